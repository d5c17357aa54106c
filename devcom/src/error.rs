//! Error types for the dispatch engine and its connections

use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the controller and carried in reply outcomes
///
/// The type is `Clone` so a single failure can be delivered both through a
/// command's reply handle and through the event stream.
#[derive(Error, Debug, Clone)]
pub enum DevcomError {
    #[error("Write failed: {0}")]
    IoWrite(#[source] Arc<io::Error>),

    #[error("No reply received within {0:?}")]
    ReplyTimeout(Duration),

    #[error("Command not written within {0:?}")]
    SendTimeout(Duration),

    #[error("Command cancelled: {0}")]
    Cancelled(String),

    #[error("Not initialized. Call init() first")]
    NotInitialized,

    #[error("Worker did not terminate within {0:?}")]
    Shutdown(Duration),
}

impl DevcomError {
    pub(crate) fn io_write(err: io::Error) -> Self {
        Self::IoWrite(Arc::new(err))
    }

    /// True for the two deadline variants
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReplyTimeout(_) | Self::SendTimeout(_))
    }
}

/// Errors raised while opening or closing a connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to open {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection {0} is not open")]
    NotOpen(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
