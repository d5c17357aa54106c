//! Transport trait abstraction for pluggable byte links

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// A byte stream that a line connection can run over
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> TransportStream for S {}

/// Factory for opening transport streams
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    /// The stream type this connector produces
    type Stream: TransportStream;

    /// Attempt to connect, returning a stream on success
    async fn connect(&self) -> io::Result<Self::Stream>;

    /// Human-readable name for this transport
    fn name(&self) -> String;
}
