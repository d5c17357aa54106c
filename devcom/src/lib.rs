//! devcom: serialized command dispatch for single-endpoint device links
//!
//! Many tasks send commands to one device (a serial port, a socket) through
//! a [`Controller`]. The controller writes them one at a time, in order, and
//! matches each inbound message to the command it answers.
//!
//! ```ignore
//! let controller = Controller::<String>::new();
//! controller.init(Arc::new(connection));
//!
//! let reply = controller.send("*IDN?".to_string()).await?;
//! controller.send_data("RESET".to_string())?;
//! controller.close().await?;
//! ```

pub mod command;
pub mod connection;
pub mod controller;
mod correlator;
mod dispatcher;
pub mod error;
pub mod events;
pub mod memory;
mod queue;
pub mod reply;
mod worker;

pub use command::{BoxError, CancelHandler, Command, CommandBuilder, Payload};
pub use connection::{
    on_connection_closed, on_connection_opened, on_data_received, on_io_error, ConnectionEvent,
    DataConnection, DataFormat, Subscription,
};
pub use controller::{Controller, ControllerConfig};
pub use error::{ConnectionError, DevcomError};
pub use events::CommandEvent;
pub use memory::{AnyReply, MemoryConnection};
pub use reply::{Reply, ReplyHandle};

/// Default timing parameters
pub mod defaults {
    /// Reply deadline of `Controller::send`
    pub const REPLY_TIMEOUT_MS: u64 = 1000;

    /// Time `Controller::close` grants the worker to finish
    pub const SHUTDOWN_GRACE_MS: u64 = 1000;

    /// Fallback wake-up of an idle dispatcher
    pub const IDLE_POLL_MS: u64 = 1000;

    /// Buffered command events per subscriber
    pub const EVENT_CAPACITY: usize = 256;
}
