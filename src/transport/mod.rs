pub mod line;
pub mod serial;
pub mod tcp;
pub mod traits;

pub use line::{LineConnection, LineEnding};
pub use serial::{SerialConfig, SerialConnector};
pub use tcp::TcpConnector;
