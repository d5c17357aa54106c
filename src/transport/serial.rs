//! Serial (COM port) transport

use crate::transport::traits::TransportConnector;
use async_trait::async_trait;
use std::io;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

/// Serial port parameters
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Device path, e.g. "/dev/ttyUSB0" or "COM3"
    pub port: String,
    pub baud: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

/// Opens a serial port as an async stream
pub struct SerialConnector {
    config: SerialConfig,
}

impl SerialConnector {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

#[async_trait]
impl TransportConnector for SerialConnector {
    type Stream = SerialStream;

    async fn connect(&self) -> io::Result<Self::Stream> {
        let stream = tokio_serial::new(&self.config.port, self.config.baud)
            .data_bits(self.config.data_bits)
            .parity(self.config.parity)
            .stop_bits(self.config.stop_bits)
            .flow_control(self.config.flow_control)
            .open_native_async()?;
        Ok(stream)
    }

    fn name(&self) -> String {
        format!("serial:{}@{}", self.config.port, self.config.baud)
    }
}
