//! Command-line configuration

use crate::transport::LineEnding;
use clap::{Parser, Subcommand, ValueEnum};
use devcom::ControllerConfig;
use std::time::Duration;

/// How inbound lines are matched to outstanding commands
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum MatchMode {
    /// Any line answers the oldest outstanding command.
    #[default]
    Next,
    /// A line answers the oldest command with the same first word.
    Prefix,
}

/// Line terminator appended to every outbound command
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum Ending {
    #[default]
    Lf,
    Crlf,
}

impl From<Ending> for LineEnding {
    fn from(ending: Ending) -> Self {
        match ending {
            Ending::Lf => LineEnding::Lf,
            Ending::Crlf => LineEnding::CrLf,
        }
    }
}

/// Interactive terminal for line-oriented devices.
///
/// Each stdin line is sent as a command and its reply printed. Prefix a line
/// with `!` to send it without waiting, or with `&` to wait in the background.
#[derive(Parser, Debug)]
#[command(name = "devcom-term", version)]
pub struct Args {
    /// Deadline for a single reply, in milliseconds
    #[arg(long, default_value_t = devcom::defaults::REPLY_TIMEOUT_MS)]
    pub reply_timeout_ms: u64,

    /// Send timeout per command in milliseconds (0 waits forever)
    #[arg(long, default_value_t = 0)]
    pub command_timeout_ms: u64,

    /// Reply matching rule
    #[arg(long = "match", value_enum, default_value_t = MatchMode::Next)]
    pub match_mode: MatchMode,

    /// Outbound line terminator
    #[arg(long, value_enum, default_value_t = Ending::Lf)]
    pub line_ending: Ending,

    #[command(subcommand)]
    pub link: Link,
}

/// Device link
#[derive(Subcommand, Debug, Clone)]
pub enum Link {
    /// Talk to a serial port
    Serial {
        /// Device path, e.g. /dev/ttyUSB0
        port: String,
        #[arg(long, default_value_t = 115_200)]
        baud: u32,
    },
    /// Talk to a TCP endpoint
    Tcp {
        /// host:port
        address: String,
    },
}

impl Args {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            ..Default::default()
        }
    }
}
