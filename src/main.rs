mod config;
mod format;
mod transport;

use anyhow::Context;
use clap::Parser;
use config::{Args, Link, MatchMode};
use devcom::{
    on_connection_closed, on_io_error, AnyReply, CommandEvent, Controller, DataConnection,
    DataFormat,
};
use format::PrefixFormat;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use transport::{LineConnection, LineEnding, SerialConfig, SerialConnector, TcpConnector};

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; stdout is reserved for replies
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let connection = build_connection(&args);
    connection
        .open()
        .await
        .with_context(|| format!("cannot open {}", connection.name()))?;

    let controller = Arc::new(Controller::with_config(args.controller_config()));
    controller.init(connection.clone());
    info!(
        "Connected to {} (reply timeout {} ms, match {:?})",
        connection.name(),
        args.reply_timeout_ms,
        args.match_mode
    );

    let _io_errors = on_io_error(connection.as_ref(), |err| warn!("Link error: {}", err));
    let _closed = on_connection_closed(connection.as_ref(), || warn!("Link closed"));
    tokio::spawn(log_events(controller.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => line.context("cannot read stdin")?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        handle_line(&controller, line).await;
    }

    if let Err(e) = controller.close().await {
        error!("Controller did not shut down cleanly: {}", e);
    }
    connection.close().await?;
    Ok(())
}

fn build_connection(args: &Args) -> Arc<dyn DataConnection<String>> {
    let format: Arc<dyn DataFormat<String>> = match args.match_mode {
        MatchMode::Next => Arc::new(AnyReply),
        MatchMode::Prefix => Arc::new(PrefixFormat),
    };

    let line_ending: LineEnding = args.line_ending.into();
    match &args.link {
        Link::Serial { port, baud } => {
            let connector = SerialConnector::new(SerialConfig {
                port: port.clone(),
                baud: *baud,
                ..Default::default()
            });
            Arc::new(LineConnection::new(connector, format).with_line_ending(line_ending))
        }
        Link::Tcp { address } => {
            let connector = TcpConnector::new(address.clone());
            Arc::new(LineConnection::new(connector, format).with_line_ending(line_ending))
        }
    }
}

/// `!CMD` sends without a reply, `&CMD` waits in the background, anything
/// else blocks until the reply arrives.
async fn handle_line(controller: &Arc<Controller<String>>, line: &str) {
    if let Some(data) = line.strip_prefix('!') {
        if let Err(e) = controller.send_data(data.to_string()) {
            error!("Cannot send {:?}: {}", data, e);
        }
        return;
    }

    if let Some(payload) = line.strip_prefix('&') {
        let command = match controller.send_payload_async(payload.to_string()) {
            Ok(command) => command,
            Err(e) => {
                error!("Cannot send {:?}: {}", payload, e);
                return;
            }
        };
        println!("[{}] queued", command.id());
        let controller = controller.clone();
        tokio::spawn(async move {
            let deadline = controller.config().reply_timeout;
            match command.reply().get_timeout(deadline).await.into_result() {
                Ok(Some(reply)) => println!("[{}] {}", command.id(), reply),
                Ok(None) => println!("[{}] sent", command.id()),
                Err(e) => println!("[{}] error: {}", command.id(), e),
            }
        });
        return;
    }

    match controller.send(line.to_string()).await {
        Ok(reply) => println!("{}", reply),
        Err(e) => println!("error: {}", e),
    }
}

async fn log_events(mut events: broadcast::Receiver<CommandEvent<String>>) {
    loop {
        match events.recv().await {
            Ok(CommandEvent::Written { id }) => debug!("Command {} written", id),
            Ok(CommandEvent::Matched { id, reply }) => debug!("Command {} answered: {}", id, reply),
            Ok(CommandEvent::Abandoned { id, error }) => {
                warn!("Command {} abandoned: {}", id, error)
            }
            Ok(CommandEvent::CancelHandlerFailed { id, error }) => {
                error!("Cancellation handler of command {} failed: {}", id, error)
            }
            Ok(event) => debug!("Command {}: {:?}", event.command_id(), event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event log lagged, {} events dropped", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
