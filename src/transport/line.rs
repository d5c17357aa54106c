//! Newline-delimited text messages over any transport stream
//!
//! Outbound messages get the configured line ending appended. Inbound bytes
//! are split on `\n`; a trailing `\r` is stripped, so devices that answer
//! with CRLF work under either setting.

use crate::transport::traits::TransportConnector;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use devcom::{ConnectionError, ConnectionEvent, DataConnection, DataFormat};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Longest accepted inbound line (64 KiB)
pub const MAX_LINE_LEN: usize = 64 * 1024;

const EVENT_CAPACITY: usize = 256;

/// Errors from splitting the inbound byte stream
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LineError {
    #[error("Line too long: {0} bytes without terminator (max: {MAX_LINE_LEN})")]
    TooLong(usize),
}

/// Line terminator for outbound messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    #[default]
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            LineEnding::Lf => b"\n",
            LineEnding::CrLf => b"\r\n",
        }
    }
}

/// Streaming line splitter
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
    /// Dropping the rest of an over-long line up to its terminator
    discarding: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            discarding: false,
        }
    }

    /// Add received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Take the next complete line, if any.
    ///
    /// Call repeatedly until it returns `Ok(None)`. An over-long line is
    /// reported once and dropped whole, including bytes that arrive after
    /// the error up to its terminator.
    pub fn decode_next(&mut self) -> Result<Option<String>, LineError> {
        loop {
            let newline = self.buffer.iter().position(|b| *b == b'\n');

            if self.discarding {
                match newline {
                    Some(pos) => {
                        self.buffer.advance(pos + 1);
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        self.buffer.clear();
                        return Ok(None);
                    }
                }
            }

            return match newline {
                Some(pos) => Ok(Some(self.take_line(pos))),
                None if self.buffer.len() > MAX_LINE_LEN => {
                    let len = self.buffer.len();
                    self.buffer.clear();
                    self.discarding = true;
                    Err(LineError::TooLong(len))
                }
                None => Ok(None),
            };
        }
    }

    fn take_line(&mut self, pos: usize) -> String {
        let mut line = self.buffer.split_to(pos);
        self.buffer.advance(1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        String::from_utf8_lossy(&line).into_owned()
    }

    /// Bytes of the incomplete trailing line
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

/// [`DataConnection`] carrying one `String` per line
pub struct LineConnection<C: TransportConnector> {
    connector: C,
    format: Arc<dyn DataFormat<String>>,
    line_ending: LineEnding,
    open: Arc<AtomicBool>,
    writer: Mutex<Option<WriteHalf<C::Stream>>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ConnectionEvent<String>>,
}

impl<C: TransportConnector> LineConnection<C> {
    pub fn new(connector: C, format: Arc<dyn DataFormat<String>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connector,
            format,
            line_ending: LineEnding::default(),
            open: Arc::new(AtomicBool::new(false)),
            writer: Mutex::new(None),
            reader: std::sync::Mutex::new(None),
            events,
        }
    }

    pub fn with_line_ending(mut self, line_ending: LineEnding) -> Self {
        self.line_ending = line_ending;
        self
    }

    fn replace_reader(&self, task: Option<JoinHandle<()>>) {
        let mut slot = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(old) = std::mem::replace(&mut *slot, task) {
            old.abort();
        }
    }
}

#[async_trait]
impl<C: TransportConnector> DataConnection<String> for LineConnection<C> {
    async fn open(&self) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        if self.is_open() {
            return Ok(());
        }

        let name = self.connector.name();
        let stream = self
            .connector
            .connect()
            .await
            .map_err(|source| ConnectionError::Open {
                name: name.clone(),
                source,
            })?;
        let (read_half, write_half) = tokio::io::split(stream);
        *writer = Some(write_half);
        self.open.store(true, Ordering::SeqCst);

        let task = tokio::spawn(read_loop(
            read_half,
            self.events.clone(),
            self.open.clone(),
            name.clone(),
        ));
        self.replace_reader(Some(task));

        info!("Opened {}", name);
        let _ = self.events.send(ConnectionEvent::Opened);
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        self.replace_reader(None);

        if let Some(mut write_half) = writer.take() {
            if let Err(e) = write_half.shutdown().await {
                debug!("Shutdown of {} failed: {}", self.connector.name(), e);
            }
        }

        if self.open.swap(false, Ordering::SeqCst) {
            info!("Closed {}", self.connector.name());
            let _ = self.events.send(ConnectionEvent::Closed);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn write_data(&self, msg: &String) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let write_half = writer.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} is not open", self.connector.name()),
            )
        })?;

        let ending = self.line_ending.as_bytes();
        let mut line = BytesMut::with_capacity(msg.len() + ending.len());
        line.put_slice(msg.as_bytes());
        line.put_slice(ending);

        write_half.write_all(&line).await?;
        write_half.flush().await
    }

    fn format(&self) -> Arc<dyn DataFormat<String>> {
        self.format.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent<String>> {
        self.events.subscribe()
    }

    fn name(&self) -> String {
        self.connector.name()
    }
}

impl<C: TransportConnector> Drop for LineConnection<C> {
    fn drop(&mut self) {
        self.replace_reader(None);
    }
}

/// Read until EOF or error, publishing every complete line
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    events: broadcast::Sender<ConnectionEvent<String>>,
    open: Arc<AtomicBool>,
    name: String,
) {
    let mut decoder = LineDecoder::new();
    let mut read_buf = vec![0u8; 4096];

    loop {
        match reader.read(&mut read_buf).await {
            Ok(0) => {
                info!("{} closed by peer", name);
                break;
            }
            Ok(n) => {
                decoder.extend(&read_buf[..n]);

                // Publish all complete lines
                loop {
                    match decoder.decode_next() {
                        Ok(Some(line)) => {
                            debug!("<<< {}", line);
                            let _ = events.send(ConnectionEvent::Received(line));
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Decode error from {}: {}", name, e);
                            let _ = events.send(ConnectionEvent::IoError(e.to_string()));
                        }
                    }
                }
            }
            Err(e) => {
                error!("Read error from {}: {}", name, e);
                let _ = events.send(ConnectionEvent::IoError(e.to_string()));
                break;
            }
        }
    }

    if open.swap(false, Ordering::SeqCst) {
        let _ = events.send(ConnectionEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PrefixFormat;
    use crate::transport::TcpConnector;
    use devcom::{Controller, DevcomError};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[test]
    fn test_decode_lines() {
        let mut decoder = LineDecoder::new();
        decoder.extend(b"PONG\r\nOK 1\npart");

        assert_eq!(decoder.decode_next().unwrap().as_deref(), Some("PONG"));
        assert_eq!(decoder.decode_next().unwrap().as_deref(), Some("OK 1"));
        assert_eq!(decoder.decode_next().unwrap(), None);
        assert_eq!(decoder.buffer_len(), 4);

        decoder.extend(b"ial\n");
        assert_eq!(decoder.decode_next().unwrap().as_deref(), Some("partial"));
    }

    #[test]
    fn test_empty_line() {
        let mut decoder = LineDecoder::new();
        decoder.extend(b"\r\n");
        assert_eq!(decoder.decode_next().unwrap().as_deref(), Some(""));
    }

    #[test]
    fn test_line_too_long() {
        let mut decoder = LineDecoder::new();
        decoder.extend(&vec![b'x'; MAX_LINE_LEN + 1]);

        assert_eq!(
            decoder.decode_next(),
            Err(LineError::TooLong(MAX_LINE_LEN + 1))
        );
        assert_eq!(decoder.buffer_len(), 0);

        // The rest of the dropped line never surfaces
        decoder.extend(b"TAIL");
        assert_eq!(decoder.decode_next().unwrap(), None);
        decoder.extend(b"-OF-GARBAGE\nOK\n");
        assert_eq!(decoder.decode_next().unwrap().as_deref(), Some("OK"));
        assert_eq!(decoder.decode_next().unwrap(), None);
    }

    #[test]
    fn test_line_too_long_tail_in_same_chunk() {
        let mut decoder = LineDecoder::new();
        let mut chunk = vec![b'x'; MAX_LINE_LEN + 1];
        decoder.extend(&chunk);
        assert!(decoder.decode_next().is_err());

        chunk.clear();
        chunk.extend_from_slice(b"yyy\r\nPONG\r\n");
        decoder.extend(&chunk);
        assert_eq!(decoder.decode_next().unwrap().as_deref(), Some("PONG"));
    }

    #[test]
    fn test_line_ending_bytes() {
        assert_eq!(LineEnding::Lf.as_bytes(), b"\n");
        assert_eq!(LineEnding::CrLf.as_bytes(), b"\r\n");
    }

    /// Device that answers every line `X` with `X OK`
    async fn spawn_echo_device() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = socket.into_split();
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = format!("{} OK\r\n", line);
                if writer.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        address
    }

    #[tokio::test]
    async fn test_write_before_open_fails() {
        let conn =
            LineConnection::new(TcpConnector::new("127.0.0.1:1"), Arc::new(PrefixFormat));
        let err = conn.write_data(&"PING".to_string()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_controller_over_tcp() {
        let address = spawn_echo_device().await;
        let conn = Arc::new(
            LineConnection::new(TcpConnector::new(address), Arc::new(PrefixFormat))
                .with_line_ending(LineEnding::CrLf),
        );
        conn.open().await.unwrap();
        assert!(conn.is_open());

        let controller = Controller::new();
        controller.init(conn.clone());

        let reply = controller
            .send_with_timeout("PING".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, "PING OK");

        let a = controller.send_payload_async("READ A".to_string()).unwrap();
        let b = controller.send_payload_async("WRITE B".to_string()).unwrap();
        let b_reply = b.reply().get_timeout(Duration::from_secs(5)).await;
        let a_reply = a.reply().get_timeout(Duration::from_secs(5)).await;
        assert_eq!(a_reply.message().map(String::as_str), Some("READ A OK"));
        assert_eq!(b_reply.message().map(String::as_str), Some("WRITE B OK"));

        controller.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(!conn.is_open());
        assert!(matches!(
            controller.send("LATE".to_string()).await,
            Err(DevcomError::NotInitialized)
        ));
    }
}
