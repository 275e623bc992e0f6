//! Terminal session over an upgraded WebSocket
//!
//! A [`TerminalSession`] owns one client connection and exposes it to the
//! exec stream as an input source, an output sink and a size source. The
//! three are driven from separate tasks, so every operation takes `&self`:
//! the inbound and outbound halves sit behind their own locks, resizes go
//! through the [`ResizeQueue`], and termination is a one-shot
//! [`DoneSignal`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use podterm_protocol::{
    decode, decode_slice, encode_output, ControlFrame, FrameError, Operation, END_OF_TRANSMISSION,
};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use super::io::{InputSource, OutputSink, SizeSource};
use super::resize::{DoneSignal, ResizeQueue, TerminalSize};

/// Errors surfaced by session reads and writes
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("{0}")]
    Malformed(#[from] FrameError),

    #[error("unknown message type '{0}'")]
    UnknownOperation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    Closed,
}

/// Lifecycle of a session once the connection is upgraded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Serving traffic
    Active,
    /// `done()` or `close()` has run, but not both
    Closing,
    /// Fully torn down
    Closed,
}

/// Session over an axum WebSocket
pub type WsTerminalSession =
    TerminalSession<SplitSink<WebSocket, Message>, SplitStream<WebSocket>>;

struct Inbound<Rx> {
    stream: Rx,
    /// Input that did not fit in the caller's buffer
    pending: Vec<u8>,
}

impl<Rx> Inbound<Rx> {
    fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

struct Outbound<Tx> {
    sink: Tx,
    /// Trailing bytes of a UTF-8 sequence split across writes
    carry: Vec<u8>,
}

impl<Tx> Outbound<Tx> {
    /// Carried bytes plus `buf`, minus any unfinished sequence at the end
    fn take_complete(&mut self, buf: &[u8]) -> Vec<u8> {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(buf);
        let tail = incomplete_utf8_tail(&bytes);
        self.carry = bytes.split_off(bytes.len() - tail);
        bytes
    }
}

/// Length of an unfinished multi-byte sequence at the end of `bytes`
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// Bridges one client connection to one remote process
pub struct TerminalSession<Tx, Rx> {
    id: Uuid,
    inbound: AsyncMutex<Inbound<Rx>>,
    outbound: AsyncMutex<Outbound<Tx>>,
    resize: ResizeQueue,
    done: DoneSignal,
    closed: AtomicBool,
}

impl WsTerminalSession {
    /// Take ownership of an upgraded socket
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self::from_parts(sink, stream)
    }
}

impl<Tx, Rx> TerminalSession<Tx, Rx> {
    /// Build a session from separate outbound and inbound halves
    pub fn from_parts(sink: Tx, stream: Rx) -> Self {
        Self {
            id: Uuid::new_v4(),
            inbound: AsyncMutex::new(Inbound {
                stream,
                pending: Vec::new(),
            }),
            outbound: AsyncMutex::new(Outbound {
                sink,
                carry: Vec::new(),
            }),
            resize: ResizeQueue::new(),
            done: DoneSignal::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        match (self.done.is_fired(), self.closed.load(Ordering::Acquire)) {
            (false, false) => SessionState::Active,
            (true, true) => SessionState::Closed,
            _ => SessionState::Closing,
        }
    }

    /// Signal termination. Wakes every `next()` waiter; repeat calls are no-ops.
    pub fn done(&self) {
        if self.done.fire() {
            tracing::debug!(session = %self.id, "Terminal session done");
        }
    }

    /// Resolves once the session has been signalled done
    pub async fn closed(&self) {
        self.done.wait().await;
    }

    /// Next terminal size from the client, or `None` after `done()`
    pub async fn next(&self) -> Option<TerminalSize> {
        self.resize.next(&self.done).await
    }

    fn fail(&self, buf: &mut [u8], err: TerminalError) -> TerminalError {
        if let Some(first) = buf.first_mut() {
            *first = END_OF_TRANSMISSION;
        }
        tracing::info!(session = %self.id, error = %err, "Terminal input ended");
        self.done();
        err
    }
}

impl<Tx, Rx, E> TerminalSession<Tx, Rx>
where
    Tx: Sink<Message> + Unpin + Send,
    Tx::Error: fmt::Display,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: fmt::Display + Send,
{
    async fn next_frame(stream: &mut Rx) -> Result<ControlFrame, TerminalError> {
        loop {
            let message = match stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(TerminalError::Transport(e.to_string())),
                None => return Err(TerminalError::Closed),
            };
            return match message {
                Message::Text(text) => Ok(decode(text.as_str())?),
                Message::Binary(bytes) => Ok(decode_slice(&bytes)?),
                Message::Close(_) => Err(TerminalError::Closed),
                // Protocol-level keepalives are answered by the WebSocket layer
                Message::Ping(_) | Message::Pong(_) => continue,
            };
        }
    }

    /// Read the next chunk of user input.
    ///
    /// Resize and ping frames are consumed here and yield `Ok(0)`. Any
    /// failure writes the end-of-transmission sentinel to `buf[0]` and marks
    /// the session done before returning the error.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TerminalError> {
        let mut inbound = self.inbound.lock().await;
        if !inbound.pending.is_empty() {
            return Ok(inbound.drain_into(buf));
        }

        let frame = match Self::next_frame(&mut inbound.stream).await {
            Ok(frame) => frame,
            Err(e) => return Err(self.fail(buf, e)),
        };

        match frame.operation {
            Operation::Stdin => {
                inbound.pending = frame.data.into_bytes();
                Ok(inbound.drain_into(buf))
            }
            Operation::Resize => {
                let size = TerminalSize::new(frame.cols, frame.rows);
                tracing::debug!(
                    session = %self.id,
                    cols = size.cols,
                    rows = size.rows,
                    "Resize requested"
                );
                self.resize.offer(size);
                Ok(0)
            }
            Operation::Ping => Ok(0),
            other => Err(self.fail(buf, TerminalError::UnknownOperation(other.to_string()))),
        }
    }

    /// Send process output to the client as one `stdout` frame.
    ///
    /// Returns `buf.len()` on success. An unfinished UTF-8 sequence at the end
    /// of `buf` is held back and sent with the next write, or flushed as
    /// U+FFFD by `close()`.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, TerminalError> {
        let mut outbound = self.outbound.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(TerminalError::Closed);
        }

        let bytes = outbound.take_complete(buf);
        if bytes.is_empty() && !buf.is_empty() {
            return Ok(buf.len());
        }

        let json = encode_output(&bytes)?;
        if let Err(e) = outbound.sink.send(Message::text(json)).await {
            outbound.carry.clear();
            return Err(TerminalError::Transport(e.to_string()));
        }
        Ok(buf.len())
    }

    /// Close the connection. Only the first call touches the transport.
    ///
    /// Held-back output is sent first so the client sees every byte the
    /// process wrote.
    pub async fn close(&self) -> Result<(), TerminalError> {
        let mut outbound = self.outbound.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(session = %self.id, "Closing terminal connection");

        let tail = std::mem::take(&mut outbound.carry);
        if !tail.is_empty() {
            let sent = match encode_output(&tail) {
                Ok(json) => outbound
                    .sink
                    .send(Message::text(json))
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = sent {
                tracing::debug!(session = %self.id, error = %e, "Dropped trailing output");
            }
        }

        outbound
            .sink
            .close()
            .await
            .map_err(|e| TerminalError::Transport(e.to_string()))
    }
}

impl<Tx, Rx> Drop for TerminalSession<Tx, Rx> {
    fn drop(&mut self) {
        self.done.fire();
    }
}

impl<Tx, Rx> fmt::Debug for TerminalSession<Tx, Rx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<Tx, Rx, E> InputSource for TerminalSession<Tx, Rx>
where
    Tx: Sink<Message> + Unpin + Send,
    Tx::Error: fmt::Display,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: fmt::Display + Send,
{
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TerminalError> {
        TerminalSession::read(self, buf).await
    }
}

#[async_trait]
impl<Tx, Rx, E> OutputSink for TerminalSession<Tx, Rx>
where
    Tx: Sink<Message> + Unpin + Send,
    Tx::Error: fmt::Display,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: fmt::Display + Send,
{
    async fn write(&self, buf: &[u8]) -> Result<usize, TerminalError> {
        TerminalSession::write(self, buf).await
    }
}

#[async_trait]
impl<Tx, Rx> SizeSource for TerminalSession<Tx, Rx>
where
    Tx: Send,
    Rx: Send,
{
    async fn next(&self) -> Option<TerminalSize> {
        TerminalSession::next(self).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::channel::mpsc;
    use std::io;
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) type ChannelSession = TerminalSession<
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<Result<Message, io::Error>>,
    >;

    /// Session wired to in-memory channels: (session, client -> bridge, bridge -> client)
    pub(crate) fn channel_session() -> (
        ChannelSession,
        mpsc::UnboundedSender<Result<Message, io::Error>>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded();
        let (in_tx, in_rx) = mpsc::unbounded();
        (TerminalSession::from_parts(out_tx, in_rx), in_tx, out_rx)
    }

    fn send_json(tx: &mpsc::UnboundedSender<Result<Message, io::Error>>, json: &str) {
        tx.unbounded_send(Ok(Message::text(json.to_string()))).unwrap();
    }

    async fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> ControlFrame {
        match tokio::time::timeout(Duration::from_secs(1), rx.next()).await {
            Ok(Some(Message::Text(text))) => decode(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    // ============================================================================
    // Read Tests
    // ============================================================================

    #[tokio::test]
    async fn test_read_stdin() {
        let (session, client, _out) = channel_session();
        send_json(&client, r#"{"operation":"stdin","data":"ls\n"}"#);

        let mut buf = [0u8; 64];
        let n = session.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ls\n");
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_read_stdin_larger_than_buffer() {
        let (session, client, _out) = channel_session();
        send_json(&client, r#"{"operation":"stdin","data":"abcdefghij"}"#);

        let mut buf = [0u8; 4];
        let mut got = Vec::new();
        for _ in 0..3 {
            let n = session.read(&mut buf).await.unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"abcdefghij");
    }

    #[tokio::test]
    async fn test_read_binary_frame() {
        let (session, client, _out) = channel_session();
        client
            .unbounded_send(Ok(Message::binary(br#"{"operation":"stdin","data":"pwd"}"#.to_vec())))
            .unwrap();

        let mut buf = [0u8; 16];
        let n = session.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pwd");
    }

    #[tokio::test]
    async fn test_read_resize_yields_no_bytes() {
        let (session, client, _out) = channel_session();
        send_json(&client, r#"{"operation":"resize","rows":40,"cols":120}"#);

        let mut buf = [0u8; 16];
        assert_eq!(session.read(&mut buf).await.unwrap(), 0);
        assert_eq!(session.next().await, Some(TerminalSize::new(120, 40)));
    }

    #[tokio::test]
    async fn test_read_resize_without_dimensions() {
        let (session, client, _out) = channel_session();
        send_json(&client, r#"{"operation":"resize"}"#);

        let mut buf = [0u8; 16];
        assert_eq!(session.read(&mut buf).await.unwrap(), 0);
        assert_eq!(session.next().await, Some(TerminalSize::new(0, 0)));
    }

    #[tokio::test]
    async fn test_read_resize_latest_wins() {
        let (session, client, _out) = channel_session();
        for (rows, cols) in [(24, 80), (30, 100), (50, 160)] {
            send_json(&client, &format!(r#"{{"operation":"resize","rows":{rows},"cols":{cols}}}"#));
        }

        let mut buf = [0u8; 16];
        for _ in 0..3 {
            assert_eq!(session.read(&mut buf).await.unwrap(), 0);
        }
        assert_eq!(session.next().await, Some(TerminalSize::new(160, 50)));
    }

    #[tokio::test]
    async fn test_read_ping_is_noop() {
        let (session, client, mut out) = channel_session();
        send_json(&client, r#"{"operation":"ping"}"#);

        let mut buf = [0xAAu8; 8];
        assert_eq!(session.read(&mut buf).await.unwrap(), 0);
        assert_eq!(buf, [0xAA; 8]);
        assert!(out.try_next().is_err(), "ping must not produce a reply");
    }

    #[tokio::test]
    async fn test_read_skips_websocket_control_frames() {
        let (session, client, _out) = channel_session();
        client.unbounded_send(Ok(Message::Ping(vec![1, 2].into()))).unwrap();
        client.unbounded_send(Ok(Message::Pong(vec![].into()))).unwrap();
        send_json(&client, r#"{"operation":"stdin","data":"x"}"#);

        let mut buf = [0u8; 4];
        let n = session.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"x");
    }

    #[tokio::test]
    async fn test_read_unknown_operation() {
        let (session, client, _out) = channel_session();
        send_json(&client, r#"{"operation":"detach"}"#);

        let mut buf = [0u8; 8];
        let err = session.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, TerminalError::UnknownOperation(ref tag) if tag == "detach"));
        assert_eq!(buf[0], END_OF_TRANSMISSION);
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn test_read_client_stdout_is_unknown() {
        let (session, client, _out) = channel_session();
        send_json(&client, r#"{"operation":"stdout","data":"x"}"#);

        let mut buf = [0u8; 8];
        let err = session.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, TerminalError::UnknownOperation(ref tag) if tag == "stdout"));
    }

    #[tokio::test]
    async fn test_read_malformed_frame() {
        let (session, client, _out) = channel_session();
        client.unbounded_send(Ok(Message::text("not json"))).unwrap();

        let mut buf = [0u8; 8];
        let err = session.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, TerminalError::Malformed(FrameError::Malformed(_))));
        assert_eq!(buf[0], END_OF_TRANSMISSION);
    }

    #[tokio::test]
    async fn test_read_array_frame_is_malformed() {
        let (session, client, _out) = channel_session();
        send_json(&client, r#"["stdin","rm -rf /\n"]"#);

        let mut buf = [0u8; 16];
        let err = session.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, TerminalError::Malformed(FrameError::Malformed(_))));
        assert_eq!(buf[0], END_OF_TRANSMISSION);
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn test_read_transport_error() {
        let (session, client, _out) = channel_session();
        client
            .unbounded_send(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "reset by peer",
            )))
            .unwrap();

        let mut buf = [0u8; 8];
        let err = session.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, TerminalError::Transport(ref msg) if msg.contains("reset")));
        assert_eq!(buf[0], END_OF_TRANSMISSION);
    }

    #[tokio::test]
    async fn test_read_connection_dropped() {
        let (session, client, _out) = channel_session();
        drop(client);

        let mut buf = [0u8; 8];
        let err = session.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, TerminalError::Closed));
        assert_eq!(buf[0], END_OF_TRANSMISSION);
    }

    #[tokio::test]
    async fn test_read_close_frame() {
        let (session, client, _out) = channel_session();
        client.unbounded_send(Ok(Message::Close(None))).unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(session.read(&mut buf).await, Err(TerminalError::Closed)));
    }

    #[tokio::test]
    async fn test_read_error_wakes_size_poller() {
        let (session, client, _out) = channel_session();
        let session = Arc::new(session);

        let poller = {
            let session = session.clone();
            tokio::spawn(async move { session.next().await })
        };

        drop(client);
        let mut buf = [0u8; 8];
        assert!(session.read(&mut buf).await.is_err());

        let size = tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .expect("size poller hung")
            .unwrap();
        assert_eq!(size, None);
    }

    // ============================================================================
    // Write Tests
    // ============================================================================

    #[tokio::test]
    async fn test_write_wraps_stdout() {
        let (session, _client, mut out) = channel_session();

        let n = session.write(b"total 0\n").await.unwrap();
        assert_eq!(n, 8);

        match out.next().await {
            Some(Message::Text(text)) => {
                assert_eq!(text.as_str(), r#"{"operation":"stdout","data":"total 0\n"}"#);
            }
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_preserves_bytes() {
        let (session, _client, mut out) = channel_session();
        let payload = "\x1b[2J\x1b[H$ echo 世界\r\n世界\r\n";

        session.write(payload.as_bytes()).await.unwrap();
        let frame = recv_frame(&mut out).await;
        assert_eq!(frame.operation, Operation::Stdout);
        assert_eq!(frame.data, payload);
    }

    #[tokio::test]
    async fn test_write_split_multibyte_character() {
        let (session, _client, mut out) = channel_session();
        let bytes = "a世b".as_bytes();

        assert_eq!(session.write(&bytes[..2]).await.unwrap(), 2);
        assert_eq!(session.write(&bytes[2..]).await.unwrap(), bytes.len() - 2);

        assert_eq!(recv_frame(&mut out).await.data, "a");
        assert_eq!(recv_frame(&mut out).await.data, "世b");
    }

    #[tokio::test]
    async fn test_write_only_partial_character_sends_nothing() {
        let (session, _client, mut out) = channel_session();
        let emoji = "🌍".as_bytes();

        assert_eq!(session.write(&emoji[..1]).await.unwrap(), 1);
        assert!(out.try_next().is_err());
        session.write(&emoji[1..]).await.unwrap();
        assert_eq!(recv_frame(&mut out).await.data, "🌍");
    }

    #[tokio::test]
    async fn test_write_replaces_invalid_bytes() {
        let (session, _client, mut out) = channel_session();
        session.write(b"a\xFFb").await.unwrap();
        assert_eq!(recv_frame(&mut out).await.data, "a\u{fffd}b");
    }

    #[tokio::test]
    async fn test_close_flushes_held_back_bytes() {
        let (session, _client, mut out) = channel_session();

        assert_eq!(session.write(b"done\xE4").await.unwrap(), 5);
        assert_eq!(recv_frame(&mut out).await.data, "done");

        session.close().await.unwrap();
        assert_eq!(recv_frame(&mut out).await.data, "\u{fffd}");
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_after_lone_lead_byte() {
        let (session, _client, mut out) = channel_session();

        session.write(&[0xF0]).await.unwrap();
        assert!(out.try_next().is_err());

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(recv_frame(&mut out).await.data, "\u{fffd}");
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_write_discards_held_back_bytes() {
        let (session, _client, out) = channel_session();
        drop(out);

        assert!(session.write(b"x\xE4").await.is_err());
        assert!(session.outbound.lock().await.carry.is_empty());
    }

    #[tokio::test]
    async fn test_write_after_close() {
        let (session, _client, _out) = channel_session();
        session.close().await.unwrap();
        assert!(matches!(session.write(b"late").await, Err(TerminalError::Closed)));
    }

    #[tokio::test]
    async fn test_write_transport_error() {
        let (session, _client, out) = channel_session();
        drop(out);
        assert!(matches!(session.write(b"x").await, Err(TerminalError::Transport(_))));
    }

    #[test]
    fn test_incomplete_utf8_tail() {
        assert_eq!(incomplete_utf8_tail(b""), 0);
        assert_eq!(incomplete_utf8_tail(b"abc"), 0);
        assert_eq!(incomplete_utf8_tail("世".as_bytes()), 0);
        assert_eq!(incomplete_utf8_tail(&"世".as_bytes()[..1]), 1);
        assert_eq!(incomplete_utf8_tail(&"世".as_bytes()[..2]), 2);
        assert_eq!(incomplete_utf8_tail(&"🌍".as_bytes()[..3]), 3);
        assert_eq!(incomplete_utf8_tail(&[b'a', 0x80, 0x80, 0x80]), 0);
    }

    // ============================================================================
    // Lifecycle Tests
    // ============================================================================

    #[tokio::test]
    async fn test_done_and_close_are_idempotent() {
        let (session, _client, mut out) = channel_session();
        assert_eq!(session.state(), SessionState::Active);

        session.done();
        session.done();
        assert_eq!(session.state(), SessionState::Closing);

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);

        // Closing the sink ends the outbound channel exactly once
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_before_done_is_closing() {
        let (session, _client, _out) = channel_session();
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closing);
        session.done();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_done_wakes_blocked_next() {
        let (session, _client, _out) = channel_session();
        let session = Arc::new(session);

        let pollers: Vec<_> = (0..4)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.next().await })
            })
            .collect();

        tokio::task::yield_now().await;
        session.done();

        for poller in pollers {
            let size = tokio::time::timeout(Duration::from_secs(1), poller)
                .await
                .expect("poller hung")
                .unwrap();
            assert_eq!(size, None);
        }
    }

    #[tokio::test]
    async fn test_closed_resolves_after_done() {
        let (session, _client, _out) = channel_session();
        session.done();
        tokio::time::timeout(Duration::from_secs(1), session.closed())
            .await
            .expect("closed() hung");
    }

    #[tokio::test]
    async fn test_sessions_have_distinct_ids() {
        let (a, _ca, _oa) = channel_session();
        let (b, _cb, _ob) = channel_session();
        assert_ne!(a.id(), b.id());
    }

    // ============================================================================
    // Concurrency Tests
    // ============================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_read_write_next_stress() {
        let (session, client, mut out) = channel_session();
        let session = Arc::new(session);

        // Client: interleaved stdin / resize / ping, then hang up
        let feeder = tokio::spawn(async move {
            for i in 0..500u16 {
                let json = match i % 3 {
                    0 => format!(r#"{{"operation":"stdin","data":"k{i};"}}"#),
                    1 => format!(r#"{{"operation":"resize","rows":{},"cols":{}}}"#, i, i + 1),
                    _ => r#"{"operation":"ping"}"#.to_string(),
                };
                client.unbounded_send(Ok(Message::text(json))).unwrap();
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });

        let reader = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut input = Vec::new();
                let mut buf = [0u8; 3];
                loop {
                    match session.read(&mut buf).await {
                        Ok(n) => input.extend_from_slice(&buf[..n]),
                        Err(_) => {
                            assert_eq!(buf[0], END_OF_TRANSMISSION);
                            return input;
                        }
                    }
                }
            })
        };

        let writer = {
            let session = session.clone();
            tokio::spawn(async move {
                for i in 0..300 {
                    session.write(format!("out{i}\n").as_bytes()).await.unwrap();
                }
            })
        };

        let poller = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut seen = 0usize;
                while let Some(size) = session.next().await {
                    assert_eq!(size.cols, size.rows + 1);
                    seen += 1;
                }
                seen
            })
        };

        feeder.await.unwrap();
        writer.await.unwrap();

        let input = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("reader hung")
            .unwrap();
        let expected: String = (0..500u16)
            .filter(|i| i % 3 == 0)
            .map(|i| format!("k{i};"))
            .collect();
        assert_eq!(String::from_utf8(input).unwrap(), expected);

        let resizes_seen = tokio::time::timeout(Duration::from_secs(5), poller)
            .await
            .expect("poller hung")
            .unwrap();
        assert!(resizes_seen <= 167);

        for i in 0..300 {
            let frame = recv_frame(&mut out).await;
            assert_eq!(frame.operation, Operation::Stdout);
            assert_eq!(frame.data, format!("out{i}\n"));
        }
        assert_eq!(session.state(), SessionState::Closing);
    }
}
