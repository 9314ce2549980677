//! Stream multiplexer.
//!
//! # Data Flow
//! ```text
//! physical connection (post-handshake)
//!     → reader task: decode frames, dispatch to stream table / accept queue
//!     → writer task: drain outbound frame queue, encode, flush
//!
//! application
//!     → MuxHandle::open_stream()  (initiator side)
//!     → Multiplexer::accept()     (peer side, arrival order)
//!     → LogicalStream read/write  (flow-controlled per stream)
//! ```
//!
//! # Design Decisions
//! - One multiplexer per physical connection; id allocation and the stream
//!   table are serialized under a single per-connection mutex
//! - Stream ids are monotonic with parity split by side (client odd,
//!   server even) so simultaneous opens cannot collide
//! - Data in flight is bounded by per-stream windows, so the shared
//!   outbound queue needs no extra limit and no stream can starve the
//!   connection's memory budget
//! - No head-of-line blocking: a stream with a full receive buffer only
//!   stalls its own sender

mod stream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::codec::{encode_frame, read_frame, Frame, FrameDecoder, FrameKind};
use crate::config::TransportConfig;

pub use stream::{LogicalStream, StreamState};
pub(crate) use stream::StreamShared;

/// Errors raised by the multiplexer.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The physical connection is gone; no streams can be opened or used.
    #[error("multiplexer closed")]
    Closed,

    /// The peer violated the framing contract; the connection terminates.
    #[error("multiplexer protocol violation: {0}")]
    Protocol(String),
}

/// Which end of the connection this multiplexer runs on. Determines stream
/// id parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Per-connection multiplexer settings.
#[derive(Debug, Clone, Copy)]
pub struct MuxConfig {
    /// Receive window advertised to the peer, per stream.
    pub recv_window: u32,
    /// The peer's advertised window; our send budget per stream.
    pub peer_window: u32,
    /// Largest data chunk put in one frame.
    pub max_payload: usize,
    /// Grace period for a half-closed stream whose handle is gone.
    pub linger: Duration,
}

impl MuxConfig {
    /// Derive from transport config plus the handshake outcome.
    pub fn new(transport: &TransportConfig, peer_window: u32) -> Self {
        Self {
            recv_window: transport.initial_window_bytes,
            peer_window,
            max_payload: transport.max_frame_bytes.min(16 * 1024),
            linger: Duration::from_secs(transport.linger_secs),
        }
    }
}

pub(crate) enum OutboundCmd {
    Frame(Frame),
    Shutdown,
}

struct MuxState {
    next_id: u32,
    streams: HashMap<u32, Arc<StreamShared>>,
}

pub(crate) struct Shared {
    state: Mutex<MuxState>,
    outbound: mpsc::UnboundedSender<OutboundCmd>,
    closed: AtomicBool,
    closed_notify: Notify,
    cfg: MuxConfig,
    side: Side,
}

impl Shared {
    pub(crate) fn send_frame(&self, frame: Frame) -> Result<(), MuxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::Closed);
        }
        self.outbound
            .send(OutboundCmd::Frame(frame))
            .map_err(|_| MuxError::Closed)
    }

    pub(crate) fn max_payload(&self) -> usize {
        self.cfg.max_payload
    }

    pub(crate) fn linger(&self) -> Duration {
        self.cfg.linger
    }

    pub(crate) fn remove_stream(&self, id: u32) {
        self.state.lock().unwrap().streams.remove(&id);
    }

    fn get_stream(&self, id: u32) -> Option<Arc<StreamShared>> {
        self.state.lock().unwrap().streams.get(&id).cloned()
    }

    /// Tear the whole connection down: mark closed, evict every stream,
    /// stop the writer. Idempotent.
    fn shutdown(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // notify_waiters wakes a reader already parked; notify_one leaves a
        // permit for one that has not reached its await yet.
        self.closed_notify.notify_waiters();
        self.closed_notify.notify_one();
        let streams: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.streams.drain().map(|(_, s)| s).collect()
        };
        for stream in streams {
            stream.mark_conn_closed();
        }
        let _ = self.outbound.send(OutboundCmd::Shutdown);
    }

    fn create_local_stream(self: &Arc<Self>) -> Result<Arc<StreamShared>, MuxError> {
        let mut state = self.state.lock().unwrap();
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::Closed);
        }
        let id = state.next_id;
        state.next_id = state
            .next_id
            .checked_add(2)
            .ok_or_else(|| MuxError::Protocol("stream ids exhausted".to_string()))?;
        let stream = Arc::new(StreamShared::new(
            id,
            Arc::downgrade(self),
            self.cfg.peer_window,
        ));
        state.streams.insert(id, stream.clone());
        Ok(stream)
    }

    fn create_remote_stream(self: &Arc<Self>, id: u32) -> Result<Arc<StreamShared>, MuxError> {
        let expected_parity = match self.side {
            Side::Client => 0, // server-opened ids are even
            Side::Server => 1, // client-opened ids are odd
        };
        if id % 2 != expected_parity || id == 0 {
            return Err(MuxError::Protocol(format!(
                "peer opened stream {id} with wrong parity"
            )));
        }
        let mut state = self.state.lock().unwrap();
        if state.streams.contains_key(&id) {
            return Err(MuxError::Protocol(format!("duplicate syn for stream {id}")));
        }
        let stream = Arc::new(StreamShared::new(
            id,
            Arc::downgrade(self),
            self.cfg.peer_window,
        ));
        state.streams.insert(id, stream.clone());
        Ok(stream)
    }
}

fn stream_id_of(payload: &Bytes) -> Result<(u32, Bytes), MuxError> {
    if payload.len() < 4 {
        return Err(MuxError::Protocol("frame payload shorter than stream id".to_string()));
    }
    let id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Ok((id, payload.slice(4..)))
}

pub(crate) fn syn_frame(id: u32) -> Frame {
    Frame::new(FrameKind::Syn, Bytes::copy_from_slice(&id.to_be_bytes()))
}

pub(crate) fn data_frame(id: u32, data: &[u8]) -> Frame {
    let mut payload = BytesMut::with_capacity(4 + data.len());
    payload.put_u32(id);
    payload.put_slice(data);
    Frame::new(FrameKind::Data, payload.freeze())
}

pub(crate) fn window_update_frame(id: u32, delta: u32) -> Frame {
    let mut payload = BytesMut::with_capacity(8);
    payload.put_u32(id);
    payload.put_u32(delta);
    Frame::new(FrameKind::WindowUpdate, payload.freeze())
}

pub(crate) fn fin_frame(id: u32) -> Frame {
    Frame::new(FrameKind::Fin, Bytes::copy_from_slice(&id.to_be_bytes()))
}

pub(crate) fn rst_frame(id: u32) -> Frame {
    Frame::new(FrameKind::Rst, Bytes::copy_from_slice(&id.to_be_bytes()))
}

/// Cloneable handle for opening streams and closing the connection.
#[derive(Clone)]
pub struct MuxHandle {
    shared: Arc<Shared>,
}

impl MuxHandle {
    /// Open a new logical stream towards the peer.
    pub fn open_stream(&self) -> Result<LogicalStream, MuxError> {
        let stream = self.shared.create_local_stream()?;
        self.shared.send_frame(syn_frame(stream.id))?;
        Ok(LogicalStream::new(stream))
    }

    /// Whether the physical connection is gone.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Tear the connection down.
    pub fn close(&self) {
        self.shared.shutdown();
    }
}

/// One multiplexer, owning one physical connection.
pub struct Multiplexer {
    shared: Arc<Shared>,
    accept_rx: mpsc::UnboundedReceiver<LogicalStream>,
}

impl Multiplexer {
    /// Take over a post-handshake connection: spawns the reader and writer
    /// tasks and returns the accept side. `decoder` carries any bytes the
    /// handshake over-read.
    pub fn spawn<S>(io: S, decoder: FrameDecoder, side: Side, cfg: MuxConfig) -> Multiplexer
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(MuxState {
                next_id: match side {
                    Side::Client => 1,
                    Side::Server => 2,
                },
                streams: HashMap::new(),
            }),
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            cfg,
            side,
        });

        let (read_half, write_half) = tokio::io::split(io);
        tokio::spawn(run_reader(read_half, decoder, shared.clone(), accept_tx));
        tokio::spawn(run_writer(write_half, outbound_rx, shared.clone()));

        Multiplexer { shared, accept_rx }
    }

    /// Yield streams opened by the peer, in arrival order. Returns `None`
    /// once the connection is closed and the backlog is drained.
    pub async fn accept(&mut self) -> Option<LogicalStream> {
        self.accept_rx.recv().await
    }

    /// Handle for opening streams from other tasks.
    pub fn handle(&self) -> MuxHandle {
        MuxHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

async fn run_reader<R>(
    mut io: R,
    mut decoder: FrameDecoder,
    shared: Arc<Shared>,
    accept_tx: mpsc::UnboundedSender<LogicalStream>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        let frame = tokio::select! {
            biased;
            _ = shared.closed_notify.notified() => break,
            result = read_frame(&mut io, &mut decoder) => match result {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "transport read failed");
                    break;
                }
            },
        };
        if let Err(e) = dispatch(&shared, &accept_tx, frame) {
            tracing::warn!(error = %e, "terminating connection");
            break;
        }
    }
    shared.shutdown();
}

fn dispatch(
    shared: &Arc<Shared>,
    accept_tx: &mpsc::UnboundedSender<LogicalStream>,
    frame: Frame,
) -> Result<(), MuxError> {
    match frame.kind {
        FrameKind::Syn => {
            let (id, _) = stream_id_of(&frame.payload)?;
            let stream = shared.create_remote_stream(id)?;
            // If the acceptor is gone the stream drops here, answering the
            // peer with Rst.
            let _ = accept_tx.send(LogicalStream::new(stream));
            Ok(())
        }
        FrameKind::Data => {
            let (id, data) = stream_id_of(&frame.payload)?;
            match shared.get_stream(id) {
                Some(stream) => stream.push_data(data, shared.cfg.recv_window),
                // Races with local Rst/removal are expected; drop quietly.
                None => Ok(()),
            }
        }
        FrameKind::WindowUpdate => {
            let (id, rest) = stream_id_of(&frame.payload)?;
            if rest.len() != 4 {
                return Err(MuxError::Protocol("malformed window update".to_string()));
            }
            let delta = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
            if let Some(stream) = shared.get_stream(id) {
                stream.add_send_window(delta);
            }
            Ok(())
        }
        FrameKind::Fin => {
            let (id, _) = stream_id_of(&frame.payload)?;
            if let Some(stream) = shared.get_stream(id) {
                if stream.remote_fin() {
                    shared.remove_stream(id);
                }
            }
            Ok(())
        }
        FrameKind::Rst => {
            let (id, _) = stream_id_of(&frame.payload)?;
            if let Some(stream) = shared.get_stream(id) {
                stream.mark_reset();
                shared.remove_stream(id);
            }
            Ok(())
        }
        FrameKind::Hello | FrameKind::HelloAck => Err(MuxError::Protocol(
            "handshake frame after handshake".to_string(),
        )),
    }
}

async fn run_writer<W>(
    mut io: W,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundCmd>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    while let Some(cmd) = outbound_rx.recv().await {
        match cmd {
            OutboundCmd::Frame(frame) => {
                let encoded = encode_frame(&frame);
                if let Err(e) = io.write_all(&encoded).await {
                    tracing::debug!(error = %e, "transport write failed");
                    break;
                }
                if let Err(e) = io.flush().await {
                    tracing::debug!(error = %e, "transport flush failed");
                    break;
                }
            }
            OutboundCmd::Shutdown => break,
        }
    }
    let _ = io.shutdown().await;
    shared.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_cfg(window: u32) -> MuxConfig {
        MuxConfig {
            recv_window: window,
            peer_window: window,
            max_payload: 4096,
            linger: Duration::from_millis(200),
        }
    }

    fn pair(window: u32) -> (Multiplexer, Multiplexer) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = Multiplexer::spawn(
            client_io,
            FrameDecoder::new(1024 * 1024),
            Side::Client,
            test_cfg(window),
        );
        let server = Multiplexer::spawn(
            server_io,
            FrameDecoder::new(1024 * 1024),
            Side::Server,
            test_cfg(window),
        );
        (client, server)
    }

    #[tokio::test]
    async fn test_open_accept_and_echo() {
        let (client, mut server) = pair(64 * 1024);

        let echo = tokio::spawn(async move {
            let mut stream = server.accept().await.expect("no incoming stream");
            let mut buf = vec![0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            buf
        });

        let mut stream = client.handle().open_stream().unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut back = vec![0u8; 5];
        stream.read_exact(&mut back).await.unwrap();

        assert_eq!(&back, b"hello");
        assert_eq!(echo.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_streams_are_independent_and_ordered() {
        let (client, mut server) = pair(64 * 1024);

        let server_task = tokio::spawn(async move {
            let mut collected = Vec::new();
            for _ in 0..3 {
                let mut stream = server.accept().await.unwrap();
                let mut body = Vec::new();
                stream.read_to_end(&mut body).await.unwrap();
                collected.push((stream.id(), body));
            }
            collected
        });

        let handle = client.handle();
        for i in 0u8..3 {
            let mut stream = handle.open_stream().unwrap();
            // Interleave writes across streams; per-stream order must hold.
            for chunk in 0u8..10 {
                stream.write_all(&[i, chunk]).await.unwrap();
            }
            stream.shutdown().await.unwrap();
        }

        let mut collected = server_task.await.unwrap();
        collected.sort_by_key(|(id, _)| *id);
        assert_eq!(collected.len(), 3);
        // Client-opened ids are odd and monotonic.
        assert_eq!(
            collected.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![1, 3, 5]
        );
        for (i, (_, body)) in collected.iter().enumerate() {
            let expected: Vec<u8> = (0u8..10).flat_map(|c| [i as u8, c]).collect();
            assert_eq!(body, &expected, "stream {i} bytes reordered");
        }
    }

    #[tokio::test]
    async fn test_write_backpressure_at_zero_window() {
        let (client, mut server) = pair(8);

        let mut stream = client.handle().open_stream().unwrap();
        let mut incoming = server.accept().await.unwrap();

        // Fill the 8-byte window.
        stream.write_all(b"12345678").await.unwrap();

        // The next write must block until the peer reads and returns credit.
        let blocked = tokio::time::timeout(Duration::from_millis(100), stream.write(b"9")).await;
        assert!(blocked.is_err(), "write proceeded past an exhausted window");

        let mut buf = vec![0u8; 8];
        incoming.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"12345678");

        // Credit is back; the write completes.
        tokio::time::timeout(Duration::from_millis(500), stream.write_all(b"9"))
            .await
            .expect("write still blocked after credit returned")
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_after_close_fails() {
        let (client, _server) = pair(64 * 1024);
        let handle = client.handle();
        handle.close();
        match handle.open_stream() {
            Err(MuxError::Closed) => {}
            other => panic!("expected MuxError::Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_drop_ends_accept_and_reads() {
        let (client, mut server) = pair(64 * 1024);

        let mut stream = client.handle().open_stream().unwrap();
        let mut incoming = server.accept().await.unwrap();
        drop(client);

        // Accept drains, then reports closure.
        assert!(server.accept().await.is_none());
        // The accepted stream observes the teardown.
        let mut buf = [0u8; 1];
        let n = incoming.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        // And writes on the initiator side fail.
        assert!(stream.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_half_close_still_delivers_responses() {
        let (client, mut server) = pair(64 * 1024);

        let server_task = tokio::spawn(async move {
            let mut stream = server.accept().await.unwrap();
            let mut request = Vec::new();
            stream.read_to_end(&mut request).await.unwrap();
            stream.write_all(b"response").await.unwrap();
            stream.shutdown().await.unwrap();
            request
        });

        let mut stream = client.handle().open_stream().unwrap();
        stream.write_all(b"request").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");
        assert_eq!(server_task.await.unwrap(), b"request");
    }
}
