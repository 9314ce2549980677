//! Work-connection pool.
//!
//! # Responsibilities
//! - Keep a small per-proxy reserve of pre-opened logical streams so a
//!   public connection can be spliced without a control round-trip
//! - On exhaustion, request a fresh work connection and hold the caller
//!   bounded by a timeout
//! - Cancel every waiter when the owning session dies
//!
//! # Design Decisions
//! - Pending requests live in an explicit waiter-id table served oldest
//!   first, so cancellation and timeout paths stay auditable
//! - Replenishment is driven by takes: whenever the reserve is below
//!   target after a successful take, one more connection is requested

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use crate::mux::LogicalStream;

/// Errors surfaced to a public connection waiting on the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No work connection arrived within the deadline; the caller answers
    /// with a gateway-timeout.
    #[error("timed out waiting for a work connection")]
    Timeout,

    /// The owning session is gone.
    #[error("work connection pool closed")]
    Closed,
}

/// A ready-to-splice work connection.
///
/// Wraps the logical stream plus any bytes read past the preamble; reads
/// serve the leftover first, then fall through to the stream.
pub struct WorkConn {
    stream: LogicalStream,
    leftover: Bytes,
}

impl WorkConn {
    pub fn new(stream: LogicalStream, leftover: Bytes) -> Self {
        Self { stream, leftover }
    }

    /// Underlying stream id, for logs.
    pub fn id(&self) -> u32 {
        self.stream.id()
    }

    /// Whether the stream died while waiting in the reserve.
    pub fn is_closed(&self) -> bool {
        self.stream.state() == crate::mux::StreamState::Closed
    }
}

impl AsyncRead for WorkConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.remaining());
            buf.put_slice(&self.leftover[..n]);
            self.leftover = self.leftover.slice(n..);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for WorkConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

struct PoolInner {
    closed: bool,
    idle: VecDeque<WorkConn>,
    waiters: HashMap<u64, oneshot::Sender<WorkConn>>,
    waiter_order: VecDeque<u64>,
    next_waiter_id: u64,
}

/// Per-proxy reserve of pre-opened work connections.
pub struct WorkConnPool {
    proxy_name: String,
    reserve: usize,
    /// Channel into the owning session; each send asks the client for one
    /// more work connection for this proxy.
    requester: mpsc::UnboundedSender<String>,
    inner: Mutex<PoolInner>,
}

impl WorkConnPool {
    pub fn new(proxy_name: String, reserve: usize, requester: mpsc::UnboundedSender<String>) -> Self {
        Self {
            proxy_name,
            reserve,
            requester,
            inner: Mutex::new(PoolInner {
                closed: false,
                idle: VecDeque::new(),
                waiters: HashMap::new(),
                waiter_order: VecDeque::new(),
                next_waiter_id: 0,
            }),
        }
    }

    /// Ask the client to pre-open the configured reserve. Called once after
    /// registration.
    pub fn prime(&self) {
        self.request(self.reserve);
    }

    /// Take a work connection, waiting up to `timeout` for one to arrive.
    pub async fn take(&self, timeout: Duration) -> Result<WorkConn, PoolError> {
        let (waiter_id, rx) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(PoolError::Closed);
            }
            while let Some(conn) = inner.idle.pop_front() {
                // Streams can die in reserve (connection churn); skip them.
                if conn.is_closed() {
                    continue;
                }
                let deficit = self.reserve.saturating_sub(inner.idle.len());
                drop(inner);
                if deficit > 0 {
                    self.request(1);
                }
                tracing::trace!(proxy = %self.proxy_name, stream = conn.id(), "reused pooled work connection");
                return Ok(conn);
            }

            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            inner.waiters.insert(id, tx);
            inner.waiter_order.push_back(id);
            (id, rx)
        };

        self.request(1);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(conn)) => {
                if self.reserve > 0 {
                    self.request_if_below_reserve();
                }
                Ok(conn)
            }
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => {
                self.inner.lock().unwrap().waiters.remove(&waiter_id);
                Err(PoolError::Timeout)
            }
        }
    }

    /// Deliver a fresh work connection: hand it to the oldest live waiter,
    /// otherwise stash it in the reserve.
    pub fn put(&self, conn: WorkConn) {
        let mut conn = conn;
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        while let Some(id) = inner.waiter_order.pop_front() {
            let Some(tx) = inner.waiters.remove(&id) else {
                continue; // timed out, entry already removed
            };
            match tx.send(conn) {
                Ok(()) => return,
                Err(returned) => conn = returned, // waiter cancelled
            }
        }
        if inner.idle.len() < self.reserve.max(1) {
            inner.idle.push_back(conn);
        }
        // Surplus connections drop here and reset their stream.
    }

    /// Tear the pool down, failing every waiter with `Closed`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.idle.clear();
        inner.waiters.clear();
        inner.waiter_order.clear();
    }

    /// Idle connections currently in reserve.
    pub fn idle_len(&self) -> usize {
        self.inner.lock().unwrap().idle.len()
    }

    fn request_if_below_reserve(&self) {
        let below = {
            let inner = self.inner.lock().unwrap();
            !inner.closed && inner.idle.len() < self.reserve
        };
        if below {
            self.request(1);
        }
    }

    fn request(&self, n: usize) {
        for _ in 0..n {
            if self.requester.send(self.proxy_name.clone()).is_err() {
                // Session is gone; takers learn through close().
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameDecoder;
    use crate::mux::{Multiplexer, MuxConfig, Side};

    fn stream_pair() -> (Multiplexer, Multiplexer) {
        let cfg = MuxConfig {
            recv_window: 64 * 1024,
            peer_window: 64 * 1024,
            max_payload: 4096,
            linger: Duration::from_millis(100),
        };
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Multiplexer::spawn(a, FrameDecoder::new(1024 * 1024), Side::Client, cfg),
            Multiplexer::spawn(b, FrameDecoder::new(1024 * 1024), Side::Server, cfg),
        )
    }

    fn pool(reserve: usize) -> (WorkConnPool, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WorkConnPool::new("web".to_string(), reserve, tx), rx)
    }

    #[tokio::test]
    async fn test_take_satisfied_by_put() {
        let (client, _server) = stream_pair();
        let (pool, mut requests) = pool(0);

        let stream = client.handle().open_stream().unwrap();
        pool.put(WorkConn::new(stream, Bytes::new()));

        let conn = pool.take(Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.id(), 1);
        // An idle connection was available, so no take-driven request for
        // this one beyond the reserve logic.
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_waiter_receives_late_connection() {
        use std::sync::Arc;

        let (client, _server) = stream_pair();
        let (tx, mut requests) = mpsc::unbounded_channel();
        let pool = Arc::new(WorkConnPool::new("web".to_string(), 0, tx));

        let taker = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.take(Duration::from_secs(2)).await.map(|c| c.id()) })
        };
        assert_eq!(requests.recv().await.unwrap(), "web");

        let stream = client.handle().open_stream().unwrap();
        pool.put(WorkConn::new(stream, Bytes::new()));

        assert_eq!(taker.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_take_times_out_and_unregisters_waiter() {
        use std::sync::Arc;

        let (client, _server) = stream_pair();
        let (tx, _requests) = mpsc::unbounded_channel();
        let pool = Arc::new(WorkConnPool::new("web".to_string(), 0, tx));

        match pool.take(Duration::from_millis(50)).await {
            Err(PoolError::Timeout) => {}
            other => panic!("expected timeout, got {:?}", other.map(|c| c.id())),
        }

        // A connection arriving after the timeout goes to the reserve, not
        // to the dead waiter.
        let stream = client.handle().open_stream().unwrap();
        pool.put(WorkConn::new(stream, Bytes::new()));
        assert_eq!(pool.idle_len(), 1);
    }

    #[tokio::test]
    async fn test_close_fails_pending_waiters() {
        use std::sync::Arc;

        let (tx, _requests) = mpsc::unbounded_channel();
        let pool = Arc::new(WorkConnPool::new("web".to_string(), 0, tx));

        let taker = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.take(Duration::from_secs(5)).await.err() })
        };
        tokio::task::yield_now().await;
        pool.close();

        assert!(matches!(taker.await.unwrap(), Some(PoolError::Closed)));
        assert!(matches!(
            pool.take(Duration::from_secs(1)).await,
            Err(PoolError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_leftover_bytes_read_first() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (client, mut server) = stream_pair();
        let mut initiated = client.handle().open_stream().unwrap();
        let accepted = server.accept().await.unwrap();

        initiated.write_all(b" world").await.unwrap();
        initiated.shutdown().await.unwrap();

        let mut conn = WorkConn::new(accepted, Bytes::from_static(b"hello"));
        let mut all = Vec::new();
        conn.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"hello world");
    }
}
