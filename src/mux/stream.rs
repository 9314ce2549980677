//! Logical stream state and the public [`LogicalStream`] handle.
//!
//! Each stream keeps its receive buffer, flow-control windows, and closure
//! flags behind one mutex shared by the connection's reader task and the
//! application handle. Wakers registered by pending reads/writes are fired
//! by whichever side changes the state they wait on.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::mux::{MuxError, Shared};

/// Lifecycle of one logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Syn sent or received, no close signal yet.
    Established,
    /// One direction closed.
    HalfClosed,
    /// Both directions closed, or reset.
    Closed,
}

pub(crate) struct StreamShared {
    pub(crate) id: u32,
    pub(crate) conn: Weak<Shared>,
    inner: Mutex<StreamInner>,
}

struct StreamInner {
    recv_buf: BytesMut,
    send_window: u32,
    /// Peer sent Fin; no more data will arrive.
    remote_closed: bool,
    /// We sent Fin; no more data may be written.
    local_closed: bool,
    reset: bool,
    conn_closed: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl StreamShared {
    pub(crate) fn new(id: u32, conn: Weak<Shared>, send_window: u32) -> Self {
        Self {
            id,
            conn,
            inner: Mutex::new(StreamInner {
                recv_buf: BytesMut::new(),
                send_window,
                remote_closed: false,
                local_closed: false,
                reset: false,
                conn_closed: false,
                read_waker: None,
                write_waker: None,
            }),
        }
    }

    /// Current lifecycle state, for diagnostics.
    pub(crate) fn state(&self) -> StreamState {
        let inner = self.inner.lock().unwrap();
        if inner.reset || inner.conn_closed || (inner.local_closed && inner.remote_closed) {
            StreamState::Closed
        } else if inner.local_closed || inner.remote_closed {
            StreamState::HalfClosed
        } else {
            StreamState::Established
        }
    }

    /// Buffer data from the peer. Fails if the peer overran the receive
    /// window we advertised or wrote after its own Fin; both are protocol
    /// violations that terminate the connection.
    pub(crate) fn push_data(&self, data: Bytes, recv_window: u32) -> Result<(), MuxError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.reset || inner.conn_closed {
            return Ok(());
        }
        if inner.remote_closed {
            return Err(MuxError::Protocol(format!(
                "stream {}: data after fin",
                self.id
            )));
        }
        if inner.recv_buf.len() + data.len() > recv_window as usize {
            return Err(MuxError::Protocol(format!(
                "stream {}: receive window overrun",
                self.id
            )));
        }
        inner.recv_buf.extend_from_slice(&data);
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        Ok(())
    }

    /// Credit returned by the peer; unblocks pending writes.
    pub(crate) fn add_send_window(&self, delta: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.send_window = inner.send_window.saturating_add(delta);
        if let Some(waker) = inner.write_waker.take() {
            waker.wake();
        }
    }

    /// Peer half-closed. Returns true when both directions are now closed
    /// and the stream can leave the connection's table.
    pub(crate) fn remote_fin(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.remote_closed = true;
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        inner.local_closed
    }

    /// Peer aborted the stream.
    pub(crate) fn mark_reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.reset = true;
        wake_both(&mut inner);
    }

    /// The physical connection is gone.
    pub(crate) fn mark_conn_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.conn_closed = true;
        wake_both(&mut inner);
    }

    fn send_frame(&self, frame: crate::codec::Frame) -> Result<(), MuxError> {
        match self.conn.upgrade() {
            Some(conn) => conn.send_frame(frame),
            None => Err(MuxError::Closed),
        }
    }
}

fn wake_both(inner: &mut StreamInner) {
    if let Some(waker) = inner.read_waker.take() {
        waker.wake();
    }
    if let Some(waker) = inner.write_waker.take() {
        waker.wake();
    }
}

/// One multiplexed byte stream.
///
/// Reads drain the bounded receive buffer and return credit to the peer;
/// writes consume the peer-advertised window and back-pressure at zero.
/// Dropping the handle without a clean close aborts the stream (`Rst`).
pub struct LogicalStream {
    shared: Arc<StreamShared>,
}

impl LogicalStream {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        Self { shared }
    }

    /// Stream identifier, unique within its physical connection.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }
}

impl AsyncRead for LogicalStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().unwrap();

        if inner.reset {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        if !inner.recv_buf.is_empty() {
            let n = inner.recv_buf.len().min(buf.remaining());
            let chunk = inner.recv_buf.split_to(n);
            buf.put_slice(&chunk);
            let give_credit = !inner.remote_closed && !inner.conn_closed;
            drop(inner);
            if give_credit {
                // Credit failure means the connection died; the next read
                // observes that through conn_closed.
                let _ = shared.send_frame(super::window_update_frame(shared.id, n as u32));
            }
            return Poll::Ready(Ok(()));
        }
        if inner.remote_closed || inner.conn_closed {
            return Poll::Ready(Ok(()));
        }
        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for LogicalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().unwrap();

        if inner.reset {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        if inner.conn_closed || inner.local_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if inner.send_window == 0 {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let max_payload = match shared.conn.upgrade() {
            Some(conn) => conn.max_payload(),
            None => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        };
        let n = buf.len().min(inner.send_window as usize).min(max_payload);
        inner.send_window -= n as u32;
        drop(inner);

        match shared.send_frame(super::data_frame(shared.id, &buf[..n])) {
            Ok(()) => Poll::Ready(Ok(n)),
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the connection's writer task.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().unwrap();
        if inner.local_closed || inner.reset || inner.conn_closed {
            return Poll::Ready(Ok(()));
        }
        inner.local_closed = true;
        let fully_closed = inner.remote_closed;
        drop(inner);

        let _ = shared.send_frame(super::fin_frame(shared.id));
        if fully_closed {
            if let Some(conn) = shared.conn.upgrade() {
                conn.remove_stream(shared.id);
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for LogicalStream {
    fn drop(&mut self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().unwrap();
        if inner.reset || inner.conn_closed || (inner.local_closed && inner.remote_closed) {
            drop(inner);
            if let Some(conn) = shared.conn.upgrade() {
                conn.remove_stream(shared.id);
            }
            return;
        }

        if inner.local_closed {
            // Half-closed cleanly; give the peer a linger window to answer
            // with its own Fin before the entry is forced out.
            drop(inner);
            if let Some(conn) = shared.conn.upgrade() {
                let linger = conn.linger();
                let weak = Arc::downgrade(shared);
                let conn_weak = Arc::downgrade(&conn);
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        tokio::time::sleep(linger).await;
                        if let (Some(stream), Some(conn)) = (weak.upgrade(), conn_weak.upgrade()) {
                            let _ = stream.send_frame(super::rst_frame(stream.id));
                            conn.remove_stream(stream.id);
                        }
                    });
                } else {
                    let _ = shared.send_frame(super::rst_frame(shared.id));
                    conn.remove_stream(shared.id);
                }
            }
            return;
        }

        // Never closed: abort.
        inner.reset = true;
        drop(inner);
        let _ = shared.send_frame(super::rst_frame(shared.id));
        if let Some(conn) = shared.conn.upgrade() {
            conn.remove_stream(shared.id);
        }
    }
}

impl std::fmt::Debug for LogicalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalStream")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish()
    }
}
