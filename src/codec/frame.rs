//! Length-prefixed transport frames.
//!
//! # Responsibilities
//! - Encode frames as kind byte + u32 big-endian length + payload
//! - Decode resumably across arbitrary read chunk sizes
//! - Bound payload lengths before the bytes arrive
//!
//! # Design Decisions
//! - An oversized length prefix fails immediately rather than waiting for
//!   bytes that may never come
//! - The decoder owns its buffer so a handshake can hand leftover bytes to
//!   the multiplexer without losing data

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::FramingError;

/// Frame header: 1 kind byte + 4 length bytes.
pub const FRAME_HEADER_LEN: usize = 5;

/// Frame kinds carried on a physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Handshake offer, first frame sent by the connecting side.
    Hello = 0x00,
    /// Handshake answer, sent by the accepting side.
    HelloAck = 0x01,
    /// Open a logical stream.
    Syn = 0x10,
    /// Bytes for a logical stream.
    Data = 0x11,
    /// Flow-control credit for a logical stream.
    WindowUpdate = 0x12,
    /// Half-close of a logical stream.
    Fin = 0x13,
    /// Abortive close of a logical stream.
    Rst = 0x14,
}

impl FrameKind {
    /// Parse a kind byte.
    pub fn from_u8(byte: u8) -> Result<Self, FramingError> {
        match byte {
            0x00 => Ok(FrameKind::Hello),
            0x01 => Ok(FrameKind::HelloAck),
            0x10 => Ok(FrameKind::Syn),
            0x11 => Ok(FrameKind::Data),
            0x12 => Ok(FrameKind::WindowUpdate),
            0x13 => Ok(FrameKind::Fin),
            0x14 => Ok(FrameKind::Rst),
            other => Err(FramingError::UnknownKind(other)),
        }
    }
}

/// One decoded transport frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Bytes) -> Self {
        Self { kind, payload }
    }
}

/// Encode a frame into a fresh buffer.
pub fn encode_frame(frame: &Frame) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + frame.payload.len());
    buf.put_u8(frame.kind as u8);
    buf.put_u32(frame.payload.len() as u32);
    buf.put_slice(&frame.payload);
    buf
}

/// Resumable frame decoder.
///
/// Feed it whatever the transport delivers; [`FrameDecoder::next`] yields a
/// frame once a complete one is buffered. Decoding state survives partial
/// reads, so the transport may deliver bytes in arbitrary chunk sizes.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame: usize,
}

impl FrameDecoder {
    /// Create a decoder that rejects payloads above `max_frame` bytes.
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame,
        }
    }

    /// Append raw transport bytes to the decode buffer.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode one frame from the buffered bytes.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A length prefix above
    /// the configured maximum fails without waiting for the payload.
    pub fn next(&mut self) -> Result<Option<Frame>, FramingError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let kind = FrameKind::from_u8(self.buf[0])?;
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > self.max_frame {
            return Err(FramingError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(FRAME_HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(Frame { kind, payload }))
    }
}

/// Read frames from `io` until the decoder yields one.
///
/// Returns `Ok(None)` on clean EOF; EOF in the middle of a frame is a
/// [`FramingError::TruncatedFrame`].
pub async fn read_frame<S>(
    io: &mut S,
    decoder: &mut FrameDecoder,
) -> Result<Option<Frame>, FramingError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = decoder.next()? {
            return Ok(Some(frame));
        }

        let mut chunk = [0u8; 4096];
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            let trailing = decoder.buffered();
            if trailing != 0 {
                return Err(FramingError::TruncatedFrame(trailing));
            }
            return Ok(None);
        }
        decoder.feed(&chunk[..n]);
    }
}

/// Write one frame and flush.
pub async fn write_frame<S>(io: &mut S, frame: &Frame) -> Result<(), FramingError>
where
    S: AsyncWrite + Unpin,
{
    io.write_all(&encode_frame(frame)).await?;
    io.flush().await?;
    Ok(())
}
