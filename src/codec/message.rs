//! Typed message framing over a byte stream.
//!
//! Used on the control stream and for the work-connection preamble. The
//! layout mirrors the transport frames (tag byte + u32 big-endian length +
//! body) but the body is a JSON-encoded [`Message`]. Reads are resumable
//! across partial reads and bounded by the same maximum frame size.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::frame::FRAME_HEADER_LEN;
use crate::codec::FramingError;
use crate::msg::Message;

/// A message-framed wrapper over any async byte stream.
pub struct MessageStream<S> {
    io: S,
    buf: BytesMut,
    max_frame: usize,
}

impl<S> MessageStream<S> {
    /// Wrap `io`, rejecting message bodies above `max_frame` bytes.
    pub fn new(io: S, max_frame: usize) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4096),
            max_frame,
        }
    }

    /// Unwrap, returning the stream and any bytes read past the last
    /// decoded message. Callers splicing raw data afterwards must serve the
    /// leftover first.
    pub fn into_parts(self) -> (S, Bytes) {
        (self.io, self.buf.freeze())
    }

    fn try_decode(&mut self) -> Result<Option<Message>, FramingError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let kind = self.buf[0];
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
        let payload = self.buf.split_to(len);
        Message::decode(kind, &payload).map(Some)
    }
}

impl<S> MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send one message and flush.
    pub async fn send(&mut self, msg: &Message) -> Result<(), FramingError> {
        let payload = msg.encode_payload()?;
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.put_u8(msg.kind() as u8);
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);
        self.io.write_all(&frame).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` on clean EOF; EOF inside a message is a
    /// [`FramingError::TruncatedFrame`].
    pub async fn recv(&mut self) -> Result<Option<Message>, FramingError> {
        loop {
            if let Some(msg) = self.try_decode()? {
                return Ok(Some(msg));
            }

            let mut chunk = [0u8; 4096];
            let n = self.io.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(FramingError::TruncatedFrame(self.buf.len()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{Login, Ping};

    #[tokio::test]
    async fn test_roundtrip_preserves_leftover() {
        let (client_io, server_io) = tokio::io::duplex(4096);

        let mut sender = MessageStream::new(client_io, 64 * 1024);
        sender
            .send(&Message::Login(Login {
                version: "0.1.0".into(),
                hostname: None,
                token: Some("secret".into()),
            }))
            .await
            .unwrap();
        sender.send(&Message::Ping(Ping {})).await.unwrap();
        // Raw bytes after the last message must survive into_parts().
        let (mut raw, _) = sender.into_parts();
        raw.write_all(b"spliced-data").await.unwrap();
        drop(raw);

        let mut receiver = MessageStream::new(server_io, 64 * 1024);
        match receiver.recv().await.unwrap() {
            Some(Message::Login(login)) => assert_eq!(login.token.as_deref(), Some("secret")),
            other => panic!("expected login, got {other:?}"),
        }
        assert!(matches!(receiver.recv().await.unwrap(), Some(Message::Ping(_))));

        let (mut io, leftover) = receiver.into_parts();
        let mut rest = leftover.to_vec();
        io.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"spliced-data");
    }

    #[tokio::test]
    async fn test_eof_mid_message_is_truncation() {
        let (mut client_io, server_io) = tokio::io::duplex(4096);
        // A header promising 100 bytes, then hang up.
        client_io.write_all(&[0x06, 0, 0, 0, 100]).await.unwrap();
        drop(client_io);

        let mut receiver = MessageStream::new(server_io, 64 * 1024);
        assert!(matches!(
            receiver.recv().await,
            Err(FramingError::TruncatedFrame(_))
        ));
    }
}
