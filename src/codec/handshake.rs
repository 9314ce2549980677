//! Connection handshake.
//!
//! Before any multiplexed traffic, the connecting side sends a `Hello` frame
//! offering a protocol version, the wire modes it supports, and its initial
//! per-stream receive window. The accepting side picks a mode and answers
//! with `HelloAck`. The negotiated mode is fixed for the lifetime of the
//! physical connection.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::frame::{read_frame, write_frame, Frame, FrameDecoder, FrameKind};
use crate::codec::FramingError;

/// Protocol version spoken by this build. Bumped on incompatible changes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Payload transform applied to frame payloads after the handshake.
///
/// Only `Plain` ships today; the negotiation is versioned so a compression
/// mode can be added without a protocol break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireMode {
    Plain,
}

/// Handshake offer sent by the connecting side.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    version: u8,
    modes: Vec<WireMode>,
    window: u32,
}

/// Handshake answer sent by the accepting side.
#[derive(Debug, Serialize, Deserialize)]
struct HelloAck {
    version: u8,
    mode: WireMode,
    window: u32,
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, Copy)]
pub struct Negotiated {
    /// Payload transform for the rest of the connection.
    pub mode: WireMode,
    /// The peer's initial per-stream receive window; our send budget.
    pub peer_window: u32,
}

/// Run the connecting side of the handshake.
pub async fn client_handshake<S>(
    io: &mut S,
    decoder: &mut FrameDecoder,
    window: u32,
) -> Result<Negotiated, FramingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = Hello {
        version: PROTOCOL_VERSION,
        modes: vec![WireMode::Plain],
        window,
    };
    write_frame(io, &encode_json(FrameKind::Hello, &hello)?).await?;

    let frame = expect_frame(io, decoder, FrameKind::HelloAck).await?;
    let ack: HelloAck = decode_json("hello ack", &frame.payload)?;
    if ack.version != PROTOCOL_VERSION {
        return Err(FramingError::Version(ack.version));
    }
    Ok(Negotiated {
        mode: ack.mode,
        peer_window: ack.window,
    })
}

/// Run the accepting side of the handshake.
pub async fn server_handshake<S>(
    io: &mut S,
    decoder: &mut FrameDecoder,
    window: u32,
) -> Result<Negotiated, FramingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = expect_frame(io, decoder, FrameKind::Hello).await?;
    let hello: Hello = decode_json("hello", &frame.payload)?;
    if hello.version != PROTOCOL_VERSION {
        return Err(FramingError::Version(hello.version));
    }
    if !hello.modes.contains(&WireMode::Plain) {
        return Err(FramingError::Malformed {
            what: "hello",
            detail: "no common wire mode".to_string(),
        });
    }

    let ack = HelloAck {
        version: PROTOCOL_VERSION,
        mode: WireMode::Plain,
        window,
    };
    write_frame(io, &encode_json(FrameKind::HelloAck, &ack)?).await?;

    Ok(Negotiated {
        mode: WireMode::Plain,
        peer_window: hello.window,
    })
}

async fn expect_frame<S>(
    io: &mut S,
    decoder: &mut FrameDecoder,
    kind: FrameKind,
) -> Result<Frame, FramingError>
where
    S: AsyncRead + Unpin,
{
    match read_frame(io, decoder).await? {
        Some(frame) if frame.kind == kind => Ok(frame),
        Some(frame) => Err(FramingError::Malformed {
            what: "handshake",
            detail: format!("expected {kind:?}, got {:?}", frame.kind),
        }),
        None => Err(FramingError::TruncatedFrame(0)),
    }
}

fn encode_json<T: Serialize>(kind: FrameKind, value: &T) -> Result<Frame, FramingError> {
    let payload = serde_json::to_vec(value).map_err(|e| FramingError::Malformed {
        what: "handshake payload",
        detail: e.to_string(),
    })?;
    Ok(Frame::new(kind, Bytes::from(payload)))
}

fn decode_json<'a, T: Deserialize<'a>>(
    what: &'static str,
    payload: &'a [u8],
) -> Result<T, FramingError> {
    serde_json::from_slice(payload).map_err(|e| FramingError::Malformed {
        what,
        detail: e.to_string(),
    })
}
