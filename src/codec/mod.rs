//! Wire codec.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → handshake.rs (Hello/HelloAck: version, wire mode, windows)
//!     → frame.rs (kind + length + payload transport frames, for the mux)
//!     → message.rs (typed JSON messages, over a logical stream)
//! ```
//!
//! # Design Decisions
//! - Decoding is resumable: the transport may deliver bytes in arbitrary
//!   chunk sizes and the decoder never loses state between reads
//! - A malformed or oversized length prefix fails fast with a
//!   [`FramingError`] that terminates the connection
//! - The wire mode is negotiated once and fixed per connection

pub mod frame;
pub mod handshake;
pub mod message;

use thiserror::Error;

pub use frame::{encode_frame, read_frame, write_frame, Frame, FrameDecoder, FrameKind};
pub use handshake::{client_handshake, server_handshake, Negotiated, WireMode, PROTOCOL_VERSION};
pub use message::MessageStream;

/// Errors raised by the framing layer. All of them terminate the physical
/// connection they occur on.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    #[error("peer speaks protocol version {0}, this build speaks {PROTOCOL_VERSION}")]
    Version(u8),

    #[error("malformed {what}: {detail}")]
    Malformed {
        what: &'static str,
        detail: String,
    },

    #[error("connection closed mid-frame with {0} buffered bytes")]
    TruncatedFrame(usize),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}
