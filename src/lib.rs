//! spdymux: a SPDY (versions 2 and 3) connection multiplexer.
//!
//! The crate owns a single already-negotiated secure byte stream and
//! multiplexes many independent request/response streams over it according to
//! the SPDY framing protocol. TLS and NPN/ALPN selection happen elsewhere;
//! the caller hands in any `AsyncRead + AsyncWrite` transport together with
//! the negotiated protocol version.
//!
//! Sub-streams are opened with [`Control`] (client role) or pushed with it
//! (server role); streams initiated by the peer arrive on [`Incoming`]. The
//! connection itself must be driven persistently with [`Session::run`].

use std::io;

use thiserror::Error;

pub mod client;
mod codec;
mod compress;
mod frame;
pub mod server;
mod session;
mod stream;
mod utils;

pub use crate::codec::{Decoded, FrameCodec};
pub use crate::compress::{HeaderCompressor, HeaderDecompressor};
pub use crate::frame::{
    goaway_status, setting, CredentialFrame, DataFrame, Frame, GoawayFrame, Headers, HeadersFrame,
    PingFrame, RstStatus, RstStreamFrame, Setting, SettingsFrame, SynReplyFrame, SynStreamFrame,
    Version, WindowUpdateFrame,
};
pub use crate::session::{Builder, Config, Control, Incoming, Ping, Role, Session};
pub use crate::stream::{PushWriter, StreamEvent, StreamHandle};

/// Highest stream (and ping) identifier expressible in the 31-bit wire field.
pub const MAX_STREAM_ID: u32 = (1 << 31) - 1;

/// Largest legal WINDOW_UPDATE delta.
pub const MAX_DELTA_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// Per-stream send window granted to new streams before any SETTINGS says
/// otherwise (SPDY/3 flow control).
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 64 * 1024;

/// Frame flag: the sender will transmit no more frames on this stream half.
pub const FLAG_FIN: u8 = 0x01;

/// SYN_STREAM flag: the stream is one-directional (server push).
pub const FLAG_UNIDIRECTIONAL: u8 = 0x02;

/// Protocol violations tolerated per connection before escalating to a
/// connection-level PROTOCOL_ERROR.
pub const MAX_BENIGN_ERRORS: u32 = 10;

#[derive(Error, Debug)]
pub enum Error {
    #[error("transport i/o error")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Frame(String),
    #[error("header block compression error: {0}")]
    Compression(String),
    #[error("unsupported SPDY version {0}")]
    UnsupportedVersion(u16),
    #[error("protocol error on stream {0}")]
    Protocol(u32),
    #[error("connection is going away")]
    GoingAway,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("stream {0} is closed for sending")]
    StreamClosed(u32),
    #[error("stream identifier space exhausted")]
    StreamsExhausted,
    #[error("operation requires the {0:?} role")]
    WrongRole(Role),
}
