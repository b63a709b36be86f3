//! SPDY frame types.
//!
//! Pure data: the wire parsing and encoding live in [`crate::codec`], header
//! block compression in [`crate::compress`].

use std::collections::BTreeMap;

use bytes::Bytes;

/// Decoded name/value header block. Multi-valued headers keep their values in
/// arrival order; on the wire they are NUL-joined.
pub type Headers = BTreeMap<String, Vec<String>>;

/// SPDY protocol version of a connection. Fixed at construction; frames of
/// any other version are rejected at dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    V2,
    V3,
}

impl Version {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }

    /// Per-stream flow control exists from version 3 on.
    pub fn flow_controlled(self) -> bool {
        matches!(self, Self::V3)
    }
}

/// Control frame type codes.
pub(crate) mod kind {
    pub const SYN_STREAM: u16 = 1;
    pub const SYN_REPLY: u16 = 2;
    pub const RST_STREAM: u16 = 3;
    pub const SETTINGS: u16 = 4;
    /// SPDY/2 only; removed in SPDY/3.
    pub const NOOP: u16 = 5;
    pub const PING: u16 = 6;
    pub const GOAWAY: u16 = 7;
    pub const HEADERS: u16 = 8;
    /// SPDY/3 only.
    pub const WINDOW_UPDATE: u16 = 9;
    /// SPDY/3 only.
    pub const CREDENTIAL: u16 = 10;
}

/// SETTINGS entry identifiers.
pub mod setting {
    pub const UPLOAD_BANDWIDTH: u32 = 1;
    pub const DOWNLOAD_BANDWIDTH: u32 = 2;
    pub const ROUND_TRIP_TIME: u32 = 3;
    pub const MAX_CONCURRENT_STREAMS: u32 = 4;
    pub const CURRENT_CWND: u32 = 5;
    pub const DOWNLOAD_RETRANS_RATE: u32 = 6;
    pub const INITIAL_WINDOW_SIZE: u32 = 7;
    pub const CLIENT_CERTIFICATE_VECTOR_SIZE: u32 = 8;

    /// Entry flag: the receiver should persist this value.
    pub const FLAG_PERSIST_VALUE: u8 = 0x01;
    /// Entry flag: this value was previously persisted by the sender.
    pub const FLAG_PERSISTED: u8 = 0x02;
    /// Frame flag: clear any previously persisted settings first.
    pub const FLAG_CLEAR_SETTINGS: u8 = 0x01;
}

/// GOAWAY status codes (SPDY/3; version 2 carries none on the wire).
pub mod goaway_status {
    pub const OK: u32 = 0;
    pub const PROTOCOL_ERROR: u32 = 1;
    pub const INTERNAL_ERROR: u32 = 2;
}

/// RST_STREAM status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RstStatus {
    ProtocolError = 1,
    InvalidStream = 2,
    RefusedStream = 3,
    UnsupportedVersion = 4,
    Cancel = 5,
    InternalError = 6,
    FlowControlError = 7,
    /// SPDY/3.
    StreamInUse = 8,
    /// SPDY/3.
    StreamAlreadyClosed = 9,
    /// SPDY/3.
    InvalidCredentials = 10,
}

impl RstStatus {
    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::ProtocolError,
            2 => Self::InvalidStream,
            3 => Self::RefusedStream,
            4 => Self::UnsupportedVersion,
            5 => Self::Cancel,
            6 => Self::InternalError,
            7 => Self::FlowControlError,
            8 => Self::StreamInUse,
            9 => Self::StreamAlreadyClosed,
            10 => Self::InvalidCredentials,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// SYN_STREAM: opens a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynStreamFrame {
    pub version: Version,
    pub stream_id: u32,
    /// Parent stream for pushed resources, 0 otherwise.
    pub associated_stream_id: u32,
    /// 2 bits on v2, 3 bits on v3. Higher value means lower priority.
    pub priority: u8,
    /// Credential slot (v3); 0 on v2.
    pub slot: u8,
    pub headers: Headers,
    pub fin: bool,
    pub unidirectional: bool,
}

/// SYN_REPLY: first response frame on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynReplyFrame {
    pub version: Version,
    pub stream_id: u32,
    pub headers: Headers,
    pub fin: bool,
}

/// RST_STREAM: abortive stream termination.
///
/// The status is kept raw: unknown codes are a dispatch concern, not a parse
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub version: Version,
    pub stream_id: u32,
    pub status_code: u32,
}

impl RstStreamFrame {
    pub fn new(version: Version, stream_id: u32, status: RstStatus) -> Self {
        Self {
            version,
            stream_id,
            status_code: status.as_u32(),
        }
    }

    pub fn status(&self) -> Option<RstStatus> {
        RstStatus::from_u32(self.status_code)
    }
}

/// One SETTINGS entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub flags: u8,
    pub id: u32,
    pub value: u32,
}

/// SETTINGS: connection-level configuration, last-write-wins per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFrame {
    pub version: Version,
    pub clear_persisted: bool,
    pub entries: Vec<Setting>,
}

/// PING: round-trip probe. Ping-ID parity identifies the originator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    pub version: Version,
    pub id: u32,
}

/// GOAWAY: the sender will accept no new streams above the given ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoawayFrame {
    pub version: Version,
    pub last_good_stream_id: u32,
    /// See [`goaway_status`]; always [`goaway_status::OK`] on v2.
    pub status: u32,
}

/// HEADERS: additional name/value pairs on an open stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    pub version: Version,
    pub stream_id: u32,
    pub headers: Headers,
    pub fin: bool,
}

/// WINDOW_UPDATE (v3): grants send-window credit on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub version: Version,
    pub stream_id: u32,
    pub delta: u32,
}

/// CREDENTIAL (v3): client certificate material for a slot. The payload is
/// kept opaque; this core routes it to a no-op handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialFrame {
    pub version: Version,
    pub slot: u16,
    pub payload: Bytes,
}

/// DATA: stream payload bytes. Carries no version field on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub fin: bool,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes, fin: bool) -> Self {
        Self {
            stream_id,
            data,
            fin,
        }
    }
}

/// Any SPDY frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    SynStream(SynStreamFrame),
    SynReply(SynReplyFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    Ping(PingFrame),
    Goaway(GoawayFrame),
    Headers(HeadersFrame),
    WindowUpdate(WindowUpdateFrame),
    Credential(CredentialFrame),
    Data(DataFrame),
}

impl Frame {
    /// Frame kind name, for log events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SynStream(_) => "SYN_STREAM",
            Self::SynReply(_) => "SYN_REPLY",
            Self::RstStream(_) => "RST_STREAM",
            Self::Settings(_) => "SETTINGS",
            Self::Ping(_) => "PING",
            Self::Goaway(_) => "GOAWAY",
            Self::Headers(_) => "HEADERS",
            Self::WindowUpdate(_) => "WINDOW_UPDATE",
            Self::Credential(_) => "CREDENTIAL",
            Self::Data(_) => "DATA",
        }
    }

    /// Protocol version, or `None` for DATA frames which carry no version.
    pub fn version(&self) -> Option<Version> {
        match self {
            Self::SynStream(f) => Some(f.version),
            Self::SynReply(f) => Some(f.version),
            Self::RstStream(f) => Some(f.version),
            Self::Settings(f) => Some(f.version),
            Self::Ping(f) => Some(f.version),
            Self::Goaway(f) => Some(f.version),
            Self::Headers(f) => Some(f.version),
            Self::WindowUpdate(f) => Some(f.version),
            Self::Credential(f) => Some(f.version),
            Self::Data(_) => None,
        }
    }

    /// Referenced stream, or 0 for connection-scoped frames.
    pub fn stream_id(&self) -> u32 {
        match self {
            Self::SynStream(f) => f.stream_id,
            Self::SynReply(f) => f.stream_id,
            Self::RstStream(f) => f.stream_id,
            Self::Headers(f) => f.stream_id,
            Self::WindowUpdate(f) => f.stream_id,
            Self::Data(f) => f.stream_id,
            Self::Settings(_) | Self::Ping(_) | Self::Goaway(_) | Self::Credential(_) => 0,
        }
    }
}
