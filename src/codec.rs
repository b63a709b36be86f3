//! SPDY frame wire codec.
//!
//! Control frames: `1 | version(15) | type(16) | flags(8) | length(24)`.
//! Data frames: `0 | stream-id(31) | flags(8) | length(24)`. All integers are
//! big-endian except the SPDY/2 SETTINGS entry ID, which draft 2 specifies as
//! 24-bit little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::compress::{HeaderCompressor, HeaderDecompressor};
use crate::frame::{
    kind, CredentialFrame, DataFrame, Frame, GoawayFrame, HeadersFrame, PingFrame, RstStreamFrame,
    Setting, SettingsFrame, SynReplyFrame, SynStreamFrame, Version, WindowUpdateFrame,
};
use crate::{Error, FLAG_FIN, FLAG_UNIDIRECTIONAL};

const HEADER_LEN: usize = 8;
const STREAM_ID_MASK: u32 = (1 << 31) - 1;

/// Result of reading one frame off the wire.
#[derive(Debug)]
pub enum Decoded {
    Frame(Frame),
    /// Control frame whose version field differs from the connection's. The
    /// payload is discarded; dispatch decides how loudly to object.
    WrongVersion {
        version: u16,
        kind: u16,
        stream_id: u32,
    },
    /// Control frame type this version does not define.
    UnknownKind { kind: u16 },
}

/// Reads and writes frames for one connection at one protocol version.
pub struct FrameCodec {
    version: Version,
}

impl FrameCodec {
    pub fn new(version: Version) -> Self {
        Self { version }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Read one frame. `Ok(None)` is a clean end of stream (EOF on a frame
    /// boundary); EOF mid-frame, parse failures, and i/o errors are fatal.
    pub async fn read_frame<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        decompressor: &mut HeaderDecompressor,
    ) -> Result<Option<Decoded>, Error> {
        loop {
            let mut head = [0u8; HEADER_LEN];
            let mut filled = 0usize;
            while filled < HEADER_LEN {
                let n = reader.read(&mut head[filled..]).await?;
                if n == 0 {
                    if filled == 0 {
                        return Ok(None);
                    }
                    return Err(Error::Frame("eof inside frame header".into()));
                }
                filled += n;
            }

            let length = u32::from_be_bytes([0, head[5], head[6], head[7]]) as usize;
            let flags = head[4];
            let mut payload = vec![0u8; length];
            reader.read_exact(&mut payload).await?;
            let payload = Bytes::from(payload);

            if head[0] & 0x80 == 0 {
                let stream_id =
                    u32::from_be_bytes([head[0], head[1], head[2], head[3]]) & STREAM_ID_MASK;
                trace!(stream_id, len = length, "read DATA");
                return Ok(Some(Decoded::Frame(Frame::Data(DataFrame {
                    stream_id,
                    data: payload,
                    fin: flags & FLAG_FIN != 0,
                }))));
            }

            let version_raw = u16::from_be_bytes([head[0] & 0x7f, head[1]]);
            let frame_kind = u16::from_be_bytes([head[2], head[3]]);
            if version_raw != self.version.as_u16() {
                return Ok(Some(Decoded::WrongVersion {
                    version: version_raw,
                    kind: frame_kind,
                    stream_id: leading_stream_id(frame_kind, &payload),
                }));
            }
            if frame_kind == kind::NOOP && self.version == Version::V2 {
                trace!("skipped NOOP");
                continue;
            }
            return self.parse_control(frame_kind, flags, payload, decompressor);
        }
    }

    fn parse_control(
        &self,
        frame_kind: u16,
        flags: u8,
        mut payload: Bytes,
        decompressor: &mut HeaderDecompressor,
    ) -> Result<Option<Decoded>, Error> {
        let version = self.version;
        let frame = match frame_kind {
            kind::SYN_STREAM => {
                if payload.len() < 10 {
                    return Err(Error::Frame("short SYN_STREAM".into()));
                }
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                let associated_stream_id = payload.get_u32() & STREAM_ID_MASK;
                let pri_byte = payload.get_u8();
                let slot = payload.get_u8();
                let (priority, slot) = match version {
                    Version::V2 => (pri_byte >> 6, 0),
                    Version::V3 => (pri_byte >> 5, slot),
                };
                Frame::SynStream(SynStreamFrame {
                    version,
                    stream_id,
                    associated_stream_id,
                    priority,
                    slot,
                    headers: decompressor.decompress(&payload)?,
                    fin: flags & FLAG_FIN != 0,
                    unidirectional: flags & FLAG_UNIDIRECTIONAL != 0,
                })
            }
            kind::SYN_REPLY => {
                let (stream_id, block) = self.stream_then_block(&mut payload, "SYN_REPLY")?;
                Frame::SynReply(SynReplyFrame {
                    version,
                    stream_id,
                    headers: decompressor.decompress(&block)?,
                    fin: flags & FLAG_FIN != 0,
                })
            }
            kind::HEADERS => {
                let (stream_id, block) = self.stream_then_block(&mut payload, "HEADERS")?;
                Frame::Headers(HeadersFrame {
                    version,
                    stream_id,
                    headers: decompressor.decompress(&block)?,
                    fin: flags & FLAG_FIN != 0,
                })
            }
            kind::RST_STREAM => {
                if payload.len() != 8 {
                    return Err(Error::Frame("RST_STREAM length must be 8".into()));
                }
                Frame::RstStream(RstStreamFrame {
                    version,
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    status_code: payload.get_u32(),
                })
            }
            kind::SETTINGS => {
                if payload.len() < 4 {
                    return Err(Error::Frame("short SETTINGS".into()));
                }
                let count = payload.get_u32() as usize;
                if payload.len() != count * 8 {
                    return Err(Error::Frame("SETTINGS length mismatch".into()));
                }
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(match version {
                        // Draft 2 quirk: 24-bit little-endian ID, then flags.
                        Version::V2 => {
                            let b = [payload.get_u8(), payload.get_u8(), payload.get_u8()];
                            let flags = payload.get_u8();
                            Setting {
                                flags,
                                id: u32::from_le_bytes([b[0], b[1], b[2], 0]),
                                value: payload.get_u32(),
                            }
                        }
                        Version::V3 => {
                            let flags = payload.get_u8();
                            let b = [payload.get_u8(), payload.get_u8(), payload.get_u8()];
                            Setting {
                                flags,
                                id: u32::from_be_bytes([0, b[0], b[1], b[2]]),
                                value: payload.get_u32(),
                            }
                        }
                    });
                }
                Frame::Settings(SettingsFrame {
                    version,
                    clear_persisted: flags & crate::frame::setting::FLAG_CLEAR_SETTINGS != 0,
                    entries,
                })
            }
            kind::PING => {
                if payload.len() != 4 {
                    return Err(Error::Frame("PING length must be 4".into()));
                }
                Frame::Ping(PingFrame {
                    version,
                    id: payload.get_u32(),
                })
            }
            kind::GOAWAY => {
                let want = match version {
                    Version::V2 => 4,
                    Version::V3 => 8,
                };
                if payload.len() != want {
                    return Err(Error::Frame("GOAWAY length mismatch".into()));
                }
                let last_good_stream_id = payload.get_u32() & STREAM_ID_MASK;
                let status = match version {
                    Version::V2 => crate::frame::goaway_status::OK,
                    Version::V3 => payload.get_u32(),
                };
                Frame::Goaway(GoawayFrame {
                    version,
                    last_good_stream_id,
                    status,
                })
            }
            kind::WINDOW_UPDATE if version == Version::V3 => {
                if payload.len() != 8 {
                    return Err(Error::Frame("WINDOW_UPDATE length must be 8".into()));
                }
                Frame::WindowUpdate(WindowUpdateFrame {
                    version,
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    delta: payload.get_u32() & STREAM_ID_MASK,
                })
            }
            kind::CREDENTIAL if version == Version::V3 => {
                if payload.len() < 2 {
                    return Err(Error::Frame("short CREDENTIAL".into()));
                }
                let slot = payload.get_u16();
                Frame::Credential(CredentialFrame {
                    version,
                    slot,
                    payload,
                })
            }
            other => return Ok(Some(Decoded::UnknownKind { kind: other })),
        };
        trace!(kind = frame.kind(), stream_id = frame.stream_id(), "read frame");
        Ok(Some(Decoded::Frame(frame)))
    }

    fn stream_then_block(&self, payload: &mut Bytes, what: &str) -> Result<(u32, Bytes), Error> {
        let skip = match self.version {
            Version::V2 => 2,
            Version::V3 => 0,
        };
        if payload.len() < 4 + skip {
            return Err(Error::Frame(format!("short {what}")));
        }
        let stream_id = payload.get_u32() & STREAM_ID_MASK;
        payload.advance(skip);
        Ok((stream_id, payload.clone()))
    }

    /// Encode and write one frame, then flush.
    pub async fn write_frame<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        frame: &Frame,
        compressor: &mut HeaderCompressor,
    ) -> Result<(), Error> {
        let mut buf = BytesMut::with_capacity(64);
        self.encode(frame, &mut buf, compressor)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        trace!(kind = frame.kind(), len = buf.len(), "wrote frame");
        Ok(())
    }

    /// Encode one frame into `buf`.
    pub fn encode(
        &mut self,
        frame: &Frame,
        buf: &mut BytesMut,
        compressor: &mut HeaderCompressor,
    ) -> Result<(), Error> {
        match frame {
            Frame::Data(f) => {
                buf.put_u32(f.stream_id & STREAM_ID_MASK);
                buf.put_u8(if f.fin { FLAG_FIN } else { 0 });
                put_u24(buf, f.data.len());
                buf.put_slice(&f.data);
            }
            Frame::SynStream(f) => {
                let block = compressor.compress(&f.headers)?;
                let mut flags = 0;
                if f.fin {
                    flags |= FLAG_FIN;
                }
                if f.unidirectional {
                    flags |= FLAG_UNIDIRECTIONAL;
                }
                self.control_header(buf, kind::SYN_STREAM, flags, 10 + block.len());
                buf.put_u32(f.stream_id & STREAM_ID_MASK);
                buf.put_u32(f.associated_stream_id & STREAM_ID_MASK);
                match self.version {
                    Version::V2 => {
                        buf.put_u8(f.priority << 6);
                        buf.put_u8(0);
                    }
                    Version::V3 => {
                        buf.put_u8(f.priority << 5);
                        buf.put_u8(f.slot);
                    }
                }
                buf.put_slice(&block);
            }
            Frame::SynReply(f) => {
                let block = compressor.compress(&f.headers)?;
                self.headers_like(buf, kind::SYN_REPLY, f.stream_id, f.fin, &block);
            }
            Frame::Headers(f) => {
                let block = compressor.compress(&f.headers)?;
                self.headers_like(buf, kind::HEADERS, f.stream_id, f.fin, &block);
            }
            Frame::RstStream(f) => {
                self.control_header(buf, kind::RST_STREAM, 0, 8);
                buf.put_u32(f.stream_id & STREAM_ID_MASK);
                buf.put_u32(f.status_code);
            }
            Frame::Settings(f) => {
                let flags = if f.clear_persisted {
                    crate::frame::setting::FLAG_CLEAR_SETTINGS
                } else {
                    0
                };
                self.control_header(buf, kind::SETTINGS, flags, 4 + 8 * f.entries.len());
                buf.put_u32(f.entries.len() as u32);
                for entry in &f.entries {
                    match self.version {
                        Version::V2 => {
                            let id = entry.id.to_le_bytes();
                            buf.put_slice(&id[..3]);
                            buf.put_u8(entry.flags);
                        }
                        Version::V3 => {
                            buf.put_u8(entry.flags);
                            let id = entry.id.to_be_bytes();
                            buf.put_slice(&id[1..]);
                        }
                    }
                    buf.put_u32(entry.value);
                }
            }
            Frame::Ping(f) => {
                self.control_header(buf, kind::PING, 0, 4);
                buf.put_u32(f.id);
            }
            Frame::Goaway(f) => {
                let len = match self.version {
                    Version::V2 => 4,
                    Version::V3 => 8,
                };
                self.control_header(buf, kind::GOAWAY, 0, len);
                buf.put_u32(f.last_good_stream_id & STREAM_ID_MASK);
                if self.version == Version::V3 {
                    buf.put_u32(f.status);
                }
            }
            Frame::WindowUpdate(f) => {
                self.control_header(buf, kind::WINDOW_UPDATE, 0, 8);
                buf.put_u32(f.stream_id & STREAM_ID_MASK);
                buf.put_u32(f.delta & STREAM_ID_MASK);
            }
            Frame::Credential(f) => {
                self.control_header(buf, kind::CREDENTIAL, 0, 2 + f.payload.len());
                buf.put_u16(f.slot);
                buf.put_slice(&f.payload);
            }
        }
        Ok(())
    }

    fn control_header(&self, buf: &mut BytesMut, frame_kind: u16, flags: u8, len: usize) {
        buf.put_u16(0x8000 | self.version.as_u16());
        buf.put_u16(frame_kind);
        buf.put_u8(flags);
        put_u24(buf, len);
    }

    fn headers_like(
        &self,
        buf: &mut BytesMut,
        frame_kind: u16,
        stream_id: u32,
        fin: bool,
        block: &[u8],
    ) {
        let skip = match self.version {
            Version::V2 => 2,
            Version::V3 => 0,
        };
        let flags = if fin { FLAG_FIN } else { 0 };
        self.control_header(buf, frame_kind, flags, 4 + skip + block.len());
        buf.put_u32(stream_id & STREAM_ID_MASK);
        buf.put_bytes(0, skip);
        buf.put_slice(block);
    }
}

/// Stream ID sitting at the head of the payload for stream-scoped control
/// frames; 0 for everything else. Used to address replies to frames we will
/// not otherwise interpret.
fn leading_stream_id(frame_kind: u16, payload: &[u8]) -> u32 {
    match frame_kind {
        kind::SYN_STREAM
        | kind::SYN_REPLY
        | kind::RST_STREAM
        | kind::HEADERS
        | kind::WINDOW_UPDATE
            if payload.len() >= 4 =>
        {
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & STREAM_ID_MASK
        }
        _ => 0,
    }
}

fn put_u24(buf: &mut BytesMut, len: usize) {
    debug_assert!(len < 1 << 24);
    buf.put_u8((len >> 16) as u8);
    buf.put_u8((len >> 8) as u8);
    buf.put_u8(len as u8);
}
