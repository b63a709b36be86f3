//! zlib compression of SPDY name/value header blocks.
//!
//! One [`HeaderCompressor`] and one [`HeaderDecompressor`] exist per
//! connection; the zlib dictionary state is shared across every header block
//! on that connection, so each object must stay with exactly one task
//! (compressor with the outbound serializer, decompressor with the ingress
//! loop). Neither is safe to share.

use bytes::{Buf, BufMut, Bytes};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use once_cell::sync::Lazy;
use tracing::trace;

use crate::frame::{Headers, Version};
use crate::Error;

/// Upper bound on a decompressed header block; a peer feeding us an
/// ever-expanding stream past this point is treated as a compression fault.
const MAX_DECOMPRESSED_LEN: usize = 256 * 1024;

/// SPDY/2 compression dictionary, from draft 2 of the protocol.
const DICTIONARY_V2: &[u8] =
    b"optionsgetheadpostputdeletetraceacceptaccept-charsetaccept-encodingaccept-\
languageauthorizationexpectfromhostif-modified-sinceif-matchif-none-matchi\
f-rangeif-unmodifiedsincemax-forwardsproxy-authorizationrangerefererteuser\
-agent10010120020120220320420520630030130230330430530630740040140240340440\
540640740840941041141241341441541641742050050150250350450550060160260360460\
5accept-rangesageetaglocationproxy-authenticatepublicretry-afterservervary\
warningwww-authenticateallowcontent-basecontent-encodingcache-controlconne\
ctiondatetrailertransfer-encodingupgradeviawarningcontent-languagecontent-\
lengthcontent-locationcontent-md5content-rangecontent-typeetagexpireslast-\
modifiedset-cookieMondayTuesdayWednesdayThursdayFridaySaturdaySundayJanFeb\
MarAprMayJunJulAugSepOctNovDecchunkedtext/htmlimage/pngimage/jpgimage/gifa\
pplication/xmlapplication/xhtmltext/plainpublicmax-agecharset=iso-8859-1ut\
f-8gzipdeflateHTTP/1.1statusversionurl\0";

/// SPDY/3 compression dictionary, from draft 3: a sequence of
/// length-prefixed tokens followed by one long literal tail.
static DICTIONARY_V3: Lazy<Vec<u8>> = Lazy::new(|| {
    const TOKENS: &[&str] = &[
        "options",
        "head",
        "post",
        "put",
        "delete",
        "trace",
        "accept",
        "accept-charset",
        "accept-encoding",
        "accept-language",
        "accept-ranges",
        "age",
        "allow",
        "authorization",
        "cache-control",
        "connection",
        "content-base",
        "content-encoding",
        "content-language",
        "content-length",
        "content-location",
        "content-md5",
        "content-range",
        "content-type",
        "date",
        "etag",
        "expect",
        "expires",
        "from",
        "host",
        "if-match",
        "if-modified-since",
        "if-none-match",
        "if-range",
        "if-unmodified-since",
        "last-modified",
        "location",
        "max-forwards",
        "pragma",
        "proxy-authenticate",
        "proxy-authorization",
        "range",
        "referer",
        "retry-after",
        "server",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
        "user-agent",
        "vary",
        "via",
        "warning",
        "www-authenticate",
        "method",
        "get",
        "status",
        "200 OK",
        "version",
        "HTTP/1.1",
        "url",
        "public",
        "set-cookie",
        "keep-alive",
        "origin",
        "100101201202205206300302303304305306307402405406407408409410411412413\
414415416417502504505203 Non-Authoritative Information204 No Content301 Moved \
Permanently400 Bad Request401 Unauthorized403 Forbidden404 Not Found500 \
Internal Server Error501 Not Implemented503 Service UnavailableJan Feb Mar Apr \
May Jun Jul Aug Sept Oct Nov Dec 00:00:00 Mon, Tue, Wed, Thu, Fri, Sat, Sun, \
GMTchunked,text/html,image/png,image/jpg,image/gif,application/xml,\
application/xhtml+xml,text/plain,text/javascript,publicprivatemax-age=gzip,\
deflate,sdchcharset=utf-8charset=iso-8859-1,utf-,*,enq=0.",
    ];
    let mut dict = Vec::with_capacity(1423);
    for token in TOKENS {
        dict.put_u32(token.len() as u32);
        dict.put_slice(token.as_bytes());
    }
    dict
});

fn dictionary(version: Version) -> &'static [u8] {
    match version {
        Version::V2 => DICTIONARY_V2,
        Version::V3 => &DICTIONARY_V3,
    }
}

/// Compresses name/value blocks for outbound SYN_STREAM, SYN_REPLY, and
/// HEADERS frames. Owned by the outbound serializer.
pub struct HeaderCompressor {
    version: Version,
    zlib: Compress,
}

impl HeaderCompressor {
    pub fn new(version: Version) -> Result<Self, Error> {
        let mut zlib = Compress::new(Compression::default(), true);
        zlib.set_dictionary(dictionary(version))
            .map_err(|e| Error::Compression(e.to_string()))?;
        Ok(Self { version, zlib })
    }

    /// Serialize and compress one header block. Each call continues the
    /// connection-lifetime zlib stream and ends with a sync flush so the
    /// peer can decode the block without waiting for more input.
    pub fn compress(&mut self, headers: &Headers) -> Result<Bytes, Error> {
        let plain = encode_name_value_block(self.version, headers);
        let mut out = Vec::with_capacity(plain.len() + 64);
        let mut pos = 0usize;
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            let before = self.zlib.total_in();
            self.zlib
                .compress_vec(&plain[pos..], &mut out, FlushCompress::Sync)
                .map_err(|e| Error::Compression(e.to_string()))?;
            pos += (self.zlib.total_in() - before) as usize;
            if pos == plain.len() && out.len() < out.capacity() {
                break;
            }
        }
        trace!(plain = plain.len(), compressed = out.len(), "header block");
        Ok(Bytes::from(out))
    }
}

/// Decompresses name/value blocks from inbound frames. Owned by the ingress
/// loop. Any error here is connection-fatal: the dictionary state can no
/// longer be trusted.
pub struct HeaderDecompressor {
    version: Version,
    zlib: Decompress,
}

impl HeaderDecompressor {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            zlib: Decompress::new(true),
        }
    }

    /// Decompress and parse one header block.
    pub fn decompress(&mut self, block: &[u8]) -> Result<Headers, Error> {
        let base = self.zlib.total_in();
        let mut out = Vec::with_capacity(2 * block.len() + 64);
        loop {
            if out.len() == out.capacity() {
                if out.capacity() >= MAX_DECOMPRESSED_LEN {
                    return Err(Error::Compression("header block too large".into()));
                }
                out.reserve(out.capacity().max(256));
            }
            let pos = (self.zlib.total_in() - base) as usize;
            match self
                .zlib
                .decompress_vec(&block[pos..], &mut out, FlushDecompress::Sync)
            {
                Ok(_) => {
                    let pos = (self.zlib.total_in() - base) as usize;
                    if pos == block.len() && out.len() < out.capacity() {
                        break;
                    }
                }
                Err(e) if e.needs_dictionary().is_some() => {
                    self.zlib
                        .set_dictionary(dictionary(self.version))
                        .map_err(|e| Error::Compression(e.to_string()))?;
                }
                Err(e) => return Err(Error::Compression(e.to_string())),
            }
        }
        decode_name_value_block(self.version, &out)
    }
}

/// Plaintext layout: entry count, then (length, name, length, value) pairs.
/// Lengths are 16-bit on v2 and 32-bit on v3; multi-valued headers are
/// NUL-joined into one value.
fn encode_name_value_block(version: Version, headers: &Headers) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    let put_len = |buf: &mut Vec<u8>, len: usize| match version {
        Version::V2 => buf.put_u16(len as u16),
        Version::V3 => buf.put_u32(len as u32),
    };
    put_len(&mut buf, headers.len());
    for (name, values) in headers {
        let name = name.to_ascii_lowercase();
        let joined = values.join("\0");
        put_len(&mut buf, name.len());
        buf.put_slice(name.as_bytes());
        put_len(&mut buf, joined.len());
        buf.put_slice(joined.as_bytes());
    }
    buf
}

fn decode_name_value_block(version: Version, mut data: &[u8]) -> Result<Headers, Error> {
    let len_size = match version {
        Version::V2 => 2,
        Version::V3 => 4,
    };
    let get_len = |data: &mut &[u8]| -> Result<usize, Error> {
        if data.remaining() < len_size {
            return Err(Error::Frame("truncated name/value block".into()));
        }
        Ok(match version {
            Version::V2 => data.get_u16() as usize,
            Version::V3 => data.get_u32() as usize,
        })
    };
    let get_str = |data: &mut &[u8]| -> Result<String, Error> {
        let len = get_len(data)?;
        if data.remaining() < len {
            return Err(Error::Frame("truncated name/value entry".into()));
        }
        let raw = data.copy_to_bytes(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::Frame("name/value entry is not valid utf-8".into()))
    };

    let count = get_len(&mut data)?;
    let mut headers = Headers::new();
    for _ in 0..count {
        let name = get_str(&mut data)?;
        if name.is_empty() {
            return Err(Error::Frame("empty header name".into()));
        }
        let value = get_str(&mut data)?;
        let values: Vec<String> = value.split('\0').map(str::to_owned).collect();
        if headers.insert(name, values).is_some() {
            return Err(Error::Frame("duplicate header name".into()));
        }
    }
    if data.has_remaining() {
        return Err(Error::Frame("trailing bytes after name/value block".into()));
    }
    Ok(headers)
}
