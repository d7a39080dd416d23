//! STOMP wire codec.
//!
//! Splits a byte stream into [`StompItem`]s and encodes outbound items:
//! command line, `key:value` headers until a blank line, body until NUL (or
//! `content-length` bytes followed by NUL). A bare newline between frames is
//! a heart-beat. The codec also carries the read/write byte counters sampled
//! by the heart-beat monitor and the attachment point for a host-provided
//! buffer pool used for large bodies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::broker::BufferPool;
use crate::stomp::frame::{header, Frame, StompItem};

/// Default cap on a single frame, including headers.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Bodies at or above this size are checked out of the attached pool.
const LARGE_BODY_THRESHOLD: usize = 4096;

/// True when the stream opens with a STOMP connect command. Used by
/// multi-protocol listeners to pick the handler for a fresh connection.
pub fn identifiable(buf: &[u8]) -> bool {
    buf.starts_with(b"CONNECT") || buf.starts_with(b"STOMP")
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame exceeds maximum size of {0} bytes")]
    FrameTooLarge(usize),
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("frame body missing NUL terminator")]
    MissingBodyTerminator,
    #[error("frame is not valid utf-8")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Codec handle
// ---------------------------------------------------------------------------

/// Shared view of the codec's counters and pool slot. The connection keeps a
/// clone so it can arm the heart-beat monitor and attach the host's buffer
/// pool after the handshake, while the codec itself is owned by the framed
/// reader and writer.
#[derive(Clone, Default)]
pub struct CodecHandle {
    read_bytes: Arc<AtomicU64>,
    written_bytes: Arc<AtomicU64>,
    pool: Arc<Mutex<Option<Arc<dyn BufferPool>>>>,
}

impl CodecHandle {
    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::Relaxed)
    }

    pub fn read_counter(&self) -> Arc<AtomicU64> {
        self.read_bytes.clone()
    }

    pub fn write_counter(&self) -> Arc<AtomicU64> {
        self.written_bytes.clone()
    }

    pub fn attach_pool(&self, pool: Arc<dyn BufferPool>) {
        *self.pool.lock() = Some(pool);
    }
}

impl std::fmt::Debug for CodecHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecHandle")
            .field("read_bytes", &self.read_bytes())
            .field("written_bytes", &self.written_bytes())
            .field("pool", &self.pool.lock().is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

pub struct StompCodec {
    handle: CodecHandle,
    max_frame_size: usize,
}

impl StompCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            handle: CodecHandle::default(),
            max_frame_size,
        }
    }

    /// Second codec sharing the counters and pool slot of this one, for the
    /// write half of a split transport.
    pub fn share(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            max_frame_size: self.max_frame_size,
        }
    }

    pub fn handle(&self) -> CodecHandle {
        self.handle.clone()
    }

    fn incomplete(&self, src: &BytesMut) -> Result<Option<StompItem>, CodecError> {
        if src.len() > self.max_frame_size {
            Err(CodecError::FrameTooLarge(self.max_frame_size))
        } else {
            Ok(None)
        }
    }

    fn checkout_body(&self, body: &[u8]) -> Bytes {
        if body.is_empty() {
            return Bytes::new();
        }
        if body.len() >= LARGE_BODY_THRESHOLD {
            if let Some(pool) = self.handle.pool.lock().clone() {
                let mut checked = pool.checkout(body.len());
                checked.extend_from_slice(body);
                return checked.freeze();
            }
        }
        Bytes::copy_from_slice(body)
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Next `\n`-terminated line starting at `pos`, with any trailing `\r`
/// stripped. Advances `pos` past the terminator.
fn next_line<'a>(buf: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let rest = &buf[*pos..];
    let nl = rest.iter().position(|&b| b == b'\n')?;
    let mut line = &rest[..nl];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    *pos += nl + 1;
    Some(line)
}

/// Decode STOMP 1.1 header escapes: `\n`, `\c`, `\\`.
fn unescape(raw: &str) -> Result<String, CodecError> {
    if !raw.contains('\\') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            _ => return Err(CodecError::MalformedHeader(raw.to_string())),
        }
    }
    Ok(out)
}

fn escape_into(value: &str, dst: &mut BytesMut) {
    for b in value.bytes() {
        match b {
            b'\\' => dst.extend_from_slice(b"\\\\"),
            b'\n' => dst.extend_from_slice(b"\\n"),
            _ => dst.extend_from_slice(&[b]),
        }
    }
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<StompItem>, CodecError> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };

        // Bare EOLs between frames are keep-alives.
        if first == b'\n' {
            src.advance(1);
            self.handle.read_bytes.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(StompItem::Heartbeat));
        }
        if first == b'\r' {
            if src.len() < 2 {
                return Ok(None);
            }
            if src[1] != b'\n' {
                return Err(CodecError::MalformedHeader("bare carriage return".into()));
            }
            src.advance(2);
            self.handle.read_bytes.fetch_add(2, Ordering::Relaxed);
            return Ok(Some(StompItem::Heartbeat));
        }

        let buf = &src[..];
        let mut pos = 0;

        let Some(command_line) = next_line(buf, &mut pos) else {
            return self.incomplete(src);
        };
        let command = std::str::from_utf8(command_line)
            .map_err(|_| CodecError::InvalidUtf8)?
            .to_string();
        if command.is_empty() {
            return Err(CodecError::MalformedHeader("empty command line".into()));
        }

        let mut headers = Vec::new();
        let mut content_length: Option<usize> = None;
        loop {
            let Some(line) = next_line(buf, &mut pos) else {
                return self.incomplete(src);
            };
            if line.is_empty() {
                break;
            }
            let text = std::str::from_utf8(line).map_err(|_| CodecError::InvalidUtf8)?;
            let Some(split) = text.find(':') else {
                return Err(CodecError::MalformedHeader(text.to_string()));
            };
            let key = unescape(&text[..split])?;
            let value = unescape(&text[split + 1..])?;
            if key == header::CONTENT_LENGTH && content_length.is_none() {
                let len = value
                    .trim()
                    .parse()
                    .map_err(|_| CodecError::MalformedHeader(text.to_string()))?;
                content_length = Some(len);
            }
            headers.push((key, value));
        }

        let body_start = pos;
        let body_end = match content_length {
            Some(len) => {
                if buf.len() < body_start + len + 1 {
                    return self.incomplete(src);
                }
                if buf[body_start + len] != 0 {
                    return Err(CodecError::MissingBodyTerminator);
                }
                body_start + len
            }
            None => match buf[body_start..].iter().position(|&b| b == 0) {
                Some(nul) => body_start + nul,
                None => return self.incomplete(src),
            },
        };

        let consumed = body_end + 1;
        if consumed > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(self.max_frame_size));
        }

        let body = self.checkout_body(&buf[body_start..body_end]);
        src.advance(consumed);
        self.handle
            .read_bytes
            .fetch_add(consumed as u64, Ordering::Relaxed);
        Ok(Some(StompItem::Frame(Frame {
            command,
            headers,
            body,
        })))
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = CodecError;

    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), CodecError> {
        let before = dst.len();
        match item {
            StompItem::Heartbeat => dst.extend_from_slice(b"\n"),
            StompItem::Frame(frame) => {
                dst.extend_from_slice(frame.command.as_bytes());
                dst.extend_from_slice(b"\n");
                for (key, value) in &frame.headers {
                    escape_into(key, dst);
                    dst.extend_from_slice(b":");
                    escape_into(value, dst);
                    dst.extend_from_slice(b"\n");
                }
                if !frame.body.is_empty() && !frame.has(header::CONTENT_LENGTH) {
                    dst.extend_from_slice(
                        format!("{}:{}\n", header::CONTENT_LENGTH, frame.body.len()).as_bytes(),
                    );
                }
                dst.extend_from_slice(b"\n");
                dst.extend_from_slice(&frame.body);
                dst.extend_from_slice(b"\0");
            }
        }
        self.handle
            .written_bytes
            .fetch_add((dst.len() - before) as u64, Ordering::Relaxed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
