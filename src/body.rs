use std::fmt;
use std::io::ErrorKind;
use std::ops::{Deref, DerefMut};

use bytes::{Bytes, BytesMut};
use http::header::ACCEPT_ENCODING;
use http::{HeaderMap, HeaderValue};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{new_io_error, Error, Result};
use crate::CR_LF;

/// Longest chunk-size line accepted before the stream is considered garbage.
const MAX_CHUNK_LINE: usize = 4096;

/// A body.
#[derive(Clone, PartialEq)]
pub struct Body {
  inner: Bytes,
}

impl Body {
  /// An empty body.
  pub fn empty() -> Self {
    Self::default()
  }
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Body {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}

impl Default for Body {
  fn default() -> Self {
    Self {
      inner: Bytes::new(),
    }
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    s.as_bytes().into()
  }
}

impl From<&'static [u8]> for Body {
  #[inline]
  fn from(s: &'static [u8]) -> Body {
    Body {
      inner: Bytes::from_static(s),
    }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Display::fmt(s, f),
      Err(_err) => fmt::Debug::fmt(&self.inner, f),
    }
  }
}

impl fmt::Display for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Display::fmt(s, f),
      Err(_err) => fmt::Debug::fmt(&self.inner, f),
    }
  }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
  /// No body follows the head.
  Empty,
  /// `Content-Length` bytes follow.
  Length(u64),
  /// `Transfer-Encoding: chunked`.
  Chunked,
  /// The body runs until the peer closes the connection (responses only).
  Close,
}

/// Where a message body currently lives.
///
/// Bodies start `Unread` and are only pulled off the wire when an interceptor
/// asks for them. Otherwise they are streamed straight from one leg to the
/// other.
#[derive(Debug, Clone, Default)]
pub(crate) enum Payload {
  #[default]
  Empty,
  Unread(Framing),
  Buffered {
    /// bytes exactly as framed on the wire
    original: Body,
    /// `original` with its content-coding removed, when it had one
    decoded: Option<Body>,
    /// set once an interceptor replaces the body
    current: Option<Body>,
  },
  /// Replaced before the original was ever read; `unread` still has to be
  /// drained off the wire.
  Replaced { current: Body, unread: Framing },
}

impl Payload {
  pub(crate) fn from_framing(framing: Framing) -> Self {
    match framing {
      Framing::Empty | Framing::Length(0) => Payload::Empty,
      f => Payload::Unread(f),
    }
  }
  /// The body as interceptors see it, if it has been read or replaced.
  pub(crate) fn view(&self) -> Option<&Body> {
    match self {
      Payload::Empty | Payload::Unread(_) => None,
      Payload::Buffered {
        original,
        decoded,
        current,
      } => current.as_ref().or(decoded.as_ref()).or(Some(original)),
      Payload::Replaced { current, .. } => Some(current),
    }
  }
  pub(crate) fn is_modified(&self) -> bool {
    matches!(
      self,
      Payload::Buffered {
        current: Some(_),
        ..
      } | Payload::Replaced { .. }
    )
  }
  /// Install a new body, keeping track of wire bytes that still need draining.
  pub(crate) fn replace(&mut self, body: Body) {
    let next = match std::mem::take(self) {
      Payload::Unread(unread) => Payload::Replaced {
        current: body,
        unread,
      },
      Payload::Replaced { unread, .. } => Payload::Replaced {
        current: body,
        unread,
      },
      Payload::Buffered {
        original, decoded, ..
      } => Payload::Buffered {
        original,
        decoded,
        current: Some(body),
      },
      Payload::Empty => Payload::Buffered {
        original: Body::empty(),
        decoded: None,
        current: Some(body),
      },
    };
    *self = next;
  }
  /// Undo an interceptor's changes.
  ///
  /// Wire bytes consumed since `snapshot` was taken cannot be put back, so they
  /// are kept as the unmodified body.
  pub(crate) fn rollback(snapshot: &Payload, current: Payload) -> Payload {
    match (snapshot, current) {
      (
        Payload::Unread(_),
        Payload::Buffered {
          original, decoded, ..
        },
      ) => Payload::Buffered {
        original,
        decoded,
        current: None,
      },
      (Payload::Unread(_), Payload::Replaced { unread, .. }) => Payload::Unread(unread),
      (
        Payload::Buffered {
          current: previous, ..
        },
        Payload::Buffered {
          original, decoded, ..
        },
      ) => Payload::Buffered {
        original,
        decoded,
        current: previous.clone(),
      },
      (snapshot, _) => snapshot.clone(),
    }
  }
}

/// Parse the hexadecimal size of a chunk line, ignoring extensions.
pub(crate) fn parse_chunk_size(line: &[u8]) -> Result<u64> {
  let line = std::str::from_utf8(line).map_err(|_| Error::invalid_http("chunk size is not ascii"))?;
  let size = line.split(';').next().unwrap_or_default().trim();
  u64::from_str_radix(size, 16).map_err(|_| Error::invalid_http(format!("bad chunk size {size:?}")))
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R, line: &mut Vec<u8>) -> Result<()> {
  line.clear();
  let mut limited = (&mut *reader).take(MAX_CHUNK_LINE as u64);
  let n = limited.read_until(b'\n', line).await?;
  if n == 0 {
    return Err(new_io_error(ErrorKind::UnexpectedEof, "eof inside chunked body"));
  }
  if !line.ends_with(b"\n") {
    return Err(Error::invalid_http("chunk line too long"));
  }
  Ok(())
}

/// Read a whole body into memory, refusing to grow past `limit`.
pub(crate) async fn read_body<R: AsyncBufRead + Unpin>(
  reader: &mut R,
  framing: Framing,
  limit: usize,
) -> Result<Bytes> {
  match framing {
    Framing::Empty => Ok(Bytes::new()),
    Framing::Length(len) => {
      if len > limit as u64 {
        return Err(Error::BodyTooLarge(limit));
      }
      let mut body = vec![0u8; len as usize];
      reader.read_exact(&mut body).await?;
      Ok(Bytes::from(body))
    }
    Framing::Chunked => {
      let mut body = BytesMut::new();
      let mut line = Vec::new();
      loop {
        read_line(reader, &mut line).await?;
        let size = parse_chunk_size(&line)?;
        if size == 0 {
          // trailers, dropped once the body is buffered
          loop {
            read_line(reader, &mut line).await?;
            if line == CR_LF || line == b"\n" {
              break;
            }
          }
          break;
        }
        if body.len() as u64 + size > limit as u64 {
          return Err(Error::BodyTooLarge(limit));
        }
        let start = body.len();
        body.resize(start + size as usize, 0);
        reader.read_exact(&mut body[start..]).await?;
        read_line(reader, &mut line).await?;
      }
      Ok(body.freeze())
    }
    Framing::Close => {
      let mut body = Vec::new();
      let n = (&mut *reader)
        .take(limit as u64 + 1)
        .read_to_end(&mut body)
        .await?;
      if n > limit {
        return Err(Error::BodyTooLarge(limit));
      }
      Ok(Bytes::from(body))
    }
  }
}

/// Stream a body from one leg to the other without buffering it, keeping its framing.
pub(crate) async fn copy_body<R, W>(reader: &mut R, writer: &mut W, framing: Framing) -> Result<u64>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  match framing {
    Framing::Empty => Ok(0),
    Framing::Length(len) => {
      let copied = tokio::io::copy_buf(&mut (&mut *reader).take(len), writer).await?;
      if copied != len {
        return Err(new_io_error(ErrorKind::UnexpectedEof, "body shorter than content-length"));
      }
      Ok(copied)
    }
    Framing::Chunked => {
      let mut total = 0;
      let mut line = Vec::new();
      loop {
        read_line(reader, &mut line).await?;
        let size = parse_chunk_size(&line)?;
        writer.write_all(format!("{size:x}").as_bytes()).await?;
        writer.write_all(CR_LF).await?;
        if size == 0 {
          loop {
            read_line(reader, &mut line).await?;
            writer.write_all(&line).await?;
            if line == CR_LF || line == b"\n" {
              break;
            }
          }
          break;
        }
        let copied = tokio::io::copy_buf(&mut (&mut *reader).take(size), writer).await?;
        if copied != size {
          return Err(new_io_error(ErrorKind::UnexpectedEof, "chunk shorter than announced"));
        }
        total += copied;
        read_line(reader, &mut line).await?;
        writer.write_all(CR_LF).await?;
      }
      Ok(total)
    }
    Framing::Close => Ok(tokio::io::copy_buf(reader, writer).await?),
  }
}

/// Consume a body that nobody is going to forward.
pub(crate) async fn drain_body<R: AsyncBufRead + Unpin>(reader: &mut R, framing: Framing) -> Result<u64> {
  copy_body(reader, &mut tokio::io::sink(), framing).await
}

/// Content-codings [`decode_content`] knows how to undo.
pub(crate) const DECODABLE_CODINGS: &[&str] = &[
  #[cfg(feature = "gzip")]
  "gzip",
  #[cfg(feature = "gzip")]
  "x-gzip",
  #[cfg(feature = "gzip")]
  "deflate",
  #[cfg(feature = "brotli")]
  "br",
];

/// Undo a `Content-Encoding`, returning `None` for identity or codings we leave alone.
#[cfg_attr(not(any(feature = "gzip", feature = "brotli")), allow(unused_mut, unused_variables))]
pub(crate) fn decode_content(coding: &str, raw: &[u8]) -> Result<Option<Bytes>> {
  #[cfg(any(feature = "gzip", feature = "brotli"))]
  use std::io::Read;
  let mut out = Vec::new();
  match coding.trim().to_ascii_lowercase().as_str() {
    #[cfg(feature = "gzip")]
    "gzip" | "x-gzip" => {
      flate2::read::GzDecoder::new(raw).read_to_end(&mut out)?;
    }
    #[cfg(feature = "gzip")]
    "deflate" => {
      // zlib wrapped is what servers are supposed to send, raw deflate is common anyway
      if flate2::read::ZlibDecoder::new(raw).read_to_end(&mut out).is_err() {
        out.clear();
        flate2::read::DeflateDecoder::new(raw).read_to_end(&mut out)?;
      }
    }
    #[cfg(feature = "brotli")]
    "br" => {
      brotli::Decompressor::new(raw, 4096).read_to_end(&mut out)?;
    }
    _ => return Ok(None),
  }
  Ok(Some(Bytes::from(out)))
}

/// Limit `Accept-Encoding` to codings interceptors can get a plain view of.
///
/// Anything else would reach `on_response` as opaque bytes. Quality values
/// of the kept codings are preserved; a header left empty becomes `identity`.
pub(crate) fn narrow_accept_encoding(headers: &mut HeaderMap) {
  let Some(value) = headers.get(ACCEPT_ENCODING) else {
    return;
  };
  let offered = value.to_str().unwrap_or_default();
  let kept: Vec<&str> = offered
    .split(',')
    .map(str::trim)
    .filter(|item| {
      let coding = item.split(';').next().unwrap_or_default().trim();
      coding.eq_ignore_ascii_case("identity")
        || DECODABLE_CODINGS
          .iter()
          .any(|known| coding.eq_ignore_ascii_case(known))
    })
    .collect();
  let narrowed = if kept.is_empty() {
    "identity".to_string()
  } else {
    kept.join(", ")
  };
  if let Ok(narrowed) = HeaderValue::from_str(&narrowed) {
    headers.insert(ACCEPT_ENCODING, narrowed);
  }
}
