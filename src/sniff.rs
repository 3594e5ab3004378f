//! Protocol detection on freshly accepted connections.
//!
//! The first bytes are read into a [`PeekableStream`] and replayed to whoever
//! consumes the stream next, so neither the HTTP parser nor the TLS acceptor
//! ever misses a byte the sniffer looked at.
use bytes::Buf;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::errors::{new_io_error, Result};

/// TLS record header: content type, version, length.
const RECORD_HEADER_LEN: usize = 5;
/// Largest plaintext record a ClientHello may arrive in.
const MAX_RECORD_LEN: usize = 16 * 1024;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SERVER_NAME_TYPE_HOST: u8 = 0x00;

/// A stream that can look at its first bytes without losing them.
#[derive(Debug)]
pub struct PeekableStream<S> {
  inner: S,
  buffer: Vec<u8>,
  pos: usize,
}

impl<S> PeekableStream<S> {
  /// Wrap a stream, nothing is read yet.
  pub fn new(inner: S) -> Self {
    PeekableStream {
      inner,
      buffer: Vec::new(),
      pos: 0,
    }
  }
  /// Bytes read ahead and not yet handed out.
  pub fn peeked(&self) -> &[u8] {
    &self.buffer[self.pos..]
  }
  /// Wrap a stream whose first bytes were already read by someone else.
  pub fn with_prefix(inner: S, prefix: Vec<u8>) -> Self {
    PeekableStream {
      inner,
      buffer: prefix,
      pos: 0,
    }
  }
  /// The wrapped stream.
  pub fn get_ref(&self) -> &S {
    &self.inner
  }
  /// Unwrap, returning the read-ahead bytes nobody consumed.
  pub fn into_parts(self) -> (S, Vec<u8>) {
    let rest = self.buffer[self.pos..].to_vec();
    (self.inner, rest)
  }
}

impl<S: AsyncRead + Unpin> PeekableStream<S> {
  /// Read ahead until at least `want` bytes are buffered or the peer stops sending.
  pub async fn fill(&mut self, want: usize) -> io::Result<&[u8]> {
    let mut chunk = [0u8; 2048];
    while self.peeked().len() < want {
      let n = self.inner.read(&mut chunk).await?;
      if n == 0 {
        break;
      }
      self.buffer.extend_from_slice(&chunk[..n]);
    }
    Ok(self.peeked())
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableStream<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    if this.pos < this.buffer.len() {
      let rest = &this.buffer[this.pos..];
      let n = rest.len().min(buf.remaining());
      buf.put_slice(&rest[..n]);
      this.pos += n;
      if this.pos == this.buffer.len() {
        this.buffer = Vec::new();
        this.pos = 0;
      }
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut this.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableStream<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

/// What the first bytes of a connection look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
  /// An HTTP/1.x request line, or something close enough to attempt parsing.
  Http,
  /// A TLS ClientHello, with the server name it announced.
  Tls {
    /// SNI host name, if the client sent one
    sni: Option<String>,
  },
  /// Neither, the connection should be dropped.
  Unknown,
}

/// Classify a connection from its first bytes.
pub fn classify(data: &[u8]) -> Protocol {
  match data {
    [CONTENT_TYPE_HANDSHAKE] => Protocol::Tls { sni: None },
    [CONTENT_TYPE_HANDSHAKE, 0x03, ..] => Protocol::Tls {
      sni: extract_sni(data),
    },
    [first, ..] if first.is_ascii_alphabetic() || *first == b'\r' || *first == b'\n' => {
      Protocol::Http
    }
    [] => Protocol::Http,
    _ => Protocol::Unknown,
  }
}

/// Peek at a connection and classify it, buffering a whole ClientHello record
/// when one starts so its SNI can be read.
pub async fn sniff<S: AsyncRead + Unpin>(stream: &mut PeekableStream<S>) -> Result<Protocol> {
  let head = stream.fill(1).await?;
  if head.is_empty() {
    return Err(new_io_error(
      io::ErrorKind::UnexpectedEof,
      "connection closed before any data",
    ));
  }
  if head[0] == CONTENT_TYPE_HANDSHAKE {
    let head = stream.fill(RECORD_HEADER_LEN).await?;
    if head.len() >= RECORD_HEADER_LEN {
      let record_len = u16::from_be_bytes([head[3], head[4]]) as usize;
      stream
        .fill(RECORD_HEADER_LEN + record_len.min(MAX_RECORD_LEN))
        .await?;
    }
  }
  Ok(classify(stream.peeked()))
}

/// Pull the server name out of a ClientHello record without completing a handshake.
///
/// Returns `None` for anything truncated or malformed rather than guessing.
pub fn extract_sni(data: &[u8]) -> Option<String> {
  let mut buf = data;
  if buf.remaining() < RECORD_HEADER_LEN || buf.get_u8() != CONTENT_TYPE_HANDSHAKE {
    return None;
  }
  buf.advance(2); // record version
  let record_len = buf.get_u16() as usize;
  let mut record = take(&mut buf, record_len)?;

  if record.remaining() < 4 || record.get_u8() != HANDSHAKE_CLIENT_HELLO {
    return None;
  }
  let hello_len = ((record.get_u8() as usize) << 16) | record.get_u16() as usize;
  let mut hello = take(&mut record, hello_len)?;

  // client version + random
  skip(&mut hello, 2 + 32)?;
  let session_id_len = read_u8(&mut hello)? as usize;
  skip(&mut hello, session_id_len)?;
  let cipher_suites_len = read_u16(&mut hello)? as usize;
  skip(&mut hello, cipher_suites_len)?;
  let compression_len = read_u8(&mut hello)? as usize;
  skip(&mut hello, compression_len)?;

  let extensions_len = read_u16(&mut hello)? as usize;
  let mut extensions = take(&mut hello, extensions_len)?;
  while extensions.remaining() >= 4 {
    let kind = extensions.get_u16();
    let len = extensions.get_u16() as usize;
    let mut extension = take(&mut extensions, len)?;
    if kind != EXTENSION_SERVER_NAME {
      continue;
    }
    let list_len = read_u16(&mut extension)? as usize;
    let mut list = take(&mut extension, list_len)?;
    while list.remaining() >= 3 {
      let name_type = list.get_u8();
      let name_len = list.get_u16() as usize;
      let name = take(&mut list, name_len)?;
      if name_type == SERVER_NAME_TYPE_HOST {
        return std::str::from_utf8(name)
          .ok()
          .filter(|n| !n.is_empty())
          .map(|n| n.to_ascii_lowercase());
      }
    }
    return None;
  }
  None
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Option<&'a [u8]> {
  if buf.remaining() < len {
    return None;
  }
  let (head, tail) = buf.split_at(len);
  *buf = tail;
  Some(head)
}

fn skip(buf: &mut &[u8], len: usize) -> Option<()> {
  take(buf, len).map(|_| ())
}

fn read_u8(buf: &mut &[u8]) -> Option<u8> {
  (buf.remaining() >= 1).then(|| buf.get_u8())
}

fn read_u16(buf: &mut &[u8]) -> Option<u16> {
  (buf.remaining() >= 2).then(|| buf.get_u16())
}
