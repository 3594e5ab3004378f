use crate::sniff::PeekableStream;
use std::io::Error;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};
use tokio_rustls::rustls::pki_types::CertificateDer;

/// Socket
///
/// One leg of a session, either the client connection accepted by a listener
/// or an upstream connection opened by the [`Connector`](crate::Connector).
#[derive(Debug)]
pub struct Socket {
  inner: MaybeTlsStream,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
}
impl Socket {
  pub(crate) fn new(
    maybe_tls_stream: MaybeTlsStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> Self {
    Self {
      inner: maybe_tls_stream,
      read_timeout,
      write_timeout,
    }
  }
  /// Wrap this socket in client side TLS.
  ///
  /// Already encrypted sockets are wrapped again, which is what talking to an
  /// HTTPS origin through an HTTPS proxy needs.
  pub(crate) async fn tls<F, Fut>(self, func: F) -> Result<Self, Error>
  where
    F: FnOnce(Socket) -> Fut,
    Fut: std::future::Future<Output = Result<client::TlsStream<Socket>, Error>>,
  {
    let read_timeout = self.read_timeout;
    let write_timeout = self.write_timeout;
    Ok(Self {
      inner: MaybeTlsStream::Tls(Box::new(func(self).await?)),
      read_timeout,
      write_timeout,
    })
  }
  /// Whether any TLS layer is active on this socket.
  pub fn is_tls(&self) -> bool {
    matches!(
      self.inner,
      MaybeTlsStream::Tls(_) | MaybeTlsStream::Server(_)
    )
  }
  /// Address of the remote end of the underlying TCP connection.
  pub fn peer_addr(&self) -> Option<SocketAddr> {
    self.tcp().peer_addr().ok()
  }
  /// Give up the timeouts and return the stream.
  pub fn into_inner(self) -> MaybeTlsStream {
    self.inner
  }
}
/// The stream types a session pumps bytes through.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TCP whose first bytes were inspected by the sniffer
  Peeked(PeekableStream<TcpStream>),
  /// TLS toward an upstream
  Tls(Box<client::TlsStream<Socket>>),
  /// TLS terminated toward a client
  Server(Box<server::TlsStream<PeekableStream<TcpStream>>>),
}
impl MaybeTlsStream {
  /// The TCP connection at the bottom of the stack.
  pub fn tcp(&self) -> &TcpStream {
    match self {
      MaybeTlsStream::Tcp(s) => s,
      MaybeTlsStream::Peeked(p) => p.get_ref(),
      MaybeTlsStream::Tls(t) => t.get_ref().0.tcp(),
      MaybeTlsStream::Server(t) => t.get_ref().0.get_ref(),
    }
  }
  /// Certificates the upstream presented, leaf first.
  pub fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
    match &self {
      MaybeTlsStream::Tls(stream) => stream
        .get_ref()
        .1
        .peer_certificates()
        .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect()),
      _ => None,
    }
  }
  /// Server name the client asked for during a terminated handshake.
  pub fn server_name(&self) -> Option<&str> {
    match &self {
      MaybeTlsStream::Server(stream) => stream.get_ref().1.server_name(),
      _ => None,
    }
  }
}
// 实现socket的读写
impl AsyncRead for Socket {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}
impl AsyncWrite for Socket {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}
impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Peeked(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
      MaybeTlsStream::Server(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}
impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Peeked(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
      MaybeTlsStream::Server(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Peeked(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
      MaybeTlsStream::Server(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }
  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Peeked(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
      MaybeTlsStream::Server(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}
impl Socket {
  /// Reads the exact number of bytes required to fill buf.
  pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    match self.read_timeout {
      None => AsyncReadExt::read_exact(self.deref_mut(), buf).await,
      Some(t) => tokio::time::timeout(t, AsyncReadExt::read_exact(self.deref_mut(), buf)).await?,
    }
  }
  /// Pulls some bytes from this source into the specified buffer, returning how many bytes were read.
  pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    match self.read_timeout {
      None => AsyncReadExt::read(self.deref_mut(), buf).await,
      Some(t) => tokio::time::timeout(t, AsyncReadExt::read(self.deref_mut(), buf)).await?,
    }
  }
}
impl Socket {
  /// Attempts to write an entire buffer into this writer.
  pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
    match self.write_timeout {
      None => AsyncWriteExt::write_all(self.deref_mut(), buf).await,
      Some(t) => tokio::time::timeout(t, AsyncWriteExt::write_all(self.deref_mut(), buf)).await?,
    }
  }
  /// Flushes this output stream, ensuring that all intermediately buffered
  /// contents reach their destination.
  pub async fn flush(&mut self) -> std::io::Result<()> {
    match self.write_timeout {
      None => AsyncWriteExt::flush(self.deref_mut()).await,
      Some(t) => tokio::time::timeout(t, AsyncWriteExt::flush(self.deref_mut())).await?,
    }
  }
  /// Shuts down the output stream, ensuring that the value can be dropped
  /// cleanly.
  pub async fn shutdown(&mut self) -> std::io::Result<()> {
    match self.write_timeout {
      None => AsyncWriteExt::shutdown(self.deref_mut()).await,
      Some(t) => tokio::time::timeout(t, AsyncWriteExt::shutdown(self.deref_mut())).await?,
    }
  }
}

// 直接暴露socket的全部外部接口
impl Deref for Socket {
  type Target = MaybeTlsStream;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Socket {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}
