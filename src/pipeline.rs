//! Driving one client connection from its first byte to close.
//!
//! A connection is sniffed, optionally decrypted, and then carries a sequence
//! of HTTP/1.1 exchanges. A `CONNECT` hands the raw connection back to the
//! driver, which sniffs again inside the tunnel.
use crate::body::{copy_body, drain_body, narrow_accept_encoding, Framing, Payload};
use crate::ca::CertificateManager;
use crate::errors::{Error, Result};
use crate::interceptor::InterceptorHandler;
use crate::listener::{original_destination, ProxyEndpoint};
use crate::proxy::authority;
use crate::request::{read_request_head, Request};
use crate::response::{read_response_head, Response};
use crate::router::{ConnectionKey, Router, UpstreamTarget};
use crate::session::Session;
use crate::sniff::{sniff, PeekableStream, Protocol};
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls::{server_config, Identity};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, EXPECT, HOST, PROXY_AUTHORIZATION, TRANSFER_ENCODING};
use http::uri::Scheme;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Everything the sessions of one server share.
pub(crate) struct Engine {
  pub(crate) handler: InterceptorHandler,
  pub(crate) certificates: Arc<CertificateManager>,
  pub(crate) router: Router,
  pub(crate) handshake_timeout: Duration,
  pub(crate) idle_timeout: Duration,
  pub(crate) max_body_size: usize,
}

/// What the connection does once an exchange loop ends.
enum Next {
  Close,
  Connect {
    client: BufReader<Socket>,
    host: String,
    port: u16,
  },
}

/// Whether the client connection can carry another exchange.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
  KeepAlive,
  Close,
}

/// Where requests on a leg are assumed to go when they do not say.
struct Base {
  https: bool,
  authority: Option<String>,
  sni: Option<String>,
}

impl Base {
  fn scheme(&self) -> Scheme {
    if self.https {
      Scheme::HTTPS
    } else {
      Scheme::HTTP
    }
  }
}

/// Body bytes that follow a head.
enum Outgoing {
  Nothing,
  Stream(Framing),
  Fixed(Bytes),
}

pub(crate) struct Connection {
  engine: Arc<Engine>,
  endpoint: Arc<ProxyEndpoint>,
  id: u64,
  client_addr: SocketAddr,
  shutdown: watch::Receiver<bool>,
}

impl Connection {
  pub(crate) fn new(
    engine: Arc<Engine>,
    endpoint: Arc<ProxyEndpoint>,
    id: u64,
    client_addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
  ) -> Self {
    Self {
      engine,
      endpoint,
      id,
      client_addr,
      shutdown,
    }
  }

  pub(crate) async fn run(mut self, stream: TcpStream) -> Result<()> {
    let original = if self.endpoint.is_transparent() {
      original_destination(&stream)
    } else {
      None
    };
    let mut stream = PeekableStream::new(stream);
    let mut next = match self.sniff(&mut stream).await? {
      Protocol::Unknown => {
        debug!("unrecognised protocol, closing");
        Next::Close
      }
      Protocol::Tls { sni } => {
        let port = original.map(|a| a.port()).unwrap_or(443);
        let host = sni
          .clone()
          .or_else(|| original.map(|a| a.ip().to_string()))
          .ok_or_else(|| Error::invalid_http("TLS client named no server and has no original destination"))?;
        self.serve_tls(stream, sni, host, port).await?
      }
      Protocol::Http => {
        let base = Base {
          https: false,
          authority: original.map(|a| a.to_string()),
          sni: None,
        };
        self.serve_http(client_leg(MaybeTlsStream::Peeked(stream)), base).await?
      }
    };
    while let Next::Connect { client, host, port } = next {
      next = self.tunnel(client, host, port).await?;
    }
    Ok(())
  }

  async fn sniff(&self, stream: &mut PeekableStream<TcpStream>) -> Result<Protocol> {
    tokio::time::timeout(self.engine.handshake_timeout, sniff(stream))
      .await
      .map_err(|_| Error::Timeout("protocol detection"))?
  }

  fn stopping(&self) -> bool {
    *self.shutdown.borrow()
  }

  async fn serve_tls(
    &mut self,
    stream: PeekableStream<TcpStream>,
    sni: Option<String>,
    host: String,
    port: u16,
  ) -> Result<Next> {
    if !self.endpoint.decrypt_tls() {
      let mut upstream = self.engine.router.tunnel(&host, port).await?;
      let mut client = stream;
      relay(&mut client, &mut upstream).await;
      return Ok(Next::Close);
    }
    let server_name = sni.clone().unwrap_or_else(|| host.clone());
    let client = self.accept_tls(stream, &server_name).await?;
    let base = Base {
      https: true,
      authority: Some(authority(&host, port)),
      sni,
    };
    self.serve_http(BufReader::new(client), base).await
  }

  async fn accept_tls(&self, stream: PeekableStream<TcpStream>, server_name: &str) -> Result<Socket> {
    let identity = match self.endpoint.certificate() {
      Some(identity) => identity.clone(),
      None => Identity::from(
        self
          .engine
          .certificates
          .get_server_cert(server_name)
          .await?
          .as_ref(),
      ),
    };
    let acceptor = TlsAcceptor::from(server_config(&identity)?);
    let tls = tokio::time::timeout(self.engine.handshake_timeout, acceptor.accept(stream))
      .await
      .map_err(|_| Error::Timeout("client tls handshake"))??;
    debug!(server_name, "client handshake complete");
    Ok(Socket::new(MaybeTlsStream::Server(Box::new(tls)), None, None))
  }

  /// Answer a `CONNECT` and find out what the client speaks inside the tunnel.
  async fn tunnel(&mut self, mut client: BufReader<Socket>, host: String, port: u16) -> Result<Next> {
    debug!(target = %authority(&host, port), "tunnel requested");
    if !self.endpoint.decrypt_tls() {
      let mut upstream = match self.engine.router.tunnel(&host, port).await {
        Ok(upstream) => upstream,
        Err(e) => {
          write_reply(&mut client, Response::gateway_error(&e), &Method::CONNECT, true).await?;
          return Ok(Next::Close);
        }
      };
      client.write_all(CONNECT_ESTABLISHED).await?;
      client.flush().await?;
      relay(&mut client, &mut upstream).await;
      return Ok(Next::Close);
    }
    client.write_all(CONNECT_ESTABLISHED).await?;
    client.flush().await?;
    let mut prefix = client.buffer().to_vec();
    let mut stream = match client.into_inner().into_inner() {
      MaybeTlsStream::Peeked(peeked) => {
        let (tcp, rest) = peeked.into_parts();
        prefix.extend(rest);
        PeekableStream::with_prefix(tcp, prefix)
      }
      MaybeTlsStream::Tcp(tcp) => PeekableStream::with_prefix(tcp, prefix),
      _ => return Err(Error::invalid_http("CONNECT inside a decrypted connection")),
    };
    let protocol = match self.sniff(&mut stream).await {
      Ok(protocol) => protocol,
      Err(Error::IO(e)) if e.kind() == ErrorKind::UnexpectedEof => return Ok(Next::Close),
      Err(e) => return Err(e),
    };
    match protocol {
      Protocol::Tls { sni } => self.serve_tls(stream, sni, host, port).await,
      Protocol::Http => {
        let base = Base {
          https: false,
          authority: Some(authority(&host, port)),
          sni: None,
        };
        self.serve_http(client_leg(MaybeTlsStream::Peeked(stream)), base).await
      }
      Protocol::Unknown => {
        let mut upstream = self.engine.router.tunnel(&host, port).await?;
        relay(&mut stream, &mut upstream).await;
        Ok(Next::Close)
      }
    }
  }

  /// The exchange loop of one client leg.
  async fn serve_http(&mut self, client: BufReader<Socket>, base: Base) -> Result<Next> {
    let engine = self.engine.clone();
    let mut session = Session::new(
      self.id,
      self.client_addr,
      self.endpoint.clone(),
      client,
      base.https,
      base.sni.clone(),
      engine.max_body_size,
      engine.idle_timeout,
    );
    loop {
      if self.stopping() {
        return Ok(Next::Close);
      }
      let head = tokio::select! {
        head = tokio::time::timeout(engine.idle_timeout, read_request_head(&mut session.client)) => head,
        _ = shutdown_signal(&mut self.shutdown) => return Ok(Next::Close),
      };
      let mut request = match head {
        Err(_) => {
          trace!("client idle, closing");
          return Ok(Next::Close);
        }
        Ok(Ok(None)) => return Ok(Next::Close),
        Ok(Ok(Some(request))) => request,
        Ok(Err(e)) => {
          bad_request(&mut session).await;
          return Err(e);
        }
      };
      let framing = match request.framing() {
        Ok(framing) => framing,
        Err(e) => {
          bad_request(&mut session).await;
          return Err(e);
        }
      };
      if request.method() == Method::CONNECT {
        let Some((host, port)) = connect_target(&request) else {
          bad_request(&mut session).await;
          return Err(Error::invalid_http("CONNECT without host and port"));
        };
        if session.client.get_ref().is_tls() {
          bad_request(&mut session).await;
          return Err(Error::invalid_http("CONNECT inside a decrypted connection"));
        }
        return Ok(Next::Connect {
          client: session.into_client(),
          host,
          port,
        });
      }
      strip_proxy_headers(request.headers_mut());
      if engine.handler.inspects_responses() {
        narrow_accept_encoding(request.headers_mut());
      }
      if let Err(e) = absolutize(&mut request, &base) {
        bad_request(&mut session).await;
        return Err(e);
      }
      request.payload = Payload::from_framing(framing);
      if expects_continue(&request) {
        request.headers_mut().remove(EXPECT);
        if matches!(request.payload, Payload::Unread(_)) {
          session.client.write_all(CONTINUE).await?;
          session.client.flush().await?;
        }
      }
      debug!(method = %request.method(), uri = %request.uri(), "request");
      session.begin_exchange(request);
      engine.handler.process_request(&mut session).await;
      if session.is_poisoned() {
        return Err(Error::Other("request body could not be read".to_string()));
      }
      let flow = match session.take_reply() {
        Some(reply) => self.reply(&mut session, reply).await?,
        None => self.exchange(&mut session).await?,
      };
      if flow == Flow::Close || session.request().wants_close() {
        return Ok(Next::Close);
      }
    }
  }

  /// Send an interceptor's reply in place of an upstream response.
  async fn reply(&self, session: &mut Session, reply: Response) -> Result<Flow> {
    let close = drain_request(session, self.engine.idle_timeout).await.is_err()
      || session.request().wants_close()
      || self.stopping();
    let method = session.request().method().clone();
    debug!(status = %reply.status_code(), "answered by interceptor");
    write_reply(&mut session.client, reply, &method, close).await?;
    Ok(if close { Flow::Close } else { Flow::KeepAlive })
  }

  async fn gateway_error(&self, session: &mut Session, error: Error, force_close: bool) -> Result<Flow> {
    let mut close = force_close || session.request().wants_close();
    if !close && drain_request(session, self.engine.idle_timeout).await.is_err() {
      close = true;
    }
    let method = session.request().method().clone();
    write_reply(&mut session.client, Response::gateway_error(&error), &method, close).await?;
    Ok(if close { Flow::Close } else { Flow::KeepAlive })
  }

  /// Forward the current request and relay the response.
  async fn exchange(&self, session: &mut Session) -> Result<Flow> {
    let target = match UpstreamTarget::resolve(session.request(), session.upstream_target()) {
      Ok(target) => target,
      Err(e) => {
        bad_request(session).await;
        return Err(e);
      }
    };
    let key = ConnectionKey {
      target,
      local: session.upstream_endpoint(),
    };
    let replayable = !matches!(session.request().payload, Payload::Unread(_));
    let mut reused = matches!(&session.upstream, Some(upstream) if upstream.key == key);
    let response = loop {
      if !reused {
        session.upstream = None;
        match self.engine.router.connect(&key).await {
          Ok(upstream) => session.upstream = Some(upstream),
          Err(e) => return self.gateway_error(session, e, false).await,
        }
      }
      match self.send(session).await {
        Ok(response) => break response,
        Err(e) if reused && replayable && is_stale(&e) => {
          debug!(upstream = %key.target, "pooled connection went away, reconnecting");
          reused = false;
        }
        Err(e) => {
          session.upstream = None;
          return self.gateway_error(session, e, !replayable).await;
        }
      }
    };
    self.relay_response(session, response).await
  }

  /// Write the request upstream and wait for its final response head.
  async fn send(&self, session: &mut Session) -> Result<Response> {
    forward_request(session).await?;
    loop {
      let upstream = session
        .upstream
        .as_mut()
        .ok_or_else(|| Error::Other("no upstream connection".to_string()))?;
      let response = tokio::time::timeout(self.engine.idle_timeout, read_response_head(&mut upstream.stream))
        .await
        .map_err(|_| Error::Timeout("upstream response"))??;
      let status = response.status_code();
      if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
        session.client.write_all(&response.head_to_raw()).await?;
        session.client.flush().await?;
        continue;
      }
      return Ok(response);
    }
  }

  async fn relay_response(&self, session: &mut Session, mut response: Response) -> Result<Flow> {
    let method = session.request().method().clone();
    let framing = match response.framing(&method) {
      Ok(framing) => framing,
      Err(e) => {
        session.upstream = None;
        return self.gateway_error(session, e, true).await;
      }
    };
    let switching = response.status_code() == StatusCode::SWITCHING_PROTOCOLS;
    response.payload = Payload::from_framing(framing);
    debug!(status = %response.status_code(), "response");
    session.set_response(response);
    self.engine.handler.process_response(session).await;
    if session.is_poisoned() {
      session.upstream = None;
      return self
        .gateway_error(session, Error::Other("response body could not be read".to_string()), true)
        .await;
    }
    let response = session
      .take_response()
      .ok_or_else(|| Error::Other("response went missing".to_string()))?;
    let client_close = response.wants_close();
    let upstream_close = client_close || framing == Framing::Close;
    let written = write_response(session, response, &method).await?;
    if switching {
      if let Some(mut upstream) = session.upstream.take() {
        relay(&mut session.client, &mut upstream.stream).await;
      }
      return Ok(Flow::Close);
    }
    if upstream_close {
      session.upstream = None;
    }
    if client_close || written == Framing::Close {
      Ok(Flow::Close)
    } else {
      Ok(Flow::KeepAlive)
    }
  }
}

/// Resolves once the server starts shutting down. Never resolves if the server is gone.
pub(crate) async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
  if shutdown.wait_for(|stopping| *stopping).await.is_err() {
    std::future::pending::<()>().await;
  }
}

fn client_leg(stream: MaybeTlsStream) -> BufReader<Socket> {
  BufReader::new(Socket::new(stream, None, None))
}

/// Pump bytes both ways until either side closes.
async fn relay<A, B>(a: &mut A, b: &mut B)
where
  A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + ?Sized,
  B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + ?Sized,
{
  match tokio::io::copy_bidirectional(a, b).await {
    Ok((up, down)) => trace!(up, down, "relay finished"),
    Err(e) => debug!("relay ended: {}", e),
  }
}

fn connect_target(request: &Request) -> Option<(String, u16)> {
  let authority = request.uri().authority()?;
  let host = authority.host().trim_start_matches('[').trim_end_matches(']');
  Some((host.to_string(), authority.port_u16().unwrap_or(443)))
}

fn expects_continue(request: &Request) -> bool {
  request
    .headers()
    .get(EXPECT)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
}

fn strip_proxy_headers(headers: &mut HeaderMap) {
  headers.remove("proxy-connection");
  headers.remove(PROXY_AUTHORIZATION);
}

/// Give an origin-form request its full URI.
///
/// The `Host` header wins; the `CONNECT` target, SNI or original destination
/// of the leg are the fallback.
fn absolutize(request: &mut Request, base: &Base) -> Result<()> {
  if request.uri().scheme().is_some() {
    return Ok(());
  }
  let host = request
    .headers()
    .get(HOST)
    .and_then(|h| h.to_str().ok())
    .filter(|h| !h.is_empty())
    .map(str::to_string);
  let authority = match (host, &base.authority, &base.sni) {
    (Some(host), _, _) => host,
    (None, Some(authority), _) => authority.clone(),
    (None, None, Some(sni)) => sni.clone(),
    (None, None, None) => return Err(Error::invalid_http("request names no host")),
  };
  let path = request
    .uri()
    .path_and_query()
    .map(|p| p.as_str())
    .unwrap_or("/")
    .to_string();
  let uri = http::Uri::builder()
    .scheme(base.scheme())
    .authority(authority)
    .path_and_query(path)
    .build()?;
  *request.uri_mut() = uri;
  Ok(())
}

fn is_stale(error: &Error) -> bool {
  match error {
    Error::IO(e) => matches!(
      e.kind(),
      ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
    ),
    _ => false,
  }
}

/// Fix up the framing headers for what is about to be written.
fn prepare(headers: &mut HeaderMap, payload: &Payload) -> Outgoing {
  let fixed = match payload {
    Payload::Empty => return Outgoing::Nothing,
    Payload::Unread(framing) => return Outgoing::Stream(*framing),
    Payload::Buffered {
      original, current: None, ..
    } => Bytes::clone(original),
    Payload::Buffered {
      original,
      decoded,
      current: Some(current),
    } => {
      // a coding only survives on the exact bytes it was applied to
      if decoded.is_some() || current != original {
        headers.remove(CONTENT_ENCODING);
      }
      Bytes::clone(current)
    }
    Payload::Replaced { current, .. } => {
      headers.remove(CONTENT_ENCODING);
      Bytes::clone(current)
    }
  };
  headers.remove(TRANSFER_ENCODING);
  headers.insert(CONTENT_LENGTH, HeaderValue::from(fixed.len()));
  Outgoing::Fixed(fixed)
}

/// Skip whatever is left of the client's request body.
async fn drain_request(session: &mut Session, timeout: Duration) -> Result<()> {
  let framing = match &session.request().payload {
    Payload::Unread(framing) => *framing,
    Payload::Replaced { unread, .. } => *unread,
    _ => return Ok(()),
  };
  tokio::time::timeout(timeout, drain_body(&mut session.client, framing))
    .await
    .map_err(|_| Error::Timeout("request body"))??;
  match &mut session.request_mut().payload {
    Payload::Replaced { unread, .. } => *unread = Framing::Empty,
    payload => *payload = Payload::Empty,
  }
  Ok(())
}

async fn forward_request(session: &mut Session) -> Result<()> {
  let forward_proxy = session
    .upstream
    .as_ref()
    .ok_or_else(|| Error::Other("no upstream connection".to_string()))?
    .forward_proxy
    .clone();
  if let Payload::Replaced { unread, .. } = session.request().payload {
    drain_body(&mut session.client, unread).await?;
    if let Payload::Replaced { unread, .. } = &mut session.request_mut().payload {
      *unread = Framing::Empty;
    }
  }
  let request = session.request_mut();
  if let Some(Some(credentials)) = &forward_proxy {
    request.headers_mut().insert(PROXY_AUTHORIZATION, credentials.clone());
  }
  let (headers, payload) = request.headers_and_payload();
  let outgoing = prepare(headers, payload);
  let head = request.head_to_raw(forward_proxy.is_some());
  let Some(upstream) = session.upstream.as_mut() else {
    return Err(Error::Other("no upstream connection".to_string()));
  };
  upstream.stream.write_all(&head).await?;
  let streamed = match outgoing {
    Outgoing::Nothing => false,
    Outgoing::Fixed(body) => {
      upstream.stream.write_all(&body).await?;
      false
    }
    Outgoing::Stream(framing) => {
      copy_body(&mut session.client, &mut upstream.stream, framing).await?;
      true
    }
  };
  upstream.stream.flush().await?;
  if streamed {
    // the bytes are gone; later readers see an empty body
    session.request_mut().payload = Payload::Empty;
  }
  Ok(())
}

/// Write the final response to the client, returning how its body was framed.
async fn write_response(session: &mut Session, mut response: Response, method: &Method) -> Result<Framing> {
  if let Payload::Replaced { unread, .. } = &mut response.payload {
    let framing = std::mem::replace(unread, Framing::Empty);
    if framing == Framing::Close {
      session.upstream = None;
    } else if let Some(upstream) = session.upstream.as_mut() {
      drain_body(&mut upstream.stream, framing).await?;
    }
  }
  let bodiless = is_bodiless(response.status_code(), method);
  let (headers, payload) = response.headers_and_payload();
  let outgoing = prepare(headers, payload);
  session.client.write_all(&response.head_to_raw()).await?;
  let written = match outgoing {
    Outgoing::Nothing => Framing::Empty,
    Outgoing::Fixed(body) => {
      if !bodiless {
        session.client.write_all(&body).await?;
      }
      Framing::Length(body.len() as u64)
    }
    Outgoing::Stream(framing) => {
      let upstream = session
        .upstream
        .as_mut()
        .ok_or_else(|| Error::Other("no upstream connection".to_string()))?;
      copy_body(&mut upstream.stream, &mut session.client, framing).await?;
      framing
    }
  };
  session.client.flush().await?;
  Ok(written)
}

/// Write a locally generated response.
async fn write_reply(
  client: &mut BufReader<Socket>,
  mut reply: Response,
  method: &Method,
  close: bool,
) -> Result<()> {
  if close {
    reply
      .headers_mut()
      .insert(CONNECTION, HeaderValue::from_static("close"));
  }
  let bodiless = is_bodiless(reply.status_code(), method);
  let (headers, payload) = reply.headers_and_payload();
  let outgoing = prepare(headers, payload);
  client.write_all(&reply.head_to_raw()).await?;
  if let Outgoing::Fixed(body) = outgoing {
    if !bodiless {
      client.write_all(&body).await?;
    }
  }
  client.flush().await?;
  Ok(())
}

async fn bad_request(session: &mut Session) {
  if let Err(e) = write_reply(&mut session.client, Response::bad_request(), &Method::GET, true).await {
    trace!("could not send 400: {}", e);
  }
}

fn is_bodiless(status: StatusCode, method: &Method) -> bool {
  method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::body::Body;

  fn origin_form(path: &str, host: Option<&'static str>) -> Request {
    let mut request = Request::from(Request::builder().uri(path).body(Vec::new()).unwrap());
    if let Some(host) = host {
      request.headers_mut().insert(HOST, HeaderValue::from_static(host));
    }
    request
  }

  #[test]
  fn host_header_makes_the_uri_absolute() {
    let base = Base {
      https: true,
      authority: Some("10.0.0.1:8443".to_string()),
      sni: None,
    };
    let mut request = origin_form("/a?b=1", Some("example.com"));
    absolutize(&mut request, &base).unwrap();
    assert_eq!(request.uri().to_string(), "https://example.com/a?b=1");
    let mut request = origin_form("/", None);
    absolutize(&mut request, &base).unwrap();
    assert_eq!(request.uri().to_string(), "https://10.0.0.1:8443/");
  }

  #[test]
  fn request_without_any_host_is_rejected() {
    let base = Base {
      https: false,
      authority: None,
      sni: None,
    };
    assert!(absolutize(&mut origin_form("/", None), &base).is_err());
  }

  #[test]
  fn rewritten_body_gets_exact_length() {
    let mut headers = HeaderMap::new();
    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    let payload = Payload::Buffered {
      original: Body::from("zipped"),
      decoded: Some(Body::from("plain text")),
      current: Some(Body::from("new")),
    };
    assert!(matches!(prepare(&mut headers, &payload), Outgoing::Fixed(b) if b == "new"));
    assert_eq!(headers[CONTENT_LENGTH], "3");
    assert!(headers.get(TRANSFER_ENCODING).is_none());
    assert!(headers.get(CONTENT_ENCODING).is_none());
  }

  #[test]
  fn untouched_buffered_body_keeps_its_encoding() {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    let payload = Payload::Buffered {
      original: Body::from("zipped"),
      decoded: Some(Body::from("plain text")),
      current: None,
    };
    assert!(matches!(prepare(&mut headers, &payload), Outgoing::Fixed(b) if b == "zipped"));
    assert_eq!(headers[CONTENT_LENGTH], "6");
    assert_eq!(headers[CONTENT_ENCODING], "gzip");
  }

  #[test]
  fn rewritten_body_drops_a_coding_it_could_not_undo() {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
    let mut payload = Payload::Buffered {
      original: Body::from(&b"\x28\xb5\x2f\xfd\x00"[..]),
      decoded: None,
      current: None,
    };
    payload.replace(Body::from("<p>rewritten</p>"));
    assert!(matches!(prepare(&mut headers, &payload), Outgoing::Fixed(b) if b == "<p>rewritten</p>"));
    assert!(headers.get(CONTENT_ENCODING).is_none());
    assert_eq!(headers[CONTENT_LENGTH], "16");
  }

  #[test]
  fn bytes_written_back_unchanged_keep_their_coding() {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
    let mut payload = Payload::Buffered {
      original: Body::from("opaque"),
      decoded: None,
      current: None,
    };
    payload.replace(Body::from("opaque"));
    assert!(matches!(prepare(&mut headers, &payload), Outgoing::Fixed(b) if b == "opaque"));
    assert_eq!(headers[CONTENT_ENCODING], "zstd");
  }

  #[test]
  fn emptied_body_announces_zero() {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("120"));
    let payload = Payload::Replaced {
      current: Body::empty(),
      unread: Framing::Length(120),
    };
    assert!(matches!(prepare(&mut headers, &payload), Outgoing::Fixed(b) if b.is_empty()));
    assert_eq!(headers[CONTENT_LENGTH], "0");
  }

  #[test]
  fn connect_target_defaults_to_https_port() {
    let request = Request::from(
      Request::builder()
        .method(Method::CONNECT)
        .uri("example.com")
        .body(Vec::new())
        .unwrap(),
    );
    assert_eq!(connect_target(&request), Some(("example.com".to_string(), 443)));
  }

  #[test]
  fn only_dropped_connections_are_retried() {
    assert!(is_stale(&Error::IO(std::io::Error::from(ErrorKind::ConnectionReset))));
    assert!(!is_stale(&Error::Timeout("upstream response")));
    assert!(!is_stale(&Error::invalid_http("bad status line")));
  }
}
