//! The per-connection state interceptors work with.
use crate::body::{decode_content, read_body, Body, Payload};
use crate::errors::{Error, Result};
use crate::listener::ProxyEndpoint;
use crate::request::Request;
use crate::response::Response;
use crate::router::UpstreamConnection;
use crate::socket::Socket;
use bytes::Bytes;
use http::{Extensions, HeaderMap, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;

/// One client connection, possibly carrying several exchanges.
///
/// Interceptors receive `&mut Session` and reach the current [`Request`] and
/// [`Response`] through it. Bodies are pulled off the wire only when an
/// interceptor asks for them, so reading a body is `async`.
#[derive(Debug)]
pub struct Session {
  id: u64,
  client_addr: SocketAddr,
  endpoint: Arc<ProxyEndpoint>,
  sni: Option<String>,
  is_https: bool,
  request: Request,
  response: Option<Response>,
  reply: Option<Response>,
  user_data: Extensions,
  upstream_endpoint: Option<SocketAddr>,
  upstream_target: Option<(String, u16)>,
  max_body_size: usize,
  io_timeout: Duration,
  poisoned: bool,
  pub(crate) client: BufReader<Socket>,
  pub(crate) upstream: Option<UpstreamConnection>,
}

/// Everything an interceptor may change, captured before it runs.
pub(crate) struct Checkpoint {
  request: Request,
  response: Option<Response>,
  reply: Option<Response>,
  user_data: Extensions,
  upstream_endpoint: Option<SocketAddr>,
  upstream_target: Option<(String, u16)>,
}

impl Session {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    id: u64,
    client_addr: SocketAddr,
    endpoint: Arc<ProxyEndpoint>,
    client: BufReader<Socket>,
    is_https: bool,
    sni: Option<String>,
    max_body_size: usize,
    io_timeout: Duration,
  ) -> Self {
    Self {
      id,
      client_addr,
      endpoint,
      sni,
      is_https,
      request: Request::default(),
      response: None,
      reply: None,
      user_data: Extensions::new(),
      upstream_endpoint: None,
      upstream_target: None,
      max_body_size,
      io_timeout,
      poisoned: false,
      client,
      upstream: None,
    }
  }
  /// Reset the per-exchange state for a freshly parsed request.
  pub(crate) fn begin_exchange(&mut self, request: Request) {
    self.request = request;
    self.response = None;
    self.reply = None;
    self.user_data = Extensions::new();
    self.upstream_endpoint = None;
    self.upstream_target = None;
  }
  pub(crate) fn set_response(&mut self, response: Response) {
    self.response = Some(response);
  }
  pub(crate) fn take_response(&mut self) -> Option<Response> {
    self.response.take()
  }
  pub(crate) fn take_reply(&mut self) -> Option<Response> {
    self.reply.take()
  }
  pub(crate) fn has_reply(&self) -> bool {
    self.reply.is_some()
  }
  /// Set when a body read failed halfway and the connection state is unknown.
  pub(crate) fn is_poisoned(&self) -> bool {
    self.poisoned
  }
  pub(crate) fn checkpoint(&self) -> Checkpoint {
    Checkpoint {
      request: self.request.clone(),
      response: self.response.clone(),
      reply: self.reply.clone(),
      user_data: self.user_data.clone(),
      upstream_endpoint: self.upstream_endpoint,
      upstream_target: self.upstream_target.clone(),
    }
  }
  /// Undo an interceptor's changes, keeping body bytes it already consumed.
  pub(crate) fn restore(&mut self, checkpoint: Checkpoint) {
    let request_payload = Payload::rollback(
      &checkpoint.request.payload,
      std::mem::take(&mut self.request.payload),
    );
    self.request = checkpoint.request;
    self.request.payload = request_payload;
    let response_payload = match (&checkpoint.response, self.response.as_mut()) {
      (Some(before), Some(now)) => Some(Payload::rollback(
        &before.payload,
        std::mem::take(&mut now.payload),
      )),
      _ => None,
    };
    self.response = checkpoint.response;
    if let (Some(response), Some(payload)) = (self.response.as_mut(), response_payload) {
      response.payload = payload;
    }
    self.reply = checkpoint.reply;
    self.user_data = checkpoint.user_data;
    self.upstream_endpoint = checkpoint.upstream_endpoint;
    self.upstream_target = checkpoint.upstream_target;
  }
  /// Hand the client connection back, for a `CONNECT` that turns it into a tunnel.
  pub(crate) fn into_client(self) -> BufReader<Socket> {
    self.client
  }
  pub(crate) fn upstream_endpoint(&self) -> Option<SocketAddr> {
    self.upstream_endpoint
  }
  pub(crate) fn upstream_target(&self) -> Option<&(String, u16)> {
    self.upstream_target.as_ref()
  }
}

impl Session {
  /// Sequential id of this connection, unique per server.
  pub fn id(&self) -> u64 {
    self.id
  }
  /// Address of the connected client.
  pub fn client_addr(&self) -> SocketAddr {
    self.client_addr
  }
  /// The endpoint that accepted this connection.
  pub fn endpoint(&self) -> &ProxyEndpoint {
    &self.endpoint
  }
  /// Whether the client leg was decrypted.
  pub fn is_https(&self) -> bool {
    self.is_https
  }
  /// Server name the client announced in its ClientHello.
  pub fn sni(&self) -> Option<&str> {
    self.sni.as_deref()
  }
  /// The current request.
  pub fn request(&self) -> &Request {
    &self.request
  }
  /// The current request, for editing before it is forwarded.
  pub fn request_mut(&mut self) -> &mut Request {
    &mut self.request
  }
  /// The upstream response, present while response interceptors run.
  pub fn response(&self) -> Option<&Response> {
    self.response.as_ref()
  }
  /// The upstream response, for editing before it reaches the client.
  pub fn response_mut(&mut self) -> Option<&mut Response> {
    self.response.as_mut()
  }
}

// bodies
impl Session {
  async fn read_payload(
    &mut self,
    framing: crate::body::Framing,
    from_upstream: bool,
  ) -> Result<Bytes> {
    let limit = self.max_body_size;
    let timeout = self.io_timeout;
    let read = match (from_upstream, self.upstream.as_mut()) {
      (false, _) => tokio::time::timeout(timeout, read_body(&mut self.client, framing, limit)).await,
      (true, Some(upstream)) => {
        tokio::time::timeout(timeout, read_body(&mut upstream.stream, framing, limit)).await
      }
      (true, None) => return Err(Error::Other("no upstream connection".to_string())),
    };
    match read {
      Ok(Ok(bytes)) => Ok(bytes),
      Ok(Err(e)) => {
        self.poisoned = true;
        Err(e)
      }
      Err(_) => {
        self.poisoned = true;
        Err(Error::Timeout("body read"))
      }
    }
  }
  async fn load_request_body(&mut self) -> Result<()> {
    if let Payload::Unread(framing) = self.request.payload {
      let raw = self.read_payload(framing, false).await?;
      let decoded = decode_body(self.request.headers(), &raw);
      self.request.payload = Payload::Buffered {
        original: raw.into(),
        decoded,
        current: None,
      };
    }
    Ok(())
  }
  async fn load_response_body(&mut self) -> Result<()> {
    let framing = match self.response.as_ref().map(|r| &r.payload) {
      Some(Payload::Unread(framing)) => *framing,
      Some(_) => return Ok(()),
      None => return Err(Error::Other("no response yet".to_string())),
    };
    let raw = self.read_payload(framing, true).await?;
    if let Some(response) = self.response.as_mut() {
      let decoded = decode_body(response.headers(), &raw);
      response.payload = Payload::Buffered {
        original: raw.into(),
        decoded,
        current: None,
      };
    }
    Ok(())
  }
  /// The request body, read from the client on first use and decompressed.
  pub async fn request_body(&mut self) -> Result<Body> {
    self.load_request_body().await?;
    Ok(self.request.body().cloned().unwrap_or_default())
  }
  /// The request body as text, in the charset its `Content-Type` declares.
  pub async fn request_body_text(&mut self) -> Result<String> {
    self.load_request_body().await?;
    Ok(self.request.text())
  }
  /// Replace the request body. `Content-Length` is recomputed when forwarding.
  pub fn set_request_body(&mut self, body: impl Into<Body>) {
    self.request.set_body(body);
  }
  /// Replace the request body with text, encoded in the declared charset.
  pub fn set_request_body_text(&mut self, text: &str) {
    self.request.set_text(text);
  }
  /// The response body, read from the upstream on first use and decompressed.
  pub async fn response_body(&mut self) -> Result<Body> {
    self.load_response_body().await?;
    Ok(
      self
        .response
        .as_ref()
        .and_then(|r| r.body().cloned())
        .unwrap_or_default(),
    )
  }
  /// The response body as text, in the charset its `Content-Type` declares.
  pub async fn response_body_text(&mut self) -> Result<String> {
    self.load_response_body().await?;
    Ok(self.response.as_ref().map(|r| r.text()).unwrap_or_default())
  }
  /// Replace the response body. `Content-Length` is recomputed when writing.
  pub fn set_response_body(&mut self, body: impl Into<Body>) -> Result<()> {
    let response = self
      .response
      .as_mut()
      .ok_or_else(|| Error::Other("no response yet".to_string()))?;
    response.set_body(body);
    Ok(())
  }
  /// Replace the response body with text, encoded in the declared charset.
  pub fn set_response_body_text(&mut self, text: &str) -> Result<()> {
    let response = self
      .response
      .as_mut()
      .ok_or_else(|| Error::Other("no response yet".to_string()))?;
    response.set_text(text);
    Ok(())
  }
}

fn decode_body(headers: &HeaderMap, raw: &Bytes) -> Option<Body> {
  let coding = headers
    .get(http::header::CONTENT_ENCODING)?
    .to_str()
    .ok()?;
  match decode_content(coding, raw) {
    Ok(decoded) => decoded.map(Body::from),
    Err(e) => {
      tracing::debug!("could not undo content-encoding {}: {}", coding, e);
      None
    }
  }
}

// short circuits
impl Session {
  /// Answer the client with `200 OK` and an HTML body. The upstream is never contacted.
  pub fn ok(&mut self, html: impl Into<Body>) {
    self.reply = Some(Response::html(StatusCode::OK, html));
  }
  /// Answer the client with `response`. The upstream is never contacted.
  pub fn respond(&mut self, response: Response) {
    self.reply = Some(response);
  }
  /// Answer the client with `302 Found` pointing at `location`.
  pub fn redirect(&mut self, location: &str) -> Result<()> {
    self.reply = Some(Response::redirect(location)?);
    Ok(())
  }
}

// user data and routing
impl Session {
  /// Attach a value for later interceptors of the same exchange. Returns the value it replaced.
  ///
  /// The slot is emptied when the next request on the connection begins.
  pub fn set_user_data<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
    self.user_data.insert(value)
  }
  /// The value of type `T` attached during this exchange.
  pub fn user_data<T: Send + Sync + 'static>(&self) -> Option<&T> {
    self.user_data.get::<T>()
  }
  /// Remove and return the value of type `T`.
  pub fn take_user_data<T: Send + Sync + 'static>(&mut self) -> Option<T> {
    self.user_data.remove::<T>()
  }
  /// Bind the outbound connection of this exchange to a local address.
  ///
  /// A port of 0 lets the system pick one.
  pub fn set_upstream_endpoint(&mut self, local: SocketAddr) {
    self.upstream_endpoint = Some(local);
  }
  /// Send this exchange to `host:port` instead of the host the request names.
  pub fn set_upstream_target(&mut self, host: impl Into<String>, port: u16) {
    self.upstream_target = Some((host.into(), port));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::body::Framing;
  use crate::socket::MaybeTlsStream;
  use tokio::io::AsyncWriteExt;
  use tokio::net::{TcpListener, TcpStream};

  async fn session(limit: usize) -> (Session, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, peer) = listener.accept().await.unwrap();
    let socket = Socket::new(MaybeTlsStream::Tcp(server), None, None);
    let session = Session::new(
      1,
      peer,
      Arc::new(ProxyEndpoint::explicit(addr)),
      BufReader::new(socket),
      false,
      None,
      limit,
      Duration::from_secs(5),
    );
    (session, client)
  }

  fn post(len: u64) -> Request {
    let mut request = Request::from(
      Request::builder()
        .method("POST")
        .uri("http://example.com/form")
        .header(http::header::CONTENT_LENGTH, len)
        .body(Vec::new())
        .unwrap(),
    );
    request.payload = Payload::from_framing(Framing::Length(len));
    request
  }

  #[tokio::test]
  async fn failed_hook_rolls_back_but_keeps_read_bytes() {
    let (mut session, mut client) = session(1024).await;
    client.write_all(b"hello").await.unwrap();
    session.begin_exchange(post(5));
    let checkpoint = session.checkpoint();
    assert_eq!(session.request_body_text().await.unwrap(), "hello");
    session.set_request_body_text("changed");
    session.set_user_data(7u32);
    session.ok("<p>blocked</p>");
    session.restore(checkpoint);
    assert_eq!(&session.request().body().unwrap()[..], b"hello");
    assert!(!session.request().is_body_modified());
    assert!(session.user_data::<u32>().is_none());
    assert!(!session.has_reply());
  }

  #[tokio::test]
  async fn user_data_does_not_leak_between_exchanges() {
    let (mut session, _client) = session(1024).await;
    session.begin_exchange(post(0));
    session.set_user_data(String::from("first"));
    session.set_upstream_target("localhost", 8080);
    assert_eq!(session.user_data::<String>().map(String::as_str), Some("first"));
    session.begin_exchange(post(0));
    assert!(session.user_data::<String>().is_none());
    assert!(session.upstream_target().is_none());
  }

  #[tokio::test]
  async fn oversized_body_poisons_the_session() {
    let (mut session, mut client) = session(4).await;
    client.write_all(b"too long").await.unwrap();
    session.begin_exchange(post(8));
    let err = session.request_body().await.unwrap_err();
    assert!(matches!(err, Error::BodyTooLarge(4)));
    assert!(session.is_poisoned());
  }

  #[tokio::test]
  async fn response_helpers_need_a_response() {
    let (mut session, _client) = session(1024).await;
    session.begin_exchange(post(0));
    assert!(session.set_response_body("x").is_err());
    session.set_response(Response::html(StatusCode::OK, "<p>a</p>"));
    assert_eq!(session.response_body_text().await.unwrap(), "<p>a</p>");
    session.set_response_body_text("<p>b</p>").unwrap();
    assert!(session.response().unwrap().is_body_modified());
  }
}
