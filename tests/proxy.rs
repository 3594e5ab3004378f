//! End-to-end exchanges through a running proxy

use async_trait::async_trait;
use catapult::tls::Certificate;
use catapult::{
  Body, CertificateManager, ConnectorBuilder, EndpointConfig, EndpointMode, Error,
  InterceptorHandler, MitmConfig, ProxyHandle, ProxyServer, RequestInterceptor,
  ResponseInterceptor, Session,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const BLOCKED: &str = "<html><body><h1>Website Blocked</h1></body></html>";

fn temp_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("catapult-e2e-{name}-{}", std::process::id()));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

/// Hooks shared by every test: block, redirect, rewrite and bookkeeping.
#[derive(Default)]
struct Hooks {
  seen: Mutex<Vec<String>>,
  sni: Mutex<Vec<Option<String>>>,
  leaked: AtomicBool,
  lost: AtomicBool,
}

#[async_trait]
impl RequestInterceptor for Hooks {
  async fn on_request(&self, session: &mut Session) -> catapult::Result<()> {
    let uri = session.request().uri().to_string();
    self.seen.lock().unwrap().push(uri.clone());
    self.sni.lock().unwrap().push(session.sni().map(str::to_string));
    if session.user_data::<String>().is_some() {
      self.leaked.store(true, Ordering::SeqCst);
    }
    session.set_user_data(uri.clone());
    if uri.contains("/blocked") {
      session.ok(BLOCKED);
    } else if uri.contains("/wiki") {
      session.redirect("https://www.paypal.com")?;
    } else if uri.contains("/fail") {
      session.set_request_body_text("tampered");
      return Err(Error::Hook("refusing to finish".to_string()));
    } else if uri.contains("/upload") {
      let text = session.request_body_text().await?;
      session.set_request_body_text(&text.to_uppercase());
    }
    Ok(())
  }
}

#[async_trait]
impl ResponseInterceptor for Hooks {
  async fn on_response(&self, session: &mut Session) -> catapult::Result<()> {
    let uri = session.request().uri().to_string();
    if session.user_data::<String>() != Some(&uri) {
      self.lost.store(true, Ordering::SeqCst);
    }
    if uri.contains("/shrink") || uri.contains("/chunked-rewrite") {
      session.set_response_body_text("short")?;
    } else if uri.contains("/empty") {
      session.set_response_body(Body::empty())?;
    } else if uri.contains("/peek") {
      let text = session.response_body_text().await?;
      session.set_response_body_text(&format!("[{text}]"))?;
    }
    Ok(())
  }
}

/// Answers `METHOD TARGET BODY` for every request, chunked when the path asks for it.
async fn serve_origin<S: AsyncRead + AsyncWrite + Unpin>(stream: S, hits: Arc<AtomicUsize>) {
  let mut stream = BufReader::new(stream);
  loop {
    let mut request_line = String::new();
    if stream.read_line(&mut request_line).await.unwrap_or(0) == 0 {
      return;
    }
    let mut content_length = 0;
    loop {
      let mut line = String::new();
      if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
        return;
      }
      if line == "\r\n" {
        break;
      }
      if let Some((name, value)) = line.split_once(':') {
        if name.eq_ignore_ascii_case("content-length") {
          content_length = value.trim().parse().unwrap();
        }
      }
    }
    let mut body = vec![0; content_length];
    stream.read_exact(&mut body).await.unwrap();
    hits.fetch_add(1, Ordering::SeqCst);
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    let text = format!("{method} {target} {}", String::from_utf8_lossy(&body));
    let response = if target.starts_with("/chunked") {
      format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n{text}\r\n0\r\n\r\n",
        text.len()
      )
    } else {
      format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\n\r\n{text}",
        text.len()
      )
    };
    if stream.write_all(response.as_bytes()).await.is_err() {
      return;
    }
    stream.flush().await.ok();
  }
}

async fn plain_origin() -> (SocketAddr, Arc<AtomicUsize>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let hits = Arc::new(AtomicUsize::new(0));
  let counter = hits.clone();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(serve_origin(stream, counter.clone()));
    }
  });
  (addr, hits)
}

/// A TLS origin for `localhost` whose certificate comes from its own root.
async fn tls_origin(name: &str) -> (SocketAddr, CertificateDer<'static>, PathBuf) {
  let dir = temp_dir(name);
  let authority = CertificateManager::new(&dir).await.unwrap();
  let entry = authority.get_server_cert("localhost").await.unwrap();
  let config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(entry.cert_chain().to_vec(), entry.private_key())
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let hits = Arc::new(AtomicUsize::new(0));
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      let hits = hits.clone();
      tokio::spawn(async move {
        if let Ok(tls) = acceptor.accept(stream).await {
          serve_origin(tls, hits).await;
        }
      });
    }
  });
  (addr, authority.ca_cert_der().clone(), dir)
}

fn trusting(root: &CertificateDer<'static>) -> Vec<Certificate> {
  vec![Certificate::from_der(root).unwrap()]
}

async fn start_proxy(
  name: &str,
  hooks: Arc<Hooks>,
  trusted: Vec<Certificate>,
) -> (ProxyHandle, PathBuf) {
  start_proxy_with(name, hooks, trusted, |_| {}).await
}

async fn start_proxy_with(
  name: &str,
  hooks: Arc<Hooks>,
  trusted: Vec<Certificate>,
  configure: impl FnOnce(&mut MitmConfig),
) -> (ProxyHandle, PathBuf) {
  let dir = temp_dir(name);
  let mut config = MitmConfig {
    ca_storage_path: dir.clone(),
    endpoints: vec![EndpointConfig {
      bind: "127.0.0.1:0".parse().unwrap(),
      mode: EndpointMode::Explicit,
      decrypt_tls: true,
      certificate: None,
    }],
    ..Default::default()
  };
  configure(&mut config);
  let mut handler = InterceptorHandler::new();
  handler.add_request_interceptor(hooks.clone());
  handler.add_response_interceptor(hooks);
  let proxy = ProxyServer::builder()
    .config(config)
    .interceptor_handler(handler)
    .configure_connector(move |builder: ConnectorBuilder| builder.native_roots(false).certificate(trusted))
    .build_async()
    .await
    .unwrap()
    .start()
    .await
    .unwrap();
  (proxy, dir)
}

struct Reply {
  status: u16,
  headers: Vec<(String, String)>,
  body: String,
}

impl Reply {
  fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> Reply {
  let mut line = String::new();
  reader.read_line(&mut line).await.unwrap();
  let status = line.split_whitespace().nth(1).unwrap().parse().unwrap();
  let mut headers = Vec::new();
  loop {
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    if line == "\r\n" {
      break;
    }
    let (name, value) = line.split_once(':').unwrap();
    headers.push((name.trim().to_string(), value.trim().to_string()));
  }
  let mut reply = Reply {
    status,
    headers,
    body: String::new(),
  };
  if reply.header("transfer-encoding") == Some("chunked") {
    let mut body = Vec::new();
    loop {
      line.clear();
      reader.read_line(&mut line).await.unwrap();
      let size = usize::from_str_radix(line.trim(), 16).unwrap();
      if size == 0 {
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        break;
      }
      let mut chunk = vec![0; size + 2];
      reader.read_exact(&mut chunk).await.unwrap();
      body.extend_from_slice(&chunk[..size]);
    }
    reply.body = String::from_utf8(body).unwrap();
  } else if let Some(len) = reply.header("content-length") {
    let mut body = vec![0; len.parse().unwrap()];
    reader.read_exact(&mut body).await.unwrap();
    reply.body = String::from_utf8(body).unwrap();
  }
  reply
}

async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut BufReader<S>, raw: String) -> Reply {
  stream.write_all(raw.as_bytes()).await.unwrap();
  stream.flush().await.unwrap();
  read_reply(stream).await
}

fn get(origin: SocketAddr, path: &str) -> String {
  format!("GET http://{origin}{path} HTTP/1.1\r\nHost: {origin}\r\n\r\n")
}

#[tokio::test]
async fn plain_http_block_redirect_and_pass() {
  let (origin, hits) = plain_origin().await;
  let hooks = Arc::new(Hooks::default());
  let (proxy, dir) = start_proxy("plain", hooks.clone(), Vec::new()).await;
  let mut client = BufReader::new(TcpStream::connect(proxy.local_addrs()[0]).await.unwrap());

  let blocked = exchange(&mut client, get(origin, "/blocked")).await;
  assert_eq!(blocked.status, 200);
  assert_eq!(blocked.body, BLOCKED);
  assert_eq!(blocked.header("content-type"), Some("text/html; charset=utf-8"));

  let redirected = exchange(&mut client, get(origin, "/wiki/Rust")).await;
  assert_eq!(redirected.status, 302);
  assert_eq!(redirected.header("location"), Some("https://www.paypal.com"));
  assert_eq!(hits.load(Ordering::SeqCst), 0, "origin saw a short-circuited request");

  let passed = exchange(&mut client, get(origin, "/hello?x=1")).await;
  assert_eq!(passed.status, 200);
  assert_eq!(passed.body, "GET /hello?x=1 ");
  assert_eq!(hits.load(Ordering::SeqCst), 1);

  assert!(!hooks.leaked.load(Ordering::SeqCst), "user data leaked between exchanges");
  assert!(!hooks.lost.load(Ordering::SeqCst), "user data lost between hooks");
  assert_eq!(hooks.seen.lock().unwrap().len(), 3);

  proxy.stop().await;
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn rewritten_bodies_carry_exact_length() {
  let (origin, _) = plain_origin().await;
  let (proxy, dir) = start_proxy("lengths", Arc::new(Hooks::default()), Vec::new()).await;
  let mut client = BufReader::new(TcpStream::connect(proxy.local_addrs()[0]).await.unwrap());

  let shrunk = exchange(&mut client, get(origin, "/shrink")).await;
  assert_eq!(shrunk.body, "short");
  assert_eq!(shrunk.header("content-length"), Some("5"));

  let rewritten = exchange(&mut client, get(origin, "/chunked-rewrite")).await;
  assert_eq!(rewritten.body, "short");
  assert_eq!(rewritten.header("content-length"), Some("5"));
  assert_eq!(rewritten.header("transfer-encoding"), None);

  let emptied = exchange(&mut client, get(origin, "/empty")).await;
  assert_eq!(emptied.header("content-length"), Some("0"));
  assert_eq!(emptied.body, "");

  let streamed = exchange(&mut client, get(origin, "/chunked")).await;
  assert_eq!(streamed.header("transfer-encoding"), Some("chunked"));
  assert_eq!(streamed.body, "GET /chunked ");

  let peeked = exchange(&mut client, get(origin, "/peek")).await;
  assert_eq!(peeked.body, "[GET /peek ]");
  assert_eq!(peeked.header("content-length"), Some("12"));

  proxy.stop().await;
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn request_bodies_are_forwarded_or_rewritten() {
  let (origin, _) = plain_origin().await;
  let (proxy, dir) = start_proxy("request-bodies", Arc::new(Hooks::default()), Vec::new()).await;
  let mut client = BufReader::new(TcpStream::connect(proxy.local_addrs()[0]).await.unwrap());

  let post = |path: &str, body: &str| {
    format!(
      "POST http://{origin}{path} HTTP/1.1\r\nHost: {origin}\r\nContent-Length: {}\r\n\r\n{body}",
      body.len()
    )
  };
  let untouched = exchange(&mut client, post("/echo", "hello")).await;
  assert_eq!(untouched.body, "POST /echo hello");

  let upper = exchange(&mut client, post("/upload", "hello")).await;
  assert_eq!(upper.body, "POST /upload HELLO");

  // the failing hook's edit is rolled back
  let rolled_back = exchange(&mut client, post("/fail", "original")).await;
  assert_eq!(rolled_back.status, 200);
  assert_eq!(rolled_back.body, "POST /fail original");

  proxy.stop().await;
  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn unreachable_upstream_gets_bad_gateway() {
  let (origin, _) = plain_origin().await;
  let closed = {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
  };
  let (proxy, dir) = start_proxy("refused", Arc::new(Hooks::default()), Vec::new()).await;
  let mut client = BufReader::new(TcpStream::connect(proxy.local_addrs()[0]).await.unwrap());

  let failed = exchange(&mut client, get(closed, "/")).await;
  assert_eq!(failed.status, 502);
  assert!(failed.body.contains("502"));

  // the session survives the failed exchange
  let passed = exchange(&mut client, get(origin, "/after")).await;
  assert_eq!(passed.body, "GET /after ");

  proxy.stop().await;
  std::fs::remove_dir_all(&dir).ok();
}

async fn connect_tls(
  proxy: SocketAddr,
  target: &str,
  root: &CertificateDer<'static>,
) -> BufReader<tokio_rustls::client::TlsStream<TcpStream>> {
  let mut stream = BufReader::new(TcpStream::connect(proxy).await.unwrap());
  let established = exchange(
    &mut stream,
    format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n"),
  )
  .await;
  assert_eq!(established.status, 200);
  assert!(stream.buffer().is_empty());
  let mut roots = RootCertStore::empty();
  roots.add(root.clone()).unwrap();
  let config = ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));
  let server_name = ServerName::try_from("localhost").unwrap();
  let tls = connector.connect(server_name, stream.into_inner()).await.unwrap();
  BufReader::new(tls)
}

#[tokio::test]
async fn connect_tunnel_is_decrypted() {
  let (origin, origin_root, origin_dir) = tls_origin("tls-origin").await;
  let hooks = Arc::new(Hooks::default());
  let (proxy, dir) = start_proxy("tls", hooks.clone(), trusting(&origin_root)).await;
  let root = proxy.certificate_manager().ca_cert_der().clone();
  let target = format!("localhost:{}", origin.port());

  let mut client = connect_tls(proxy.local_addrs()[0], &target, &root).await;
  let request = |path: &str| format!("GET {path} HTTP/1.1\r\nHost: {target}\r\n\r\n");

  let passed = exchange(&mut client, request("/secure")).await;
  assert_eq!(passed.status, 200);
  assert_eq!(passed.body, "GET /secure ");

  let blocked = exchange(&mut client, request("/blocked")).await;
  assert_eq!(blocked.body, BLOCKED);

  let again = exchange(&mut client, request("/again")).await;
  assert_eq!(again.body, "GET /again ");

  assert_eq!(
    hooks.seen.lock().unwrap()[0],
    format!("https://localhost:{}/secure", origin.port())
  );
  assert_eq!(hooks.seen.lock().unwrap().len(), 3);
  assert_eq!(hooks.sni.lock().unwrap()[0].as_deref(), Some("localhost"));
  assert!(!hooks.leaked.load(Ordering::SeqCst), "user data leaked between exchanges");
  assert!(!hooks.lost.load(Ordering::SeqCst), "user data lost between hooks");
  assert_eq!(proxy.certificate_manager().issued_count(), 1);

  proxy.stop().await;
  std::fs::remove_dir_all(&dir).ok();
  std::fs::remove_dir_all(&origin_dir).ok();
}

#[tokio::test]
async fn untrusted_upstream_is_refused_by_default() {
  let (origin, _untrusted_root, origin_dir) = tls_origin("untrusted-origin").await;
  let (proxy, dir) = start_proxy("untrusted", Arc::new(Hooks::default()), Vec::new()).await;
  let root = proxy.certificate_manager().ca_cert_der().clone();
  let target = format!("localhost:{}", origin.port());

  let mut client = connect_tls(proxy.local_addrs()[0], &target, &root).await;
  let reply = exchange(&mut client, format!("GET / HTTP/1.1\r\nHost: {target}\r\n\r\n")).await;
  assert_eq!(reply.status, 502);

  proxy.stop().await;
  std::fs::remove_dir_all(&dir).ok();
  std::fs::remove_dir_all(&origin_dir).ok();
}

#[tokio::test]
async fn stopped_proxy_refuses_connections() {
  let (proxy, dir) = start_proxy("stop", Arc::new(Hooks::default()), Vec::new()).await;
  let addr = proxy.local_addrs()[0];
  assert_ne!(addr.port(), 0);
  let idle = TcpStream::connect(addr).await.unwrap();

  proxy.stop_with_grace(std::time::Duration::from_millis(200)).await;
  assert!(TcpStream::connect(addr).await.is_err());
  drop(idle);

  std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn tunnel_is_blind_without_decryption() {
  let (origin, origin_root, origin_dir) = tls_origin("blind-origin").await;
  let hooks = Arc::new(Hooks::default());
  let (proxy, dir) = start_proxy_with("blind", hooks.clone(), Vec::new(), |config| {
    config.endpoints[0].decrypt_tls = false;
  })
  .await;
  let target = format!("localhost:{}", origin.port());

  // the client talks to the origin's own certificate end to end
  let mut client = connect_tls(proxy.local_addrs()[0], &target, &origin_root).await;
  let reply = exchange(&mut client, format!("GET /secret HTTP/1.1\r\nHost: {target}\r\n\r\n")).await;
  assert_eq!(reply.status, 200);
  assert_eq!(reply.body, "GET /secret ");

  assert!(hooks.seen.lock().unwrap().is_empty(), "hooks saw tunnelled traffic");
  assert_eq!(proxy.certificate_manager().issued_count(), 0);

  proxy.stop().await;
  std::fs::remove_dir_all(&dir).ok();
  std::fs::remove_dir_all(&origin_dir).ok();
}

#[tokio::test]
async fn transparent_endpoint_falls_back_to_sni() {
  let (origin, origin_root, origin_dir) = tls_origin("transparent-origin").await;
  let hooks = Arc::new(Hooks::default());
  let (proxy, dir) = start_proxy_with("transparent", hooks.clone(), trusting(&origin_root), |config| {
    config.endpoints[0].mode = EndpointMode::Transparent;
  })
  .await;
  let root = proxy.certificate_manager().ca_cert_der().clone();

  // no CONNECT: the client believes the proxy is the server
  let mut roots = RootCertStore::empty();
  roots.add(root).unwrap();
  let config = ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let stream = TcpStream::connect(proxy.local_addrs()[0]).await.unwrap();
  let tls = TlsConnector::from(Arc::new(config))
    .connect(ServerName::try_from("localhost").unwrap(), stream)
    .await
    .unwrap();
  let mut client = BufReader::new(tls);

  // without a Host header the destination comes from SNI and the scheme's port
  let blocked = exchange(&mut client, "GET /blocked HTTP/1.1\r\n\r\n".to_string()).await;
  assert_eq!(blocked.body, BLOCKED);
  assert_eq!(hooks.seen.lock().unwrap()[0], "https://localhost:443/blocked");
  assert_eq!(hooks.sni.lock().unwrap()[0].as_deref(), Some("localhost"));

  let target = format!("localhost:{}", origin.port());
  let passed = exchange(&mut client, format!("GET /direct HTTP/1.1\r\nHost: {target}\r\n\r\n")).await;
  assert_eq!(passed.status, 200);
  assert_eq!(passed.body, "GET /direct ");
  assert_eq!(proxy.certificate_manager().issued_count(), 1);

  proxy.stop().await;
  std::fs::remove_dir_all(&dir).ok();
  std::fs::remove_dir_all(&origin_dir).ok();
}

/// A forward proxy in front of the origins. Answers absolute-form requests
/// itself, tunnels `CONNECT` to loopback, and logs each request line with its
/// `Proxy-Authorization`.
async fn upstream_proxy() -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let log = Arc::new(Mutex::new(Vec::new()));
  let seen = log.clone();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let seen = seen.clone();
      tokio::spawn(async move {
        let mut stream = BufReader::new(stream);
        loop {
          let mut request_line = String::new();
          if stream.read_line(&mut request_line).await.unwrap_or(0) == 0 {
            return;
          }
          let mut credentials = "-".to_string();
          loop {
            let mut line = String::new();
            if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
              return;
            }
            if line == "\r\n" {
              break;
            }
            if let Some((name, value)) = line.split_once(':') {
              if name.eq_ignore_ascii_case("proxy-authorization") {
                credentials = value.trim().to_string();
              }
            }
          }
          let request_line = request_line.trim().to_string();
          seen.lock().unwrap().push(format!("{request_line} {credentials}"));
          let target = request_line.split_whitespace().nth(1).unwrap_or_default().to_string();
          if request_line.starts_with("CONNECT ") {
            let port: u16 = target.rsplit(':').next().unwrap().parse().unwrap();
            let mut origin = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream
              .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
              .await
              .unwrap();
            stream.flush().await.unwrap();
            let mut client = stream.into_inner();
            tokio::io::copy_bidirectional(&mut client, &mut origin).await.ok();
            return;
          }
          let body = format!("via upstream {target}");
          let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
          );
          if stream.write_all(response.as_bytes()).await.is_err() {
            return;
          }
          stream.flush().await.ok();
        }
      });
    }
  });
  (addr, log)
}

#[tokio::test]
async fn traffic_is_chained_through_upstream_proxy() {
  let (plain, hits) = plain_origin().await;
  let (secure, origin_root, origin_dir) = tls_origin("chained-origin").await;
  let (upstream, log) = upstream_proxy().await;
  let (proxy, dir) = start_proxy_with("chained", Arc::new(Hooks::default()), trusting(&origin_root), |config| {
    config.upstream_http_proxy = Some(format!("http://user:pass@{upstream}"));
    config.upstream_https_proxy = Some(format!("http://user:pass@{upstream}"));
  })
  .await;
  let credentials = catapult::encode_basic_auth("user", Some("pass"))
    .to_str()
    .unwrap()
    .to_string();
  assert_eq!(credentials, "Basic dXNlcjpwYXNz");

  let mut client = BufReader::new(TcpStream::connect(proxy.local_addrs()[0]).await.unwrap());
  let plain_reply = exchange(&mut client, get(plain, "/chained")).await;
  assert_eq!(plain_reply.body, format!("via upstream http://{plain}/chained"));
  assert_eq!(hits.load(Ordering::SeqCst), 0, "plain request bypassed the upstream proxy");

  let root = proxy.certificate_manager().ca_cert_der().clone();
  let target = format!("localhost:{}", secure.port());
  let mut tls = connect_tls(proxy.local_addrs()[0], &target, &root).await;
  let secure_reply = exchange(&mut tls, format!("GET /secure HTTP/1.1\r\nHost: {target}\r\n\r\n")).await;
  assert_eq!(secure_reply.body, "GET /secure ");

  let log = log.lock().unwrap().clone();
  assert_eq!(log[0], format!("GET http://{plain}/chained HTTP/1.1 {credentials}"));
  assert_eq!(log[1], format!("CONNECT {target} HTTP/1.1 {credentials}"));

  proxy.stop().await;
  std::fs::remove_dir_all(&dir).ok();
  std::fs::remove_dir_all(&origin_dir).ok();
}

#[tokio::test]
async fn expect_continue_is_answered_before_the_body() {
  let (origin, _) = plain_origin().await;
  let (proxy, dir) = start_proxy("expect", Arc::new(Hooks::default()), Vec::new()).await;
  let mut client = BufReader::new(TcpStream::connect(proxy.local_addrs()[0]).await.unwrap());

  let head = format!(
    "POST http://{origin}/echo HTTP/1.1\r\nHost: {origin}\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n"
  );
  let interim = exchange(&mut client, head).await;
  assert_eq!(interim.status, 100);

  let reply = exchange(&mut client, "hello".to_string()).await;
  assert_eq!(reply.status, 200);
  assert_eq!(reply.body, "POST /echo hello");

  proxy.stop().await;
  std::fs::remove_dir_all(&dir).ok();
}
