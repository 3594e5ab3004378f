use std::fmt::{Debug, Formatter};

use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};
use tokio::io::AsyncBufRead;

use crate::body::{Body, Framing, Payload};
use crate::errors::{Error, Result};
use crate::response::{decode_text, encode_text, parser_headers, parser_version, read_head_lines};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// An intercepted HTTP request.
///
/// The URI is always absolute while interceptors see it, even when the client
/// sent origin-form, so `request.uri().host()` names the upstream.
#[derive(Default, Clone)]
pub struct Request {
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  pub(crate) payload: Payload,
}
impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.payload.view())
      .finish()
  }
}
impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    let mut request = Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      payload: Payload::Empty,
    };
    if !body.is_empty() {
      request.payload.replace(body);
    }
    request
  }
}

impl Request {
  /// Serialize the request line and headers for the upstream.
  ///
  /// The target is written in origin-form, authority-form for `CONNECT`, or
  /// absolute-form when `absolute_form` is set for a forwarding proxy.
  pub(crate) fn head_to_raw(&self, absolute_form: bool) -> Vec<u8> {
    let mut http_requests = Vec::new();
    // 请求头
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    // 路径
    if self.method == Method::CONNECT {
      if let Some(authority) = self.uri.authority() {
        http_requests.extend(authority.as_str().as_bytes());
      }
    } else if absolute_form && self.uri.scheme().is_some() {
      http_requests.extend(self.uri.to_string().as_bytes());
    } else {
      http_requests.extend(self.uri.path().as_bytes());
      if let Some(q) = self.uri.query() {
        http_requests.extend([63]);
        http_requests.extend(q.as_bytes());
      }
    }
    http_requests.extend(SPACE);
    // 版本
    http_requests.extend(format!("{:?}", self.version).as_bytes());
    http_requests.extend(CR_LF);
    // 如果请求头里面没有主机头就先加主机头
    if self.headers.get(http::header::HOST).is_none() {
      if let Some(authority) = self.uri.authority() {
        http_requests.extend(http::header::HOST.as_str().as_bytes());
        http_requests.extend(COLON_SPACE);
        http_requests.extend(authority.as_str().as_bytes());
        http_requests.extend(CR_LF);
      }
    }
    for (k, v) in self.headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    http_requests
  }
  /// Creates a new builder-style object to manufacture a `Request`
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }
  /// How the body following this head is delimited.
  pub(crate) fn framing(&self) -> Result<Framing> {
    Ok(message_framing(&self.headers)?.unwrap_or(Framing::Empty))
  }
  /// Whether the client asked for the connection to end after this exchange.
  pub(crate) fn wants_close(&self) -> bool {
    wants_close(self.version, &self.headers)
  }
  pub(crate) fn headers_and_payload(&mut self) -> (&mut HeaderMap, &Payload) {
    (&mut self.headers, &self.payload)
  }
}

/// Framing declared by `Transfer-Encoding` / `Content-Length`, `None` if neither is present.
pub(crate) fn message_framing(headers: &HeaderMap) -> Result<Option<Framing>> {
  if let Some(te) = headers.get_all(http::header::TRANSFER_ENCODING).iter().last() {
    let te = te
      .to_str()
      .map_err(|_| Error::invalid_http("unreadable transfer-encoding"))?;
    return match te.rsplit(',').next().map(|c| c.trim().to_ascii_lowercase()) {
      Some(coding) if coding == "chunked" => Ok(Some(Framing::Chunked)),
      _ => Err(Error::invalid_http(format!(
        "unsupported transfer-encoding {te:?}"
      ))),
    };
  }
  let mut length: Option<u64> = None;
  for value in headers.get_all(http::header::CONTENT_LENGTH) {
    let parsed: u64 = value
      .to_str()
      .map_err(|_| Error::invalid_http("unreadable content-length"))?
      .trim()
      .parse()?;
    if length.is_some_and(|l| l != parsed) {
      return Err(Error::invalid_http("conflicting content-length values"));
    }
    length = Some(parsed);
  }
  Ok(length.map(Framing::Length))
}

pub(crate) fn wants_close(version: Version, headers: &HeaderMap) -> bool {
  let has_token = |token: &str| {
    headers
      .get_all(http::header::CONNECTION)
      .iter()
      .filter_map(|v| v.to_str().ok())
      .flat_map(|v| v.split(','))
      .any(|t| t.trim().eq_ignore_ascii_case(token))
  };
  match version {
    Version::HTTP_09 | Version::HTTP_10 => !has_token("keep-alive"),
    _ => has_token("close"),
  }
}

impl Request {
  /// Get the method.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }

  /// Get a mutable reference to the method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }

  /// Get the uri.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }

  /// Get a mutable reference to the uri.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }

  /// Get the headers.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Get a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }

  /// Get the http version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }

  /// The body, once it has been read from the client or replaced.
  ///
  /// Use [`Session::request_body`](crate::Session::request_body) to pull it off the wire first.
  pub fn body(&self) -> Option<&Body> {
    self.payload.view()
  }

  /// Replace the body. `Content-Length` is recomputed when the request is forwarded.
  pub fn set_body(&mut self, body: impl Into<Body>) {
    self.payload.replace(body.into());
  }

  /// The body decoded with the `Content-Type` charset, or `default_encoding`.
  pub fn text_with_charset(&self, default_encoding: &str) -> String {
    match self.body() {
      Some(body) => decode_text(&self.headers, body, default_encoding),
      None => String::new(),
    }
  }

  /// The body as text, assuming `utf-8` when no charset is declared.
  pub fn text(&self) -> String {
    self.text_with_charset("utf-8")
  }

  /// Replace the body with `text`, encoded in the declared charset.
  pub fn set_text(&mut self, text: &str) {
    let encoded = encode_text(&self.headers, text);
    self.set_body(encoded);
  }

  /// Whether an interceptor replaced the body.
  pub fn is_body_modified(&self) -> bool {
    self.payload.is_modified()
  }
}

/// Read the next request head off a client connection.
///
/// `Ok(None)` means the client closed the connection between requests.
pub(crate) async fn read_request_head<R: AsyncBufRead + Unpin>(
  reader: &mut R,
) -> Result<Option<Request>> {
  let Some(lines) = read_head_lines(reader).await? else {
    return Ok(None);
  };
  let (request_line, header_lines) = lines
    .split_first()
    .ok_or_else(|| Error::invalid_http("empty request head"))?;
  let line = request_line.strip_suffix(b"\r\n").unwrap_or(request_line);
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let mut parts = line.split(|b| *b == b' ').filter(|p| !p.is_empty());
  let (Some(method), Some(target), Some(version), None) =
    (parts.next(), parts.next(), parts.next(), parts.next())
  else {
    return Err(Error::invalid_http(format!(
      "bad request line {:?}",
      String::from_utf8_lossy(line)
    )));
  };
  let method = Method::from_bytes(method)
    .map_err(|_| Error::invalid_http(format!("bad method {:?}", String::from_utf8_lossy(method))))?;
  let uri = http::Uri::try_from(target)?;
  let version = parser_version(version)?;
  let mut headers = HeaderMap::new();
  for line in header_lines {
    let (k, v) = parser_headers(line)?;
    headers.append(k, v);
  }
  Ok(Some(Request {
    uri,
    version,
    method,
    headers,
    payload: Payload::Empty,
  }))
}
