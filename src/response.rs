use std::fmt::Debug;

use crate::body::{Body, Framing, Payload};
use crate::errors::{new_io_error, Error, Result};
use crate::request::{message_framing, wants_close};
use crate::{COLON_SPACE, CR_LF, SPACE};
use encoding_rs::{Encoding, UTF_8};
use http::{HeaderMap, HeaderValue, Method, Response as HttpResponse, StatusCode, Version};
use mime::Mime;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound for a request or response head.
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;

/// A response on its way back to the client.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: Version,
  status_code: StatusCode,
  reason: Option<String>,
  headers: HeaderMap<HeaderValue>,
  pub(crate) payload: Payload,
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let mut response = Self {
      version: parts.version,
      status_code: parts.status,
      reason: None,
      headers: parts.headers,
      payload: Payload::Empty,
    };
    response.payload.replace(body.into());
    response
  }
}

impl Response {
  pub(crate) fn head_to_raw(&self) -> Vec<u8> {
    let mut http_response = Vec::new();
    http_response.extend(format!("{:?}", self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.status_code.as_str().as_bytes());
    let reason = self
      .reason
      .as_deref()
      .or_else(|| self.status_code.canonical_reason());
    if let Some(reason) = reason {
      http_response.extend(SPACE);
      http_response.extend(reason.as_bytes());
    }
    http_response.extend(CR_LF);
    for (k, v) in self.headers.iter() {
      http_response.extend(k.as_str().as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    http_response
  }
  /// An HTTP response builder
  ///
  /// This type can be used to construct an instance of `Response` through a
  /// builder-like pattern.
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }
  /// An HTML page with the given status.
  pub fn html(status: StatusCode, body: impl Into<Body>) -> Response {
    let mut response = Response {
      status_code: status,
      ..Default::default()
    };
    response.headers.insert(
      http::header::CONTENT_TYPE,
      HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response.payload.replace(body.into());
    response
  }
  /// A `302 Found` pointing at `location`.
  pub fn redirect(location: &str) -> Result<Response> {
    let mut response = Response {
      status_code: StatusCode::FOUND,
      ..Default::default()
    };
    response
      .headers
      .insert(http::header::LOCATION, HeaderValue::from_str(location)?);
    response.payload.replace(Body::empty());
    Ok(response)
  }
  /// The plain text answer sent when the upstream could not be reached.
  pub(crate) fn gateway_error(error: &Error) -> Response {
    let status = error.gateway_status();
    let mut response = Response {
      status_code: status,
      ..Default::default()
    };
    response.headers.insert(
      http::header::CONTENT_TYPE,
      HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response.payload.replace(Body::from(format!(
      "{} {}\n{}\n",
      status.as_str(),
      status.canonical_reason().unwrap_or_default(),
      error
    )));
    response
  }
  /// `400 Bad Request`, sent before dropping a client whose request could not be parsed.
  pub(crate) fn bad_request() -> Response {
    let mut response = Response {
      status_code: StatusCode::BAD_REQUEST,
      ..Default::default()
    };
    response.headers.insert(
      http::header::CONNECTION,
      HeaderValue::from_static("close"),
    );
    response.payload.replace(Body::empty());
    response
  }
  /// How the body following this head is delimited, given the request it answers.
  pub(crate) fn framing(&self, method: &Method) -> Result<Framing> {
    let status = self.status_code;
    if method == Method::HEAD
      || status.is_informational()
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED
      || (method == Method::CONNECT && status.is_success())
    {
      return Ok(Framing::Empty);
    }
    Ok(message_framing(&self.headers)?.unwrap_or(Framing::Close))
  }
  /// Whether the connection this response travels on ends after it.
  pub(crate) fn wants_close(&self) -> bool {
    wants_close(self.version, &self.headers)
  }
  pub(crate) fn headers_and_payload(&mut self) -> (&mut HeaderMap, &Payload) {
    (&mut self.headers, &self.payload)
  }
}

impl Response {
  /// The body decoded with the `Content-Type` charset, falling back to `default_encoding`.
  pub fn text_with_charset(&self, default_encoding: &str) -> String {
    match self.body() {
      Some(body) => decode_text(&self.headers, body, default_encoding),
      None => String::new(),
    }
  }
  /// Get the response text.
  ///
  /// This method decodes the response body with BOM sniffing
  /// and with malformed sequences replaced with the REPLACEMENT CHARACTER.
  /// Encoding is determined from the `charset` parameter of `Content-Type` header,
  /// and defaults to `utf-8` if not presented.
  pub fn text(&self) -> String {
    self.text_with_charset("utf-8")
  }
  /// Replace the body with `text`, encoded in the declared charset.
  pub fn set_text(&mut self, text: &str) {
    let encoded = encode_text(&self.headers, text);
    self.set_body(encoded);
  }
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Change the status, dropping the upstream's reason phrase.
  pub fn set_status_code(&mut self, status: StatusCode) {
    self.status_code = status;
    self.reason = None;
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Get the content-length of the response, if it is known.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.trim().parse().ok())
  }
  /// The parsed `Content-Type`, if any.
  pub fn content_type(&self) -> Option<Mime> {
    content_type(&self.headers)
  }
  /// Whether the `Content-Type` announces something textual (`text/*`, JSON, XML, JavaScript).
  pub fn is_text(&self) -> bool {
    self.content_type().is_some_and(|mime| {
      mime.type_() == mime::TEXT
        || mime.subtype() == mime::JSON
        || mime.subtype() == mime::XML
        || mime.subtype() == mime::JAVASCRIPT
        || mime.suffix() == Some(mime::JSON)
        || mime.suffix() == Some(mime::XML)
    })
  }
  /// The body, once it has been read from the upstream or replaced.
  ///
  /// Compressed bodies are shown decompressed.
  pub fn body(&self) -> Option<&Body> {
    self.payload.view()
  }
  /// Replace the body. Framing headers are recomputed when the response is written.
  pub fn set_body(&mut self, body: impl Into<Body>) {
    self.payload.replace(body.into());
  }
  /// Whether an interceptor replaced the body.
  pub fn is_body_modified(&self) -> bool {
    self.payload.is_modified()
  }
}

pub(crate) fn content_type(headers: &HeaderMap) -> Option<Mime> {
  headers
    .get(http::header::CONTENT_TYPE)
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.parse::<Mime>().ok())
}

fn charset(headers: &HeaderMap) -> Option<&'static Encoding> {
  content_type(headers)
    .as_ref()
    .and_then(|mime| mime.get_param("charset"))
    .and_then(|charset| Encoding::for_label(charset.as_str().as_bytes()))
}

/// 获取编码并且尝试解码
pub(crate) fn decode_text(headers: &HeaderMap, body: &[u8], default_encoding: &str) -> String {
  let default = Encoding::for_label(default_encoding.as_bytes()).unwrap_or(UTF_8);
  let declared = charset(headers).unwrap_or(default);
  for encoding in [declared, default] {
    let (text, _, is_errors) = encoding.decode(body);
    if !is_errors {
      return text.into_owned();
    }
  }
  declared.decode(body).0.into_owned()
}

pub(crate) fn encode_text(headers: &HeaderMap, text: &str) -> Vec<u8> {
  let encoding = charset(headers).unwrap_or(UTF_8);
  encoding.encode(text).0.into_owned()
}

/// Read the lines of a message head up to, not including, the blank line.
///
/// Blank lines before the first line are skipped. `Ok(None)` means the peer
/// closed the connection before sending anything.
pub(crate) async fn read_head_lines<R: AsyncBufRead + Unpin>(
  reader: &mut R,
) -> Result<Option<Vec<Vec<u8>>>> {
  let mut lines = Vec::new();
  let mut total = 0usize;
  loop {
    if total >= MAX_HEAD_SIZE {
      return Err(Error::invalid_http("message head too large"));
    }
    let mut line = Vec::new();
    let n = (&mut *reader)
      .take((MAX_HEAD_SIZE - total) as u64)
      .read_until(b'\n', &mut line)
      .await?;
    if n == 0 {
      if total == 0 {
        return Ok(None);
      }
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside message head",
      ));
    }
    total += n;
    if !line.ends_with(b"\n") {
      if total >= MAX_HEAD_SIZE {
        return Err(Error::invalid_http("message head too large"));
      }
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside message head",
      ));
    }
    if line == CR_LF || line == b"\n" {
      if lines.is_empty() {
        continue;
      }
      return Ok(Some(lines));
    }
    lines.push(line);
  }
}

pub(crate) fn parser_version(version: &[u8]) -> Result<Version> {
  Ok(match version {
    b"HTTP/0.9" => Version::HTTP_09,
    b"HTTP/1.0" => Version::HTTP_10,
    b"HTTP/1.1" => Version::HTTP_11,
    b"HTTP/2" | b"HTTP/2.0" => Version::HTTP_2,
    b"HTTP/3" | b"HTTP/3.0" => Version::HTTP_3,
    _ => {
      return Err(Error::invalid_http(format!(
        "invalid http version {:?}",
        String::from_utf8_lossy(version)
      )));
    }
  })
}

pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(http::HeaderName, http::HeaderValue)> {
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  let colon = buffer
    .iter()
    .position(|b| *b == b':')
    .ok_or_else(|| Error::invalid_http(format!("header without colon {:?}", String::from_utf8_lossy(buffer))))?;
  let (name, value) = (&buffer[..colon], &buffer[colon + 1..]);
  let value = value.trim_ascii();
  Ok((
    http::HeaderName::from_bytes(name)?,
    http::HeaderValue::from_bytes(value)?,
  ))
}

/// Read a response head from an upstream connection.
pub(crate) async fn read_response_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Response> {
  let lines = read_head_lines(reader).await?.ok_or_else(|| {
    new_io_error(
      std::io::ErrorKind::UnexpectedEof,
      "upstream closed before responding",
    )
  })?;
  let (status_line, header_lines) = lines
    .split_first()
    .ok_or_else(|| Error::invalid_http("empty response head"))?;
  let line = status_line.strip_suffix(CR_LF).unwrap_or(status_line);
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let mut parts = line.splitn(3, |b| *b == b' ');
  let version = parser_version(parts.next().unwrap_or_default())?;
  let status_code = StatusCode::from_bytes(parts.next().unwrap_or_default())
    .map_err(|_| Error::invalid_http("invalid status code"))?;
  let reason = parts
    .next()
    .map(|r| String::from_utf8_lossy(r).trim().to_string())
    .filter(|r| !r.is_empty());
  let mut headers = HeaderMap::new();
  for line in header_lines {
    let (k, v) = parser_headers(line)?;
    headers.append(k, v);
  }
  Ok(Response {
    version,
    status_code,
    reason,
    headers,
    payload: Payload::Empty,
  })
}
