//! Intercepting MITM proxy example
//!
//! Blocks google.com, redirects wikipedia.org and peeks at HTML pages.
//!
//! To run:
//! ```bash
//! cargo run --example intercept [config.toml]
//! ```
//!
//! Then configure your browser to use the proxy at 127.0.0.1:8000 and
//! install the CA certificate from .catapult/ca_cert.pem

use async_trait::async_trait;
use catapult::tls::{CertificateValidation, ClientCertificateRequest, Identity};
use catapult::{
  InterceptorHandler, Method, MitmConfig, ProxyServer, Request, RequestInterceptor,
  ResponseInterceptor, Session, StatusCode,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

struct Demo;

#[async_trait]
impl RequestInterceptor for Demo {
  async fn on_request(&self, session: &mut Session) -> catapult::Result<()> {
    let url = session.request().uri().to_string();
    println!("{url}");
    let method = session.request().method().clone();
    if method == Method::POST || method == Method::PUT || method == Method::PATCH {
      let body = session.request_body().await?;
      session.set_request_body(body);
      let text = session.request_body_text().await?;
      session.set_request_body_text(&text);
      // keep the request around for the response hook
      let request: Request = session.request().clone();
      session.set_user_data(request);
    }
    if url.contains("google.com") {
      session.ok(
        "<!DOCTYPE html><html><body><h1>Website Blocked</h1>\
         <p>Blocked by catapult.</p></body></html>",
      );
    } else if url.contains("wikipedia.org") {
      session.redirect("https://www.paypal.com")?;
    }
    Ok(())
  }
}

#[async_trait]
impl ResponseInterceptor for Demo {
  async fn on_response(&self, session: &mut Session) -> catapult::Result<()> {
    let method = session.request().method().clone();
    let is_html = session.response().is_some_and(|response| {
      response.status_code() == StatusCode::OK
        && response
          .content_type()
          .is_some_and(|mime| mime.essence_str() == "text/html")
    });
    if (method == Method::GET || method == Method::POST) && is_html {
      let body = session.response_body().await?;
      session.set_response_body(body)?;
      let text = session.response_body_text().await?;
      session.set_response_body_text(&text)?;
    }
    if let Some(request) = session.user_data::<Request>() {
      println!("response for {} {}", request.method(), request.uri());
    }
    Ok(())
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = match std::env::args().nth(1) {
    Some(path) => MitmConfig::from_file(path)?,
    None => MitmConfig::default(),
  };

  let demo = Arc::new(Demo);
  let mut handler = InterceptorHandler::new();
  handler.add_request_interceptor(demo.clone());
  handler.add_response_interceptor(demo);
  handler.set_certificate_validator(Arc::new(|validation: &CertificateValidation<'_>| {
    validation.policy_errors.is_empty()
  }));
  handler.set_client_certificate_selector(Arc::new(
    |_request: &ClientCertificateRequest<'_>| -> Option<Identity> { None },
  ));

  let server = ProxyServer::builder()
    .config(config)
    .interceptor_handler(handler)
    .build_async()
    .await?;
  println!("CA certificate: {}", server.certificate_manager().ca_cert_path().display());
  let proxy = server.start().await?;
  for addr in proxy.local_addrs() {
    println!("Listening on {addr}");
  }

  tokio::signal::ctrl_c().await?;
  proxy.stop().await;
  Ok(())
}
