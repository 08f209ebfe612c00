//! HTTP proxy request handling (components E and F): per-request admission
//! and auth checks, hop-by-hop header stripping, and bridging client traffic
//! through whichever tunnel the selector raced and won.

use std::convert::Infallible;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::header::HeaderName;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::OwnedSemaphorePermit;

use crate::admission::AdmissionGate;
use crate::error::GatewayError;
use crate::selector::Selector;

/// Hop-by-hop headers stripped before forwarding, including the
/// non-standard `Proxy-Connection` that libcurl and friends still send.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Where a request without an absolute URI gets redirected, mirroring the
/// original gateway's redirect to its own project page.
const REDIRECT_TARGET: &str = "https://github.com/havuz";

type ProxyBody = BoxBody<Bytes, Infallible>;

/// Serves one user's proxy: the admission gate and signer/roster selector are
/// fixed for the process lifetime, matching one `Server::run` per license.
pub struct ProxyHandler {
    admission: AdmissionGate,
    selector: Arc<Selector>,
    auth: Option<String>,
}

impl ProxyHandler {
    pub fn new(admission: AdmissionGate, selector: Arc<Selector>, auth: Option<String>) -> Self {
        Self {
            admission,
            selector,
            auth,
        }
    }

    /// Bind `addr` and serve connections until the listener errors out.
    pub async fn serve(self: Arc<Self>, addr: &str) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(addr).await?;
        info!("proxy gateway is now listening on {addr}");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };

            let io = TokioIo::new(stream);
            let handler = Arc::clone(&self);

            tokio::spawn(async move {
                debug!("connection from {peer}");

                let service = service_fn(move |req| {
                    let handler = Arc::clone(&handler);
                    async move { handler.handle(req).await }
                });

                if let Err(e) = server_http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    debug!("connection error with {peer}: {e}");
                }
            });
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, Infallible> {
        if req.uri().authority().is_none() {
            return Ok(redirect_response());
        }

        if let Some(expected) = &self.auth {
            if !proxy_auth_matches(&req, expected) {
                return Ok(status_response(
                    StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                    "Proxy Authentication Required",
                ));
            }
        }

        let permit = self.admission.acquire().await;

        let host = req.uri().host().unwrap_or_default().to_string();
        let default_port = if req.method() == Method::CONNECT { 443 } else { 80 };
        let port = req.uri().port_u16().unwrap_or(default_port);

        if req.method() == Method::CONNECT {
            Ok(self.handle_connect(req, host, port, permit))
        } else {
            Ok(self.handle_forward(req, host, port, permit).await)
        }
    }

    /// Acknowledge the `CONNECT` and hand the upgraded connection off to a
    /// background task that bridges it to the tunnel; the admission permit
    /// rides along so the slot stays held for the tunnel's whole lifetime.
    fn handle_connect(
        &self,
        req: Request<Incoming>,
        host: String,
        port: u16,
        permit: OwnedSemaphorePermit,
    ) -> Response<ProxyBody> {
        let selector = Arc::clone(&self.selector);

        tokio::spawn(async move {
            let _permit = permit;

            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    error!("CONNECT {host}:{port}: upgrade failed: {e}");
                    return;
                }
            };
            let mut client_stream = TokioIo::new(upgraded);

            let mut tunnel_stream = match selector.dial(&host, port).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("CONNECT {host}:{port}: no tunnel available: {e}");
                    return;
                }
            };

            match tokio::io::copy_bidirectional(&mut client_stream, &mut tunnel_stream).await {
                Ok((to_tunnel, to_client)) => {
                    debug!(
                        "CONNECT {host}:{port} closed: {to_tunnel} bytes out, {to_client} bytes in"
                    );
                }
                Err(e) => debug!("CONNECT {host}:{port} bridge error: {e}"),
            }
        });

        // No headers beyond the status line: a successful response to a
        // CONNECT request carries no Content-Length/Transfer-Encoding
        // framing, so this is exactly "HTTP/1.1 200 OK\r\n\r\n" on the wire,
        // same as a literal hijacked-socket write (see DESIGN.md).
        status_response(StatusCode::OK, "")
    }

    /// Forward a plain HTTP request through the tunnel and relay the
    /// response back as an ordinary hyper response (no socket hijack needed,
    /// since nothing here crosses a protocol boundary the way `CONNECT` does).
    async fn handle_forward(
        &self,
        mut req: Request<Incoming>,
        host: String,
        port: u16,
        _permit: OwnedSemaphorePermit,
    ) -> Response<ProxyBody> {
        strip_hop_by_hop(req.headers_mut());

        let tunnel_stream = match self.selector.dial(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("{} {}: no tunnel available: {e}", req.method(), req.uri());
                return status_response(StatusCode::BAD_GATEWAY, "no tunnel available");
            }
        };

        let io = TokioIo::new(tunnel_stream);
        let (mut sender, conn) = match client_http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                error!("{host}:{port}: tunnel handshake failed: {e}");
                return status_response(StatusCode::BAD_GATEWAY, "tunnel handshake failed");
            }
        };

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("tunnel connection to {host}:{port} closed: {e}");
            }
        });

        match sender.send_request(req).await {
            Ok(upstream_resp) => into_proxy_response(upstream_resp),
            Err(e) => {
                error!("upstream request failed: {e}");
                status_response(StatusCode::BAD_GATEWAY, "upstream request failed")
            }
        }
    }
}

fn proxy_auth_matches(req: &Request<Incoming>, expected: &str) -> bool {
    let Some(header) = req
        .headers()
        .get("proxy-authorization")
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };

    match parse_basic_auth(header) {
        Some(credentials) => credentials == expected,
        None => false,
    }
}

/// Decode a `Basic` `Proxy-Authorization` header into a `user:pass` string.
fn parse_basic_auth(header: &str) -> Option<String> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    String::from_utf8(decoded).ok()
}

fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    for name in HOP_BY_HOP {
        if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(name);
        }
    }
}

fn into_proxy_response(resp: Response<Incoming>) -> Response<ProxyBody> {
    let (mut parts, body) = resp.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Response::from_parts(parts, body.boxed())
}

fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(full_body(Bytes::copy_from_slice(message.as_bytes())))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn redirect_response() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header("Location", REDIRECT_TARGET)
        .body(empty_body())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|_| unreachable!()).boxed()
}

fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|_| unreachable!()).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_basic_auth() {
        let encoded = BASE64.encode(b"alice:s3cret");
        let header = format!("Basic {encoded}");
        assert_eq!(parse_basic_auth(&header), Some("alice:s3cret".to_string()));
    }

    #[test]
    fn rejects_missing_basic_prefix() {
        assert_eq!(parse_basic_auth("Bearer abc"), None);
    }

    #[test]
    fn rejects_non_base64_payload() {
        assert_eq!(parse_basic_auth("Basic not-base64!!"), None);
    }

    #[test]
    fn strip_hop_by_hop_removes_every_listed_header() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("Connection", "keep-alive".parse().unwrap());
        headers.insert("Proxy-Authorization", "Basic xyz".parse().unwrap());
        headers.insert("Content-Type", "text/plain".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("proxy-authorization").is_none());
        assert!(headers.get("content-type").is_some());
    }
}
