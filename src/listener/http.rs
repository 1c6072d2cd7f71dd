//! HTTP and HTTPS capture listener

use async_trait::async_trait;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_native_tls::TlsAcceptor;
use tracing::{debug, info};

use super::{Capture, CaptureContext, Listener};
use crate::error::{Result, VigilError};
use crate::models::{HttpRequest, HttpResponse, ParsedProbe, Probe, ProbeResponse, Protocol};

/// HTTP on a TCP port, optionally behind TLS
pub struct HttpListener {
    listener: TcpListener,
    addr: SocketAddr,
    ctx: Arc<CaptureContext>,
    tls: Option<TlsAcceptor>,
}

impl HttpListener {
    pub async fn bind(
        addr: SocketAddr,
        ctx: Arc<CaptureContext>,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            VigilError::ListenerError(format!("cannot bind HTTP on {addr}: {e}"))
        })?;
        Self::from_listener(listener, ctx, tls)
    }

    pub fn from_listener(
        listener: TcpListener,
        ctx: Arc<CaptureContext>,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self> {
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            ctx,
            tls,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Listener for HttpListener {
    fn name(&self) -> String {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        format!("{}://{}", scheme, self.addr)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn run(&self) -> Result<()> {
        info!("HTTP listening on {}", self.name());

        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    debug!("HTTP accept error: {}", e);
                    continue;
                }
            };
            let Some(permit) = self.ctx.limiter.try_acquire(remote.ip()) else {
                continue;
            };

            let ctx = Arc::clone(&self.ctx);
            let tls = self.tls.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let max_session = ctx.limits.max_session;
                match timeout(max_session, accept_connection(stream, remote, ctx, tls)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("HTTP connection from {} failed: {}", remote, e),
                    Err(_) => debug!("HTTP connection from {} hit the session cap", remote),
                }
            });
        }
    }
}

async fn accept_connection(
    stream: TcpStream,
    remote: SocketAddr,
    ctx: Arc<CaptureContext>,
    tls: Option<TlsAcceptor>,
) -> Result<()> {
    match tls {
        Some(acceptor) => {
            let stream = timeout(ctx.limits.idle_timeout, acceptor.accept(stream))
                .await
                .map_err(|_| VigilError::ListenerError("TLS handshake timed out".into()))??;
            serve_connection(TokioIo::new(stream), remote, ctx, true).await;
        }
        None => serve_connection(TokioIo::new(stream), remote, ctx, false).await,
    }
    Ok(())
}

async fn serve_connection<I>(io: I, remote: SocketAddr, ctx: Arc<CaptureContext>, tls: bool)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let idle = ctx.limits.idle_timeout;
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { Ok::<_, Infallible>(handle_request(req, remote, ctx, tls).await) }
    });

    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new()).header_read_timeout(idle);
    if let Err(e) = builder.serve_connection(io, service).await {
        debug!("HTTP connection from {} closed: {}", remote, e);
    }
}

/// Routes, answers and schedules recording of one request
pub async fn handle_request(
    req: Request<Incoming>,
    remote: SocketAddr,
    ctx: Arc<CaptureContext>,
    tls: bool,
) -> Response<Full<Bytes>> {
    let Some(host) = request_host(&req) else {
        return plain(StatusCode::BAD_REQUEST, "Bad Request");
    };
    let Some(zone) = ctx.resolve(&host) else {
        debug!("HTTP request for unknown host {} from {}", host, remote);
        return plain(StatusCode::NOT_FOUND, "Not Found");
    };

    let (parts, body) = req.into_parts();
    let limited = Limited::new(body, ctx.limits.max_http_body_bytes);
    let body = match timeout(ctx.limits.idle_timeout, limited.collect()).await {
        Err(_) => return plain(StatusCode::REQUEST_TIMEOUT, "Request Timeout"),
        Ok(Ok(collected)) => collected.to_bytes(),
        Ok(Err(e)) if e.is::<http_body_util::LengthLimitError>() => {
            debug!("HTTP body from {} over limit", remote);
            return plain(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large");
        }
        Ok(Err(e)) => {
            debug!("HTTP body from {} unreadable: {}", remote, e);
            return plain(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    let request = HttpRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        version: format!("{:?}", parts.version),
        headers: parts
            .headers
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body: String::from_utf8_lossy(&body).into_owned(),
        tls,
    };
    debug!(
        "HTTP {} {} from {} (zone {})",
        request.method, request.path, remote, zone.zone.fqdn
    );

    let probe = ParsedProbe::new(host, remote, Probe::Http(request));
    let default = ProbeResponse::Http(HttpResponse::default());
    let (response, matched) = ctx.respond(&zone, &probe.payload, default);
    let reply = match &response {
        ProbeResponse::Http(http) => to_hyper(http),
        _ => plain(StatusCode::OK, ""),
    };

    let capture = Capture {
        zone,
        probe,
        response,
        matched,
    };
    tokio::spawn(async move {
        ctx.record(capture).await;
    });

    reply
}

fn request_host(req: &Request<Incoming>) -> Option<String> {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;
    let host = strip_port(raw.trim()).trim_end_matches('.');
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

/// Drops a trailing `:port`, unwrapping bracketed IPv6 literals
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or_default();
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn to_hyper(response: &HttpResponse) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => debug!("Skipping unencodable header {}", name),
        }
    }
    builder
        .body(Full::new(Bytes::from(response.body.clone())))
        .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, ""))
}

fn plain(status: StatusCode, text: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(text.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("alice.ssrf.uk:8080"), "alice.ssrf.uk");
        assert_eq!(strip_port("alice.ssrf.uk"), "alice.ssrf.uk");
        assert_eq!(strip_port("[::1]:80"), "::1");
        assert_eq!(strip_port("host:"), "host:");
    }

    #[test]
    fn test_rule_headers_applied() {
        let response = HttpResponse {
            status: 302,
            headers: vec![
                ("Location".into(), "http://example.net/".into()),
                ("bad header".into(), "x".into()),
            ],
            body: String::new(),
        };
        let hyper_response = to_hyper(&response);
        assert_eq!(hyper_response.status(), StatusCode::FOUND);
        assert_eq!(
            hyper_response.headers().get("location").unwrap(),
            "http://example.net/"
        );
        assert_eq!(hyper_response.headers().len(), 1);
    }
}
