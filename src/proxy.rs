//! Reverse Proxy Core
//!
//! Forwards every request that passed the access gate to the single local
//! target, counting requests and bytes on the way through.
//!
//! - **bytes in**: the request's declared `Content-Length` (the body is not
//!   read to measure it)
//! - **bytes out**: every body chunk handed to the client writer, so chunked
//!   and unknown-length responses are measured exactly
//! - **errors**: upstream connection failures, answered with `502`
//!
//! `Connection: upgrade` requests (WebSockets, dev-server hot reload) are
//! forwarded with their `Upgrade` header. On `101 Switching Protocols` both
//! connections are taken over and spliced; bytes in both directions are
//! counted as they flow.

use crate::analytics::{AnalyticsSink, PendingEvent, RequestInfo};
use crate::counters::Counters;
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    BoxError,
};
use futures_util::{Stream, TryStreamExt};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use reqwest::{redirect::Policy, Client};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

/// Connection-scoped headers that must not be forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
static CF_CONNECTING_IP: HeaderName = HeaderName::from_static("cf-connecting-ip");

/// Copy headers, dropping hop-by-hop ones (including any named in `Connection`)
fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = connection_tokens(headers).collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if HOP_BY_HOP.contains(&name_str) || listed.iter().any(|l| l == name_str) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = String> + '_ {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
}

/// The requested protocol when the client asks for a connection upgrade
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    if connection_tokens(headers).any(|t| t == "upgrade") {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

fn header_string(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Request fields for the analytics event
fn request_info(req: &Request, declared_len: Option<u64>) -> RequestInfo {
    let headers = req.headers();
    let ip = header_string(headers, &X_FORWARDED_FOR)
        .or_else(|| header_string(headers, &CF_CONNECTING_IP))
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    RequestInfo {
        ip,
        user_agent: header_string(headers, header::USER_AGENT)
            .unwrap_or_else(|| "Unknown".to_string()),
        method: req.method().to_string(),
        path: req.uri().path().to_string(),
        request_size_bytes: declared_len.unwrap_or(0),
        referer: header_string(headers, header::REFERER),
        accept_language: header_string(headers, header::ACCEPT_LANGUAGE),
    }
}

/// Wrap a body stream so every chunk written to the client is counted
pub fn counted_body<S, E>(stream: S, counters: Arc<Counters>) -> Body
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    tapped_body(stream, counters, None)
}

fn tapped_body<S, E>(stream: S, counters: Arc<Counters>, mut pending: Option<PendingEvent>) -> Body
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    Body::from_stream(stream.inspect_ok(move |chunk| {
        let n = chunk.len() as u64;
        counters.add_bytes_out(n);
        if let Some(pending) = pending.as_mut() {
            pending.add_response_bytes(n);
        }
    }))
}

/// Client side of an upgraded connection, counted as it flows
struct MeteredIo<T> {
    inner: T,
    counters: Arc<Counters>,
    written: u64,
}

impl<T: AsyncRead + Unpin> AsyncRead for MeteredIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            this.counters
                .add_bytes_in((buf.filled().len() - before) as u64);
        }
        poll
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for MeteredIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            this.counters.add_bytes_out(n as u64);
            this.written += n as u64;
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Join an upgraded client connection with the upgraded upstream one
async fn splice(
    on_upgrade: OnUpgrade,
    upstream: reqwest::Response,
    counters: Arc<Counters>,
    mut pending: Option<PendingEvent>,
) {
    let mut upstream_io = match upstream.upgrade().await {
        Ok(io) => io,
        Err(e) => {
            counters.record_error();
            warn!("Upstream upgrade failed: {}", e);
            return;
        }
    };

    let client_io = match on_upgrade.await {
        Ok(io) => io,
        Err(e) => {
            warn!("Client upgrade failed: {}", e);
            return;
        }
    };

    let mut client_io = MeteredIo {
        inner: TokioIo::new(client_io),
        counters,
        written: 0,
    };

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
        Ok((from_client, from_upstream)) => {
            debug!(
                "Upgraded connection closed ({} bytes in, {} bytes out)",
                from_client, from_upstream
            );
        }
        Err(e) => debug!("Upgraded connection ended: {}", e),
    }

    if let Some(pending) = pending.as_mut() {
        pending.add_response_bytes(client_io.written);
    }
}

/// Single-upstream reverse proxy
pub struct ReverseProxy {
    client: Client,
    target: String,
    counters: Arc<Counters>,
    analytics: Option<AnalyticsSink>,
}

impl ReverseProxy {
    /// Create a proxy to `target` (e.g. `http://localhost:3000`)
    pub fn new(target: impl Into<String>, counters: Arc<Counters>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().redirect(Policy::none()).build()?;

        Ok(Self {
            client,
            target: target.into().trim_end_matches('/').to_string(),
            counters,
            analytics: None,
        })
    }

    /// Emit one analytics event per forwarded request
    pub fn with_analytics(mut self, sink: AnalyticsSink) -> Self {
        self.analytics = Some(sink);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Forward one request and relay the response
    pub async fn forward(&self, mut req: Request) -> Response {
        let declared_len = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        self.counters.record_request(declared_len);

        let mut pending = self
            .analytics
            .as_ref()
            .map(|sink| sink.begin(request_info(&req, declared_len)));

        let method = req.method().clone();
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        // Only upgrade when the server connection can be taken over
        let upgrade = upgrade_protocol(req.headers()).and_then(|protocol| {
            req.extensions_mut()
                .remove::<OnUpgrade>()
                .map(|on_upgrade| (protocol, on_upgrade))
        });

        let protocol = upgrade.as_ref().map(|(protocol, _)| protocol.clone());
        match self.send_upstream(req, &path, protocol).await {
            Ok(upstream) => {
                let status = upstream.status();
                debug!("{} {} -> {}", method, path, status);
                if let Some(pending) = pending.as_mut() {
                    pending.set_status(status.as_u16());
                }

                match upgrade {
                    Some((_, on_upgrade)) if status == StatusCode::SWITCHING_PROTOCOLS => {
                        self.switch_protocols(upstream, on_upgrade, pending)
                    }
                    _ => self.relay(upstream, pending),
                }
            }
            Err(e) => {
                self.counters.record_error();
                if let Some(pending) = pending.as_mut() {
                    pending.set_status(StatusCode::BAD_GATEWAY.as_u16());
                }
                warn!("Upstream request {} {} failed: {}", method, path, e);
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }

    async fn send_upstream(
        &self,
        req: Request,
        path: &str,
        upgrade: Option<HeaderValue>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let (parts, body) = req.into_parts();

        let mut headers = forwardable_headers(&parts.headers);
        headers.remove(header::HOST);

        if let Some(protocol) = upgrade {
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, protocol);
        }

        if let Some(host) = parts.headers.get(header::HOST) {
            headers.insert(X_FORWARDED_HOST.clone(), host.clone());
        }

        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            let client_ip = addr.ip().to_string();
            let forwarded = match parts
                .headers
                .get(&X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
            {
                Some(prior) => format!("{}, {}", prior, client_ip),
                None => client_ip,
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert(X_FORWARDED_FOR.clone(), value);
            }
        }

        headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static("http"));

        let has_body = parts.headers.contains_key(header::CONTENT_LENGTH)
            || parts.headers.contains_key(header::TRANSFER_ENCODING);

        let mut request = self
            .client
            .request(parts.method, format!("{}{}", self.target, path))
            .headers(headers);

        if has_body {
            request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        request.send().await
    }

    fn relay(&self, upstream: reqwest::Response, pending: Option<PendingEvent>) -> Response {
        let status = upstream.status();
        let headers = forwardable_headers(upstream.headers());

        let mut response = Response::new(tapped_body(
            upstream.bytes_stream(),
            self.counters.clone(),
            pending,
        ));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }

    /// Answer `101` and hand both connections to a splice task
    fn switch_protocols(
        &self,
        upstream: reqwest::Response,
        on_upgrade: OnUpgrade,
        pending: Option<PendingEvent>,
    ) -> Response {
        let mut headers = forwardable_headers(upstream.headers());
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        if let Some(protocol) = upstream.headers().get(header::UPGRADE) {
            headers.insert(header::UPGRADE, protocol.clone());
        }

        tokio::spawn(splice(on_upgrade, upstream, self.counters.clone(), pending));

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *response.headers_mut() = headers;
        response
    }
}

/// Router fallback: everything goes upstream
pub async fn proxy_handler(State(proxy): State<Arc<ReverseProxy>>, req: Request) -> Response {
    proxy.forward(req).await
}
