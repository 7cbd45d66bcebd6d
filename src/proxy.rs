// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Intercepting forward proxy. Every request becomes a [`Flow`] that passes
//! through the orchestrator hooks on its way upstream and back.

use crate::ca::CertificateAuthority;
use crate::capture::{CaptureRecord, CaptureWriter};
use crate::config::Config;
use crate::connector::{build_client, HttpsClient};
use crate::flow::{Flow, ResponseInfo};
use crate::orchestrator::Orchestrator;
use crate::registry::DedupRegistry;
use crate::replay::{run_replay_worker, FlowExecutor, ReplayHandle};

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, CONNECTION, HOST};
use hyper::upgrade::Upgraded;
use hyper::{service::service_fn, Method, Request, Response, Uri};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as AutoConnBuilder;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<BoxBody<Bytes, Infallible>>, Infallible>> + Send>>;

const CERT_PATH: &str = "/_jswzl/cert";

// RFC 7230 Section 6.1: Hop-by-hop headers must not be forwarded by proxies.
static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug)]
struct AlwaysResolves(Arc<CertifiedKey>);

impl ResolvesServerCert for AlwaysResolves {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

struct Shared {
    client: HttpsClient,
    cfg: Arc<Config>,
    ca: Option<Arc<CertificateAuthority>>,
    orchestrator: Arc<Orchestrator>,
    captures: Option<CaptureWriter>,
}

impl Shared {
    /// Wire the orchestrator to a replay worker executing through this proxy.
    fn start(
        cfg: Arc<Config>,
        ca: Option<Arc<CertificateAuthority>>,
        captures: Option<CaptureWriter>,
    ) -> anyhow::Result<Arc<Self>> {
        let (replays, rx) = ReplayHandle::channel(captures.clone());
        let orchestrator =
            Orchestrator::new(&cfg.enrich, Arc::new(replays), Arc::new(DedupRegistry::new()))?;
        let shared = Arc::new(Self {
            client: build_client(),
            cfg,
            ca,
            orchestrator: Arc::new(orchestrator),
            captures,
        });
        tokio::spawn(run_replay_worker(shared.clone(), rx));
        Ok(shared)
    }

    /// Apply live rewrites to the outgoing request. The orchestrator's
    /// snapshot was taken before this and is unaffected.
    fn rewrite_request(&self, flow: &mut Flow) {
        let headers = &mut flow.request.headers;
        for name in &self.cfg.tls.suppress_headers {
            headers.remove(name.as_str());
        }
        strip_hop_by_hop(headers);
        if self.cfg.general.anticomp {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        }
    }

    async fn send_upstream(&self, flow: &Flow) -> anyhow::Result<ResponseInfo> {
        let mut builder = Request::builder()
            .method(flow.request.method.clone())
            .uri(flow.request.uri.clone());
        for (name, value) in flow.request.headers.iter() {
            builder = builder.header(name, value);
        }
        let upstream_req = builder.body(Full::new(flow.request.body.clone()))?;

        let resp = self.client.request(upstream_req).await?;
        let status = resp.status().as_u16();
        let version = resp.version();
        let headers = resp.headers().clone();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| anyhow::anyhow!("upstream body collect error: {}", e))?
            .to_bytes();

        let mut info = ResponseInfo::new(status, headers, body);
        info.version = version;
        Ok(info)
    }

    /// Rewrite, forward and record the outcome on the flow.
    async fn forward(&self, flow: &mut Flow) {
        self.rewrite_request(flow);
        match self.send_upstream(flow).await {
            Ok(resp) => flow.response = Some(resp),
            Err(e) => {
                debug!(url = %flow.request.uri, %e, "upstream request failed");
                flow.error = Some(e.to_string());
            }
        }
    }

    /// Deliver the response or error hook, then record the flow.
    async fn complete(&self, flow: &mut Flow, started: Instant) {
        if flow.response.is_some() {
            // Enrichment is detached; the handle is not awaited.
            let _ = self.orchestrator.on_response(flow);
        } else {
            self.orchestrator.on_error(flow);
        }
        self.record(flow, started.elapsed().as_millis() as u64).await;
    }

    async fn record(&self, flow: &Flow, duration_ms: u64) {
        let Some(captures) = &self.captures else {
            return;
        };
        if let Err(e) = captures
            .write_record(&CaptureRecord::completed(flow, duration_ms))
            .await
        {
            warn!(%e, "failed to write capture");
        }
    }
}

impl FlowExecutor for Shared {
    async fn execute(&self, mut flow: Flow) {
        let started = Instant::now();
        self.orchestrator.on_request_headers(&mut flow);
        self.orchestrator.on_request(&mut flow);
        self.forward(&mut flow).await;
        self.complete(&mut flow, started).await;
    }

    async fn fail(&self, mut flow: Flow, reason: &str) {
        debug!(flow = %flow.id, %reason, "replayed flow failed");
        self.orchestrator.on_error(&mut flow);
        self.record(&flow, 0).await;
    }
}

pub async fn run_proxy(
    listen: SocketAddr,
    cfg: Arc<Config>,
    captures: Option<CaptureWriter>,
) -> anyhow::Result<()> {
    run_proxy_with_limit(listen, cfg, captures, None).await
}

/// Testable variant of `run_proxy` that accepts an optional `accept_limit`.
/// When `accept_limit` is `Some(n)`, the accept loop returns after accepting
/// the Nth connection. Connection handlers are spawned and may still be
/// running when this function returns.
pub async fn run_proxy_with_limit(
    listen: SocketAddr,
    cfg: Arc<Config>,
    captures: Option<CaptureWriter>,
    accept_limit: Option<usize>,
) -> anyhow::Result<()> {
    let ca = if cfg.tls.enabled {
        Some(
            CertificateAuthority::load_or_generate(
                std::path::Path::new(cfg.tls.cert_path()),
                std::path::Path::new(cfg.tls.key_path()),
            )
            .await?,
        )
    } else {
        None
    };

    let shared = Shared::start(cfg, ca, captures)?;
    info!(api = %shared.cfg.enrich.api_url, "enrichment enabled");

    // Manual accept loop to keep the remote address.
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(%listen, "listening");

    let server_builder = AutoConnBuilder::new(TokioExecutor::new());

    let mut remaining = accept_limit;
    loop {
        if let Some(0) = remaining {
            break;
        }

        let (stream, remote_addr) = listener.accept().await?;

        if let Some(ref mut n) = remaining {
            *n -= 1;
        }

        let shared = shared.clone();
        let builder = server_builder.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let shared = shared.clone();
                let fut: ServiceFuture = Box::pin(async move {
                    handle_request(req, shared, remote_addr, hyper::http::uri::Scheme::HTTP).await
                });
                fut
            });

            if let Err(e) = builder
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                error!(%e, "connection error");
            }
        });
    }

    Ok(())
}

fn text_response(status: u16, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, Infallible>> {
    let body: Bytes = body.into();
    Response::builder()
        .status(status)
        .body(Full::new(body.clone()).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(body).boxed()))
}

async fn handle_request<B>(
    req: Request<B>,
    shared: Arc<Shared>,
    client_addr: SocketAddr,
    scheme: hyper::http::uri::Scheme,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() == Method::CONNECT {
        if shared.ca.is_none() {
            return Ok(text_response(405, "CONNECT not supported (TLS disabled)"));
        }
        let uri = req.uri().clone();
        tokio::task::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(e) = handle_connect(upgraded, uri, shared, client_addr).await {
                        error!(%e, "connect error");
                    }
                }
                Err(e) => error!(%uri, %e, "upgrade error"),
            }
        });
        return Ok(Response::new(Full::new(Bytes::new()).boxed()));
    }

    if req.uri().path() == CERT_PATH && req.method() == Method::GET {
        let Some(ca) = &shared.ca else {
            return Ok(text_response(404, "TLS not enabled"));
        };
        let pem = Bytes::from(ca.cert_pem().to_string());
        return Ok(Response::builder()
            .header("Content-Type", "application/x-x509-ca-cert")
            .header(
                "Content-Disposition",
                "attachment; filename=\"jswzl-proxy-ca.crt\"",
            )
            .body(Full::new(pem.clone()).boxed())
            .unwrap_or_else(|_| Response::new(Full::new(pem).boxed())));
    }

    handle_http_logic(req, shared, client_addr, scheme).await
}

async fn handle_inner_request<B>(
    req: Request<B>,
    shared: Arc<Shared>,
    client_addr: SocketAddr,
    scheme: hyper::http::uri::Scheme,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() == Method::CONNECT {
        return Ok(text_response(405, "Nested CONNECT not supported"));
    }
    handle_http_logic(req, shared, client_addr, scheme).await
}

/// Absolute request URI. Origin-form targets are completed from `Host`.
fn absolute_uri<B>(req: &Request<B>, scheme: &hyper::http::uri::Scheme) -> Uri {
    if req.uri().scheme().is_some() {
        return req.uri().clone();
    }
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{}://{}{}", scheme, host, path)
        .parse::<Uri>()
        .unwrap_or_else(|_| Uri::from_static("http://localhost/"))
}

async fn handle_http_logic<B>(
    req: Request<B>,
    shared: Arc<Shared>,
    client_addr: SocketAddr,
    scheme: hyper::http::uri::Scheme,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let started = Instant::now();
    let uri = absolute_uri(&req, &scheme);
    let (parts, body) = req.into_parts();

    let mut flow = Flow::new(parts.method, uri);
    flow.client_addr = Some(client_addr);
    flow.request.version = parts.version;
    flow.request.headers = parts.headers;
    shared.orchestrator.on_request_headers(&mut flow);

    flow.request.body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let boxed: Box<dyn std::error::Error + Send + Sync> = e.into();
            error!(url = %flow.request.uri, %boxed, "failed to collect request body");
            flow.error = Some(format!("request body collect error: {}", boxed));
            shared.orchestrator.on_error(&mut flow);
            shared
                .record(&flow, started.elapsed().as_millis() as u64)
                .await;
            return Ok(text_response(500, "request body collect error"));
        }
    };
    shared.orchestrator.on_request(&mut flow);

    shared.forward(&mut flow).await;
    shared.complete(&mut flow, started).await;

    Ok(client_response(&flow))
}

/// Response relayed to the client, minus hop-by-hop headers.
fn client_response(flow: &Flow) -> Response<BoxBody<Bytes, Infallible>> {
    let Some(upstream) = &flow.response else {
        let reason = flow.error.as_deref().unwrap_or("no response");
        return text_response(502, format!("upstream error: {}", reason));
    };

    let connection_tokens = parse_connection_tokens(upstream.headers.get(CONNECTION));
    let mut builder = Response::builder().status(upstream.status);
    for (name, value) in upstream.headers.iter() {
        if is_hop_by_hop_header(name.as_str(), &connection_tokens) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(upstream.body.clone()).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(upstream.body.clone()).boxed()))
}

// Parse a Connection header value into a lowercased set of tokens
fn parse_connection_tokens(val: Option<&HeaderValue>) -> HashSet<String> {
    let mut set = HashSet::new();
    if let Some(conn_str) = val.and_then(|v| v.to_str().ok()) {
        for token in conn_str.split(',') {
            let trimmed = token.trim().to_ascii_lowercase();
            if !trimmed.is_empty() {
                set.insert(trimmed);
            }
        }
    }
    set
}

fn is_hop_by_hop_header(name: &str, connection_tokens: &HashSet<String>) -> bool {
    connection_tokens.contains(name) || HOP_BY_HOP_HEADERS.contains(&name)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_tokens = parse_connection_tokens(headers.get(CONNECTION));
    let doomed: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str(), &connection_tokens))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(&name);
    }
}

async fn handle_connect(
    client_conn: Upgraded,
    uri: Uri,
    shared: Arc<Shared>,
    client_addr: SocketAddr,
) -> anyhow::Result<()> {
    let host = uri.host().unwrap_or("unknown");

    if shared
        .cfg
        .tls
        .passthrough_domains
        .iter()
        .any(|d| host.ends_with(d.as_str()))
    {
        info!(%host, "tunneling connection (passthrough)");
        if let Err(e) = tunnel(client_conn, host, uri.port_u16().unwrap_or(443)).await {
            error!(%host, %e, "tunnel error");
        }
        return Ok(());
    }

    let Some(ca) = shared.ca.as_ref() else {
        error!("CONNECT handled without a CA");
        return Ok(());
    };
    let cert = ca.leaf_for(host)?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(AlwaysResolves(cert)));
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
    let stream = acceptor.accept(TokioIo::new(client_conn)).await?;

    let service = service_fn(move |req: Request<Incoming>| {
        let shared = shared.clone();
        let fut: ServiceFuture = Box::pin(async move {
            handle_inner_request(req, shared, client_addr, hyper::http::uri::Scheme::HTTPS).await
        });
        fut
    });

    let builder = AutoConnBuilder::new(TokioExecutor::new());
    if let Err(e) = builder
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        error!(%e, "TLS connection error");
    }

    Ok(())
}

async fn tunnel(upgraded: Upgraded, host: &str, port: u16) -> std::io::Result<()> {
    tunnel_with_io(TokioIo::new(upgraded), host, port).await
}

async fn tunnel_with_io<S>(mut upgraded_io: S, host: &str, port: u16) -> std::io::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    trace!(%host, port, "tunnel: connecting");
    let mut server = tokio::net::TcpStream::connect((host, port)).await?;
    let (n1, n2) = tokio::io::copy_bidirectional(&mut upgraded_io, &mut server).await?;
    trace!(%host, up = n1, down = n2, "tunnel: closed");
    Ok(())
}
