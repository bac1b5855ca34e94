//! Proxy server implementation
//! Routes each request by host to its backend, with optional rule screening

use crate::access_log::{AccessLog, LogEntry};
use crate::config::PipelineConfig;
use crate::route::{Backend, RouteError, Router};
use crate::waf::{RuleEngine, Verdict};
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::http::request::Parts;
use hyper::http::uri::Authority;
use hyper::client::conn::http1::SendRequest;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Connection-scoped headers that are never relayed
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Failure talking to the resolved backend; always answered with 502
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: std::io::Error },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid TLS server name '{0}'")]
    ServerName(String),

    #[error("TLS handshake with backend failed: {0}")]
    Tls(std::io::Error),

    #[error("HTTP exchange with backend failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("failed to build backend request: {0}")]
    Build(#[from] hyper::http::Error),

    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Per-request pipeline: rule check, resolve, forward, relay
pub struct Pipeline {
    router: Arc<dyn Router>,
    rules: Option<Arc<RuleEngine>>,
    access_log: Option<Arc<AccessLog>>,
    config: PipelineConfig,
    tls: TlsConnector,
}

impl Pipeline {
    pub fn new(router: Arc<dyn Router>, config: PipelineConfig) -> Result<Self, rustls::Error> {
        Ok(Self {
            router,
            rules: None,
            access_log: None,
            config,
            tls: crate::tls::backend_connector()?,
        })
    }

    pub fn with_rules(mut self, rules: RuleEngine) -> Self {
        self.rules = Some(Arc::new(rules));
        self
    }

    pub fn with_access_log(mut self, log: AccessLog) -> Self {
        self.access_log = Some(Arc::new(log));
        self
    }

    /// Run one request through the pipeline. Never fails: every error becomes a response
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        remote_addr: SocketAddr,
        is_https: bool,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let host = match request_host(&req) {
            Some(h) => h,
            None => return text_response(StatusCode::BAD_REQUEST, "Missing Host header"),
        };

        if self.config.debug {
            info!(
                host = %host,
                method = %req.method(),
                path = %req.uri().path(),
                "Routing request"
            );
        }

        let (parts, body) = req.into_parts();

        // Buffer the body only when something has to read it; it is replayed to the backend
        let inspect = carries_body(&parts.method)
            && (self.rules.is_some() || self.access_log.is_some());
        let (body, snapshot): (ProxyBody, Option<Bytes>) = if inspect {
            match Limited::new(body, self.config.max_body_bytes).collect().await {
                Ok(collected) => {
                    let bytes = collected.to_bytes();
                    (full_body(bytes.clone()), Some(bytes))
                }
                Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                    return text_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
                }
                Err(e) => {
                    debug!("Failed to read request body from {}: {}", remote_addr, e);
                    return text_response(StatusCode::BAD_REQUEST, "Failed to read request body");
                }
            }
        } else {
            (body.map_err(Into::into).boxed_unsync(), None)
        };

        if let Some(rules) = &self.rules {
            let user_agent = parts
                .headers
                .get(USER_AGENT)
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .unwrap_or_default();
            let body_text = snapshot
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();

            let verdict = rules.check_request(parts.uri.path(), &user_agent, &body_text);
            if let Verdict::Deny(reason) = verdict {
                info!(host = %host, path = %parts.uri.path(), "Request rejected: {}", reason);
                let message = format!("WAF validation failed: {}", reason);
                return text_response(StatusCode::FORBIDDEN, &message);
            }
        }

        let backend = match self.router.resolve(&host).await {
            Ok(Some(backend)) => backend,
            Ok(None) => {
                debug!("No site for host {}", host);
                return text_response(StatusCode::NOT_FOUND, "Domain not found");
            }
            Err(RouteError::InvalidBackend { url, reason }) => {
                error!("Site {} has an unusable backend {}: {}", host, url, reason);
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
            Err(e) => {
                error!("Registry lookup for {} failed: {}", host, e);
                return text_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
            }
        };

        if let Some(log) = &self.access_log {
            let log = log.clone();
            let entry = LogEntry::from_parts(&parts, snapshot.as_deref());
            // The sink may be a slow file; keep the write off the runtime workers
            if let Err(e) = tokio::task::spawn_blocking(move || log.record(&entry)).await {
                warn!("Request log task failed: {}", e);
            }
        }

        match self.forward(parts, body, &backend, remote_addr, &host, is_https).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Backend {} for {} unavailable: {}", backend.authority(), host, e);
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }

    /// Send the request to `backend` and relay its response head and streamed body
    async fn forward(
        &self,
        parts: Parts,
        body: ProxyBody,
        backend: &Backend,
        remote_addr: SocketAddr,
        original_host: &str,
        is_https: bool,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let target = backend.target_uri(path_and_query)?;
        debug!("Proxying to: {}", target);

        let origin_form: Uri = target
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse::<Uri>()
            .map_err(hyper::http::Error::from)?;

        let mut builder = Request::builder()
            .method(parts.method)
            .uri(origin_form)
            .version(Version::HTTP_11);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        let forwarded_for = forwarded_for(&headers, remote_addr);

        // Client-sent values are replaced, never trusted alongside ours
        for name in [HOST, X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PROTO] {
            headers.remove(name);
        }
        if let Some(out) = builder.headers_mut() {
            *out = headers;
        }

        let proxy_req = builder
            .header(HOST, backend.authority())
            .header(X_FORWARDED_FOR, forwarded_for)
            .header(X_FORWARDED_HOST, original_host)
            .header(X_FORWARDED_PROTO, if is_https { "https" } else { "http" })
            .body(body)?;

        let limit = self.config.backend_timeout;
        let addr = format!("{}:{}", backend.host(), backend.port());
        let stream = timeout(limit, TcpStream::connect((backend.host(), backend.port())))
            .await
            .map_err(|_| ForwardError::Timeout(limit))?
            .map_err(|source| ForwardError::Connect { addr, source })?;
        let _ = stream.set_nodelay(true);

        let mut sender = if backend.is_https() {
            let server_name = ServerName::try_from(backend.host())
                .map_err(|_| ForwardError::ServerName(backend.host().to_string()))?
                .to_owned();
            let tls_stream = timeout(limit, self.tls.connect(server_name, stream))
                .await
                .map_err(|_| ForwardError::Timeout(limit))?
                .map_err(ForwardError::Tls)?;
            handshake(tls_stream).await?
        } else {
            handshake(stream).await?
        };

        let response = timeout(limit, sender.send_request(proxy_req))
            .await
            .map_err(|_| ForwardError::Timeout(limit))??;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body.map_err(Into::into).boxed_unsync()))
    }
}

/// Open an HTTP/1 client connection over `io`, driving it on its own task
async fn handshake<I>(io: I) -> Result<SendRequest<ProxyBody>, ForwardError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;

    // The connection ends once the sender and the response body are dropped
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Backend connection error: {}", e);
        }
    });

    Ok(sender)
}

/// Proxy server: accepts plain and TLS connections and feeds them to one pipeline
pub struct ProxyServer {
    pipeline: Arc<Pipeline>,
}

impl ProxyServer {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }

    /// Accept plain HTTP connections until the listener fails permanently
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("HTTP server listening on {}", addr);
        }

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept HTTP connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let pipeline = self.pipeline.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, remote_addr, pipeline, false).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Accept TLS connections; the certificate is picked by SNI inside `acceptor`
    pub async fn serve_https(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) {
        if let Ok(addr) = listener.local_addr() {
            info!("HTTPS server listening on {}", addr);
        }

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept HTTPS connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let pipeline = self.pipeline.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let accept = timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream));
                let tls_stream = match accept.await {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => {
                        debug!("TLS handshake with {} failed: {}", remote_addr, e);
                        return;
                    }
                    Err(_) => {
                        debug!("TLS handshake with {} timed out", remote_addr);
                        return;
                    }
                };

                if let Err(e) = serve_connection(tls_stream, remote_addr, pipeline, true).await {
                    debug!("HTTPS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }
}

async fn serve_connection<I>(
    io: I,
    remote_addr: SocketAddr,
    pipeline: Arc<Pipeline>,
    is_https: bool,
) -> Result<(), hyper::Error>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(false)
        .serve_connection(
            TokioIo::new(io),
            service_fn(move |req: Request<Incoming>| {
                let pipeline = pipeline.clone();
                async move {
                    Ok::<_, Infallible>(pipeline.handle(req, remote_addr, is_https).await)
                }
            }),
        )
        .await
}

/// Host used for routing: the Host header, else the request-target authority, without port
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = match req.headers().get(HOST) {
        Some(value) => value.to_str().ok()?.to_string(),
        None => req.uri().authority()?.as_str().to_string(),
    };

    let authority: Authority = raw.parse().ok()?;
    let host = authority.host();
    if host.is_empty() {
        return None;
    }
    Some(host.to_string())
}

/// Methods whose body is inspected and logged
pub fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Every prior `X-Forwarded-For` hop, in order, followed by the peer address
fn forwarded_for(headers: &HeaderMap, remote_addr: SocketAddr) -> String {
    let ip = remote_addr.ip().to_string();
    let mut hops: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();
    hops.push(&ip);
    hops.join(", ")
}

/// Create text response
pub fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Create full body
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::route::{FixedRouter, RegistryRouter};
    use crate::waf::RuleDocument;

    fn remote() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    /// Backend on a port that was just released, so nothing answers there
    async fn dead_backend() -> Backend {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        Backend::parse(&format!("http://127.0.0.1:{}", port)).unwrap()
    }

    fn request(method: &str, host: &str, path: &str, body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, host)
            .header(USER_AGENT, "EvilBot/1.0")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    async fn body_text(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_request_host_strips_port() {
        let req = Request::builder().uri("/").header(HOST, "a.test:8080").body(()).unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("a.test"));

        let req = Request::builder().uri("/").header(HOST, "[::1]:8080").body(()).unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("[::1]"));

        let req = Request::builder().uri("/").header(HOST, "A.Test").body(()).unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("A.Test"));
    }

    #[test]
    fn test_request_host_from_absolute_uri() {
        let req = Request::builder().uri("http://b.test/x").body(()).unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("b.test"));

        let req = Request::builder().uri("/x").body(()).unwrap();
        assert_eq!(request_host(&req), None);
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session-hint", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-session-hint").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn test_carries_body() {
        assert!(carries_body(&Method::POST));
        assert!(carries_body(&Method::PUT));
        assert!(carries_body(&Method::PATCH));
        assert!(!carries_body(&Method::GET));
        assert!(!carries_body(&Method::DELETE));
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_for(&headers, remote()), "127.0.0.1");
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));
        assert_eq!(forwarded_for(&headers, remote()), "10.0.0.1, 127.0.0.1");
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.2"));
        assert_eq!(forwarded_for(&headers, remote()), "10.0.0.1, 10.0.0.2, 127.0.0.1");
    }

    #[tokio::test]
    async fn test_missing_host_is_400() {
        let pipeline = Pipeline::new(
            Arc::new(FixedRouter::new(dead_backend().await)),
            PipelineConfig::default(),
        )
        .unwrap();
        let req = Request::builder().uri("/").body(Full::new(Bytes::new())).unwrap();

        let response = pipeline.handle(req, remote(), false).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_host_is_404() {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let router = Arc::new(RegistryRouter::new(registry));
        let pipeline = Pipeline::new(router, PipelineConfig::default()).unwrap();

        let req = request("GET", "nobody.test", "/", "");
        let response = pipeline.handle(req, remote(), false).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "Domain not found");
    }

    #[tokio::test]
    async fn test_rule_violation_is_403_with_reason() {
        let doc = RuleDocument::from_yaml("low:\n  disallow:\n    agent: [\"bot\"]\n").unwrap();
        let pipeline = Pipeline::new(
            Arc::new(FixedRouter::new(dead_backend().await)),
            PipelineConfig::default(),
        )
        .unwrap()
        .with_rules(RuleEngine::new(&doc).unwrap());

        let response = pipeline.handle(request("GET", "a.test", "/", ""), remote(), false).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_text(response).await,
            "WAF validation failed: matches disallowed rule: bot"
        );
    }

    #[tokio::test]
    async fn test_body_rule_only_applies_to_body_methods() {
        let doc = RuleDocument::from_yaml("low:\n  allow:\n    body: [\"^ok$\"]\n").unwrap();
        let pipeline = Pipeline::new(
            Arc::new(FixedRouter::new(dead_backend().await)),
            PipelineConfig::default(),
        )
        .unwrap()
        .with_rules(RuleEngine::new(&doc).unwrap());

        // POST body "nope" fails the allow rule
        let req = request("POST", "a.test", "/", "nope");
        let response = pipeline.handle(req, remote(), false).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // DELETE bodies are evaluated as empty, which also fails "^ok$"
        let req = request("DELETE", "a.test", "/", "ok");
        let response = pipeline.handle(req, remote(), false).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // A passing POST body reaches forwarding, which fails against the dead backend
        let response = pipeline.handle(request("POST", "a.test", "/", "ok"), remote(), false).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_oversized_inspected_body_is_413() {
        let config = PipelineConfig::new(5, 4, false).unwrap();
        let pipeline = Pipeline::new(Arc::new(FixedRouter::new(dead_backend().await)), config)
            .unwrap()
            .with_rules(RuleEngine::new(&RuleDocument::default()).unwrap());

        let response = pipeline
            .handle(request("POST", "a.test", "/", "more than four bytes"), remote(), false)
            .await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_registry_failure_is_503() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("server.db");
        let registry = Arc::new(Registry::open(&db_path).unwrap());

        // Break the store underneath the open registry
        rusqlite::Connection::open(&db_path)
            .unwrap()
            .execute_batch("DROP TABLE sites;")
            .unwrap();

        let router = Arc::new(RegistryRouter::new(registry));
        let pipeline = Pipeline::new(router, PipelineConfig::default()).unwrap();

        let response = pipeline.handle(request("GET", "a.test", "/", ""), remote(), false).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_502() {
        let pipeline = Pipeline::new(
            Arc::new(FixedRouter::new(dead_backend().await)),
            PipelineConfig::default(),
        )
        .unwrap();

        let response = pipeline.handle(request("GET", "a.test", "/x", ""), remote(), false).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
