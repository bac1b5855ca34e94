//! Administrative HTTP API
//!
//! `POST /api/sites` registers a site, `GET /api/sites` lists them. Both need
//! `Authorization: Bearer <token>` with a token known to the registry; a
//! request that fails authorization never reaches the registry write.

use crate::proxy::{full_body, text_response, BoxError, ProxyBody};
use crate::registry::{Registry, RegistryError, Site};
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

const SITES_PATH: &str = "/api/sites";
const MAX_ADMIN_BODY: usize = 64 * 1024;

/// Site fields accepted from a client; the original field names are accepted as aliases
#[derive(Debug, Deserialize)]
struct NewSite {
    #[serde(alias = "website")]
    name: String,
    domain: String,
    #[serde(alias = "proxyUrl")]
    backend_url: String,
    #[serde(default, alias = "ssl")]
    tls_enabled: bool,
}

impl From<NewSite> for Site {
    fn from(s: NewSite) -> Self {
        Site {
            name: s.name,
            domain: s.domain,
            backend_url: s.backend_url,
            tls_enabled: s.tls_enabled,
        }
    }
}

pub struct AdminServer {
    registry: Arc<Registry>,
}

impl AdminServer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("Admin API listening on {}", addr);
        }

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept admin connection: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle(req).await) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("Admin connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if req.uri().path() != SITES_PATH {
            return text_response(StatusCode::NOT_FOUND, "Not Found");
        }
        if *req.method() != Method::POST && *req.method() != Method::GET {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        }

        match self.authorize(bearer_token(&req)).await {
            Ok(true) => {}
            Ok(false) => {
                return text_response(StatusCode::UNAUTHORIZED, "Invalid or missing bearer token")
            }
            Err(e) => {
                error!("Token verification failed: {}", e);
                return text_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
            }
        }

        if *req.method() == Method::GET {
            return self.list_sites().await;
        }
        self.create_site(req).await
    }

    async fn authorize(&self, token: Option<String>) -> Result<bool, RegistryError> {
        let Some(token) = token else {
            return Ok(false);
        };

        let registry = self.registry.clone();
        blocking(move || registry.verify_token(&token)).await
    }

    async fn create_site<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let is_json = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/json"))
            .unwrap_or(false);

        let bytes = match Limited::new(req.into_body(), MAX_ADMIN_BODY).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let message = format!("Failed to read body: {}", e);
                return text_response(StatusCode::BAD_REQUEST, &message);
            }
        };

        let site = match parse_site(&bytes, is_json) {
            Ok(site) => site,
            Err(message) => return text_response(StatusCode::BAD_REQUEST, &message),
        };

        let registry = self.registry.clone();
        match blocking(move || registry.insert(site)).await {
            Ok(site) => {
                info!("Registered site {} for {} -> {}", site.name, site.domain, site.backend_url);
                json_response(StatusCode::CREATED, &site)
            }
            Err(RegistryError::Duplicate(domain)) => text_response(
                StatusCode::CONFLICT,
                &format!("a site for domain '{}' already exists", domain),
            ),
            Err(e @ RegistryError::Validation(_)) => {
                text_response(StatusCode::BAD_REQUEST, &e.to_string())
            }
            Err(e) => {
                error!("Failed to insert site: {}", e);
                text_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
            }
        }
    }

    async fn list_sites(&self) -> Response<ProxyBody> {
        let registry = self.registry.clone();
        match blocking(move || registry.list_sites()).await {
            Ok(sites) => json_response(StatusCode::OK, &sites),
            Err(e) => {
                error!("Failed to list sites: {}", e);
                text_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
            }
        }
    }
}

fn bearer_token<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Run a registry call on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T, RegistryError>
where
    F: FnOnce() -> Result<T, RegistryError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

fn parse_site(bytes: &[u8], is_json: bool) -> Result<Site, String> {
    if is_json {
        return serde_json::from_slice::<NewSite>(bytes)
            .map(Site::from)
            .map_err(|e| format!("invalid JSON body: {}", e));
    }

    let mut site = Site::new("", "", "", false);
    let (mut has_name, mut has_domain, mut has_backend) = (false, false, false);
    for (key, value) in url::form_urlencoded::parse(bytes) {
        match &*key {
            "name" | "website" => {
                site.name = value.into_owned();
                has_name = true;
            }
            "domain" => {
                site.domain = value.into_owned();
                has_domain = true;
            }
            "backend_url" | "proxyUrl" => {
                site.backend_url = value.into_owned();
                has_backend = true;
            }
            "tls_enabled" | "ssl" => site.tls_enabled = matches!(&*value, "true" | "1" | "on"),
            _ => {}
        }
    }

    match (has_name, has_domain, has_backend) {
        (true, true, true) => Ok(site),
        _ => Err("name, domain and backend_url are required".to_string()),
    }
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(full_body(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("Failed to encode response: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    fn server() -> AdminServer {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        registry.add_token(Some("secret")).unwrap();
        AdminServer::new(registry)
    }

    fn post(token: Option<&str>, content_type: &str, body: &'static str) -> Request<Full<Bytes>> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(SITES_PATH)
            .header(CONTENT_TYPE, content_type);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Full::new(Bytes::from_static(body.as_bytes()))).unwrap()
    }

    #[tokio::test]
    async fn test_blocking_reports_panicked_task() {
        let result: Result<(), RegistryError> = blocking(|| panic!("registry call panicked")).await;
        assert!(matches!(result, Err(RegistryError::Task(_))));
    }

    const JSON_SITE: &str =
        r#"{"name":"shop","domain":"shop.test","backend_url":"http://127.0.0.1:9001"}"#;

    #[tokio::test]
    async fn test_create_site_json() {
        let admin = server();
        let response = admin.handle(post(Some("secret"), "application/json", JSON_SITE)).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let site: Site = serde_json::from_slice(&body).unwrap();
        assert_eq!(site.domain, "shop.test");
        assert!(!site.tls_enabled);

        assert!(admin.registry.lookup_by_host("shop.test").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_site_form_with_original_names() {
        let admin = server();
        let body = "website=blog&domain=blog.test&proxyUrl=http%3A%2F%2F127.0.0.1%3A9002&ssl=true";
        let response = admin
            .handle(post(Some("secret"), "application/x-www-form-urlencoded", body))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let site = admin.registry.lookup_by_host("blog.test").unwrap().unwrap();
        assert_eq!(site.name, "blog");
        assert_eq!(site.backend_url, "http://127.0.0.1:9002");
        assert!(site.tls_enabled);
    }

    #[tokio::test]
    async fn test_unauthorized_never_inserts() {
        let admin = server();

        for token in [None, Some("wrong"), Some("")] {
            let response = admin.handle(post(token, "application/json", JSON_SITE)).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        assert!(admin.registry.list_sites().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_invalid_input() {
        let admin = server();

        let response = admin.handle(post(Some("secret"), "application/json", "{not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = admin
            .handle(post(Some("secret"), "application/x-www-form-urlencoded", "domain=x.test"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let invalid = r#"{"name":"x","domain":"x.test","backend_url":"not-a-url"}"#;
        let response = admin.handle(post(Some("secret"), "application/json", invalid)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert!(admin.registry.list_sites().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_domain_conflict() {
        let admin = server();
        let first = admin.handle(post(Some("secret"), "application/json", JSON_SITE)).await;
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = admin.handle(post(Some("secret"), "application/json", JSON_SITE)).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_list_and_routing_errors() {
        let admin = server();
        admin.handle(post(Some("secret"), "application/json", JSON_SITE)).await;

        let list = Request::builder()
            .method("GET")
            .uri(SITES_PATH)
            .header(AUTHORIZATION, "Bearer secret")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = admin.handle(list).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let sites: Vec<Site> = serde_json::from_slice(&body).unwrap();
        assert_eq!(sites.len(), 1);

        let other = Request::builder().uri("/api/other").body(Full::new(Bytes::new())).unwrap();
        assert_eq!(admin.handle(other).await.status(), StatusCode::NOT_FOUND);

        let delete = Request::builder()
            .method("DELETE")
            .uri(SITES_PATH)
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(admin.handle(delete).await.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
