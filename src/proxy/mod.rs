use crate::error::{AppError, Result};
use crate::metrics;
use crate::router::{RouteMatch, Router};
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, Method},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Service, ServiceExt};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

/// Proxy state shared by every dispatch
#[derive(Clone)]
pub struct ProxyState {
    pub router: Arc<Router>,
    pub client: reqwest::Client,
}

impl ProxyState {
    /// Create a new proxy state
    pub fn new(router: Router, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            router: Arc::new(router),
            client,
        })
    }
}

/// Innermost stage of the host chain.
///
/// Requests a route claims are forwarded to that route's backend; everything
/// else is served from the static file root. Both passes of a redirected request
/// come through here, so a redirect target is usually a static file.
#[derive(Clone)]
pub struct Dispatcher {
    state: ProxyState,
    files: ServeDir,
}

impl Dispatcher {
    pub fn new(state: ProxyState, static_root: impl AsRef<Path>) -> Self {
        Self {
            state,
            files: ServeDir::new(static_root),
        }
    }
}

impl Service<Request> for Dispatcher {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, std::result::Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let state = self.state.clone();
        let files = self.files.clone();

        Box::pin(async move {
            let matched = state
                .router
                .match_route(request.uri().path(), request.method());

            match matched {
                Ok(Some(route_match)) => Ok(forward(&state, route_match, request)
                    .await
                    .unwrap_or_else(IntoResponse::into_response)),
                Ok(None) => {
                    debug!(path = %request.uri().path(), "No route matched, serving static content");
                    let response = files.oneshot(request).await?;
                    Ok(response.map(Body::new))
                }
                Err(e) => {
                    warn!(path = %request.uri().path(), error = %e, "Route rejected request");
                    Ok(e.into_response())
                }
            }
        })
    }
}

/// Forward a request to the backend of the matched route
pub async fn forward(
    state: &ProxyState,
    route_match: RouteMatch,
    request: Request,
) -> Result<Response> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let path = uri.path();

    let mut timer = metrics::Timer::new(method.to_string(), path.to_string());
    timer.set_backend(route_match.route.backend.clone());

    let backend_url = route_match.build_backend_url(path, uri.query());
    debug!(backend_url = %backend_url, params = ?route_match.params, "Forwarding to backend");

    let headers = request.headers().clone();
    let body_bytes = request
        .into_body()
        .collect()
        .await
        .map_err(|e| AppError::Proxy(format!("Failed to read request body: {}", e)))?
        .to_bytes();

    let response = send_request(
        state.client.clone(),
        method.clone(),
        headers,
        body_bytes,
        &backend_url,
    )
    .await;

    match &response {
        Ok(resp) => {
            info!(
                method = %method,
                path = %path,
                status = %resp.status(),
                backend = %route_match.route.backend,
                latency_ms = timer.elapsed() * 1000.0,
                "Backend request completed"
            );
            timer.record(resp.status().as_u16());
        }
        Err(e) => {
            warn!(
                method = %method,
                path = %path,
                error = %e,
                backend = %route_match.route.backend,
                latency_ms = timer.elapsed() * 1000.0,
                "Backend request failed"
            );
            timer.record(e.status_code().as_u16());
        }
    }

    response
}

/// Send request to the backend service
async fn send_request(
    client: reqwest::Client,
    method: Method,
    headers: HeaderMap,
    body_bytes: Bytes,
    backend_url: &str,
) -> Result<Response> {
    let mut backend_req = client.request(method, backend_url).body(body_bytes);

    for (name, value) in headers.iter() {
        if !is_hop_by_hop_header(name.as_str()) && *name != http::header::HOST {
            backend_req = backend_req.header(name, value);
        }
    }

    let backend_response = backend_req.send().await.map_err(|e| {
        if e.is_timeout() {
            AppError::Timeout(format!("Backend request timed out: {}", e))
        } else if e.is_connect() {
            AppError::Backend(format!("Failed to connect to backend: {}", e))
        } else {
            AppError::Proxy(format!("Backend request failed: {}", e))
        }
    })?;

    let status = backend_response.status();
    let mut response_builder = Response::builder().status(status);

    // Signal headers travel back with the rest
    for (name, value) in backend_response.headers().iter() {
        if !is_hop_by_hop_header(name.as_str()) {
            response_builder = response_builder.header(name, value);
        }
    }

    let body_bytes = backend_response
        .bytes()
        .await
        .map_err(|e| AppError::Backend(format!("Failed to read backend response: {}", e)))?;

    response_builder
        .body(Body::from(body_bytes))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;
    use http::StatusCode;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher(backend: &str, root: &Path) -> Dispatcher {
        let router = Router::new(vec![RouteConfig {
            path: "/api/*rest".to_string(),
            backend: backend.to_string(),
            methods: vec!["GET".to_string()],
            strip_prefix: false,
            description: "".to_string(),
        }])
        .unwrap();
        Dispatcher::new(ProxyState::new(router, Duration::from_secs(5)).unwrap(), root)
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("connection"));
        assert!(is_hop_by_hop_header("Keep-Alive"));
        assert!(is_hop_by_hop_header("Transfer-Encoding"));
        assert!(!is_hop_by_hop_header("Content-Type"));
        assert!(!is_hop_by_hop_header("X-Accel-Redirect"));
    }

    #[tokio::test]
    async fn test_routed_request_is_proxied() {
        let backend = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/items"))
            .and(header("x-client", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-accel-redirect", "/f")
                    .set_body_string("signal"),
            )
            .mount(&backend)
            .await;

        let root = tempfile::tempdir().unwrap();
        let response = dispatcher(&backend.uri(), root.path())
            .oneshot(
                http::Request::get("/api/items")
                    .header("x-client", "1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-accel-redirect"], "/f");
    }

    #[tokio::test]
    async fn test_unrouted_request_serves_static_file() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("f.txt"), "static content").unwrap();

        let response = dispatcher("http://127.0.0.1:1", root.path())
            .oneshot(http::Request::get("/f.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"static content");

        let missing = dispatcher("http://127.0.0.1:1", root.path())
            .oneshot(http::Request::get("/nope.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_disallowed_method_and_dead_backend() {
        let root = tempfile::tempdir().unwrap();

        let response = dispatcher("http://127.0.0.1:1", root.path())
            .oneshot(http::Request::post("/api/items").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = dispatcher("http://127.0.0.1:1", root.path())
            .oneshot(http::Request::get("/api/items").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
