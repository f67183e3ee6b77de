//! Loopback HTTP proxy the embedded UI loads every page through, so the top
//! document and its frames share the proxy's origin.
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use engine_logging::{engine_debug, engine_info, engine_task_log, engine_warn};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::active::ActiveTaskSlot;
use crate::fetch::map_reqwest_error;
use crate::CrawlError;

/// Response headers copied from upstream besides the status.
const FORWARDED_RESPONSE_HEADERS: &[header::HeaderName] = &[
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CACHE_CONTROL,
    header::ETAG,
    header::LAST_MODIFIED,
    header::CONTENT_DISPOSITION,
];

#[derive(Clone)]
struct ProxyState {
    slot: ActiveTaskSlot,
    crawler_page: Arc<str>,
}

#[derive(Debug, Deserialize)]
struct ProxyQuery {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssetQuery {
    path: Option<String>,
}

#[derive(Debug)]
enum ProxyError {
    BadRequest(String),
    NoActiveTask,
    NotFound,
    Upstream(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ProxyError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ProxyError::NoActiveTask => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no crawl task is running".to_string(),
            ),
            ProxyError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ProxyError::Upstream(message) => (StatusCode::BAD_GATEWAY, message),
        };
        (status, message).into_response()
    }
}

pub fn router(slot: ActiveTaskSlot, crawler_page: &str) -> Router {
    let state = ProxyState {
        slot,
        crawler_page: Arc::from(crawler_page),
    };
    Router::new()
        .route("/proxy", get(proxy_handler))
        .route("/crawler", get(crawler_page_handler))
        .route("/plugin/html", get(plugin_asset_handler))
        .with_state(state)
}

async fn proxy_handler(
    State(state): State<ProxyState>,
    Query(query): Query<ProxyQuery>,
    incoming: HeaderMap,
) -> Result<Response, ProxyError> {
    let target = query
        .url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| ProxyError::BadRequest("missing url parameter".to_string()))?;
    let target = url::Url::parse(target.trim())
        .map_err(|err| ProxyError::BadRequest(format!("invalid url: {err}")))?;
    if !matches!(target.scheme(), "http" | "https") {
        return Err(ProxyError::BadRequest(format!(
            "unsupported scheme {}",
            target.scheme()
        )));
    }

    let task = state.slot.current().ok_or(ProxyError::NoActiveTask)?;
    let headers = task.headers.outbound(&incoming);
    engine_task_log!(log::Level::Debug, task.task_id(), "proxy GET {}", target);

    let upstream = task
        .client
        .get(target.as_str())
        .headers(headers)
        .send()
        .await
        .map_err(|err| {
            let err = map_reqwest_error(err);
            engine_task_log!(
                log::Level::Warn,
                task.task_id(),
                "proxy fetch of {} failed: {}",
                target,
                err
            );
            ProxyError::Upstream(err.to_string())
        })?;

    let mut response = Response::builder().status(upstream.status());
    if let Some(response_headers) = response.headers_mut() {
        for name in FORWARDED_RESPONSE_HEADERS {
            if let Some(value) = upstream.headers().get(name) {
                response_headers.insert(name.clone(), value.clone());
            }
        }
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|err| ProxyError::Upstream(err.to_string()))
}

async fn crawler_page_handler(State(state): State<ProxyState>) -> Html<String> {
    Html(state.crawler_page.to_string())
}

async fn plugin_asset_handler(
    State(state): State<ProxyState>,
    Query(query): Query<AssetQuery>,
) -> Result<Response, ProxyError> {
    let path = query
        .path
        .filter(|path| !path.is_empty())
        .ok_or_else(|| ProxyError::BadRequest("missing path parameter".to_string()))?;
    let task = state.slot.current().ok_or(ProxyError::NoActiveTask)?;
    let html = task.plugin.html_asset(&path).ok_or(ProxyError::NotFound)?;
    let mut response = Html(html).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store"),
    );
    Ok(response)
}

/// A running proxy listener.
pub struct ProxyServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProxyServer {
    /// Binds `bind` (loopback only) and starts serving.
    pub async fn start(
        bind: SocketAddr,
        slot: ActiveTaskSlot,
        crawler_page: &str,
    ) -> Result<Self, CrawlError> {
        if !bind.ip().is_loopback() {
            return Err(CrawlError::Proxy(format!(
                "refusing to bind non-loopback address {bind}"
            )));
        }
        let listener = tokio::net::TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let app = router(slot, crawler_page);

        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(err) = result {
                engine_warn!("proxy server error: {}", err);
            }
        });
        engine_info!("proxy listening on http://{}", addr);
        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting connections and waits for the listener to close.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(err) = self.handle.await {
            engine_warn!("proxy task ended abnormally: {}", err);
        }
        engine_debug!("proxy on {} stopped", self.addr);
    }
}
