//! HTTP surface: an axum router generic over any [`ResourceRest`].
//!
//! Routes for a kind with plural `p`:
//! - `POST /p`, `GET /p` (list), `GET|PUT|DELETE /p/{name}`
//! - `GET /watch/p`: newline-delimited JSON `WatchEvent` frames
//!
//! Errors are JSON `Status` bodies carrying the matching status code.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use keel_core::config::env_or;
use keel_core::{ApiError, Context, DeleteOptions, Resource, Selector, Status, WatchEvent};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rest::ResourceRest;

pub const NDJSON: &str = "application/x-ndjson";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Deadline for every non-watch request.
    pub request_timeout: Duration,
    /// Cancelled on server shutdown; open watches end when it fires.
    pub shutdown: CancellationToken,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(30), shutdown: CancellationToken::new() }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self { request_timeout: Duration::from_secs(env_or("KEEL_REQUEST_TIMEOUT_SECS", d.request_timeout.as_secs())), ..d }
    }
}

/// `ApiError` rendered as a `Status` response.
#[derive(Debug)]
pub struct HttpError(pub ApiError);

impl From<ApiError> for HttpError {
    fn from(e: ApiError) -> Self {
        Self(e)
    }
}

impl From<QueryRejection> for HttpError {
    fn from(e: QueryRejection) -> Self {
        Self(ApiError::BadRequest(e.body_text()))
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let code = StatusCode::from_u16(self.0.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        counter!("http_errors_total", 1u64, "reason" => self.0.reason());
        if code.is_server_error() {
            warn!(code = code.as_u16(), error = %self.0, "http: request failed");
        }
        (code, Json(Status::from(self.0))).into_response()
    }
}

type HttpResult<T> = Result<T, HttpError>;

/// Query parameters shared by list, delete and watch.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    #[serde(default)]
    pub label_selector: String,
    #[serde(default)]
    pub field_selector: String,
    #[serde(default)]
    pub resource_version: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl QueryParams {
    fn selectors(&self) -> Result<(Selector, Selector), ApiError> {
        Ok((Selector::parse(&self.label_selector)?, Selector::parse(&self.field_selector)?))
    }
}

struct AppState<R> {
    rest: Arc<R>,
    config: ApiConfig,
}

impl<R> Clone for AppState<R> {
    fn clone(&self) -> Self {
        Self { rest: Arc::clone(&self.rest), config: self.config.clone() }
    }
}

impl<R> AppState<R> {
    fn request_ctx(&self) -> Context {
        Context::new().with_timeout(self.config.request_timeout)
    }
}

/// Routes for `R`'s kind, mounted at `/{plural}` and `/watch/{plural}`.
pub fn resource_routes<R: ResourceRest>(rest: Arc<R>, config: ApiConfig) -> Router {
    let plural = <R::Object as Resource>::PLURAL;
    Router::new()
        .route(&format!("/{}", plural), get(list::<R>).post(create::<R>))
        .route(&format!("/{}/:name", plural), get(get_one::<R>).put(update::<R>).delete(delete::<R>))
        .route(&format!("/watch/{}", plural), get(watch::<R>))
        .with_state(AppState { rest, config })
}

/// Adds `GET /healthz`.
pub fn with_health(router: Router) -> Router {
    router.route("/healthz", get(|| async { "ok" }))
}

/// Serve `router` on `listener` until `shutdown` resolves, then drain connections.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(addr = %addr, "http: serving");
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;
    info!(addr = %addr, "http: stopped");
    Ok(())
}

fn decode_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("request body required".into()));
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("malformed body: {}", e)))
}

async fn create<R: ResourceRest>(State(st): State<AppState<R>>, body: Bytes) -> HttpResult<Response> {
    let obj: R::Object = decode_body(&body)?;
    let out = st.rest.create(&st.request_ctx(), obj).await?;
    Ok((StatusCode::CREATED, Json(out)).into_response())
}

async fn get_one<R: ResourceRest>(State(st): State<AppState<R>>, Path(name): Path<String>) -> HttpResult<Json<R::Object>> {
    Ok(Json(st.rest.get(&st.request_ctx(), &name).await?))
}

async fn list<R: ResourceRest>(
    State(st): State<AppState<R>>,
    query: Result<Query<QueryParams>, QueryRejection>,
) -> HttpResult<Response> {
    let Query(p) = query?;
    let (label, field) = p.selectors()?;
    let out = st.rest.list(&st.request_ctx(), label, field).await?;
    Ok(Json(out).into_response())
}

async fn update<R: ResourceRest>(
    State(st): State<AppState<R>>,
    Path(name): Path<String>,
    body: Bytes,
) -> HttpResult<Json<R::Object>> {
    let mut obj: R::Object = decode_body(&body)?;
    if obj.meta().name.is_empty() {
        obj.meta_mut().name = name;
    } else if obj.meta().name != name {
        return Err(ApiError::BadRequest(format!("name in body {:?} does not match path {:?}", obj.meta().name, name)).into());
    }
    Ok(Json(st.rest.update(&st.request_ctx(), obj).await?))
}

async fn delete<R: ResourceRest>(
    State(st): State<AppState<R>>,
    Path(name): Path<String>,
    query: Result<Query<QueryParams>, QueryRejection>,
) -> HttpResult<Json<R::Object>> {
    let Query(p) = query?;
    let opts = DeleteOptions { resource_version: Some(p.resource_version).filter(|rv| !rv.is_empty()) };
    Ok(Json(st.rest.delete(&st.request_ctx(), &name, &opts).await?))
}

fn frame<T: Serialize>(ev: &WatchEvent<T>) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = serde_json::to_vec(ev)?;
    buf.push(b'\n');
    Ok(buf)
}

async fn watch<R: ResourceRest>(
    State(st): State<AppState<R>>,
    query: Result<Query<QueryParams>, QueryRejection>,
) -> HttpResult<Response> {
    let Query(p) = query?;
    let (label, field) = p.selectors()?;
    // No request deadline here; `timeoutSeconds` bounds the stream instead.
    let ctx = Context::new().with_cancel(st.config.shutdown.child_token());
    let w = st.rest.watch(&ctx, label, field, &p.resource_version).await?;
    debug!(kind = <R::Object as Resource>::KIND, rv = %p.resource_version, timeout_s = ?p.timeout_seconds, "http: watch open");
    let frames = w.map(|ev| frame(&ev));
    let body = match p.timeout_seconds {
        Some(secs) => Body::from_stream(frames.take_until(tokio::time::sleep(Duration::from_secs(secs)))),
        None => Body::from_stream(frames),
    };
    Ok(([(header::CONTENT_TYPE, NDJSON)], body).into_response())
}
