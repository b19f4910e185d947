use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    error::GatewayError,
    options::ScanOptions,
    pipeline::{self, JobRunner},
    registry::JobRegistry,
    types::JobSnapshot,
};

/// Shared handles behind every route.
pub struct AppState<R> {
    secret: Arc<str>,
    registry: JobRegistry,
    runner: Arc<R>,
    tasks: TaskTracker,
}

impl<R> Clone for AppState<R> {
    fn clone(&self) -> Self {
        Self {
            secret: self.secret.clone(),
            registry: self.registry.clone(),
            runner: self.runner.clone(),
            tasks: self.tasks.clone(),
        }
    }
}

impl<R: JobRunner> AppState<R> {
    pub fn new(secret: &str, registry: JobRegistry, runner: Arc<R>, tasks: TaskTracker) -> Self {
        Self {
            secret: Arc::from(secret),
            registry,
            runner,
            tasks,
        }
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), GatewayError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match token {
            Some(t) if t == &*self.secret => Ok(()),
            _ => Err(GatewayError::Unauthorized),
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanParams {
    pub id: Option<String>,
    pub options: Option<String>,
}

impl ScanParams {
    /// The first occurrence of each key wins; unknown keys are ignored.
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut params = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_str() {
                "id" => &mut params.id,
                "options" => &mut params.options,
                _ => continue,
            };
            slot.get_or_insert(value);
        }
        params
    }
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub running_scans: usize,
    pub scans: Vec<JobSnapshot>,
}

pub fn router<R: JobRunner>(state: AppState<R>) -> Router {
    Router::new()
        .route(
            "/scans",
            post(post_scan::<R>).fallback(|| async { GatewayError::MethodNotAllowed }),
        )
        .route("/status", get(get_status::<R>))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn get_health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn get_status<R: JobRunner>(
    State(app): State<AppState<R>>,
    headers: HeaderMap,
) -> Result<Json<StatusView>, GatewayError> {
    app.authorize(&headers)?;
    let scans = app.registry.snapshot();
    Ok(Json(StatusView {
        running_scans: scans.len(),
        scans,
    }))
}

async fn post_scan<R: JobRunner>(
    State(app): State<AppState<R>>,
    headers: HeaderMap,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Result<Response, GatewayError> {
    app.authorize(&headers)?;
    let Query(pairs) = query.map_err(|_| GatewayError::MalformedQuery)?;
    let params = ScanParams::from_pairs(pairs);

    let jid = params
        .id
        .filter(|s| !s.is_empty())
        .ok_or(GatewayError::MissingParameter("id"))?;
    let raw = params
        .options
        .filter(|s| !s.is_empty())
        .ok_or(GatewayError::MissingParameter("options"))?;
    let options = ScanOptions::parse(&raw)?;

    let admission = app.registry.admit(&jid, &raw)?;
    info!(jid = %jid, options = %options, "accepted scan job");

    // The response goes out now; the job reports back through /status only.
    let runner = app.runner.clone();
    app.tasks.spawn(async move {
        pipeline::drive(&*runner, admission, &options, "request").await;
    });

    Ok((StatusCode::OK, Json(json!({ "message": "accepted" }))).into_response())
}
