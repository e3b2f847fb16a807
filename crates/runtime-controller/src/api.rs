//! HTTP surface of the controller: namespace listing and provisioning,
//! access tokens for secured servers, broker completion reports, health
//! and readiness.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::broker::{BrokerEvent, BrokerEvents};
use crate::error::Error;
use crate::model::Subject;
use crate::namespace::{NamespaceManager, NamespaceMeta, NamespaceResolutionContext};
use crate::runtime::RuntimeOrchestrator;
use crate::server::token::AccessToken;

pub const HEADER_USER: &str = "x-forwarded-user";
pub const HEADER_USER_ID: &str = "x-forwarded-user-id";
pub const HEADER_GROUPS: &str = "x-forwarded-groups";

#[derive(Clone)]
pub struct AppState {
    pub namespaces: Arc<NamespaceManager>,
    pub broker_events: Arc<BrokerEvents>,
    pub runtimes: Arc<RuntimeOrchestrator>,
    /// Set once startup recovery has finished
    pub ready: Arc<AtomicBool>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/namespace", get(list_namespaces))
        .route("/namespace/provision", post(provision_namespace))
        .route("/workspace/{workspace_id}/token", post(issue_token))
        .route("/broker/{workspace_id}/events", post(broker_event))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body `{ "message": ... }` with the status matching the error kind
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Infrastructure { .. } | Error::Internal(_) | Error::Timeout(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!(error = %err, "Request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl ApiError {
    fn unauthorized(message: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "message": self.message }))).into_response()
    }
}

fn header(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Subject from the headers set by the authenticating gateway
impl<S> FromRequestParts<S> for Subject
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_name = header(parts, HEADER_USER)
            .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
        let user_id = header(parts, HEADER_USER_ID).unwrap_or_else(|| user_name.clone());
        let groups = header(parts, HEADER_GROUPS)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Subject::new(user_id, user_name).with_groups(groups))
    }
}

async fn list_namespaces(
    State(state): State<AppState>,
    subject: Subject,
) -> Result<Json<Vec<NamespaceMeta>>, ApiError> {
    Ok(Json(state.namespaces.list(&subject).await?))
}

#[derive(Debug, Deserialize)]
struct ProvisionQuery {
    #[serde(default, rename = "workspaceId")]
    workspace_id: Option<String>,
}

async fn provision_namespace(
    State(state): State<AppState>,
    subject: Subject,
    Query(query): Query<ProvisionQuery>,
) -> Result<Json<NamespaceMeta>, ApiError> {
    let mut ctx = NamespaceResolutionContext::new(subject);
    if let Some(workspace_id) = query.workspace_id {
        ctx = ctx.with_workspace(workspace_id);
    }
    Ok(Json(state.namespaces.provision(&ctx).await?))
}

/// Token for the secured servers of the caller's running workspace
async fn issue_token(
    State(state): State<AppState>,
    subject: Subject,
    Path(workspace_id): Path<String>,
) -> Result<Json<AccessToken>, ApiError> {
    Ok(Json(state.runtimes.issue_token(&subject, &workspace_id).await?))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Completion report posted by a plugin broker pod with its run's report token
async fn broker_event(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
    Json(event): Json<BrokerEvent>,
) -> Result<StatusCode, ApiError> {
    let token =
        bearer(&headers).ok_or_else(|| ApiError::unauthorized("Broker report token required"))?;
    debug!(workspace_id = %workspace_id, event = ?event, "Broker report received");
    state.broker_events.publish(&workspace_id, token, event)?;
    Ok(StatusCode::ACCEPTED)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "runtime-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.ready.load(Ordering::Acquire) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({ "status": "ready" })))
}
