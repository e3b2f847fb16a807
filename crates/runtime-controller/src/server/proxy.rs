//! Request handling of the signing proxy sidecar.
//!
//! Every listener validates the caller's token and forwards the request to
//! its upstream server on localhost. Bodies are streamed. Upgrade requests
//! (WebSocket terminals, language servers) are handed to the upstream and
//! the two upgraded connections are bridged.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{
    AUTHORIZATION, CONNECTION, CONTENT_LENGTH, COOKIE, HOST, TRANSFER_ENCODING, UPGRADE,
};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::signer::{ProxyConfig, ProxyListener};
use super::token::VerifyingKey;

pub const ACCESS_TOKEN_COOKIE: &str = "workspace-access-token";

#[derive(Clone)]
pub struct ListenerState {
    listener: Arc<ProxyListener>,
    workspace_id: Arc<str>,
    key: Arc<VerifyingKey>,
    client: reqwest::Client,
}

impl ListenerState {
    pub fn new(listener: ProxyListener, workspace_id: &str, key: Arc<VerifyingKey>) -> Self {
        Self {
            listener: Arc::new(listener),
            workspace_id: Arc::from(workspace_id),
            key,
            client: reqwest::Client::builder()
                .http1_only()
                .no_proxy()
                .build()
                .unwrap_or_default(),
        }
    }
}

pub fn listener_router(state: ListenerState) -> Router {
    Router::new()
        .fallback(handle)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `path` is an unsecured path itself or lies below one
fn is_unsecured(listener: &ProxyListener, path: &str) -> bool {
    listener.unsecured_paths.iter().any(|p| {
        let prefix = p.trim_end_matches('/');
        path == p
            || prefix.is_empty()
            || path == prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Bearer header, then `token` query parameter, then the access cookie when enabled
fn extract_token(request: &Request, cookies_enabled: bool) -> Option<String> {
    let headers = request.headers();
    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.trim().to_string());
    }

    if let Some(token) = request.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .filter(|t| !t.is_empty())
    }) {
        return Some(token.to_string());
    }

    if cookies_enabled {
        return headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .find_map(|c| c.trim().strip_prefix(&format!("{ACCESS_TOKEN_COOKIE}=")).map(str::to_string));
    }
    None
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
        && headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case("upgrade"))
}

async fn handle(State(state): State<ListenerState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    if !is_unsecured(&state.listener, &path) {
        let Some(token) = extract_token(&request, state.listener.cookies_auth_enabled) else {
            debug!(path = %path, "Request without access token");
            return reject(StatusCode::UNAUTHORIZED, "Missing access token");
        };
        if let Err(e) = state.key.verify(&token, &state.workspace_id) {
            debug!(path = %path, error = %e, "Rejected access token");
            return reject(StatusCode::UNAUTHORIZED, &e.to_string());
        }
    }

    let result = if is_upgrade(request.headers()) {
        forward_upgrade(&state, request).await
    } else {
        forward(&state, request).await
    };
    match result {
        Ok(response) => response,
        Err(e) => {
            warn!(upstream = %state.listener.upstream, error = %e, "Upstream request failed");
            reject(StatusCode::BAD_GATEWAY, "Upstream server unavailable")
        }
    }
}

fn upstream_url(state: &ListenerState, request: &Request) -> String {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    format!(
        "{}{path_and_query}",
        state.listener.upstream.trim_end_matches('/')
    )
}

async fn forward(state: &ListenerState, request: Request) -> anyhow::Result<Response> {
    let url = upstream_url(state, &request);
    let (parts, body) = request.into_parts();

    let mut upstream = state.client.request(parts.method, &url);
    for (name, value) in &parts.headers {
        if name != HOST && name != CONTENT_LENGTH && name != CONNECTION {
            upstream = upstream.header(name, value);
        }
    }
    let upstream = upstream
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await?;

    let mut response = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if name != TRANSFER_ENCODING && name != CONTENT_LENGTH && name != CONNECTION {
            response = response.header(name, value);
        }
    }
    Ok(response.body(Body::from_stream(upstream.bytes_stream()))?)
}

/// Replay the upgrade request upstream and bridge both upgraded connections
async fn forward_upgrade(state: &ListenerState, mut request: Request) -> anyhow::Result<Response> {
    let url = upstream_url(state, &request);
    let headers = request.headers().clone();
    let method = request.method().clone();
    let incoming = hyper::upgrade::on(&mut request);

    let mut upstream = state.client.request(method, &url);
    for (name, value) in &headers {
        if name != HOST && name != CONTENT_LENGTH {
            upstream = upstream.header(name, value);
        }
    }
    let upstream = upstream.send().await?;
    if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(status = %upstream.status(), "Upstream declined the upgrade");
        let mut response = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers() {
            if name != TRANSFER_ENCODING && name != CONTENT_LENGTH && name != CONNECTION {
                response = response.header(name, value);
            }
        }
        return Ok(response.body(Body::from_stream(upstream.bytes_stream()))?);
    }

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in upstream.headers() {
        response = response.header(name, value);
    }
    let mut upstream = upstream.upgrade().await?;
    let server = state.listener.server.clone();
    tokio::spawn(async move {
        match incoming.await {
            Ok(incoming) => {
                let mut incoming = hyper_util::rt::TokioIo::new(incoming);
                match tokio::io::copy_bidirectional(&mut incoming, &mut upstream).await {
                    Ok((from_client, from_server)) => {
                        debug!(server = %server, from_client, from_server, "Upgraded connection closed");
                    }
                    Err(e) => debug!(server = %server, error = %e, "Upgraded connection failed"),
                }
            }
            Err(e) => warn!(server = %server, error = %e, "Client connection was not upgraded"),
        }
    });
    Ok(response.body(Body::empty())?)
}

/// Serve every listener of `config` until one of them fails
pub async fn run(config: ProxyConfig, key: VerifyingKey) -> anyhow::Result<()> {
    if config.listeners.is_empty() {
        anyhow::bail!("Signer proxy configuration has no listeners");
    }
    let key = Arc::new(key);
    let mut servers = Vec::new();
    for listener in config.listeners {
        let addr = SocketAddr::from(([0, 0, 0, 0], u16::try_from(listener.listen_port)?));
        info!(
            addr = %addr,
            upstream = %listener.upstream,
            server = %listener.server,
            "Starting signer proxy listener"
        );
        let app = listener_router(ListenerState::new(listener, &config.workspace_id, key.clone()));
        let socket = TcpListener::bind(addr).await?;
        servers.push(async move { axum::serve(socket, app).await });
    }
    futures::future::try_join_all(servers).await?;
    Ok(())
}
