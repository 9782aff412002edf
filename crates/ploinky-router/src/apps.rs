//! HTTP handlers for the session-multiplexed apps
//!
//! `/{app}/stream` opens the SSE channel, `/{app}/input` writes to the
//! tab's PTY, `/{app}/resize` adjusts the terminal. Sessions ride on a
//! per-app cookie scoped to `/{app}`.

use crate::error::RouterError;
use crate::identity::cookie_value;
use crate::session::{AppSessions, Session, SseFrame, StreamConn, APPS};
use crate::{webchat, RouterState};
use axum::body::Bytes;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use ploinky_core::is_safe_id;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

/// Keepalive ping cadence on SSE channels.
pub const SSE_PING_INTERVAL: Duration = Duration::from_secs(30);

fn app_sessions(state: &RouterState, app: &str) -> Result<Arc<AppSessions>, RouterError> {
    if !APPS.contains(&app) {
        return Err(RouterError::NotFound);
    }
    state.apps.get(app).cloned().ok_or(RouterError::NotFound)
}

fn tab_id(params: &HashMap<String, String>) -> Result<String, RouterError> {
    let tab_id = params
        .get("tabId")
        .ok_or_else(|| RouterError::BadRequest("missing tabId".to_string()))?;
    if !is_safe_id(tab_id) {
        return Err(RouterError::BadRequest("invalid tabId".to_string()));
    }
    Ok(tab_id.clone())
}

fn session_cookie(app: &str) -> String {
    format!("{app}_sid")
}

async fn existing_session(
    app: &Arc<AppSessions>,
    headers: &HeaderMap,
) -> Result<Arc<Session>, RouterError> {
    let cookie = cookie_value(headers, &session_cookie(app.name));
    match cookie {
        Some(id) => app.session(&id).await.ok_or(RouterError::TabGone),
        None => Err(RouterError::TabGone),
    }
}

/// `GET /{app}/stream?tabId=T`
pub async fn stream(
    State(state): State<Arc<RouterState>>,
    AxumPath(app): AxumPath<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let app_sessions = match app_sessions(&state, &app) {
        Ok(app) => app,
        Err(e) => return e.into_response(),
    };
    let tab = match tab_id(&params) {
        Ok(tab) => tab,
        Err(e) => return e.into_response(),
    };

    let cookie = cookie_value(&headers, &session_cookie(app_sessions.name));
    let (session, minted) = app_sessions.session_for(cookie).await;

    let conn = match app_sessions
        .open_stream(&session, &tab, state.tty_factory.as_ref())
        .await
    {
        Ok(conn) => conn,
        Err(e) => return e.into_response(),
    };

    let mut response = sse_response(conn);
    if let Some(id) = minted {
        let cookie = format!(
            "{}={}; HttpOnly; SameSite=Strict; Path=/{}{}",
            session_cookie(app_sessions.name),
            id,
            app_sessions.name,
            if state.config.secure_cookies {
                "; Secure"
            } else {
                ""
            }
        );
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

/// Turn a stream connection into an SSE response: a `: connected`
/// comment, then one `data:` frame per output chunk, then `event:
/// close` and end-of-stream.
fn sse_response(conn: StreamConn) -> Response {
    let StreamConn { rx, guard } = conn;

    let opening = futures::stream::once(async {
        Ok::<Event, Infallible>(Event::default().comment("connected"))
    });

    let frames = futures::stream::unfold(
        (rx, Some(guard), false),
        |(mut rx, guard, done)| async move {
            if done {
                return None;
            }
            match rx.recv().await {
                Some(SseFrame::Data(payload)) => {
                    Some((Ok(Event::default().data(payload)), (rx, guard, false)))
                }
                Some(SseFrame::Close) | None => Some((
                    Ok(Event::default().event("close").data("{}")),
                    (rx, guard, true),
                )),
            }
        },
    );

    use futures::StreamExt;
    Sse::new(opening.chain(frames))
        .keep_alive(
            KeepAlive::new()
                .interval(SSE_PING_INTERVAL)
                .event(Event::default().event("ping")),
        )
        .into_response()
}

/// `POST /{app}/input?tabId=T` — the raw body goes to the PTY in
/// request order.
pub async fn input(
    State(state): State<Arc<RouterState>>,
    AxumPath(app): AxumPath<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = async {
        let app_sessions = app_sessions(&state, &app)?;
        let tab_id = tab_id(&params)?;
        let session = existing_session(&app_sessions, &headers).await?;
        let tab = session.tab(&tab_id).await.ok_or(RouterError::TabGone)?;

        if app_sessions.name == "webchat" {
            webchat::write_envelope(&tab, &body).await?;
        } else {
            tab.write(&body).await?;
        }
        Ok::<_, RouterError>(())
    }
    .await;

    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ResizeBody {
    pub cols: u16,
    pub rows: u16,
}

/// `POST /{app}/resize?tabId=T`
pub async fn resize(
    State(state): State<Arc<RouterState>>,
    AxumPath(app): AxumPath<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    axum::Json(size): axum::Json<ResizeBody>,
) -> Response {
    let result = async {
        let app_sessions = app_sessions(&state, &app)?;
        let tab_id = tab_id(&params)?;
        let session = existing_session(&app_sessions, &headers).await?;
        let tab = session.tab(&tab_id).await.ok_or(RouterError::TabGone)?;
        tab.resize(size.cols, size.rows)
    }
    .await;

    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

/// `GET /{app}/assets/{*rest}` — static assets for the app shells,
/// served from `.ploinky/ui/<app>/` when present.
pub async fn assets(
    State(state): State<Arc<RouterState>>,
    AxumPath((app, rest)): AxumPath<(String, String)>,
) -> Response {
    if !APPS.contains(&app.as_str()) {
        return RouterError::NotFound.into_response();
    }
    for segment in rest.split('/') {
        if segment == ".." {
            return RouterError::BadRequest("path traversal".to_string()).into_response();
        }
    }

    let file = state.store.dot_dir().join("ui").join(&app).join(&rest);
    match tokio::fs::read(&file).await {
        Ok(data) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, crate::proxy::mime_for(&file))
            .body(axum::body::Body::from(data))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(_) => RouterError::NotFound.into_response(),
    }
}

/// `GET /status/api` — fleet status snapshot for the dashboard.
pub async fn status_api(State(state): State<Arc<RouterState>>) -> Response {
    let snapshot = state.cache.snapshot();
    let mut agents: Vec<serde_json::Value> = snapshot
        .agents
        .values()
        .map(|record| {
            serde_json::json!({
                "agent": record.agent_name,
                "repo": record.repo_name,
                "container": record.container_name,
                "status": record.status.to_string(),
                "healthy": record.healthy,
                "ready": record.ready,
                "ports": record.host_port_bindings,
                "lastError": record.last_error,
            })
        })
        .collect();
    agents.sort_by_key(|v| v["agent"].as_str().unwrap_or_default().to_string());

    axum::Json(serde_json::json!({
        "port": snapshot.routing.port,
        "agents": agents,
    }))
    .into_response()
}
