//! Reverse proxy to agent containers
//!
//! `/apis/<agent>/...` and `/mcps/<agent>/...` are forwarded to the
//! agent's persisted host-port binding on loopback; the router never
//! asks the runtime where an agent lives. SSE responses pass through
//! unbuffered.

use crate::error::RouterError;
use crate::identity::Identity;
use crate::RouterState;
use axum::body::Body;
use axum::extract::{Path as AxumPath, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use ploinky_core::{is_safe_id, AgentStatus};
use std::sync::Arc;

/// Header carrying the upstream status on 5xx pass-through.
pub const UPSTREAM_HEADER: &str = "x-ploinky-upstream";

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// `ANY /apis/{agent}/{*rest}` and `ANY /mcps/{agent}/{*rest}`
pub async fn api_proxy(
    State(state): State<Arc<RouterState>>,
    AxumPath((agent, rest)): AxumPath<(String, String)>,
    request: Request,
) -> Response {
    proxy_to_agent(&state, &agent, &format!("/{rest}"), request).await
}

/// Forward one request to an agent's host port.
pub async fn proxy_to_agent(
    state: &RouterState,
    agent: &str,
    path: &str,
    request: Request,
) -> Response {
    if !is_safe_id(agent) {
        return RouterError::BadRequest("invalid agent id".to_string()).into_response();
    }
    if path.split('/').any(|segment| segment == "..") {
        return RouterError::BadRequest("path traversal".to_string()).into_response();
    }

    let snapshot = state.cache.snapshot();
    let Some(record) = snapshot.resolve_agent(agent) else {
        return RouterError::AgentNotEnabled.into_response();
    };
    if record.status == AgentStatus::CircuitOpen {
        return RouterError::CircuitOpen.into_response();
    }
    if !record.is_ready() {
        return RouterError::AgentNotReady.into_response();
    }
    let Some(binding) = record.primary_host_port() else {
        return RouterError::AgentNotEnabled.into_response();
    };

    let query = request
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();

    // WebSocket and other upgrades tunnel raw bytes both ways
    if request.headers().contains_key(header::UPGRADE) {
        return upgrade_proxy(request, binding.host_port, &format!("{path}{query}")).await;
    }

    let target = format!("http://127.0.0.1:{}{}{}", binding.host_port, path, query);

    let method = match reqwest::Method::from_bytes(request.method().as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };

    let is_sse = request
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    let identity = Identity::from_headers(request.headers());
    let mut outgoing = forwarded_headers(request.headers());
    identity.apply(&mut outgoing);

    let client = if is_sse {
        &state.stream_http
    } else {
        &state.http
    };

    let body_stream = request
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);
    let upstream = client
        .request(method, &target)
        .headers(outgoing)
        .body(reqwest::Body::wrap_stream(body_stream))
        .send()
        .await;

    let upstream = match upstream {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("proxy to {target} failed: {e}");
            return RouterError::Upstream { status: None }.into_response();
        }
    };

    let status = upstream.status();
    let mut builder = Response::builder().status(status.as_u16());

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }

        let is_event_stream = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);
        if is_event_stream {
            // no buffering between the agent and the browser
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        }

        if status.is_server_error() {
            if let Ok(value) = HeaderValue::from_str(&status.as_u16().to_string()) {
                headers.insert(UPSTREAM_HEADER, value);
            }
        }
    }

    let stream = upstream.bytes_stream().map_err(std::io::Error::other);
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Tunnel an upgrade request (RFC 6455 WebSocket and friends): replay
/// the request head to the agent's port, mirror the response head back,
/// then splice bytes in both directions once the client upgrade
/// completes.
async fn upgrade_proxy(request: Request, port: u16, path_and_query: &str) -> Response {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut upstream = match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("upgrade connect to port {port} failed: {e}");
            return RouterError::Upstream { status: None }.into_response();
        }
    };
    // no buffering on interactive streams
    let _ = upstream.set_nodelay(true);

    let mut head = format!("{} {} HTTP/1.1\r\n", request.method(), path_and_query);
    head.push_str(&format!("Host: 127.0.0.1:{port}\r\n"));
    for (name, value) in request.headers() {
        if name == header::HOST {
            continue;
        }
        if let Ok(value) = value.to_str() {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    head.push_str("\r\n");

    if upstream.write_all(head.as_bytes()).await.is_err() {
        return RouterError::Upstream { status: None }.into_response();
    }

    // read the upstream response head; anything past it already belongs
    // to the upgraded stream
    let mut buf = Vec::with_capacity(1024);
    let head_end = loop {
        let mut chunk = [0u8; 1024];
        let n = match upstream.read(&mut chunk).await {
            Ok(0) | Err(_) => return RouterError::Upstream { status: None }.into_response(),
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        if buf.len() > 64 * 1024 {
            return RouterError::Upstream { status: None }.into_response();
        }
    };

    let (status, upstream_headers) = match parse_response_head(&buf[..head_end]) {
        Some(parsed) => parsed,
        None => return RouterError::Upstream { status: None }.into_response(),
    };
    let leftover = buf[head_end..].to_vec();

    let on_upgrade = hyper::upgrade::on(request);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let mut client = hyper_util::rt::TokioIo::new(upgraded);
                if !leftover.is_empty() && client.write_all(&leftover).await.is_err() {
                    return;
                }
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            }
            Err(e) => tracing::debug!("client upgrade failed: {e}"),
        }
    });

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream_headers {
            if let (Ok(name), Ok(value)) = (
                header::HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.insert(name, value);
            }
        }
    }
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Offset just past the `\r\n\r\n` terminating an HTTP head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Minimal HTTP/1.1 response-head parser: status code plus headers.
fn parse_response_head(head: &[u8]) -> Option<(u16, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next()?;
    let status: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Some((status, headers))
}

/// Copy request headers minus hop-by-hop ones, translating the
/// `X-Forwarded-*` family.
fn forwarded_headers(incoming: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in incoming {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }

    // Host travels as X-Forwarded-Host; an upstream proxy's value wins
    if !headers.contains_key("x-forwarded-host") {
        if let Some(host) = incoming.get(header::HOST) {
            headers.insert("x-forwarded-host", host.clone());
        }
    }
    if !headers.contains_key("x-forwarded-proto") {
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    }
    headers
}

/// Fallback front-door dispatch: `/<agent>/...` for the configured
/// static agent serves files from its host path, or proxies through.
pub async fn front_door(State(state): State<Arc<RouterState>>, request: Request) -> Response {
    let path = request.uri().path().trim_start_matches('/').to_string();
    let (first, rest) = match path.split_once('/') {
        Some((first, rest)) => (first.to_string(), rest.to_string()),
        None => (path.clone(), String::new()),
    };
    if first.is_empty() {
        return RouterError::NotFound.into_response();
    }
    if !is_safe_id(&first) {
        return RouterError::BadRequest("invalid path".to_string()).into_response();
    }

    let snapshot = state.cache.snapshot();
    let Some(static_route) = snapshot.routing.static_route.clone() else {
        return RouterError::NotFound.into_response();
    };
    let matches_static =
        first == static_route.agent || Some(first.as_str()) == static_route.alias.as_deref();
    if !matches_static {
        return RouterError::NotFound.into_response();
    }

    if let Some(ref host_path) = static_route.host_path {
        if let Some(response) = serve_static(state.as_ref(), host_path, &rest).await {
            return response;
        }
    }

    drop(snapshot);
    proxy_to_agent(&state, &static_route.agent.clone(), &format!("/{rest}"), request).await
}

/// Serve one file beneath the static route's host path. Returns `None`
/// when the file does not exist so the caller can fall back to proxying.
async fn serve_static(state: &RouterState, host_path: &str, rest: &str) -> Option<Response> {
    for segment in rest.split('/') {
        if segment == ".." {
            return Some(RouterError::BadRequest("path traversal".to_string()).into_response());
        }
    }

    let root = state
        .store
        .root()
        .join(host_path.trim_start_matches('/'));
    let file = if rest.is_empty() {
        root.join("index.html")
    } else {
        root.join(rest)
    };

    let data = tokio::fs::read(&file).await.ok()?;
    let mime = mime_for(&file);
    Some(
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime)
            .body(Body::from(data))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
    )
}

pub(crate) fn mime_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_headers_strip_hop_by_hop() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::HOST, "front.example".parse().unwrap());
        incoming.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        incoming.insert(header::ACCEPT, "application/json".parse().unwrap());

        let outgoing = forwarded_headers(&incoming);
        assert!(outgoing.get(header::CONNECTION).is_none());
        assert!(outgoing.get(header::HOST).is_none());
        assert_eq!(outgoing.get("x-forwarded-host").unwrap(), "front.example");
        assert_eq!(outgoing.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(outgoing.get(header::ACCEPT).unwrap(), "application/json");
    }

    #[test]
    fn test_existing_forwarded_host_wins() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::HOST, "router.internal".parse().unwrap());
        incoming.insert("x-forwarded-host", "public.example".parse().unwrap());
        incoming.insert("x-forwarded-proto", "https".parse().unwrap());

        let outgoing = forwarded_headers(&incoming);
        assert_eq!(outgoing.get("x-forwarded-host").unwrap(), "public.example");
        assert_eq!(outgoing.get("x-forwarded-proto").unwrap(), "https");
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"HTTP/1.1 101 Switching\r\n\r\n"), Some(26));
        assert_eq!(find_head_end(b"partial head\r\n"), None);
        let with_frames = b"HTTP/1.1 101 S\r\nUpgrade: websocket\r\n\r\n\x81\x05hello";
        let end = find_head_end(with_frames).unwrap();
        assert_eq!(&with_frames[end..], b"\x81\x05hello");
    }

    #[test]
    fn test_parse_response_head() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_response_head(&head[..head.len() - 2]).unwrap();
        assert_eq!(status, 101);
        assert!(headers
            .iter()
            .any(|(name, value)| name == "Upgrade" && value == "websocket"));

        assert!(parse_response_head(b"garbage").is_none());
    }

    #[test]
    fn test_mime_for_common_types() {
        assert_eq!(
            mime_for(std::path::Path::new("index.html")),
            "text/html; charset=utf-8"
        );
        assert_eq!(mime_for(std::path::Path::new("app.js")), "application/javascript");
        assert_eq!(mime_for(std::path::Path::new("blob.bin")), "application/octet-stream");
    }
}
