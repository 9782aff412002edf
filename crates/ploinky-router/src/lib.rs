//! HTTP front door for a ploinky workspace
//!
//! One listener, path-prefix dispatch: session-multiplexed apps
//! (webtty, webchat, webmeet, dashboard, status), reverse proxy to
//! agent host ports under `/apis` and `/mcps`, blob storage, and a
//! static-agent fallback. Shutdown drains every live SSE sink and PTY
//! before the process exits, with a hard deadline.

pub mod apps;
pub mod blob;
pub mod cache;
pub mod error;
pub mod identity;
pub mod proxy;
pub mod session;
pub mod tty;
pub mod webchat;

pub use error::{Result, RouterError};

use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use cache::ConfigCache;
use ploinky_core::WorkspaceStore;
use session::{AppSessions, APPS};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tty::{ExecTtyFactory, TtyFactory};

/// Hard deadline for the graceful drain.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(10);
/// Idle timeout for proxied non-SSE requests.
pub const PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// Router process configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub workspace_root: PathBuf,
    /// Overrides the routing table's port when set
    pub port: Option<u16>,
    /// TTL of the on-disk config cache; zero reloads per read
    pub cache_ttl: Duration,
    /// CLI used for terminal attach ("docker" or "podman")
    pub runtime_cmd: String,
    /// Disable TTY allocation on interactive execs
    pub no_tty: bool,
    /// Mark session cookies `Secure`
    pub secure_cookies: bool,
}

impl RouterConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            port: None,
            cache_ttl: Duration::ZERO,
            runtime_cmd: "docker".to_string(),
            no_tty: false,
            secure_cookies: false,
        }
    }

    pub fn from_global(
        workspace_root: impl Into<PathBuf>,
        global: &ploinky_config::GlobalConfig,
    ) -> Self {
        let mut config = Self::new(workspace_root);
        config.port = global.router_port;
        config.cache_ttl = global.config_cache_ttl();
        if !global.runtime.is_empty() {
            config.runtime_cmd = global.runtime.clone();
        }
        config.no_tty = global.no_tty;
        config
    }
}

/// Pluggable authentication collaborator; the default deployment has
/// none and reports `sso_not_configured`.
#[async_trait::async_trait]
pub trait AuthGateway: Send + Sync {
    async fn handle(&self, path: &str, headers: &HeaderMap) -> Response;
}

/// No identity provider configured.
pub struct NoAuth;

#[async_trait::async_trait]
impl AuthGateway for NoAuth {
    async fn handle(&self, _path: &str, _headers: &HeaderMap) -> Response {
        RouterError::SsoNotConfigured.into_response()
    }
}

/// Shared state behind every handler.
pub struct RouterState {
    pub config: RouterConfig,
    pub store: Arc<WorkspaceStore>,
    pub cache: ConfigCache,
    pub apps: HashMap<&'static str, Arc<AppSessions>>,
    pub http: reqwest::Client,
    /// Client without timeouts, for SSE passthrough
    pub stream_http: reqwest::Client,
    pub tty_factory: Arc<dyn TtyFactory>,
    pub auth: Arc<dyn AuthGateway>,
}

impl RouterState {
    pub fn new(config: RouterConfig, store: Arc<WorkspaceStore>) -> anyhow::Result<Arc<Self>> {
        let factory: Arc<dyn TtyFactory> = Arc::new(ExecTtyFactory::new(
            config.runtime_cmd.clone(),
            store.clone(),
            config.no_tty,
        ));
        Self::with_tty_factory(config, store, factory)
    }

    /// Build state with an injected terminal factory (tests, embedded
    /// setups).
    pub fn with_tty_factory(
        config: RouterConfig,
        store: Arc<WorkspaceStore>,
        tty_factory: Arc<dyn TtyFactory>,
    ) -> anyhow::Result<Arc<Self>> {
        let cache = ConfigCache::new(store.clone(), config.cache_ttl);

        let mut apps = HashMap::new();
        for app in APPS {
            apps.insert(app, AppSessions::new(app));
        }

        let http = reqwest::Client::builder()
            .timeout(PROXY_TIMEOUT)
            .build()?;
        let stream_http = reqwest::Client::builder().build()?;

        Ok(Arc::new(Self {
            config,
            store,
            cache,
            apps,
            http,
            stream_http,
            tty_factory,
            auth: Arc::new(NoAuth),
        }))
    }
}

async fn auth_entry(
    axum::extract::State(state): axum::extract::State<Arc<RouterState>>,
    request: axum::extract::Request,
) -> Response {
    let path = request.uri().path().to_string();
    state.auth.handle(&path, request.headers()).await
}

/// Assemble the router over shared state.
pub fn build_router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/auth", any(auth_entry))
        .route("/auth/{*rest}", any(auth_entry))
        .route("/blobs", post(blob::upload_root))
        .route("/blobs/{key}", any(blob::key_entry))
        .route("/blobs/{agent}/{id}", any(blob::agent_entry))
        .route("/status/api", get(apps::status_api))
        .route("/apis/{agent}/{*rest}", any(proxy::api_proxy))
        .route("/mcps/{agent}/{*rest}", any(proxy::api_proxy))
        .route("/{app}/stream", get(apps::stream))
        .route("/{app}/assets/{*rest}", get(apps::assets))
        .route("/{app}/input", post(apps::input))
        .route("/{app}/resize", post(apps::resize))
        .fallback(proxy::front_door)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Drain every app: close frames to live sinks, dispose PTYs, clear
/// session maps.
pub async fn drain_all(state: &RouterState) {
    for app in state.apps.values() {
        app.drain().await;
    }
}

/// Run the router until the shutdown token fires, then drain with the
/// hard deadline.
pub async fn run(config: RouterConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let store = Arc::new(WorkspaceStore::open(&config.workspace_root)?);
    let routing = store.load_routing();
    let port = config.port.unwrap_or(routing.port);

    let state = RouterState::new(config, store)?;
    let router = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("router listening on port {port}");

    // the drain is what lets long-lived SSE connections finish
    let drain_state = state.clone();
    let drain_token = shutdown.clone();
    tokio::spawn(async move {
        drain_token.cancelled().await;
        drain_all(&drain_state).await;
    });

    let graceful = shutdown.clone();
    let serve = async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { graceful.cancelled().await })
            .await
    };

    tokio::select! {
        result = serve => result?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(DRAIN_DEADLINE).await;
        } => {
            tracing::warn!("drain deadline exceeded, forcing shutdown");
        }
    }

    Ok(())
}
