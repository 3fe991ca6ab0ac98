use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use clippa_party::{HubRegistry, TokenService};
use clippa_store::{Database, PartyRepo};

use crate::config::ServerConfig;
use crate::handlers;
use crate::session::SessionConfig;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub parties: PartyRepo,
    pub registry: HubRegistry,
    pub tokens: Arc<TokenService>,
    pub session: SessionConfig,
    pub secret_cost: u32,
    /// Cancelled when the server shuts down; ends every live session.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: &ServerConfig, db: Database, shutdown: CancellationToken) -> Self {
        let parties = PartyRepo::new(db);
        let registry = HubRegistry::new(
            Arc::new(parties.clone()),
            config.hub.clone(),
            config.retention,
        );
        Self {
            parties,
            registry,
            tokens: Arc::new(TokenService::new(config.token.clone())),
            session: config.session.clone(),
            secret_cost: config.secret_cost,
            shutdown,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/parties/",
            post(handlers::create_party).get(handlers::get_party),
        )
        .route(
            "/api/parties",
            post(handlers::create_party).get(handlers::get_party),
        )
        .route("/api/parties/auth", get(handlers::authenticate))
        .route("/api/parties/join", get(handlers::join_party))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve until `shutdown` is cancelled.
pub async fn start(
    config: ServerConfig,
    db: Database,
    shutdown: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(&config, db, shutdown.clone());
    let router = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, retention = ?config.retention, "clippa server started");

    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
    });

    Ok(ServerHandle {
        addr,
        state,
        shutdown,
        task,
    })
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting connections and end live sessions.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the serve loop to exit.
    pub async fn wait(self) -> Result<(), std::io::Error> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let db = Database::in_memory().unwrap();
        let handle = start(test_config(), db, CancellationToken::new())
            .await
            .unwrap();
        assert!(handle.port() > 0);

        let url = format!("http://{}/health", handle.addr());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["parties"], 0);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let db = Database::in_memory().unwrap();
        let handle = start(test_config(), db, CancellationToken::new())
            .await
            .unwrap();
        let url = format!("http://{}/nope", handle.addr());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn shutdown_stops_serve_loop() {
        let db = Database::in_memory().unwrap();
        let handle = start(test_config(), db, CancellationToken::new())
            .await
            .unwrap();
        handle.shutdown();
        handle.wait().await.unwrap();
    }

    #[test]
    fn state_shares_one_registry() {
        let db = Database::in_memory().unwrap();
        let state = AppState::new(&test_config(), db, CancellationToken::new());
        let cloned = state.clone();
        let id = clippa_core::ids::PartyId::from_raw("party_x");
        state.registry.get_or_create(&id);
        assert!(cloned.registry.contains(&id));
    }
}
