// Event Router HTTP server
// Exposes the subscription engine over WebSocket and SSE

//! # Event Router Server Module
//!
//! The server layer sits on top of the engine and owns everything HTTP:
//!
//! ```text
//! Client (WebSocket / SSE)
//!        ↓ GraphQL subscription protocols
//! Server Layer (this module) ← axum routes, protocol codecs, sessions
//!        ↓ subscribe / unsubscribe / release
//! Engine Layer ← registry, resolver, connections, event sources
//! ```
//!
//! ## Routes
//!
//! - `GET /graphql` (upgrade): `graphql-transport-ws` or legacy `graphql-ws`
//! - `POST /graphql` with `Accept: text/event-stream`: one subscription per
//!   response
//! - `GET /health`: liveness
//! - `GET /health/subscriptions`: subscription counters as JSON
//!
//! ## Rust Learning Notes:
//!
//! ### Shared State in axum
//! [`AppState`] is cheap to clone (every field is an `Arc` or a
//! `Copy` value), which is what axum's `State` extractor expects.

use std::future::Future;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router, Server,
};
use serde::Serialize;
use serde_json::Value;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::config::{EngineConfig, RouterConfig};
use crate::engine::{
    connection::ConnectionManager,
    entities::EntitySource,
    metrics::{Counters, CountersSnapshot},
    registry::SubscriptionRegistry,
    resolver::EventResolver,
    sources::{EventSource, SourceRegistry},
};
use crate::models::event::errors_payload;
use crate::models::GraphQLError;
use crate::{EventRouterError, Result};

/// graphql-transport-ws and legacy graphql-ws codecs
pub mod protocol;

/// Socket read strategies (readiness vs. read deadline)
pub mod readiness;

/// SSE subscription handler
pub mod sse;

/// WebSocket subscription handler
pub mod websocket;

#[cfg(test)]
mod transport_tests;

pub use protocol::WsProtocol;
pub use readiness::ReadinessStrategy;

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SubscriptionRegistry>,
    pub connections: ConnectionManager,
    pub engine: Arc<EngineConfig>,
    pub block_subscriptions: bool,
    pub counters: Arc<Counters>,
}

impl AppState {
    pub fn readiness(&self) -> ReadinessStrategy {
        ReadinessStrategy::from_config(&self.engine)
    }

    /// Drains the registry, then closes whatever connections are left
    pub async fn shutdown(&self, drain: Duration) {
        self.registry.shutdown(drain).await;
        self.connections.shutdown().await;
    }
}

/// The single error payload sent when subscriptions are blocked
pub fn blocked_payload() -> Value {
    errors_payload(&[GraphQLError::new(
        EventRouterError::SubscriptionsBlocked.to_string(),
    )])
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/graphql",
            get(websocket::graphql_ws_handler).post(sse::graphql_sse_handler),
        )
        .route("/health", get(health_check))
        .route("/health/subscriptions", get(subscription_health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// A configured router, ready to serve
pub struct RouterServer {
    state: AppState,
    listen_addr: String,
    shutdown_delay: Duration,
}

impl RouterServer {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn app(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Binds `listen_addr` and serves until Ctrl-C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr)?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serves on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let state = self.state.clone();
        let delay = self.shutdown_delay;

        info!("🚀 Event router listening on http://{}", addr);
        info!("📡 GraphQL WebSocket: ws://{}/graphql", addr);
        info!("🌊 GraphQL SSE: POST http://{}/graphql", addr);
        info!("📊 Subscription health: http://{}/health/subscriptions", addr);
        if state.block_subscriptions {
            warn!("⛔ Subscriptions are blocked by configuration");
        }

        Server::from_tcp(listener)
            .map_err(|e| EventRouterError::Internal(format!("failed to start server: {}", e)))?
            .serve(self.app().into_make_service())
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("🛑 Shutdown requested, draining subscriptions");
                state.shutdown(delay).await;
            })
            .await
            .map_err(|e| EventRouterError::Internal(format!("server error: {}", e)))?;

        info!("👋 Event router stopped");
        Ok(())
    }
}

/// Builder for [`RouterServer`]
pub struct RouterServerBuilder {
    config: RouterConfig,
    sources: Option<SourceRegistry>,
    entity_source: Option<Arc<dyn EntitySource>>,
    counters: Option<Arc<Counters>>,
}

impl RouterServerBuilder {
    pub fn new() -> Self {
        Self {
            config: RouterConfig::default(),
            sources: None,
            entity_source: None,
            counters: None,
        }
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Uses these sources instead of connecting the configured providers
    pub fn with_sources(mut self, sources: SourceRegistry) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn with_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.sources.get_or_insert_with(SourceRegistry::new).insert(source);
        self
    }

    pub fn with_entity_source(mut self, source: Arc<dyn EntitySource>) -> Self {
        self.entity_source = Some(source);
        self
    }

    /// Counters to update; the process-wide instance when not set
    pub fn with_counters(mut self, counters: Arc<Counters>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub async fn build(self) -> Result<RouterServer> {
        let config = self.config;
        config.validate()?;

        let sources = match self.sources {
            Some(sources) => sources,
            None => SourceRegistry::from_config(&config.providers).await?,
        };
        for event in &config.events {
            if sources.get(&event.provider_id).is_err() {
                return Err(EventRouterError::Config(format!(
                    "field '{}' references provider '{}' which has no event source",
                    event.field_name, event.provider_id
                )));
            }
        }

        let entity_source = match self.entity_source {
            Some(source) => Some(source),
            None => config.entities.build()?,
        };
        let resolver = match entity_source {
            Some(source) => EventResolver::new().with_entity_source(source),
            None => EventResolver::new(),
        };

        let counters = self.counters.unwrap_or_else(Counters::global);
        let catalog = config.catalog();
        info!(
            fields = catalog.len(),
            providers = ?sources.provider_ids(),
            "📋 Events catalog loaded"
        );

        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::new(sources),
            Arc::new(catalog),
            Arc::new(resolver),
            Arc::clone(&counters),
            config.engine.resolver_concurrency,
        )
        .with_inbox_capacity(config.engine.outbound_queue_size));
        let connections =
            ConnectionManager::new(Arc::clone(&registry), config.engine.connection_settings());

        Ok(RouterServer {
            state: AppState {
                registry,
                connections,
                block_subscriptions: config.security.block_subscriptions,
                engine: Arc::new(config.engine.clone()),
                counters,
            },
            shutdown_delay: config.shutdown_delay(),
            listen_addr: config.listen_addr,
        })
    }

    pub async fn build_and_run(self) -> Result<()> {
        self.build().await?.run().await
    }
}

impl Default for RouterServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[derive(Debug, Serialize)]
struct SubscriptionHealth {
    #[serde(flatten)]
    counters: CountersSnapshot,
    bindings: usize,
    accepting: bool,
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "Event router is running")
}

async fn subscription_health(State(state): State<AppState>) -> Json<SubscriptionHealth> {
    Json(SubscriptionHealth {
        counters: state.counters.snapshot(),
        bindings: state.registry.active_bindings().len(),
        accepting: state.registry.is_accepting(),
    })
}
