//! HTTP handlers and server lifecycle for Relay.
//!
//! `GET /ws/:channel` upgrades to a socket bound to one channel; the rest of
//! the connection lifecycle runs in `relay_core::connection`.

use crate::config::{BrokerConfig, BrokerKind, Config};
use crate::metrics::{self, ConnectionMetricsGuard, MeteredPublisher};
use crate::session::{QuerySession, SessionLookup};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, Path, Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use relay_broker::{
    BrokerError, Ensured, MemoryBroker, NsqPublisher, NsqSubscriber, Subscriber,
    SubscriptionRegistry,
};
use relay_core::{connection, CloseReason, Hub, Publisher, User};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Local fan-out hub.
    pub hub: Hub,
    /// Per-process broker subscription.
    pub registry: Arc<SubscriptionRegistry>,
    /// Publishes inbound client messages to the broker.
    pub publisher: Arc<dyn Publisher>,
    pub sessions: Arc<dyn SessionLookup>,
    /// Server configuration.
    pub config: Config,
}

/// Build the broker seams selected by `config.kind`.
///
/// # Errors
///
/// Returns an error if an NSQ client cannot be built.
pub fn build_broker(config: &BrokerConfig) -> Result<(Arc<dyn Publisher>, Arc<dyn Subscriber>)> {
    match config.kind {
        BrokerKind::Nsq => {
            let publisher =
                NsqPublisher::new(&config.nsqd_http_address, &config.topic, config.publish_timeout())
                    .context("Failed to create NSQ publisher")?;
            let subscriber = NsqSubscriber::new(config.consumer_config())
                .context("Failed to create NSQ subscriber")?;
            info!(nsqd = %config.nsqd_http_address, lookupd = ?config.lookupd_http_addresses, "Using NSQ broker");
            Ok((Arc::new(MeteredPublisher::new(publisher)), Arc::new(subscriber)))
        }
        BrokerKind::Memory => {
            let broker = MemoryBroker::new();
            info!("Using in-process broker");
            Ok((
                Arc::new(MeteredPublisher::new(broker.publisher(config.topic.clone()))),
                Arc::new(broker),
            ))
        }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/:channel", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until ctrl-c or SIGTERM.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let (publisher, subscriber) = build_broker(&config.broker)?;
    let hub = Hub::start();
    let registry = Arc::new(SubscriptionRegistry::new(subscriber, config.broker.topic.clone()));
    info!(topic = %registry.topic(), group = %registry.group(), "Delivery group");

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let background = [
        tokio::spawn(keep_subscribed(
            Arc::clone(&registry),
            hub.clone(),
            config.broker.subscribe_retry(),
        )),
        tokio::spawn(export_hub_stats(hub.clone())),
    ];

    let state = Arc::new(AppState {
        hub: hub.clone(),
        registry: Arc::clone(&registry),
        publisher,
        sessions: Arc::new(QuerySession),
        config: config.clone(),
    });
    let app = router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Relay server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws/{{channel}}", addr);

    let shutdown = {
        let registry = Arc::clone(&registry);
        let hub = hub.clone();
        async move {
            shutdown_signal().await;
            info!("Shutting down");
            registry.shutdown().await;
            hub.shutdown().await;
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    for task in background {
        task.abort();
    }
    info!("Relay server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
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
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Keep a broker subscription running, re-creating it whenever the consumer
/// is missing or has stopped.
async fn keep_subscribed(registry: Arc<SubscriptionRegistry>, hub: Hub, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while hub.is_running() {
        ticker.tick().await;
        ensure_subscribed(&registry, &hub).await;
    }
}

/// One subscription attempt; failures are logged and left to the next tick.
async fn ensure_subscribed(registry: &SubscriptionRegistry, hub: &Hub) {
    match registry.ensure_subscription(hub).await {
        Ok(Ensured::Created) => info!("Broker subscription established"),
        Ok(Ensured::Existing | Ensured::Pending) => {}
        Err(BrokerError::Closed) => {}
        Err(e) => {
            warn!(error = %e, "Broker subscription unavailable, serving local traffic only");
            metrics::record_error("subscription");
        }
    }
}

async fn export_hub_stats(hub: Hub) {
    let mut ticker = interval(Duration::from_secs(5));
    while hub.is_running() {
        ticker.tick().await;
        metrics::record_hub_stats(&hub.stats());
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": if state.hub.is_running() { "ok" } else { "stopping" },
        "version": env!("CARGO_PKG_VERSION"),
        "clients": state.hub.client_count(),
        "subscribed": state.registry.is_active().await,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(channel): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user = match state.sessions.lookup(&query, &headers) {
        Ok(user) => user,
        Err(e) => {
            debug!(channel = %channel, error = %e, "Upgrade rejected");
            return e.into_response();
        }
    };

    if !state.registry.is_active().await {
        let registry = Arc::clone(&state.registry);
        let hub = state.hub.clone();
        tokio::spawn(async move { ensure_subscribed(&registry, &hub).await });
    }

    let socket = &state.config.socket;
    ws.max_message_size(socket.max_message_size)
        .read_buffer_size(socket.read_buffer_size)
        .write_buffer_size(socket.write_buffer_size)
        .on_upgrade(move |socket| handle_websocket(socket, user, channel, state))
}

/// Run one upgraded connection to completion.
async fn handle_websocket(socket: WebSocket, user: User, channel: String, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let handle = match connection::start(
        socket,
        user,
        channel.clone(),
        &state.hub,
        Arc::clone(&state.publisher),
        state.config.socket.connection_config(),
    ) {
        Ok(handle) => handle,
        Err(e) => {
            warn!(channel = %channel, error = %e, "Connection refused");
            metrics::record_error("hub");
            return;
        }
    };

    let id = handle.id();
    let reason = handle.closed().await;
    metrics::record_close(close_label(reason));
    debug!(client = %id, channel = %channel, reason = ?reason, "WebSocket disconnected");
}

fn close_label(reason: CloseReason) -> &'static str {
    match reason {
        CloseReason::PeerClosed(_) => "peer_closed",
        CloseReason::Timeout => "timeout",
        CloseReason::ProtocolViolation => "protocol",
        CloseReason::PublishRejected => "publish_rejected",
        CloseReason::TransportFailed => "transport",
        CloseReason::WriterClosed => "writer_closed",
        CloseReason::Aborted => "aborted",
    }
}
