use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::{services, state::AppState};
use crate::config::BrokerConfig;
use crate::queue::{FjallQueue, QueueBroker};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Build the broker router over `state`
pub fn router(state: AppState) -> Router {
    // Leave headroom so oversized bodies reach the handler and get a JSON 413
    let body_limit = state.max_message_bytes.saturating_add(1024);

    Router::new()
        .route("/health", get(services::health))
        .route(
            "/queues/{queue}",
            put(services::declare_queue).get(services::queue_stats),
        )
        .route(
            "/queues/{queue}/messages",
            post(services::publish_message).delete(services::purge_queue),
        )
        .route("/queues/{queue}/consumers", post(services::subscribe))
        .route("/consumers/{consumer_id}", delete(services::cancel_consumer))
        .route(
            "/consumers/{consumer_id}/deliveries",
            post(services::next_delivery),
        )
        .route(
            "/consumers/{consumer_id}/deliveries/{tag}/ack",
            post(services::ack_delivery),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(body_limit)),
        )
}

/// Run the broker until interrupted
pub async fn run(config: &BrokerConfig) -> Result<(), AnyError> {
    info!(path = %config.data_path.display(), "Opening queue store");
    let store = FjallQueue::open(&config.data_path)
        .map_err(|e| format!("Failed to open queue store: {}", e))?;

    let broker = Arc::new(QueueBroker::new(
        store,
        config.consumer_timeout.as_duration(),
    ));
    let state = AppState::new(broker.clone(), config.max_message_bytes.as_usize());
    let metrics = state.metrics.clone();

    let reaper = tokio::spawn(reap_consumers(broker.clone()));

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(address = %config.bind_addr, "Broker listening");

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(crate::shutdown::shutdown_signal())
        .await?;

    reaper.abort();
    if let Err(e) = broker.flush().await {
        warn!(error = %e, "Failed to flush queue store on shutdown");
    }
    metrics.log_summary("broker");

    Ok(())
}

/// Periodically requeue deliveries of consumers that stopped polling
async fn reap_consumers(broker: Arc<QueueBroker>) {
    let period = (broker.consumer_timeout() / 4).max(std::time::Duration::from_millis(100));
    let mut ticker = tokio::time::interval(period);

    loop {
        ticker.tick().await;
        broker.reap_expired().await;
    }
}
