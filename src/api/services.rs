use std::time::Duration;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::debug;

use super::state::AppState;
use crate::api::error::ApiError;
use crate::messaging::DeliveryMode;
use crate::proto::{
    DeclareRequest, DeliveryQuery, HEADER_DELIVERY_MODE, HEADER_DELIVERY_TAG, HEADER_QUEUE,
    HEADER_REDELIVERED, PurgeResponse, QueueStatsResponse, SubscribeRequest, SubscribeResponse,
};
use crate::queue::QueueStats;

/// Longest a single delivery request may block
pub const MAX_WAIT: Duration = Duration::from_secs(60);

fn stats_response(queue: String, stats: QueueStats) -> QueueStatsResponse {
    QueueStatsResponse {
        queue,
        durable: stats.durable,
        ready: stats.ready,
        unacked: stats.unacked,
        consumers: stats.consumers,
    }
}

/// Declare a queue (PUT /queues/{queue})
///
/// Idempotent: declaring an existing queue with the same durability returns
/// its current counters. A durability mismatch is a 409.
pub async fn declare_queue(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Json(req): Json<DeclareRequest>,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    let stats = state.broker.declare(&queue, req.durable).await?;
    Ok(Json(stats_response(queue, stats)))
}

/// Queue counters (GET /queues/{queue})
pub async fn queue_stats(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    let stats = state.broker.stats(&queue).await?;
    Ok(Json(stats_response(queue, stats)))
}

/// Purge ready messages (DELETE /queues/{queue}/messages)
pub async fn purge_queue(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Result<Json<PurgeResponse>, ApiError> {
    let purged = state.broker.purge(&queue).await?;
    Ok(Json(PurgeResponse { purged }))
}

/// Publish one message (POST /queues/{queue}/messages)
///
/// The request body is the message, stored as-is. `x-delivery-mode: 2`
/// marks it persistent; a missing header means transient.
pub async fn publish_message(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    if body.len() > state.max_message_bytes {
        return Err(ApiError::PayloadTooLarge(body.len()));
    }

    let mode = match headers.get(HEADER_DELIVERY_MODE) {
        None => DeliveryMode::Transient,
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u8>().ok())
            .and_then(DeliveryMode::from_code)
            .ok_or_else(|| {
                ApiError::BadRequest(format!("invalid {} header", HEADER_DELIVERY_MODE))
            })?,
    };

    let seq = state
        .broker
        .publish(&queue, &body, mode.is_persistent())
        .await?;
    state.metrics.message_published();

    debug!(queue = %queue, seq, size = body.len(), ?mode, "Message published");
    Ok(StatusCode::ACCEPTED)
}

/// Register a consumer (POST /queues/{queue}/consumers)
pub async fn subscribe(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Json(req): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<SubscribeResponse>), ApiError> {
    let consumer_id = state.broker.subscribe(&queue, req.prefetch).await?;
    Ok((StatusCode::CREATED, Json(SubscribeResponse { consumer_id })))
}

/// Cancel a consumer, requeueing its unacked deliveries (DELETE /consumers/{id})
pub async fn cancel_consumer(
    State(state): State<AppState>,
    Path(consumer_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.broker.cancel(&consumer_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Long-poll for the next delivery (POST /consumers/{id}/deliveries)
///
/// 200 with the raw message body and delivery headers, or 204 when nothing
/// became available within `wait_ms`.
pub async fn next_delivery(
    State(state): State<AppState>,
    Path(consumer_id): Path<String>,
    Query(query): Query<DeliveryQuery>,
) -> Result<Response, ApiError> {
    let wait = query
        .wait_ms
        .map(Duration::from_millis)
        .unwrap_or_default()
        .min(MAX_WAIT);

    let Some(delivery) = state.broker.next_delivery(&consumer_id, wait).await? else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    state.metrics.message_delivered();

    let queue = HeaderValue::from_str(&delivery.queue)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let headers = [
        (HeaderName::from_static(HEADER_DELIVERY_TAG), HeaderValue::from(delivery.tag)),
        (
            HeaderName::from_static(HEADER_REDELIVERED),
            HeaderValue::from_static(if delivery.redelivered { "true" } else { "false" }),
        ),
        (HeaderName::from_static(HEADER_QUEUE), queue),
    ];

    Ok((StatusCode::OK, headers, delivery.body).into_response())
}

/// Acknowledge a delivery (POST /consumers/{id}/deliveries/{tag}/ack)
pub async fn ack_delivery(
    State(state): State<AppState>,
    Path((consumer_id, tag)): Path<(String, u64)>,
) -> Result<StatusCode, ApiError> {
    state.broker.ack(&consumer_id, tag).await?;
    state.metrics.message_acked();
    Ok(StatusCode::NO_CONTENT)
}

/// Liveness check (GET /health)
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
