//! Prometheus scrape endpoint

use axum::{
    Router,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::data::OutboxStatus;
use crate::error::AppError;
use crate::metrics::{OPEN_CIRCUITS, OUTBOX_ENTRIES, REGISTRY};

/// GET /metrics
///
/// Queue gauges are read from the database on every scrape so they stay
/// correct across restarts.
async fn scrape(State(state): State<AppState>) -> Result<Response, AppError> {
    for status in [OutboxStatus::Pending, OutboxStatus::Sent, OutboxStatus::Failed] {
        let count = state.db.count_outbox_by_status(status).await?;
        OUTBOX_ENTRIES.with_label_values(&[status.as_str()]).set(count);
    }
    OPEN_CIRCUITS.set(state.db.count_open_circuits(Utc::now()).await?);

    let encoder = TextEncoder::new();
    let text = encoder
        .encode_to_string(&REGISTRY.gather())
        .map_err(|e| AppError::Internal(e.into()))?;
    Ok(([(header::CONTENT_TYPE, encoder.format_type().to_string())], text).into_response())
}

pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(scrape))
}
