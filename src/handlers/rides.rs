use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::entities::ride;
use crate::error::{AppError, AppResult};
use crate::services::dispatch::RideRequest;
use crate::services::history::{RideHistory, DEFAULT_HISTORY_PAGE};
use crate::utils::jwt::{Claims, Identity};
use crate::AppState;

const MAX_CANCEL_REASON_LEN: usize = 200;

#[derive(Debug, Default, Deserialize)]
pub struct CancelRideRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

/// Request a ride; matching continues in the background and progress is
/// pushed over the rider's socket.
pub async fn create_ride(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<RideRequest>,
) -> AppResult<(StatusCode, Json<ride::Model>)> {
    let ride = state.dispatch.request_ride(claims.sub, payload).await?;
    Ok((StatusCode::CREATED, Json(ride)))
}

pub async fn get_ride(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(ride_id): Path<Uuid>,
) -> AppResult<Json<ride::Model>> {
    let ride = state.rides.get_ride(Identity::from(&claims), ride_id).await?;
    Ok(Json(ride))
}

pub async fn cancel_ride(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(ride_id): Path<Uuid>,
    Json(payload): Json<CancelRideRequest>,
) -> AppResult<Json<ride::Model>> {
    let reason = payload
        .reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    if reason
        .as_ref()
        .is_some_and(|r| r.chars().count() > MAX_CANCEL_REASON_LEN)
    {
        return Err(AppError::InvalidInput(format!(
            "Cancellation reason must be at most {} characters",
            MAX_CANCEL_REASON_LEN
        )));
    }

    let ride = state
        .rides
        .cancel_ride(Identity::from(&claims), ride_id, reason)
        .await?;
    Ok(Json(ride))
}

/// Finished rides of the caller, as rider or driver, newest first.
pub async fn ride_history(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<RideHistory>> {
    let history = state
        .rides
        .ride_history(
            claims.sub,
            query.page.unwrap_or(1),
            query.limit.unwrap_or(DEFAULT_HISTORY_PAGE),
        )
        .await?;
    Ok(Json(history))
}
