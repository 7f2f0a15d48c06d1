use axum::{
    extract::{Query, State},
    Extension, Json,
};
use chrono::Utc;
use serde::Deserialize;

use crate::entities::driver::VehicleClass;
use crate::error::{AppError, AppResult};
use crate::services::geo_index::NearbyDriver;
use crate::services::history::{EarningsPeriod, EarningsSummary};
use crate::utils::geo::Coordinates;
use crate::utils::jwt::Claims;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lng: f64,
    pub vehicle_class: Option<VehicleClass>,
    pub radius_km: Option<f64>,
    pub limit: Option<usize>,
}

/// Available drivers around a point, nearest first. The radius is capped at
/// the dispatch search ceiling.
pub async fn nearby(
    State(state): State<AppState>,
    Query(query): Query<NearbyQuery>,
) -> AppResult<Json<Vec<NearbyDriver>>> {
    let dispatch = &state.config.dispatch;
    let radius_km = query.radius_km.unwrap_or(dispatch.start_radius_km);
    if !radius_km.is_finite() || radius_km <= 0.0 {
        return Err(AppError::InvalidInput("radius_km must be positive".to_string()));
    }

    let drivers = state.geo.query_nearby(
        Coordinates::new(query.lat, query.lng)?,
        radius_km.min(dispatch.max_radius_km),
        query.vehicle_class.unwrap_or(VehicleClass::Economy),
        query.limit.unwrap_or(dispatch.candidate_limit).min(dispatch.candidate_limit),
    )?;

    Ok(Json(drivers))
}

#[derive(Debug, Default, Deserialize)]
pub struct EarningsQuery {
    pub period: Option<EarningsPeriod>,
}

/// The calling driver's completed-ride totals for `period` (default today).
pub async fn earnings(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<EarningsQuery>,
) -> AppResult<Json<EarningsSummary>> {
    let summary = state
        .rides
        .driver_earnings(claims.sub, query.period.unwrap_or_default(), Utc::now())
        .await?;
    Ok(Json(summary))
}
