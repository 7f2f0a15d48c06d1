use axum::{extract::State, Json};
use serde::Deserialize;

use crate::entities::driver::VehicleClass;
use crate::error::AppResult;
use crate::services::fare::FareEstimate;
use crate::utils::geo::Coordinates;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FareEstimateRequest {
    pub pickup: Coordinates,
    pub dropoff: Coordinates,
    #[serde(alias = "vehicle_class")]
    pub vehicle_class: VehicleClass,
}

/// Quote a trip at the current surge multiplier.
pub async fn estimate(
    State(state): State<AppState>,
    Json(payload): Json<FareEstimateRequest>,
) -> AppResult<Json<FareEstimate>> {
    let fare = state.rides.fare();
    let estimate = fare.estimate(
        &payload.pickup,
        &payload.dropoff,
        payload.vehicle_class,
        fare.config().default_surge_multiplier,
    )?;
    Ok(Json(estimate))
}
