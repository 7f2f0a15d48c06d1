//! Wire format for socket traffic: `{"event": "<name>", "data": {...}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::driver::VehicleClass;
use crate::entities::ride::{self, RideStatus};
use crate::error::{AppError, AppResult};
use crate::utils::geo::Coordinates;

const MAX_NOTE_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum InboundEvent {
    RequestRide {
        pickup: Coordinates,
        dropoff: Coordinates,
        vehicle_class: VehicleClass,
    },
    AcceptRide {
        ride_id: Uuid,
    },
    RejectRide {
        ride_id: Uuid,
    },
    UpdateLocation {
        lat: f64,
        lng: f64,
        heading: Option<f64>,
    },
    UpdateStatus {
        is_online: bool,
        is_available: Option<bool>,
    },
    DriverArrived {
        ride_id: Uuid,
    },
    StartRide {
        ride_id: Uuid,
    },
    CompleteRide {
        ride_id: Uuid,
    },
    CancelRide {
        ride_id: Uuid,
        reason: Option<String>,
    },
    SendMessage {
        ride_id: Uuid,
        message: String,
    },
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::RequestRide { .. } => "request-ride",
            InboundEvent::AcceptRide { .. } => "accept-ride",
            InboundEvent::RejectRide { .. } => "reject-ride",
            InboundEvent::UpdateLocation { .. } => "update-location",
            InboundEvent::UpdateStatus { .. } => "update-status",
            InboundEvent::DriverArrived { .. } => "driver-arrived",
            InboundEvent::StartRide { .. } => "start-ride",
            InboundEvent::CompleteRide { .. } => "complete-ride",
            InboundEvent::CancelRide { .. } => "cancel-ride",
            InboundEvent::SendMessage { .. } => "send-message",
        }
    }

    /// Shape checks that need no state. Runs before any handler sees the
    /// event.
    pub fn validate(&self, max_message_len: usize) -> AppResult<()> {
        match self {
            InboundEvent::RequestRide { pickup, dropoff, .. } => {
                pickup.validate()?;
                dropoff.validate()?;
            }
            InboundEvent::UpdateLocation { lat, lng, heading } => {
                Coordinates::new(*lat, *lng)?;
                if let Some(heading) = heading {
                    if !heading.is_finite() || !(0.0..360.0).contains(heading) {
                        return Err(AppError::InvalidInput(format!(
                            "heading {} is outside [0, 360)",
                            heading
                        )));
                    }
                }
            }
            InboundEvent::SendMessage { message, .. } => {
                let len = message.chars().count();
                if message.trim().is_empty() || len > max_message_len {
                    return Err(AppError::InvalidInput(format!(
                        "message must be 1 to {} characters",
                        max_message_len
                    )));
                }
            }
            InboundEvent::CancelRide { reason: Some(reason), .. } => {
                if reason.chars().count() > MAX_NOTE_LEN {
                    return Err(AppError::InvalidInput(format!(
                        "reason must be at most {} characters",
                        MAX_NOTE_LEN
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum OutboundEvent {
    /// Sent to the driver being offered a ride.
    RideRequest {
        offer_id: Uuid,
        ride_id: Uuid,
        pickup: Coordinates,
        dropoff: Coordinates,
        vehicle_class: VehicleClass,
        estimated_fare: f64,
        estimated_distance_km: f64,
        distance_to_pickup_km: f64,
        expires_in_secs: u64,
    },
    RideStatusChanged {
        ride_id: Uuid,
        status: RideStatus,
        ride: Box<ride::Model>,
    },
    DriverArrived {
        ride_id: Uuid,
        driver_id: Uuid,
    },
    DriverLocationUpdate {
        ride_id: Uuid,
        driver_id: Uuid,
        lat: f64,
        lng: f64,
        heading: Option<f64>,
    },
    NewMessage {
        ride_id: Uuid,
        from: Uuid,
        message: String,
        sent_at: DateTime<Utc>,
    },
    OfferExpired {
        ride_id: Uuid,
        offer_id: Uuid,
    },
    Error {
        code: String,
        message: String,
    },
}

impl OutboundEvent {
    pub fn status_changed(ride: &ride::Model) -> Self {
        OutboundEvent::RideStatusChanged {
            ride_id: ride.id,
            status: ride.status,
            ride: Box::new(ride.clone()),
        }
    }

    pub fn error(err: &AppError) -> Self {
        OutboundEvent::Error {
            code: err.code().to_string(),
            message: err.public_message(),
        }
    }
}
