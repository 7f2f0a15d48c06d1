use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::driver::VehicleClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    #[sea_orm(string_value = "requested")]
    Requested,
    #[sea_orm(string_value = "offered")]
    Offered,
    #[sea_orm(string_value = "accepted")]
    Accepted,
    #[sea_orm(string_value = "arrived")]
    Arrived,
    #[sea_orm(string_value = "in_progress")]
    InProgress,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl RideStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    /// Statuses in which the ride is bound to exactly one driver.
    pub fn has_assigned_driver(self) -> bool {
        matches!(
            self,
            RideStatus::Accepted | RideStatus::Arrived | RideStatus::InProgress | RideStatus::Completed
        )
    }
}

impl std::fmt::Display for RideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RideStatus::Requested => "REQUESTED",
            RideStatus::Offered => "OFFERED",
            RideStatus::Accepted => "ACCEPTED",
            RideStatus::Arrived => "ARRIVED",
            RideStatus::InProgress => "IN_PROGRESS",
            RideStatus::Completed => "COMPLETED",
            RideStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum CancelledBy {
    #[sea_orm(string_value = "rider")]
    Rider,
    #[sea_orm(string_value = "driver")]
    Driver,
    #[sea_orm(string_value = "system")]
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    #[sea_orm(string_value = "no_drivers_available")]
    NoDriversAvailable,
    #[sea_orm(string_value = "rider_cancelled")]
    RiderCancelled,
    #[sea_orm(string_value = "driver_cancelled")]
    DriverCancelled,
    #[sea_orm(string_value = "driver_disconnected")]
    DriverDisconnected,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "rides")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub rider_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub pickup_lat: f64,
    pub pickup_lng: f64,
    pub dropoff_lat: f64,
    pub dropoff_lng: f64,
    pub vehicle_class: VehicleClass,
    pub status: RideStatus,
    pub surge_multiplier: f64,
    pub estimated_distance_km: f64,
    pub estimated_duration_min: f64,
    pub estimated_fare: f64,
    pub distance_km: Option<f64>,
    pub duration_min: Option<f64>,
    pub base_fare: Option<f64>,
    pub distance_fare: Option<f64>,
    pub time_fare: Option<f64>,
    pub final_fare: Option<f64>,
    pub platform_commission: Option<f64>,
    pub driver_earnings: Option<f64>,
    pub requested_at: DateTimeWithTimeZone,
    pub offered_at: Option<DateTimeWithTimeZone>,
    pub accepted_at: Option<DateTimeWithTimeZone>,
    pub arrived_at: Option<DateTimeWithTimeZone>,
    pub started_at: Option<DateTimeWithTimeZone>,
    pub completed_at: Option<DateTimeWithTimeZone>,
    pub cancelled_at: Option<DateTimeWithTimeZone>,
    pub cancelled_by: Option<CancelledBy>,
    pub cancellation_reason: Option<CancellationReason>,
    pub cancellation_note: Option<String>,
}

impl Model {
    pub fn pickup(&self) -> crate::utils::geo::Coordinates {
        crate::utils::geo::Coordinates {
            lat: self.pickup_lat,
            lng: self.pickup_lng,
        }
    }

    pub fn dropoff(&self) -> crate::utils::geo::Coordinates {
        crate::utils::geo::Coordinates {
            lat: self.dropoff_lat,
            lng: self.dropoff_lng,
        }
    }

    pub fn is_party(&self, user_id: Uuid) -> bool {
        self.rider_id == user_id || self.driver_id == Some(user_id)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::RiderId",
        to = "super::user::Column::Id"
    )]
    Rider,
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::DriverId",
        to = "super::user::Column::Id"
    )]
    Driver,
}

impl ActiveModelBehavior for ActiveModel {}
