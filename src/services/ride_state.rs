//! Ride lifecycle transitions.
//!
//! ```text
//! REQUESTED -> OFFERED -> ACCEPTED -> ARRIVED -> IN_PROGRESS -> COMPLETED
//!     ^           |
//!     +-----------+  (offer withdrawn after a reject or a timeout)
//!
//! REQUESTED | OFFERED | ACCEPTED | ARRIVED -> CANCELLED
//! ```
//!
//! Every mutator validates state and actor before touching the record, so a
//! rejected transition leaves the ride exactly as it was.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entities::driver::VehicleClass;
use crate::entities::ride::{self, CancellationReason, CancelledBy, RideStatus};
use crate::entities::user::UserRole;
use crate::error::{AppError, AppResult};
use crate::services::fare::{FareEstimate, FareQuote};
use crate::utils::geo::Coordinates;
use crate::utils::jwt::Identity;

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    User(Identity),
    /// The dispatcher, timers and other server-side triggers.
    System,
}

impl Actor {
    pub fn user(user_id: Uuid, role: UserRole) -> Self {
        Actor::User(Identity { user_id, role })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RideAction {
    Offer,
    WithdrawOffer,
    Accept,
    Arrive,
    Start,
    Complete,
    Cancel,
}

impl RideAction {
    pub fn name(self) -> &'static str {
        match self {
            RideAction::Offer => "offer",
            RideAction::WithdrawOffer => "withdraw the offer for",
            RideAction::Accept => "accept",
            RideAction::Arrive => "mark arrival for",
            RideAction::Start => "start",
            RideAction::Complete => "complete",
            RideAction::Cancel => "cancel",
        }
    }

    fn target(self, from: RideStatus) -> Option<RideStatus> {
        use RideStatus::*;
        match (self, from) {
            (RideAction::Offer, Requested) => Some(Offered),
            (RideAction::WithdrawOffer, Offered) => Some(Requested),
            (RideAction::Accept, Offered) => Some(Accepted),
            (RideAction::Arrive, Accepted) => Some(Arrived),
            (RideAction::Start, Arrived) => Some(InProgress),
            (RideAction::Complete, InProgress) => Some(Completed),
            (RideAction::Cancel, Requested | Offered | Accepted | Arrived) => Some(Cancelled),
            _ => None,
        }
    }
}

pub struct RideStateMachine;

impl RideStateMachine {
    /// Build a fresh ride in REQUESTED.
    pub fn new_ride(
        rider_id: Uuid,
        pickup: Coordinates,
        dropoff: Coordinates,
        vehicle_class: VehicleClass,
        estimate: &FareEstimate,
        now: DateTime<Utc>,
    ) -> ride::Model {
        ride::Model {
            id: Uuid::new_v4(),
            rider_id,
            driver_id: None,
            pickup_lat: pickup.lat,
            pickup_lng: pickup.lng,
            dropoff_lat: dropoff.lat,
            dropoff_lng: dropoff.lng,
            vehicle_class,
            status: RideStatus::Requested,
            surge_multiplier: estimate.quote.surge_multiplier,
            estimated_distance_km: estimate.distance_km,
            estimated_duration_min: estimate.duration_min,
            estimated_fare: estimate.quote.total,
            distance_km: None,
            duration_min: None,
            base_fare: None,
            distance_fare: None,
            time_fare: None,
            final_fare: None,
            platform_commission: None,
            driver_earnings: None,
            requested_at: now.into(),
            offered_at: None,
            accepted_at: None,
            arrived_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancelled_by: None,
            cancellation_reason: None,
            cancellation_note: None,
        }
    }

    /// Check that `actor` may perform `action` on `ride` right now and return
    /// the resulting status. Never mutates.
    pub fn validate(ride: &ride::Model, action: RideAction, actor: Actor) -> AppResult<RideStatus> {
        let next = action.target(ride.status).ok_or(AppError::InvalidTransition {
            from: ride.status,
            action: action.name(),
        })?;

        match action {
            RideAction::Offer | RideAction::WithdrawOffer | RideAction::Accept => {
                if actor != Actor::System {
                    return Err(AppError::Forbidden(format!(
                        "only the dispatcher may {} a ride",
                        action.name()
                    )));
                }
            }
            RideAction::Arrive | RideAction::Start | RideAction::Complete => match actor {
                Actor::User(identity)
                    if identity.role == UserRole::Driver && ride.driver_id == Some(identity.user_id) => {}
                _ => {
                    return Err(AppError::Forbidden(
                        "only the assigned driver may do that".to_string(),
                    ));
                }
            },
            RideAction::Cancel => match actor {
                Actor::System => {}
                Actor::User(identity) if ride.is_party(identity.user_id) => {}
                Actor::User(_) => {
                    return Err(AppError::Forbidden(
                        "only the rider or the assigned driver may cancel".to_string(),
                    ));
                }
            },
        }

        Ok(next)
    }

    pub fn offer(ride: &mut ride::Model, now: DateTime<Utc>) -> AppResult<()> {
        ride.status = Self::validate(ride, RideAction::Offer, Actor::System)?;
        ride.offered_at = Some(now.into());
        Ok(())
    }

    pub fn withdraw_offer(ride: &mut ride::Model) -> AppResult<()> {
        ride.status = Self::validate(ride, RideAction::WithdrawOffer, Actor::System)?;
        Ok(())
    }

    pub fn accept(ride: &mut ride::Model, driver_id: Uuid, now: DateTime<Utc>) -> AppResult<()> {
        ride.status = Self::validate(ride, RideAction::Accept, Actor::System)?;
        ride.driver_id = Some(driver_id);
        ride.accepted_at = Some(now.into());
        Ok(())
    }

    pub fn arrive(ride: &mut ride::Model, actor: Actor, now: DateTime<Utc>) -> AppResult<()> {
        ride.status = Self::validate(ride, RideAction::Arrive, actor)?;
        ride.arrived_at = Some(now.into());
        Ok(())
    }

    pub fn start(ride: &mut ride::Model, actor: Actor, now: DateTime<Utc>) -> AppResult<()> {
        ride.status = Self::validate(ride, RideAction::Start, actor)?;
        ride.started_at = Some(now.into());
        Ok(())
    }

    pub fn complete(
        ride: &mut ride::Model,
        actor: Actor,
        distance_km: f64,
        duration_min: f64,
        quote: &FareQuote,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        ride.status = Self::validate(ride, RideAction::Complete, actor)?;
        ride.distance_km = Some(distance_km);
        ride.duration_min = Some(duration_min);
        ride.base_fare = Some(quote.base);
        ride.distance_fare = Some(quote.distance_fare);
        ride.time_fare = Some(quote.time_fare);
        ride.final_fare = Some(quote.total);
        ride.platform_commission = Some(quote.platform_commission);
        ride.driver_earnings = Some(quote.driver_earnings);
        ride.completed_at = Some(now.into());
        Ok(())
    }

    pub fn cancel(
        ride: &mut ride::Model,
        actor: Actor,
        reason: CancellationReason,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        ride.status = Self::validate(ride, RideAction::Cancel, actor)?;
        ride.cancelled_by = Some(match actor {
            Actor::System => CancelledBy::System,
            Actor::User(identity) if identity.user_id == ride.rider_id => CancelledBy::Rider,
            Actor::User(_) => CancelledBy::Driver,
        });
        ride.cancellation_reason = Some(reason);
        ride.cancellation_note = note;
        ride.cancelled_at = Some(now.into());
        Ok(())
    }
}
