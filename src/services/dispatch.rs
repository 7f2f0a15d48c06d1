//! Matching riders with drivers.
//!
//! A request is persisted in REQUESTED and handed to a background task that
//! searches outward from the pickup (radius doubling up to a cap) and offers
//! the ride to one candidate at a time. Each offer waits for the driver's
//! answer or its timeout before the next candidate is tried.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::{DispatchConfig, FareConfig};
use crate::entities::driver::VehicleClass;
use crate::entities::ride::{self, CancellationReason, RideStatus};
use crate::error::{AppError, AppResult};
use crate::realtime::events::OutboundEvent;
use crate::services::geo_index::NearbyDriver;
use crate::services::offers::{OfferResponse, PendingOffer};
use crate::services::ride_state::RideStateMachine;
use crate::services::rides::RideService;
use crate::utils::geo::Coordinates;

/// How long the loop keeps waiting for a driver who claimed the offer right
/// at its deadline to finish accepting.
const LATE_ACCEPT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRequest {
    pub pickup: Coordinates,
    pub dropoff: Coordinates,
    #[serde(alias = "vehicle_class")]
    pub vehicle_class: VehicleClass,
}

pub struct DispatchCoordinator {
    rides: Arc<RideService>,
    config: DispatchConfig,
    surge_multiplier: f64,
}

impl DispatchCoordinator {
    pub fn new(rides: Arc<RideService>, config: DispatchConfig, fare: &FareConfig) -> Self {
        Self {
            rides,
            config,
            surge_multiplier: fare.default_surge_multiplier,
        }
    }

    /// Persist a new ride and start looking for a driver in the background.
    pub async fn request_ride(self: &Arc<Self>, rider_id: Uuid, request: RideRequest) -> AppResult<ride::Model> {
        let ride = self.create_ride(rider_id, request).await?;

        let coordinator = Arc::clone(self);
        let ride_id = ride.id;
        tokio::spawn(async move {
            match coordinator.run_dispatch(ride_id).await {
                Ok(()) => {}
                Err(AppError::NoDriversAvailable) => {
                    tracing::info!(ride_id = %ride_id, "Dispatch ended without a driver");
                }
                Err(e) => tracing::error!(ride_id = %ride_id, error = %e, "Dispatch failed"),
            }
        });

        Ok(ride)
    }

    async fn create_ride(&self, rider_id: Uuid, request: RideRequest) -> AppResult<ride::Model> {
        request.pickup.validate()?;
        request.dropoff.validate()?;
        if request.pickup == request.dropoff {
            return Err(AppError::InvalidInput(
                "pickup and dropoff must differ".to_string(),
            ));
        }

        let estimate = self.rides.fare.estimate(
            &request.pickup,
            &request.dropoff,
            request.vehicle_class,
            self.surge_multiplier,
        )?;
        let ride = RideStateMachine::new_ride(
            rider_id,
            request.pickup,
            request.dropoff,
            request.vehicle_class,
            &estimate,
            Utc::now(),
        );
        self.rides.repo.save_ride(&ride).await?;

        tracing::info!(
            ride_id = %ride.id,
            rider_id = %rider_id,
            vehicle_class = %ride.vehicle_class,
            estimated_fare = ride.estimated_fare,
            "Ride requested"
        );
        self.rides.notify_parties(&ride);
        Ok(ride)
    }

    /// Drivers eligible right now, nearest first, from the smallest radius
    /// that yields any.
    pub fn find_candidates(&self, pickup: Coordinates, vehicle_class: VehicleClass) -> AppResult<Vec<NearbyDriver>> {
        let mut radius = self.config.start_radius_km;
        loop {
            let candidates: Vec<NearbyDriver> = self
                .rides
                .geo
                .query_nearby(pickup, radius, vehicle_class, self.config.candidate_limit)?
                .into_iter()
                .filter(|c| self.is_free(c.driver_id))
                .collect();

            tracing::debug!(radius_km = radius, found = candidates.len(), "Driver search");
            if !candidates.is_empty() || radius >= self.config.max_radius_km {
                return Ok(candidates);
            }
            radius = (radius * 2.0).min(self.config.max_radius_km);
        }
    }

    fn is_free(&self, driver_id: Uuid) -> bool {
        !self.rides.offers.has_outstanding_offer(driver_id)
            && self.rides.slots.active_ride(driver_id).is_none()
    }

    /// Offer the ride to candidates in turn until one accepts, the ride is
    /// cancelled, or nobody is left.
    pub async fn run_dispatch(&self, ride_id: Uuid) -> AppResult<()> {
        let ride = self.rides.load_ride(ride_id).await?;
        let candidates = self.find_candidates(ride.pickup(), ride.vehicle_class)?;

        let mut tried = HashSet::new();
        for candidate in candidates {
            if !tried.insert(candidate.driver_id) || !self.is_free(candidate.driver_id) {
                continue;
            }

            let pending = match self.offer_to(ride_id, &candidate).await {
                Ok(Some(pending)) => pending,
                Ok(None) => {
                    // Ride left REQUESTED while we were searching.
                    self.rides.offers.forget_ride(ride_id);
                    return Ok(());
                }
                // Another ride's dispatcher reached this driver first.
                Err(AppError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            };
            let offer_id = pending.offer_id;

            match self.await_response(pending).await {
                OfferResponse::Accepted => {
                    tracing::info!(ride_id = %ride_id, driver_id = %candidate.driver_id, "Offer accepted");
                    self.rides.offers.forget_ride(ride_id);
                    return Ok(());
                }
                OfferResponse::Withdrawn => {
                    tracing::info!(ride_id = %ride_id, "Dispatch stopped, ride cancelled");
                    self.rides.offers.forget_ride(ride_id);
                    return Ok(());
                }
                response @ (OfferResponse::Rejected | OfferResponse::Expired) => {
                    tracing::info!(
                        ride_id = %ride_id,
                        driver_id = %candidate.driver_id,
                        offer_id = %offer_id,
                        outcome = ?response,
                        "Offer not taken"
                    );
                    if response == OfferResponse::Expired {
                        self.rides.sessions.notify_user(
                            candidate.driver_id,
                            OutboundEvent::OfferExpired { ride_id, offer_id },
                        );
                    }
                    if !self.withdraw_to_requested(ride_id).await? {
                        self.rides.offers.forget_ride(ride_id);
                        return Ok(());
                    }
                }
            }
        }

        self.rides.offers.forget_ride(ride_id);
        match self
            .rides
            .cancel_by_system(ride_id, CancellationReason::NoDriversAvailable)
            .await
        {
            Ok(_) | Err(AppError::InvalidTransition { .. }) => {}
            Err(e) => return Err(e),
        }
        Err(AppError::NoDriversAvailable)
    }

    /// Move the ride to OFFERED, register the offer and tell the driver.
    /// Returns None when the ride is no longer waiting for a driver.
    async fn offer_to(&self, ride_id: Uuid, candidate: &NearbyDriver) -> AppResult<Option<PendingOffer>> {
        let _guard = self.rides.ride_locks.lock(ride_id).await;
        let mut ride = self.rides.load_ride(ride_id).await?;
        if ride.status != RideStatus::Requested {
            return Ok(None);
        }

        let pending = self
            .rides
            .offers
            .issue(ride_id, candidate.driver_id, self.config.offer_timeout)?;
        RideStateMachine::offer(&mut ride, Utc::now())?;
        if let Err(e) = self.rides.repo.save_ride(&ride).await {
            self.rides.offers.withdraw(ride_id);
            return Err(e);
        }

        tracing::info!(
            ride_id = %ride_id,
            driver_id = %candidate.driver_id,
            offer_id = %pending.offer_id,
            distance_km = candidate.distance_km,
            "Offer sent"
        );
        let delivered = self.rides.sessions.notify_user(
            candidate.driver_id,
            OutboundEvent::RideRequest {
                offer_id: pending.offer_id,
                ride_id,
                pickup: ride.pickup(),
                dropoff: ride.dropoff(),
                vehicle_class: ride.vehicle_class,
                estimated_fare: ride.estimated_fare,
                estimated_distance_km: ride.estimated_distance_km,
                distance_to_pickup_km: candidate.distance_km,
                expires_in_secs: self.config.offer_timeout.as_secs(),
            },
        );
        if delivered == 0 {
            tracing::debug!(driver_id = %candidate.driver_id, "Candidate has no live connection");
            self.rides.offers.expire(ride_id, pending.offer_id);
        }
        Ok(Some(pending))
    }

    async fn await_response(&self, mut pending: PendingOffer) -> OfferResponse {
        match tokio::time::timeout(self.config.offer_timeout, &mut pending.response).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => OfferResponse::Expired,
            Err(_) => {
                if self.rides.offers.expire(pending.ride_id, pending.offer_id) {
                    return OfferResponse::Expired;
                }
                // Claimed at the deadline; the claimant decides.
                match tokio::time::timeout(LATE_ACCEPT_WAIT, &mut pending.response).await {
                    Ok(Ok(response)) => response,
                    _ => OfferResponse::Rejected,
                }
            }
        }
    }

    /// OFFERED back to REQUESTED. False when the ride has moved elsewhere
    /// (cancelled or accepted) and dispatch should stop.
    async fn withdraw_to_requested(&self, ride_id: Uuid) -> AppResult<bool> {
        let _guard = self.rides.ride_locks.lock(ride_id).await;
        let mut ride = self.rides.load_ride(ride_id).await?;
        match ride.status {
            RideStatus::Offered => {
                RideStateMachine::withdraw_offer(&mut ride)?;
                self.rides.repo.save_ride(&ride).await?;
                Ok(true)
            }
            RideStatus::Requested => Ok(true),
            _ => Ok(false),
        }
    }

    /// The offered driver takes the ride. Exactly one caller can win the
    /// offer; a driver already bound to another ride, in this process or
    /// on their stored record, is turned down. The driver record is engaged
    /// before the ride is saved so an Accepted answer is never given for a
    /// driver that still looks free.
    pub async fn accept_offer(&self, driver_id: Uuid, ride_id: Uuid) -> AppResult<ride::Model> {
        let claimed = self.rides.offers.claim(ride_id, driver_id)?;

        let bound = match self.rides.resume_slot_for(driver_id).await {
            Ok(bound) => bound,
            Err(e) => {
                claimed.respond(OfferResponse::Rejected);
                return Err(e);
            }
        };
        let busy = bound.is_some_and(|active| active != ride_id);
        if busy || !self.rides.slots.try_claim(driver_id, ride_id) {
            claimed.respond(OfferResponse::Rejected);
            return Err(AppError::Conflict(
                "Driver already has an active ride".to_string(),
            ));
        }

        if let Err(e) = self.rides.engage_driver(driver_id, ride_id).await {
            tracing::error!(driver_id = %driver_id, ride_id = %ride_id, error = %e, "Failed to engage driver");
            self.rides.slots.release(driver_id, ride_id);
            claimed.respond(OfferResponse::Rejected);
            return Err(e);
        }

        let persisted = {
            let _guard = self.rides.ride_locks.lock(ride_id).await;
            self.persist_acceptance(driver_id, ride_id).await
        };
        let accepted = match persisted {
            Ok(ride) => ride,
            Err(e) => {
                if let Err(release_err) = self.rides.release_driver(driver_id, ride_id).await {
                    tracing::error!(driver_id = %driver_id, ride_id = %ride_id, error = %release_err, "Failed to release driver");
                }
                claimed.respond(OfferResponse::Rejected);
                return Err(e);
            }
        };

        claimed.respond(OfferResponse::Accepted);
        self.rides.notify_parties(&accepted);
        Ok(accepted)
    }

    async fn persist_acceptance(&self, driver_id: Uuid, ride_id: Uuid) -> AppResult<ride::Model> {
        let mut ride = self.rides.load_ride(ride_id).await?;
        RideStateMachine::accept(&mut ride, driver_id, Utc::now())?;
        self.rides.repo.save_ride(&ride).await?;
        Ok(ride)
    }

    pub fn reject_offer(&self, driver_id: Uuid, ride_id: Uuid) -> AppResult<()> {
        let claimed = self.rides.offers.claim(ride_id, driver_id)?;
        claimed.respond(OfferResponse::Rejected);
        tracing::debug!(driver_id = %driver_id, ride_id = %ride_id, "Offer rejected by driver");
        Ok(())
    }
}
