//! Ride lifecycle after acceptance, plus the bookkeeping shared with the
//! dispatcher: per-entity locks, driver slots, outstanding offers and the
//! driver reconnection grace window.
//!
//! Lock order is always ride before driver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::db::RideRepository;
use crate::entities::driver;
use crate::entities::ride::{self, CancellationReason, RideStatus};
use crate::entities::user::UserRole;
use crate::error::{AppError, AppResult};
use crate::realtime::events::OutboundEvent;
use crate::realtime::sessions::SessionRegistry;
use crate::services::fare::FareEngine;
use crate::services::geo_index::GeoIndex;
use crate::services::history::{
    EarningsPeriod, EarningsSummary, Pagination, RideHistory, MAX_HISTORY_PAGE,
};
use crate::services::locks::EntityLocks;
use crate::services::offers::{DriverSlots, OfferBook};
use crate::services::ride_state::{Actor, RideAction, RideStateMachine};
use crate::services::routing::{get_route_with_retry, RoutingProvider};
use crate::utils::jwt::Identity;

pub struct RideService {
    pub(crate) repo: Arc<dyn RideRepository>,
    pub(crate) geo: Arc<GeoIndex>,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) fare: FareEngine,
    pub(crate) ride_locks: EntityLocks,
    pub(crate) driver_locks: EntityLocks,
    pub(crate) offers: OfferBook,
    pub(crate) slots: DriverSlots,
    routing: Arc<dyn RoutingProvider>,
    routing_backoff: Duration,
    reconnect_grace: Duration,
    grace_tokens: Mutex<HashMap<Uuid, u64>>,
    next_grace_token: AtomicU64,
}

impl RideService {
    pub fn new(
        config: &Config,
        repo: Arc<dyn RideRepository>,
        routing: Arc<dyn RoutingProvider>,
        geo: Arc<GeoIndex>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            repo,
            geo,
            sessions,
            fare: FareEngine::new(config.fare.clone()),
            ride_locks: EntityLocks::new(),
            driver_locks: EntityLocks::new(),
            offers: OfferBook::new(),
            slots: DriverSlots::new(),
            routing,
            routing_backoff: config.routing.retry_backoff,
            reconnect_grace: config.gateway.driver_reconnect_grace,
            grace_tokens: Mutex::new(HashMap::new()),
            next_grace_token: AtomicU64::new(1),
        }
    }

    pub fn fare(&self) -> &FareEngine {
        &self.fare
    }

    pub fn slots(&self) -> &DriverSlots {
        &self.slots
    }

    /// Drop per-entity locks nobody holds. Returns how many were removed.
    pub fn prune_locks(&self) -> usize {
        self.ride_locks.prune() + self.driver_locks.prune()
    }

    pub(crate) async fn load_ride(&self, ride_id: Uuid) -> AppResult<ride::Model> {
        self.repo
            .load_ride(ride_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Ride {} not found", ride_id)))
    }

    /// Read a ride on behalf of a user: its rider, its driver, or an admin.
    pub async fn get_ride(&self, identity: Identity, ride_id: Uuid) -> AppResult<ride::Model> {
        let ride = self.load_ride(ride_id).await?;
        if identity.role != UserRole::Admin && !ride.is_party(identity.user_id) {
            return Err(AppError::Forbidden("Not a party to this ride".to_string()));
        }
        Ok(ride)
    }

    pub(crate) fn notify_parties(&self, ride: &ride::Model) {
        let event = OutboundEvent::status_changed(ride);
        self.sessions.notify_user(ride.rider_id, event.clone());
        if let Some(driver_id) = ride.driver_id {
            self.sessions.notify_user(driver_id, event);
        }
    }

    pub async fn driver_arrived(&self, identity: Identity, ride_id: Uuid) -> AppResult<ride::Model> {
        let _guard = self.ride_locks.lock(ride_id).await;
        let mut ride = self.load_ride(ride_id).await?;
        RideStateMachine::arrive(&mut ride, Actor::User(identity), Utc::now())?;
        self.repo.save_ride(&ride).await?;

        tracing::info!(ride_id = %ride.id, driver_id = %identity.user_id, "Driver arrived at pickup");
        self.sessions.notify_user(
            ride.rider_id,
            OutboundEvent::DriverArrived {
                ride_id: ride.id,
                driver_id: identity.user_id,
            },
        );
        self.notify_parties(&ride);
        Ok(ride)
    }

    pub async fn start_ride(&self, identity: Identity, ride_id: Uuid) -> AppResult<ride::Model> {
        let _guard = self.ride_locks.lock(ride_id).await;
        let mut ride = self.load_ride(ride_id).await?;
        RideStateMachine::start(&mut ride, Actor::User(identity), Utc::now())?;
        self.repo.save_ride(&ride).await?;

        tracing::info!(ride_id = %ride.id, "Ride started");
        self.notify_parties(&ride);
        Ok(ride)
    }

    /// Fetch the route, price the trip and close the ride. A routing failure
    /// leaves the ride IN_PROGRESS so the driver can try again.
    pub async fn complete_ride(&self, identity: Identity, ride_id: Uuid) -> AppResult<ride::Model> {
        let _guard = self.ride_locks.lock(ride_id).await;
        let mut ride = self.load_ride(ride_id).await?;
        RideStateMachine::validate(&ride, RideAction::Complete, Actor::User(identity))?;

        let route = get_route_with_retry(
            self.routing.as_ref(),
            ride.pickup(),
            ride.dropoff(),
            self.routing_backoff,
        )
        .await?;

        let now = Utc::now();
        let duration_min = match ride.started_at {
            Some(started_at) => {
                let elapsed = now - started_at.with_timezone(&Utc);
                (elapsed.num_seconds().max(0) as f64 / 60.0).ceil()
            }
            None => route.duration_min.ceil(),
        };

        let quote = self.fare.quote(
            route.distance_km,
            duration_min,
            ride.vehicle_class,
            ride.surge_multiplier,
        )?;
        RideStateMachine::complete(
            &mut ride,
            Actor::User(identity),
            route.distance_km,
            duration_min,
            &quote,
            now,
        )?;
        self.repo.save_ride(&ride).await?;

        tracing::info!(
            ride_id = %ride.id,
            distance_km = route.distance_km,
            duration_min,
            final_fare = quote.total,
            "Ride completed"
        );

        if let Some(driver_id) = ride.driver_id {
            self.release_driver(driver_id, ride.id).await?;
        }
        self.notify_parties(&ride);
        Ok(ride)
    }

    /// Cancel on behalf of the rider or the assigned driver.
    pub async fn cancel_ride(
        &self,
        identity: Identity,
        ride_id: Uuid,
        note: Option<String>,
    ) -> AppResult<ride::Model> {
        let reason = match identity.role {
            UserRole::Driver => CancellationReason::DriverCancelled,
            _ => CancellationReason::RiderCancelled,
        };
        self.cancel(ride_id, Actor::User(identity), reason, note).await
    }

    /// Cancel on the server's own initiative (no drivers, driver gone).
    pub async fn cancel_by_system(
        &self,
        ride_id: Uuid,
        reason: CancellationReason,
    ) -> AppResult<ride::Model> {
        self.cancel(ride_id, Actor::System, reason, None).await
    }

    async fn cancel(
        &self,
        ride_id: Uuid,
        actor: Actor,
        reason: CancellationReason,
        note: Option<String>,
    ) -> AppResult<ride::Model> {
        let _guard = self.ride_locks.lock(ride_id).await;
        let mut ride = self.load_ride(ride_id).await?;
        RideStateMachine::cancel(&mut ride, actor, reason, note, Utc::now())?;
        self.repo.save_ride(&ride).await?;

        tracing::info!(ride_id = %ride.id, reason = ?reason, "Ride cancelled");

        if let Some(driver_id) = self.offers.withdraw(ride.id) {
            tracing::debug!(ride_id = %ride.id, driver_id = %driver_id, "Outstanding offer withdrawn");
        }
        if let Some(driver_id) = ride.driver_id {
            self.release_driver(driver_id, ride.id).await?;
        }
        self.notify_parties(&ride);
        Ok(ride)
    }

    /// Bind a driver to an accepted ride: unavailable on the record, then in
    /// the index. A failed save leaves the index untouched.
    pub(crate) async fn engage_driver(&self, driver_id: Uuid, ride_id: Uuid) -> AppResult<()> {
        let _guard = self.driver_locks.lock(driver_id).await;
        if let Some(mut driver) = self.repo.load_driver(driver_id).await? {
            driver.current_ride_id = Some(ride_id);
            driver.is_available = false;
            self.repo.save_driver(&driver).await?;
        }
        self.geo.set_available(driver_id, false);
        Ok(())
    }

    /// Free a driver after their ride ends. No-op if the driver has already
    /// moved on to a different ride.
    pub(crate) async fn release_driver(&self, driver_id: Uuid, ride_id: Uuid) -> AppResult<()> {
        let _guard = self.driver_locks.lock(driver_id).await;
        self.slots.release(driver_id, ride_id);
        self.clear_reconnect_grace(driver_id);

        let Some(mut driver) = self.repo.load_driver(driver_id).await? else {
            return Ok(());
        };
        if driver.current_ride_id != Some(ride_id) {
            return Ok(());
        }
        driver.current_ride_id = None;
        driver.is_available = driver.is_online;
        self.repo.save_driver(&driver).await?;
        if driver.is_online {
            self.geo.set_available(driver_id, true);
        }
        Ok(())
    }

    /// The ride this driver is bound to, rebuilding the in-memory slot from
    /// the stored `current_ride_id` when the process has none (after a
    /// restart, or on another instance). The caller holds the driver lock.
    ///
    /// Returns `None` when the record names a ride that is gone, finished,
    /// or assigned elsewhere.
    pub(crate) async fn resume_slot(&self, driver: &driver::Model) -> AppResult<Option<Uuid>> {
        if let Some(ride_id) = self.slots.active_ride(driver.id) {
            return Ok(Some(ride_id));
        }
        let Some(ride_id) = driver.current_ride_id else {
            return Ok(None);
        };
        let Some(ride) = self.repo.load_ride(ride_id).await? else {
            return Ok(None);
        };
        if ride.status.is_terminal() || ride.driver_id != Some(driver.id) {
            return Ok(None);
        }
        if !self.slots.try_claim(driver.id, ride_id) {
            return Ok(self.slots.active_ride(driver.id));
        }
        tracing::info!(driver_id = %driver.id, ride_id = %ride_id, "Driver slot restored from record");
        Ok(Some(ride_id))
    }

    /// [`resume_slot`](Self::resume_slot) for callers that hold no lock.
    pub(crate) async fn resume_slot_for(&self, driver_id: Uuid) -> AppResult<Option<Uuid>> {
        let _guard = self.driver_locks.lock(driver_id).await;
        match self.repo.load_driver(driver_id).await? {
            Some(driver) => self.resume_slot(&driver).await,
            None => Ok(self.slots.active_ride(driver_id)),
        }
    }

    /// Finished rides where the user was rider or driver, newest first.
    pub async fn ride_history(&self, user_id: Uuid, page: u64, limit: u64) -> AppResult<RideHistory> {
        if page == 0 {
            return Err(AppError::InvalidInput("page starts at 1".to_string()));
        }
        if limit == 0 || limit > MAX_HISTORY_PAGE {
            return Err(AppError::InvalidInput(format!(
                "limit must be between 1 and {}",
                MAX_HISTORY_PAGE
            )));
        }
        let (rides, total) = self.repo.list_rides_for_user(user_id, page, limit).await?;
        Ok(RideHistory {
            rides,
            pagination: Pagination {
                page,
                limit,
                total,
                pages: total.div_ceil(limit),
            },
        })
    }

    /// Sum a driver's completed rides since the start of `period`.
    pub async fn driver_earnings(
        &self,
        driver_id: Uuid,
        period: EarningsPeriod,
        now: DateTime<Utc>,
    ) -> AppResult<EarningsSummary> {
        if self.repo.load_driver(driver_id).await?.is_none() {
            return Err(AppError::NotFound("Driver profile not found".to_string()));
        }
        let since = period.start(now);
        let rides = self.repo.completed_rides_for_driver(driver_id, since).await?;
        Ok(EarningsSummary::from_rides(period, &rides))
    }

    /// The driver's last connection dropped while holding a ride. If they
    /// are not back within the grace window the ride is cancelled, unless it
    /// is already under way.
    pub fn begin_reconnect_grace(self: &Arc<Self>, driver_id: Uuid) {
        let Some(ride_id) = self.slots.active_ride(driver_id) else {
            return;
        };

        let token = self.next_grace_token.fetch_add(1, Ordering::Relaxed);
        self.grace_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(driver_id, token);
        tracing::info!(
            driver_id = %driver_id,
            ride_id = %ride_id,
            grace_secs = self.reconnect_grace.as_secs(),
            "Driver disconnected during ride, waiting for reconnect"
        );

        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(service.reconnect_grace).await;
            if let Err(e) = service.expire_reconnect_grace(driver_id, ride_id, token).await {
                tracing::error!(driver_id = %driver_id, ride_id = %ride_id, error = %e, "Grace expiry failed");
            }
        });
    }

    pub fn clear_reconnect_grace(&self, driver_id: Uuid) -> bool {
        self.grace_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&driver_id)
            .is_some()
    }

    async fn expire_reconnect_grace(&self, driver_id: Uuid, ride_id: Uuid, token: u64) -> AppResult<()> {
        {
            let mut tokens = self.grace_tokens.lock().unwrap_or_else(PoisonError::into_inner);
            if tokens.get(&driver_id) != Some(&token) {
                return Ok(());
            }
            tokens.remove(&driver_id);
        }
        if self.sessions.is_connected(driver_id) {
            return Ok(());
        }

        let ride = self.load_ride(ride_id).await?;
        match ride.status {
            RideStatus::Accepted | RideStatus::Arrived => {
                tracing::warn!(driver_id = %driver_id, ride_id = %ride_id, "Reconnect grace expired, cancelling ride");
                self.cancel_by_system(ride_id, CancellationReason::DriverDisconnected)
                    .await?;
            }
            RideStatus::InProgress => {
                tracing::warn!(
                    driver_id = %driver_id,
                    ride_id = %ride_id,
                    "Reconnect grace expired mid-trip, ride left running"
                );
            }
            _ => {}
        }
        Ok(())
    }
}
