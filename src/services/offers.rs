//! Outstanding ride offers and driver assignment slots.
//!
//! An offer is resolved exactly once. Accept, reject, timeout and withdrawal
//! all race on the same slot under one mutex; the first to remove it wins and
//! everyone after that gets `OfferAlreadyResolved` (or `OfferExpired` when the
//! timeout won).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// What the dispatcher learns about its offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferResponse {
    Accepted,
    Rejected,
    Expired,
    Withdrawn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Taken,
    Expired,
    Withdrawn,
}

struct OfferSlot {
    offer_id: Uuid,
    driver_id: Uuid,
    expires_at: Instant,
    responder: oneshot::Sender<OfferResponse>,
}

#[derive(Default)]
struct OfferState {
    by_ride: HashMap<Uuid, OfferSlot>,
    by_driver: HashMap<Uuid, Uuid>,
    history: HashMap<(Uuid, Uuid), Resolution>,
}

impl OfferState {
    fn remove(&mut self, ride_id: Uuid, resolution: Resolution) -> Option<OfferSlot> {
        let slot = self.by_ride.remove(&ride_id)?;
        self.by_driver.remove(&slot.driver_id);
        self.history.insert((ride_id, slot.driver_id), resolution);
        Some(slot)
    }
}

/// The dispatcher's side of an issued offer.
#[derive(Debug)]
pub struct PendingOffer {
    pub offer_id: Uuid,
    pub ride_id: Uuid,
    pub driver_id: Uuid,
    pub expires_at: Instant,
    pub response: oneshot::Receiver<OfferResponse>,
}

/// Proof that the caller won the race for an offer. Whoever holds it decides
/// what the dispatcher is told.
#[derive(Debug)]
pub struct ClaimedOffer {
    pub offer_id: Uuid,
    pub ride_id: Uuid,
    pub driver_id: Uuid,
    responder: oneshot::Sender<OfferResponse>,
}

impl ClaimedOffer {
    pub fn respond(self, response: OfferResponse) {
        // The dispatcher may have gone away (ride cancelled); nothing to tell.
        let _ = self.responder.send(response);
    }
}

#[derive(Default)]
pub struct OfferBook {
    state: Mutex<OfferState>,
}

impl OfferBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an offer of `ride_id` to `driver_id`. A ride has at most one
    /// outstanding offer and so does a driver.
    pub fn issue(&self, ride_id: Uuid, driver_id: Uuid, timeout: Duration) -> AppResult<PendingOffer> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.by_ride.contains_key(&ride_id) {
            return Err(AppError::Conflict(format!(
                "ride {} already has an outstanding offer",
                ride_id
            )));
        }
        if state.by_driver.contains_key(&driver_id) {
            return Err(AppError::Conflict(format!(
                "driver {} already has an outstanding offer",
                driver_id
            )));
        }

        let (tx, rx) = oneshot::channel();
        let offer_id = Uuid::new_v4();
        let expires_at = Instant::now() + timeout;
        state.by_ride.insert(
            ride_id,
            OfferSlot {
                offer_id,
                driver_id,
                expires_at,
                responder: tx,
            },
        );
        state.by_driver.insert(driver_id, ride_id);
        state.history.remove(&(ride_id, driver_id));

        Ok(PendingOffer {
            offer_id,
            ride_id,
            driver_id,
            expires_at,
            response: rx,
        })
    }

    /// Resolve the offer on behalf of the driver it was made to. Fails if the
    /// offer is gone, belongs to someone else, or has passed its deadline.
    pub fn claim(&self, ride_id: Uuid, driver_id: Uuid) -> AppResult<ClaimedOffer> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let pending = state.by_ride.get(&ride_id).map(|slot| (slot.driver_id, slot.expires_at));
        match pending {
            Some((owner, expires_at)) if owner == driver_id => {
                if Instant::now() >= expires_at {
                    if let Some(slot) = state.remove(ride_id, Resolution::Expired) {
                        let _ = slot.responder.send(OfferResponse::Expired);
                    }
                    return Err(AppError::OfferExpired);
                }
                let slot = state
                    .remove(ride_id, Resolution::Taken)
                    .ok_or(AppError::OfferAlreadyResolved)?;
                Ok(ClaimedOffer {
                    offer_id: slot.offer_id,
                    ride_id,
                    driver_id,
                    responder: slot.responder,
                })
            }
            _ => match state.history.get(&(ride_id, driver_id)) {
                Some(Resolution::Expired) => Err(AppError::OfferExpired),
                Some(_) => Err(AppError::OfferAlreadyResolved),
                None => Err(AppError::NotFound(format!(
                    "no offer for ride {} was made to this driver",
                    ride_id
                ))),
            },
        }
    }

    /// Timeout path. Returns true if the offer was still pending and is now
    /// expired; false means another resolution got there first.
    pub fn expire(&self, ride_id: Uuid, offer_id: Uuid) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.by_ride.get(&ride_id).is_some_and(|slot| slot.offer_id == offer_id) {
            state.remove(ride_id, Resolution::Expired);
            true
        } else {
            false
        }
    }

    /// Pull the outstanding offer for a ride, if any. Returns the driver it
    /// was made to.
    pub fn withdraw(&self, ride_id: Uuid) -> Option<Uuid> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = state.remove(ride_id, Resolution::Withdrawn)?;
        let _ = slot.responder.send(OfferResponse::Withdrawn);
        Some(slot.driver_id)
    }

    pub fn has_outstanding_offer(&self, driver_id: Uuid) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_driver
            .contains_key(&driver_id)
    }

    pub fn outstanding_for_ride(&self, ride_id: Uuid) -> Option<Uuid> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_ride
            .get(&ride_id)
            .map(|slot| slot.driver_id)
    }

    /// Drop resolution history once a ride has finished dispatching.
    pub fn forget_ride(&self, ride_id: Uuid) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.history.retain(|(ride, _), _| *ride != ride_id);
    }
}

/// Which ride each driver is bound to. A driver holds at most one
/// accepted-through-in-progress ride.
#[derive(Default)]
pub struct DriverSlots {
    active: Mutex<HashMap<Uuid, Uuid>>,
}

impl DriverSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `driver_id` to `ride_id` unless it is bound to a different ride.
    pub fn try_claim(&self, driver_id: Uuid, ride_id: Uuid) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.get(&driver_id) {
            Some(current) => *current == ride_id,
            None => {
                active.insert(driver_id, ride_id);
                true
            }
        }
    }

    /// Unbind only if the driver is still bound to `ride_id`.
    pub fn release(&self, driver_id: Uuid, ride_id: Uuid) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.get(&driver_id) == Some(&ride_id) {
            active.remove(&driver_id);
            true
        } else {
            false
        }
    }

    pub fn active_ride(&self, driver_id: Uuid) -> Option<Uuid> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&driver_id)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(15);

    #[tokio::test]
    async fn test_claim_delivers_response_to_dispatcher() {
        let book = OfferBook::new();
        let (ride, driver) = (Uuid::new_v4(), Uuid::new_v4());
        let pending = book.issue(ride, driver, TIMEOUT).unwrap();
        assert!(book.has_outstanding_offer(driver));

        let claimed = book.claim(ride, driver).unwrap();
        assert_eq!(claimed.offer_id, pending.offer_id);
        claimed.respond(OfferResponse::Accepted);

        assert_eq!(pending.response.await.unwrap(), OfferResponse::Accepted);
        assert!(!book.has_outstanding_offer(driver));
    }

    #[tokio::test]
    async fn test_exactly_one_concurrent_claim_wins() {
        let book = Arc::new(OfferBook::new());
        let (ride, driver) = (Uuid::new_v4(), Uuid::new_v4());
        let _pending = book.issue(ride, driver, TIMEOUT).unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let book = book.clone();
            handles.push(tokio::spawn(async move { book.claim(ride, driver) }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(err) => assert!(matches!(err, AppError::OfferAlreadyResolved)),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_claim_after_timeout_is_expired() {
        let book = OfferBook::new();
        let (ride, driver) = (Uuid::new_v4(), Uuid::new_v4());
        let pending = book.issue(ride, driver, TIMEOUT).unwrap();

        assert!(book.expire(ride, pending.offer_id));
        assert!(!book.expire(ride, pending.offer_id));
        assert!(matches!(book.claim(ride, driver), Err(AppError::OfferExpired)));
    }

    #[tokio::test]
    async fn test_claim_past_deadline_expires_offer() {
        let book = OfferBook::new();
        let (ride, driver) = (Uuid::new_v4(), Uuid::new_v4());
        let pending = book.issue(ride, driver, Duration::ZERO).unwrap();

        assert!(matches!(book.claim(ride, driver), Err(AppError::OfferExpired)));
        assert_eq!(pending.response.await.unwrap(), OfferResponse::Expired);
    }

    #[tokio::test]
    async fn test_expire_loses_to_claim() {
        let book = OfferBook::new();
        let (ride, driver) = (Uuid::new_v4(), Uuid::new_v4());
        let pending = book.issue(ride, driver, TIMEOUT).unwrap();

        let claimed = book.claim(ride, driver).unwrap();
        assert!(!book.expire(ride, pending.offer_id));
        claimed.respond(OfferResponse::Accepted);
        assert_eq!(pending.response.await.unwrap(), OfferResponse::Accepted);
    }

    #[tokio::test]
    async fn test_one_outstanding_offer_per_driver_and_ride() {
        let book = OfferBook::new();
        let driver = Uuid::new_v4();
        let ride = Uuid::new_v4();
        let _pending = book.issue(ride, driver, TIMEOUT).unwrap();

        assert!(matches!(
            book.issue(Uuid::new_v4(), driver, TIMEOUT),
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            book.issue(ride, Uuid::new_v4(), TIMEOUT),
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_other_driver_cannot_claim() {
        let book = OfferBook::new();
        let ride = Uuid::new_v4();
        let _pending = book.issue(ride, Uuid::new_v4(), TIMEOUT).unwrap();
        assert!(matches!(book.claim(ride, Uuid::new_v4()), Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_withdraw_notifies_dispatcher() {
        let book = OfferBook::new();
        let (ride, driver) = (Uuid::new_v4(), Uuid::new_v4());
        let pending = book.issue(ride, driver, TIMEOUT).unwrap();

        assert_eq!(book.withdraw(ride), Some(driver));
        assert_eq!(book.withdraw(ride), None);
        assert_eq!(pending.response.await.unwrap(), OfferResponse::Withdrawn);
        assert!(matches!(book.claim(ride, driver), Err(AppError::OfferAlreadyResolved)));

        book.forget_ride(ride);
        assert!(matches!(book.claim(ride, driver), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_driver_slot_holds_one_ride() {
        let slots = DriverSlots::new();
        let driver = Uuid::new_v4();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(slots.try_claim(driver, first));
        assert!(slots.try_claim(driver, first));
        assert!(!slots.try_claim(driver, second));
        assert!(!slots.release(driver, second));
        assert_eq!(slots.active_ride(driver), Some(first));
        assert!(slots.release(driver, first));
        assert!(slots.try_claim(driver, second));
    }
}
