use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::events::{InboundEvent, OutboundEvent};
use super::sessions::{ConnectionId, SessionRegistry};
use crate::db::RideRepository;
use crate::entities::user::UserRole;
use crate::error::{AppError, AppResult};
use crate::services::dispatch::{DispatchCoordinator, RideRequest};
use crate::services::geo_index::{DriverPosition, GeoIndex};
use crate::services::rides::RideService;
use crate::utils::geo::Coordinates;
use crate::utils::jwt::{verify_token, Identity};
use crate::AppState;

/// Routes socket events into the dispatch and lifecycle services and owns
/// the driver presence bookkeeping (location, online status, disconnects).
pub struct RealtimeGateway {
    repo: Arc<dyn RideRepository>,
    geo: Arc<GeoIndex>,
    sessions: Arc<SessionRegistry>,
    rides: Arc<RideService>,
    dispatch: Arc<DispatchCoordinator>,
    max_message_len: usize,
}

/// The role an event is reserved for, if any.
fn required_role(event: &InboundEvent) -> Option<UserRole> {
    match event {
        InboundEvent::RequestRide { .. } => Some(UserRole::Rider),
        InboundEvent::CancelRide { .. } | InboundEvent::SendMessage { .. } => None,
        _ => Some(UserRole::Driver),
    }
}

impl RealtimeGateway {
    pub fn new(
        repo: Arc<dyn RideRepository>,
        geo: Arc<GeoIndex>,
        sessions: Arc<SessionRegistry>,
        rides: Arc<RideService>,
        dispatch: Arc<DispatchCoordinator>,
        max_message_len: usize,
    ) -> Self {
        Self {
            repo,
            geo,
            sessions,
            rides,
            dispatch,
            max_message_len,
        }
    }

    pub async fn handle_event(&self, identity: Identity, event: InboundEvent) -> AppResult<()> {
        event.validate(self.max_message_len)?;
        tracing::debug!(user_id = %identity.user_id, event = event.name(), "Inbound event");

        if let Some(role) = required_role(&event) {
            if identity.role != role {
                return Err(AppError::Forbidden(format!(
                    "{} is only available to {:?} accounts",
                    event.name(),
                    role
                )));
            }
        }

        match event {
            InboundEvent::RequestRide {
                pickup,
                dropoff,
                vehicle_class,
            } => {
                let request = RideRequest {
                    pickup,
                    dropoff,
                    vehicle_class,
                };
                self.dispatch.request_ride(identity.user_id, request).await?;
            }
            InboundEvent::AcceptRide { ride_id } => {
                self.dispatch.accept_offer(identity.user_id, ride_id).await?;
            }
            InboundEvent::RejectRide { ride_id } => {
                self.dispatch.reject_offer(identity.user_id, ride_id)?;
            }
            InboundEvent::UpdateLocation { lat, lng, heading } => {
                self.update_location(identity.user_id, Coordinates { lat, lng }, heading)
                    .await?;
            }
            InboundEvent::UpdateStatus {
                is_online,
                is_available,
            } => {
                self.set_driver_status(identity.user_id, is_online, is_available)
                    .await?;
            }
            InboundEvent::DriverArrived { ride_id } => {
                self.rides.driver_arrived(identity, ride_id).await?;
            }
            InboundEvent::StartRide { ride_id } => {
                self.rides.start_ride(identity, ride_id).await?;
            }
            InboundEvent::CompleteRide { ride_id } => {
                self.rides.complete_ride(identity, ride_id).await?;
            }
            InboundEvent::CancelRide { ride_id, reason } => {
                self.rides.cancel_ride(identity, ride_id, reason).await?;
            }
            InboundEvent::SendMessage { ride_id, message } => {
                self.send_message(identity, ride_id, message).await?;
            }
        }
        Ok(())
    }

    /// Record a driver's position, move them in the index if online, and
    /// pass it on to the rider of their current ride.
    pub async fn update_location(
        &self,
        driver_id: Uuid,
        location: Coordinates,
        heading: Option<f64>,
    ) -> AppResult<()> {
        location.validate()?;
        let now = Utc::now();
        let active_ride = {
            let _guard = self.rides.driver_locks.lock(driver_id).await;
            let mut driver = self
                .repo
                .load_driver(driver_id)
                .await?
                .ok_or_else(|| AppError::NotFound("Driver profile not found".to_string()))?;

            if driver
                .location_updated_at
                .is_some_and(|at| at.with_timezone(&Utc) > now)
            {
                return Ok(());
            }
            driver.current_lat = Some(location.lat);
            driver.current_lng = Some(location.lng);
            driver.heading = heading;
            driver.location_updated_at = Some(now.into());
            self.repo.save_driver(&driver).await?;

            let active_ride = self.rides.resume_slot(&driver).await?;
            if driver.is_online && !self.geo.update_location(driver_id, location, now)? {
                // Evicted as stale; put the driver back.
                self.geo.upsert(DriverPosition {
                    driver_id,
                    location,
                    vehicle_class: driver.vehicle_class,
                    available: driver.is_available && active_ride.is_none(),
                    recorded_at: now,
                })?;
            }
            active_ride
        };

        if let Some(ride_id) = active_ride {
            let ride = self.rides.load_ride(ride_id).await?;
            if !ride.status.is_terminal() && ride.driver_id == Some(driver_id) {
                self.sessions.notify_user(
                    ride.rider_id,
                    OutboundEvent::DriverLocationUpdate {
                        ride_id,
                        driver_id,
                        lat: location.lat,
                        lng: location.lng,
                        heading,
                    },
                );
            }
        }
        Ok(())
    }

    /// Go online (indexed at the last known position) or offline (removed).
    pub async fn set_driver_status(
        &self,
        driver_id: Uuid,
        is_online: bool,
        is_available: Option<bool>,
    ) -> AppResult<()> {
        let _guard = self.rides.driver_locks.lock(driver_id).await;
        let mut driver = self
            .repo
            .load_driver(driver_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Driver profile not found".to_string()))?;

        let busy = self.rides.resume_slot(&driver).await?.is_some();
        if !busy && driver.current_ride_id.is_some() {
            tracing::info!(driver_id = %driver_id, ride_id = ?driver.current_ride_id, "Clearing stale ride binding");
            driver.current_ride_id = None;
        }
        driver.is_online = is_online;
        driver.is_available = is_online && !busy && is_available.unwrap_or(true);
        self.repo.save_driver(&driver).await?;

        if !is_online {
            self.geo.remove(driver_id);
        } else if let Some(location) = driver.last_known_location() {
            self.geo.upsert(DriverPosition {
                driver_id,
                location,
                vehicle_class: driver.vehicle_class,
                available: driver.is_available,
                recorded_at: driver
                    .location_updated_at
                    .map(|at| at.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
            })?;
            self.geo.set_available(driver_id, driver.is_available);
        }

        tracing::info!(
            driver_id = %driver_id,
            is_online = driver.is_online,
            is_available = driver.is_available,
            indexed = self.geo.contains(driver_id),
            "Driver status updated"
        );
        Ok(())
    }

    /// Relay a chat message between the rider and the assigned driver.
    pub async fn send_message(&self, sender: Identity, ride_id: Uuid, message: String) -> AppResult<()> {
        let ride = self.rides.load_ride(ride_id).await?;
        let Some(driver_id) = ride.driver_id else {
            return Err(AppError::Forbidden("Ride has no assigned driver".to_string()));
        };
        let recipient = if sender.user_id == ride.rider_id {
            driver_id
        } else if sender.user_id == driver_id {
            ride.rider_id
        } else {
            return Err(AppError::Forbidden("Not a party to this ride".to_string()));
        };
        if ride.status.is_terminal() {
            return Err(AppError::Conflict(format!("Ride is {}", ride.status)));
        }

        self.sessions.notify_user(
            recipient,
            OutboundEvent::NewMessage {
                ride_id,
                from: sender.user_id,
                message,
                sent_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn connected(&self, identity: Identity) {
        if identity.role == UserRole::Driver && self.rides.clear_reconnect_grace(identity.user_id) {
            tracing::info!(driver_id = %identity.user_id, "Driver reconnected within grace window");
        }
    }

    /// Tear down a connection. A driver's last connection going away takes
    /// them offline and, mid-ride, starts the reconnection grace window.
    pub async fn disconnected(&self, connection_id: ConnectionId) -> AppResult<()> {
        let Some(departure) = self.sessions.unregister(connection_id) else {
            return Ok(());
        };
        let identity = departure.identity;
        if identity.role != UserRole::Driver || !departure.last_connection {
            return Ok(());
        }

        {
            let _guard = self.rides.driver_locks.lock(identity.user_id).await;
            self.geo.remove(identity.user_id);
            if let Some(mut driver) = self.repo.load_driver(identity.user_id).await? {
                self.rides.resume_slot(&driver).await?;
                driver.is_online = false;
                driver.is_available = false;
                self.repo.save_driver(&driver).await?;
            }
        }
        self.rides.begin_reconnect_grace(identity.user_id);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

fn bearer_token<'a>(headers: &'a HeaderMap, params: &'a WsParams) -> Option<&'a str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .or(params.token.as_deref())
}

/// `GET /ws`. The credential is checked before the upgrade; a connection
/// that fails it never becomes a socket.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<Response> {
    let token = bearer_token(&headers, &params)
        .ok_or_else(|| AppError::Authentication("Missing credentials".to_string()))?;
    let claims = verify_token(token, &state.config.jwt_secret)?;
    let identity = Identity::from(&claims);

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    Ok(ws.on_upgrade(move |socket| handle_socket(state, identity, socket)))
}

async fn handle_socket(state: AppState, identity: Identity, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundEvent>();

    let connection_id = state.sessions.register(identity, tx);
    state.gateway.connected(identity);

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode outbound event");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "Socket read failed");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let result = match serde_json::from_str::<InboundEvent>(text.as_str()) {
                    Ok(event) => state.gateway.handle_event(identity, event).await,
                    Err(e) => Err(AppError::InvalidInput(format!("Malformed event: {}", e))),
                };
                if let Err(e) = result {
                    tracing::debug!(connection_id = %connection_id, error = %e, "Event rejected");
                    state
                        .sessions
                        .notify_connection(connection_id, OutboundEvent::error(&e));
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Err(e) = state.gateway.disconnected(connection_id).await {
        tracing::error!(connection_id = %connection_id, error = %e, "Disconnect cleanup failed");
    }
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::InMemoryRepository;
    use crate::entities::driver::{self, VehicleClass};
    use crate::entities::ride::{self, RideStatus};
    use crate::services::ride_state::RideStateMachine;
    use crate::services::routing::StraightLineRouting;

    const PICKUP: Coordinates = Coordinates { lat: 6.5244, lng: 3.3792 };
    const DROPOFF: Coordinates = Coordinates { lat: 6.6018, lng: 3.3515 };

    struct Harness {
        state: AppState,
        repo: Arc<InMemoryRepository>,
        rider: Identity,
        driver: Identity,
    }

    async fn harness() -> Harness {
        let repo = Arc::new(InMemoryRepository::new());
        let state = AppState::new(
            Config::for_tests(),
            repo.clone(),
            Arc::new(StraightLineRouting::new(40.0)),
        );
        let driver = Identity { user_id: Uuid::new_v4(), role: UserRole::Driver };
        repo.save_driver(&driver::Model::new(driver.user_id, VehicleClass::Economy))
            .await
            .unwrap();
        Harness {
            state,
            repo,
            rider: Identity { user_id: Uuid::new_v4(), role: UserRole::Rider },
            driver,
        }
    }

    fn connect(h: &Harness, identity: Identity) -> (ConnectionId, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = h.state.sessions.register(identity, tx);
        h.state.gateway.connected(identity);
        (id, rx)
    }

    async fn accepted_ride(h: &Harness) -> ride::Model {
        let estimate = h
            .state
            .rides
            .fare()
            .estimate(&PICKUP, &DROPOFF, VehicleClass::Economy, 1.0)
            .unwrap();
        let mut ride = RideStateMachine::new_ride(
            h.rider.user_id,
            PICKUP,
            DROPOFF,
            VehicleClass::Economy,
            &estimate,
            Utc::now(),
        );
        RideStateMachine::offer(&mut ride, Utc::now()).unwrap();
        RideStateMachine::accept(&mut ride, h.driver.user_id, Utc::now()).unwrap();
        h.repo.save_ride(&ride).await.unwrap();
        assert!(h.state.rides.slots().try_claim(h.driver.user_id, ride.id));
        ride
    }

    #[tokio::test]
    async fn test_driver_only_events_are_role_gated() {
        let h = harness().await;
        let err = h
            .state
            .gateway
            .handle_event(h.rider, InboundEvent::AcceptRide { ride_id: Uuid::new_v4() })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = h
            .state
            .gateway
            .handle_event(
                h.driver,
                InboundEvent::RequestRide {
                    pickup: PICKUP,
                    dropoff: DROPOFF,
                    vehicle_class: VehicleClass::Economy,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_going_online_indexes_driver_at_last_location() {
        let h = harness().await;
        let gateway = &h.state.gateway;

        gateway.update_location(h.driver.user_id, PICKUP, Some(90.0)).await.unwrap();
        assert!(!h.state.geo.contains(h.driver.user_id));

        gateway
            .handle_event(h.driver, InboundEvent::UpdateStatus { is_online: true, is_available: None })
            .await
            .unwrap();
        assert_eq!(h.state.geo.location_of(h.driver.user_id), Some(PICKUP));

        let moved = Coordinates { lat: PICKUP.lat + 0.01, lng: PICKUP.lng };
        gateway
            .handle_event(h.driver, InboundEvent::UpdateLocation { lat: moved.lat, lng: moved.lng, heading: None })
            .await
            .unwrap();
        assert_eq!(h.state.geo.location_of(h.driver.user_id), Some(moved));

        gateway
            .handle_event(h.driver, InboundEvent::UpdateStatus { is_online: false, is_available: None })
            .await
            .unwrap();
        assert!(!h.state.geo.contains(h.driver.user_id));
        let record = h.repo.load_driver(h.driver.user_id).await.unwrap().unwrap();
        assert!(!record.is_online);
        assert_eq!(record.current_lat, Some(moved.lat));
    }

    #[tokio::test]
    async fn test_location_is_forwarded_to_rider() {
        let h = harness().await;
        let ride = accepted_ride(&h).await;
        let (_, mut rider_rx) = connect(&h, h.rider);

        h.state
            .gateway
            .update_location(h.driver.user_id, PICKUP, Some(45.0))
            .await
            .unwrap();

        match rider_rx.try_recv().unwrap() {
            OutboundEvent::DriverLocationUpdate { ride_id, driver_id, heading, .. } => {
                assert_eq!(ride_id, ride.id);
                assert_eq!(driver_id, h.driver.user_id);
                assert_eq!(heading, Some(45.0));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_messages_flow_between_parties_only() {
        let h = harness().await;
        let ride = accepted_ride(&h).await;
        let (_, mut driver_rx) = connect(&h, h.driver);

        h.state
            .gateway
            .handle_event(h.rider, InboundEvent::SendMessage { ride_id: ride.id, message: "At the gate".into() })
            .await
            .unwrap();
        match driver_rx.try_recv().unwrap() {
            OutboundEvent::NewMessage { from, message, .. } => {
                assert_eq!(from, h.rider.user_id);
                assert_eq!(message, "At the gate");
            }
            other => panic!("unexpected event {other:?}"),
        }

        let stranger = Identity { user_id: Uuid::new_v4(), role: UserRole::Rider };
        let err = h
            .state
            .gateway
            .handle_event(stranger, InboundEvent::SendMessage { ride_id: ride.id, message: "hi".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = h
            .state
            .gateway
            .handle_event(h.rider, InboundEvent::SendMessage { ride_id: ride.id, message: "x".repeat(501) })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_driver_disconnect_goes_offline() {
        let h = harness().await;
        let (connection, _rx) = connect(&h, h.driver);
        h.state.gateway.update_location(h.driver.user_id, PICKUP, None).await.unwrap();
        h.state
            .gateway
            .set_driver_status(h.driver.user_id, true, Some(true))
            .await
            .unwrap();
        assert!(h.state.geo.contains(h.driver.user_id));

        h.state.gateway.disconnected(connection).await.unwrap();
        assert!(!h.state.geo.contains(h.driver.user_id));
        let record = h.repo.load_driver(h.driver.user_id).await.unwrap().unwrap();
        assert!(!record.is_online);
        assert!(!record.is_available);
    }

    #[tokio::test]
    async fn test_busy_driver_comes_online_unavailable() {
        let h = harness().await;
        accepted_ride(&h).await;
        h.state.gateway.update_location(h.driver.user_id, PICKUP, None).await.unwrap();
        h.state
            .gateway
            .set_driver_status(h.driver.user_id, true, Some(true))
            .await
            .unwrap();

        let nearby = h.state.geo.query_nearby(PICKUP, 2.0, VehicleClass::Economy, 10).unwrap();
        assert!(nearby.is_empty());
        assert!(h.state.geo.contains(h.driver.user_id));
    }

    async fn next_offer(rx: &mut mpsc::UnboundedReceiver<OutboundEvent>) -> Uuid {
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .expect("no offer in time")
                .expect("channel closed");
            if let OutboundEvent::RideRequest { ride_id, .. } = event {
                return ride_id;
            }
        }
    }

    #[tokio::test]
    async fn test_ride_binding_survives_restart() {
        let h = harness().await;
        let (_, mut driver_rx) = connect(&h, h.driver);
        h.state.gateway.update_location(h.driver.user_id, PICKUP, None).await.unwrap();
        h.state.gateway.set_driver_status(h.driver.user_id, true, None).await.unwrap();

        let request = RideRequest { pickup: PICKUP, dropoff: DROPOFF, vehicle_class: VehicleClass::Economy };
        let first = h.state.dispatch.request_ride(h.rider.user_id, request).await.unwrap();
        assert_eq!(next_offer(&mut driver_rx).await, first.id);
        h.state
            .gateway
            .handle_event(h.driver, InboundEvent::AcceptRide { ride_id: first.id })
            .await
            .unwrap();

        // Same storage, fresh process state.
        let restarted = AppState::new(
            Config::for_tests(),
            h.repo.clone(),
            Arc::new(StraightLineRouting::new(40.0)),
        );
        assert_eq!(restarted.rides.slots().active_ride(h.driver.user_id), None);

        let estimate = restarted
            .rides
            .fare()
            .estimate(&PICKUP, &DROPOFF, VehicleClass::Economy, 1.0)
            .unwrap();
        let mut second = RideStateMachine::new_ride(
            Uuid::new_v4(),
            PICKUP,
            DROPOFF,
            VehicleClass::Economy,
            &estimate,
            Utc::now(),
        );
        RideStateMachine::offer(&mut second, Utc::now()).unwrap();
        h.repo.save_ride(&second).await.unwrap();
        let _pending = restarted
            .rides
            .offers
            .issue(second.id, h.driver.user_id, std::time::Duration::from_secs(5))
            .unwrap();

        let err = restarted.dispatch.accept_offer(h.driver.user_id, second.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        let stored = h.repo.load_ride(second.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RideStatus::Offered);
        assert_eq!(restarted.rides.slots().active_ride(h.driver.user_id), Some(first.id));

        restarted.gateway.update_location(h.driver.user_id, PICKUP, None).await.unwrap();
        restarted
            .gateway
            .set_driver_status(h.driver.user_id, true, Some(true))
            .await
            .unwrap();
        assert!(restarted.geo.contains(h.driver.user_id));
        let nearby = restarted.geo.query_nearby(PICKUP, 2.0, VehicleClass::Economy, 10).unwrap();
        assert!(nearby.is_empty());
        let record = h.repo.load_driver(h.driver.user_id).await.unwrap().unwrap();
        assert_eq!(record.current_ride_id, Some(first.id));
        assert!(!record.is_available);
    }

    #[tokio::test]
    async fn test_binding_to_finished_ride_is_cleared_on_going_online() {
        let h = harness().await;
        let ride = accepted_ride(&h).await;
        h.state.rides.cancel_ride(h.rider, ride.id, None).await.unwrap();

        // Record still pointing at the cancelled ride, slot already gone.
        let mut record = h.repo.load_driver(h.driver.user_id).await.unwrap().unwrap();
        record.current_ride_id = Some(ride.id);
        record.current_lat = Some(PICKUP.lat);
        record.current_lng = Some(PICKUP.lng);
        h.repo.save_driver(&record).await.unwrap();

        h.state
            .gateway
            .set_driver_status(h.driver.user_id, true, None)
            .await
            .unwrap();

        let record = h.repo.load_driver(h.driver.user_id).await.unwrap().unwrap();
        assert_eq!(record.current_ride_id, None);
        assert!(record.is_available);
        let nearby = h.state.geo.query_nearby(PICKUP, 2.0, VehicleClass::Economy, 10).unwrap();
        assert_eq!(nearby.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_event_cancels_ride() {
        let h = harness().await;
        let ride = accepted_ride(&h).await;
        h.state
            .gateway
            .handle_event(h.rider, InboundEvent::CancelRide { ride_id: ride.id, reason: None })
            .await
            .unwrap();
        let stored = h.repo.load_ride(ride.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RideStatus::Cancelled);
    }
}
