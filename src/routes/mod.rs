use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::handlers::{self, auth, drivers, fares, rides};
use crate::middleware::auth::{auth_middleware, require_driver, require_rider};
use crate::middleware::rate_limit::create_public_governor;
use crate::middleware::account_rate_limit::{create_account_governor, RouteBudget};
use crate::realtime::ws_handler;
use crate::AppState;

pub fn create_router(state: AppState) -> Router {
    let booking_governor = create_account_governor(RouteBudget::Booking);
    let tracking_governor = create_account_governor(RouteBudget::Tracking);
    // IP-based governor for unauthenticated routes (booking-level limits)
    let public_governor = create_public_governor();

    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/register-driver", post(auth::register_driver))
        .route("/login", post(auth::login))
        .layer(public_governor.clone());

    // Rider routes (requires auth + rider role)
    let rider_routes = Router::new()
        .route("/rides", post(rides::create_ride))
        .layer(booking_governor)
        .layer(middleware::from_fn(require_rider))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Driver routes (requires auth + driver role)
    let driver_routes = Router::new()
        .route("/drivers/earnings", get(drivers::earnings))
        .layer(tracking_governor.clone())
        .layer(middleware::from_fn(require_driver))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Routes open to any authenticated user; party checks happen in the
    // ride service.
    let shared_routes = Router::new()
        .route("/rides/history", get(rides::ride_history))
        .route("/rides/{id}", get(rides::get_ride))
        .route("/rides/{id}/cancel", post(rides::cancel_ride))
        .route("/fares/estimate", post(fares::estimate))
        .route("/drivers/nearby", get(drivers::nearby))
        .layer(tracking_governor)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // The socket authenticates inside the handler, before the upgrade
    let socket_routes = Router::new()
        .route("/ws", get(ws_handler))
        .layer(public_governor);

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/auth", auth_routes)
        .nest("/api", rider_routes.merge(driver_routes).merge(shared_routes))
        .merge(socket_routes)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        extract::ConnectInfo,
        http::{header, Method, Request, StatusCode},
    };
    use chrono::Utc;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::config::Config;
    use crate::db::{InMemoryRepository, RideRepository};
    use crate::entities::driver::VehicleClass;
    use crate::entities::ride::RideStatus;
    use crate::services::geo_index::DriverPosition;
    use crate::services::ride_state::RideStateMachine;
    use crate::services::routing::StraightLineRouting;
    use crate::utils::geo::Coordinates;

    fn test_state() -> AppState {
        AppState::new(
            Config::for_tests(),
            Arc::new(InMemoryRepository::new()),
            Arc::new(StraightLineRouting::new(40.0)),
        )
    }

    fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let body = match body {
            Some(body) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let mut req = builder.body(body).unwrap();
        // The per-IP governor keys on the peer address
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
        req
    }

    async fn send(state: &AppState, req: Request<Body>) -> (StatusCode, Value) {
        let response = create_router(state.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn register_rider(state: &AppState, email: &str) -> (String, Uuid) {
        let (status, body) = send(
            state,
            request(
                Method::POST,
                "/api/auth/register",
                None,
                Some(json!({"email": email, "password": "hunter2hunter2", "name": "Ada"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["user"]["id"].as_str().unwrap().parse().unwrap();
        (body["token"].as_str().unwrap().to_string(), id)
    }

    async fn register_driver(state: &AppState, email: &str) -> (String, Uuid) {
        let (status, body) = send(
            state,
            request(
                Method::POST,
                "/api/auth/register-driver",
                None,
                Some(json!({
                    "email": email,
                    "password": "hunter2hunter2",
                    "name": "Dele",
                    "vehicleClass": "comfort",
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user"]["role"], "driver");
        let id = body["user"]["id"].as_str().unwrap().parse().unwrap();
        (body["token"].as_str().unwrap().to_string(), id)
    }

    fn trip() -> Value {
        json!({
            "pickup": {"lat": 6.5244, "lng": 3.3792},
            "dropoff": {"lat": 6.6018, "lng": 3.3515},
            "vehicleClass": "economy",
        })
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state();
        let (status, body) = send(&state, request(Method::GET, "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let state = test_state();
        register_rider(&state, "ada@example.com").await;

        let (status, body) = send(
            &state,
            request(
                Method::POST,
                "/api/auth/login",
                None,
                Some(json!({"email": "Ada@Example.com", "password": "hunter2hunter2"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["role"], "rider");
        assert!(body["token"].as_str().is_some());

        let (status, body) = send(
            &state,
            request(
                Method::POST,
                "/api/auth/login",
                None,
                Some(json!({"email": "ada@example.com", "password": "wrong-password"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "authentication_error");
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts() {
        let state = test_state();
        register_rider(&state, "ada@example.com").await;

        let (status, body) = send(
            &state,
            request(
                Method::POST,
                "/api/auth/register",
                None,
                Some(json!({"email": "ada@example.com", "password": "hunter2hunter2", "name": "Ada"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");
    }

    #[tokio::test]
    async fn test_weak_password_rejected() {
        let state = test_state();
        let (status, _) = send(
            &state,
            request(
                Method::POST,
                "/api/auth/register",
                None,
                Some(json!({"email": "ada@example.com", "password": "short", "name": "Ada"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_driver_registration_creates_driver_record() {
        let state = test_state();
        let (_, driver_id) = register_driver(&state, "dele@example.com").await;

        let driver = state.repo.load_driver(driver_id).await.unwrap().unwrap();
        assert_eq!(driver.vehicle_class, VehicleClass::Comfort);
        assert!(!driver.is_online);
    }

    #[tokio::test]
    async fn test_ride_routes_require_authentication() {
        let state = test_state();
        let (status, body) = send(&state, request(Method::POST, "/api/rides", None, Some(trip()))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "authentication_error");

        let (status, _) = send(
            &state,
            request(Method::POST, "/api/rides", Some("not-a-token"), Some(trip())),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_only_riders_request_rides() {
        let state = test_state();
        let (token, _) = register_driver(&state, "dele@example.com").await;

        let (status, body) = send(
            &state,
            request(Method::POST, "/api/rides", Some(&token), Some(trip())),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");
    }

    #[tokio::test]
    async fn test_rider_requests_and_reads_ride() {
        let state = test_state();
        let (token, rider_id) = register_rider(&state, "ada@example.com").await;

        let (status, ride) = send(
            &state,
            request(Method::POST, "/api/rides", Some(&token), Some(trip())),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(ride["status"], "REQUESTED");
        assert_eq!(ride["rider_id"], rider_id.to_string());
        assert!(ride["estimated_fare"].as_f64().unwrap() > 0.0);

        let uri = format!("/api/rides/{}", ride["id"].as_str().unwrap());
        let (status, fetched) = send(&state, request(Method::GET, &uri, Some(&token), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["id"], ride["id"]);

        let (stranger, _) = register_rider(&state, "eve@example.com").await;
        let (status, _) = send(&state, request(Method::GET, &uri, Some(&stranger), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_ride_is_not_found() {
        let state = test_state();
        let (token, _) = register_rider(&state, "ada@example.com").await;
        let uri = format!("/api/rides/{}", Uuid::new_v4());

        let (status, body) = send(&state, request(Method::GET, &uri, Some(&token), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_invalid_coordinates_rejected() {
        let state = test_state();
        let (token, _) = register_rider(&state, "ada@example.com").await;

        let (status, body) = send(
            &state,
            request(
                Method::POST,
                "/api/rides",
                Some(&token),
                Some(json!({
                    "pickup": {"lat": 91.0, "lng": 3.3792},
                    "dropoff": {"lat": 6.6018, "lng": 3.3515},
                    "vehicleClass": "economy",
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");
    }

    #[tokio::test]
    async fn test_rider_cancels_ride() {
        let state = test_state();
        let (token, _) = register_rider(&state, "ada@example.com").await;
        let (_, ride) = send(
            &state,
            request(Method::POST, "/api/rides", Some(&token), Some(trip())),
        )
        .await;
        let uri = format!("/api/rides/{}/cancel", ride["id"].as_str().unwrap());

        let (status, body) = send(
            &state,
            request(Method::POST, &uri, Some(&token), Some(json!({"reason": "changed plans"}))),
        )
        .await;
        // With no drivers online the dispatch loop may have cancelled first
        match status {
            StatusCode::OK => {
                assert_eq!(body["status"], "CANCELLED");
                assert_eq!(body["cancelled_by"], "rider");
                assert_eq!(body["cancellation_note"], "changed plans");
            }
            StatusCode::CONFLICT => assert_eq!(body["error"], "invalid_transition"),
            other => panic!("unexpected status {}", other),
        }

        let (status, body) = send(&state, request(Method::POST, &uri, Some(&token), Some(json!({})))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_transition");
    }

    #[tokio::test]
    async fn test_fare_estimate() {
        let state = test_state();
        let (token, _) = register_rider(&state, "ada@example.com").await;

        let (status, body) = send(
            &state,
            request(Method::POST, "/api/fares/estimate", Some(&token), Some(trip())),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let quote = &body["quote"];
        assert_eq!(quote["surge_multiplier"], 1.0);
        let total = quote["total"].as_f64().unwrap();
        let split = quote["platform_commission"].as_f64().unwrap() + quote["driver_earnings"].as_f64().unwrap();
        assert!((total - split).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_nearby_drivers() {
        let state = test_state();
        let (token, _) = register_rider(&state, "ada@example.com").await;
        let driver_id = Uuid::new_v4();
        state
            .geo
            .upsert(DriverPosition {
                driver_id,
                location: Coordinates { lat: 6.5250, lng: 3.3800 },
                vehicle_class: VehicleClass::Economy,
                available: true,
                recorded_at: Utc::now(),
            })
            .unwrap();

        let (status, body) = send(
            &state,
            request(
                Method::GET,
                "/api/drivers/nearby?lat=6.5244&lng=3.3792&vehicle_class=economy&radius_km=3",
                Some(&token),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let drivers = body.as_array().unwrap();
        assert_eq!(drivers.len(), 1);
        assert_eq!(drivers[0]["driver_id"], driver_id.to_string());

        let (status, body) = send(
            &state,
            request(
                Method::GET,
                "/api/drivers/nearby?lat=6.5244&lng=3.3792&vehicle_class=comfort",
                Some(&token),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }

    /// A finished ride between `rider` and `driver`, closed `days_ago`.
    async fn seed_finished_ride(
        state: &AppState,
        rider: Uuid,
        driver: Uuid,
        status: RideStatus,
        days_ago: i64,
        earnings: f64,
    ) -> Uuid {
        let pickup = Coordinates { lat: 6.5244, lng: 3.3792 };
        let dropoff = Coordinates { lat: 6.6018, lng: 3.3515 };
        let estimate = state
            .rides
            .fare()
            .estimate(&pickup, &dropoff, VehicleClass::Economy, 1.0)
            .unwrap();
        let closed_at = Utc::now() - chrono::Duration::days(days_ago);
        let mut ride = RideStateMachine::new_ride(
            rider,
            pickup,
            dropoff,
            VehicleClass::Economy,
            &estimate,
            closed_at - chrono::Duration::minutes(20),
        );
        ride.driver_id = Some(driver);
        ride.status = status;
        match status {
            RideStatus::Completed => {
                ride.completed_at = Some(closed_at.into());
                ride.driver_earnings = Some(earnings);
                ride.distance_km = Some(earnings / 125.0);
            }
            RideStatus::Cancelled => ride.cancelled_at = Some(closed_at.into()),
            _ => {}
        }
        state.repo.save_ride(&ride).await.unwrap();
        ride.id
    }

    #[tokio::test]
    async fn test_ride_history_pages_finished_rides_newest_first() {
        let state = test_state();
        let (rider_token, rider_id) = register_rider(&state, "ada@example.com").await;
        let (driver_token, driver_id) = register_driver(&state, "dele@example.com").await;

        let newest = seed_finished_ride(&state, rider_id, driver_id, RideStatus::Completed, 1, 1000.0).await;
        seed_finished_ride(&state, rider_id, driver_id, RideStatus::Cancelled, 2, 0.0).await;
        seed_finished_ride(&state, rider_id, driver_id, RideStatus::Completed, 3, 1000.0).await;
        let oldest = seed_finished_ride(&state, rider_id, driver_id, RideStatus::Completed, 4, 1000.0).await;
        // Not finished, or somebody else's.
        seed_finished_ride(&state, rider_id, driver_id, RideStatus::InProgress, 0, 0.0).await;
        seed_finished_ride(&state, Uuid::new_v4(), Uuid::new_v4(), RideStatus::Completed, 0, 900.0).await;

        let (status, body) = send(
            &state,
            request(Method::GET, "/api/rides/history?page=1&limit=3", Some(&rider_token), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"], json!({"page": 1, "limit": 3, "total": 4, "pages": 2}));
        let rides = body["rides"].as_array().unwrap();
        assert_eq!(rides.len(), 3);
        assert_eq!(rides[0]["id"], newest.to_string());
        assert!(rides.iter().all(|r| r["status"] == "COMPLETED" || r["status"] == "CANCELLED"));

        let (_, body) = send(
            &state,
            request(Method::GET, "/api/rides/history?page=2&limit=3", Some(&rider_token), None),
        )
        .await;
        let rides = body["rides"].as_array().unwrap();
        assert_eq!(rides.len(), 1);
        assert_eq!(rides[0]["id"], oldest.to_string());

        // The driver sees the same trips from their side.
        let (status, body) = send(&state, request(Method::GET, "/api/rides/history", Some(&driver_token), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["total"], 4);
        assert_eq!(body["pagination"]["limit"], 20);

        let (status, body) = send(
            &state,
            request(Method::GET, "/api/rides/history?limit=500", Some(&rider_token), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");

        let (status, _) = send(&state, request(Method::GET, "/api/rides/history", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_driver_earnings_by_period() {
        let state = test_state();
        let (rider_token, rider_id) = register_rider(&state, "ada@example.com").await;
        let (token, driver_id) = register_driver(&state, "dele@example.com").await;

        seed_finished_ride(&state, rider_id, driver_id, RideStatus::Completed, 0, 1000.0).await;
        seed_finished_ride(&state, rider_id, driver_id, RideStatus::Completed, 3, 1500.0).await;
        seed_finished_ride(&state, rider_id, driver_id, RideStatus::Completed, 40, 500.0).await;
        seed_finished_ride(&state, rider_id, driver_id, RideStatus::Cancelled, 0, 0.0).await;

        let earnings = |period: &'static str| {
            let state = state.clone();
            let token = token.clone();
            async move {
                let uri = format!("/api/drivers/earnings?period={}", period);
                send(&state, request(Method::GET, &uri, Some(&token), None)).await
            }
        };

        let (status, body) = earnings("today").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalRides"], 1);
        assert_eq!(body["totalEarnings"], 1000.0);

        let (_, body) = earnings("week").await;
        assert_eq!(body["totalRides"], 2);
        assert_eq!(body["totalEarnings"], 2500.0);
        assert_eq!(body["totalDistanceKm"], 20.0);
        assert_eq!(body["averagePerRide"], 1250.0);

        let (_, body) = earnings("all").await;
        assert_eq!(body["period"], "all");
        assert_eq!(body["totalRides"], 3);
        assert_eq!(body["averagePerRide"], 1000.0);

        let (status, _) = earnings("fortnight").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &state,
            request(Method::GET, "/api/drivers/earnings", Some(&rider_token), None),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");
    }

    #[tokio::test]
    async fn test_socket_rejects_missing_credentials() {
        let state = test_state();
        let (status, body) = send(&state, request(Method::GET, "/ws", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "authentication_error");

        let (status, _) = send(&state, request(Method::GET, "/ws?token=garbage", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
