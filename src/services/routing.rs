use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{RoutingConfig, RoutingProviderKind};
use crate::error::{AppError, AppResult};
use crate::utils::geo::Coordinates;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    pub distance_km: f64,
    pub duration_min: f64,
    /// Encoded polyline when the provider returns geometry.
    pub polyline: Option<String>,
}

/// Road routing between two points. Implementations are opaque to the rest
/// of the service.
#[async_trait]
pub trait RoutingProvider: Send + Sync {
    async fn get_route(&self, origin: Coordinates, destination: Coordinates) -> AppResult<Route>;
}

/// Client for an OSRM `route/v1` endpoint.
pub struct OsrmRoutingClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct OsrmResponse {
    code: String,
    message: Option<String>,
    routes: Option<Vec<OsrmRoute>>,
}

#[derive(Deserialize)]
struct OsrmRoute {
    distance: f64, // metres
    duration: f64, // seconds
    geometry: Option<String>,
}

impl OsrmRoutingClient {
    pub fn new(config: &RoutingConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RoutingProvider for OsrmRoutingClient {
    async fn get_route(&self, origin: Coordinates, destination: Coordinates) -> AppResult<Route> {
        let url = format!(
            "{}/route/v1/driving/{},{};{},{}",
            self.base_url, origin.lng, origin.lat, destination.lng, destination.lat
        );

        let response = self
            .client
            .get(&url)
            .query(&[("overview", "full"), ("geometries", "polyline")])
            .send()
            .await
            .map_err(|e| AppError::RouteUnavailable(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::RouteUnavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let body: OsrmResponse = response
            .json()
            .await
            .map_err(|e| AppError::RouteUnavailable(format!("Malformed response: {}", e)))?;

        if body.code != "Ok" {
            return Err(AppError::RouteUnavailable(format!(
                "{}: {}",
                body.code,
                body.message.unwrap_or_default()
            )));
        }

        let route = body
            .routes
            .and_then(|routes| routes.into_iter().next())
            .ok_or_else(|| AppError::RouteUnavailable("no route returned".to_string()))?;

        Ok(Route {
            distance_km: route.distance / 1000.0,
            duration_min: route.duration / 60.0,
            polyline: route.geometry,
        })
    }
}

/// Great-circle distance at a constant speed. Never fails for valid input.
pub struct StraightLineRouting {
    average_speed_kmh: f64,
}

impl StraightLineRouting {
    pub fn new(average_speed_kmh: f64) -> Self {
        Self { average_speed_kmh }
    }
}

#[async_trait]
impl RoutingProvider for StraightLineRouting {
    async fn get_route(&self, origin: Coordinates, destination: Coordinates) -> AppResult<Route> {
        origin.validate()?;
        destination.validate()?;
        let distance_km = origin.distance_km(&destination);
        Ok(Route {
            distance_km,
            duration_min: distance_km / self.average_speed_kmh * 60.0,
            polyline: None,
        })
    }
}

pub fn build_provider(config: &RoutingConfig, average_speed_kmh: f64) -> AppResult<Arc<dyn RoutingProvider>> {
    Ok(match config.provider {
        RoutingProviderKind::Osrm => Arc::new(OsrmRoutingClient::new(config)?),
        RoutingProviderKind::StraightLine => Arc::new(StraightLineRouting::new(average_speed_kmh)),
    })
}

/// One retry after `backoff` plus up to 50% jitter. Any failure after the
/// retry is reported as `RouteUnavailable`.
pub async fn get_route_with_retry(
    provider: &dyn RoutingProvider,
    origin: Coordinates,
    destination: Coordinates,
    backoff: Duration,
) -> AppResult<Route> {
    match provider.get_route(origin, destination).await {
        Ok(route) => return Ok(route),
        Err(AppError::InvalidInput(msg)) => return Err(AppError::InvalidInput(msg)),
        Err(e) => tracing::warn!(error = %e, "Route lookup failed, retrying once"),
    }

    let jitter_ms = if backoff.is_zero() {
        0
    } else {
        rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2)
    };
    tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;

    provider
        .get_route(origin, destination)
        .await
        .map_err(|e| match e {
            AppError::RouteUnavailable(msg) => AppError::RouteUnavailable(msg),
            AppError::InvalidInput(msg) => AppError::InvalidInput(msg),
            other => AppError::RouteUnavailable(other.to_string()),
        })
}
