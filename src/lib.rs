pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod realtime;
pub mod routes;
pub mod services;
pub mod utils;

use std::sync::Arc;

use db::RideRepository;
use realtime::{RealtimeGateway, SessionRegistry};
use services::dispatch::DispatchCoordinator;
use services::geo_index::GeoIndex;
use services::rides::RideService;
use services::routing::RoutingProvider;

pub use config::Config;
pub use error::{AppError, AppResult};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub repo: Arc<dyn RideRepository>,
    pub geo: Arc<GeoIndex>,
    pub sessions: Arc<SessionRegistry>,
    pub rides: Arc<RideService>,
    pub dispatch: Arc<DispatchCoordinator>,
    pub gateway: Arc<RealtimeGateway>,
}

impl AppState {
    pub fn new(
        config: Config,
        repo: Arc<dyn RideRepository>,
        routing: Arc<dyn RoutingProvider>,
    ) -> Self {
        let geo = Arc::new(GeoIndex::new(&config.geo));
        let sessions = Arc::new(SessionRegistry::new());
        let rides = Arc::new(RideService::new(
            &config,
            repo.clone(),
            routing,
            geo.clone(),
            sessions.clone(),
        ));
        let dispatch = Arc::new(DispatchCoordinator::new(
            rides.clone(),
            config.dispatch.clone(),
            &config.fare,
        ));
        let gateway = Arc::new(RealtimeGateway::new(
            repo.clone(),
            geo.clone(),
            sessions.clone(),
            rides.clone(),
            dispatch.clone(),
            config.gateway.max_message_len,
        ));

        Self {
            config,
            repo,
            geo,
            sessions,
            rides,
            dispatch,
            gateway,
        }
    }
}
