use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware;
use sea_orm_migration::MigratorTrait;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ride_dispatch_backend::{
    config::Config,
    db::{self, InMemoryRepository, RideRepository, SeaOrmRepository},
    entities::user::UserRole,
    handlers::auth::create_account,
    middleware::rate_limit::{create_global_governor, log_request},
    routes,
    services::routing::build_provider,
    AppState,
};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ride_dispatch_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();
    tracing::info!("Starting server at {}", config.server_addr());

    let repo: Arc<dyn RideRepository> = match &config.database_url {
        Some(url) => {
            let db = db::connect(url)
                .await
                .expect("Failed to connect to database");
            tracing::info!("Connected to database");

            migration::Migrator::up(&db, None)
                .await
                .expect("Failed to run migrations");
            tracing::info!("Migrations complete");

            Arc::new(SeaOrmRepository::new(db))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, records are kept in memory only");
            Arc::new(InMemoryRepository::new())
        }
    };

    let routing = build_provider(&config.routing, config.fare.average_speed_kmh)
        .expect("Failed to build routing provider");
    tracing::info!(provider = ?config.routing.provider, "Routing provider ready");

    let state = AppState::new(config.clone(), repo, routing);

    seed_admin(&state).await;
    spawn_sweeper(state.clone());

    // Create router with middleware
    let app = routes::create_router(state.clone())
        .layer(middleware::from_fn(log_request))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(create_global_governor());

    // Start server with socket address for rate limiting
    let addr: SocketAddr = config.server_addr().parse().expect("Invalid address");
    let listener = TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", addr);

    let sessions = state.sessions.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutting down, closing realtime sessions");
        sessions.shutdown();
    })
    .await
    .expect("Failed to start server");
}

/// Create the admin account named by ADMIN_EMAIL / ADMIN_PASSWORD if it
/// doesn't exist yet
async fn seed_admin(state: &AppState) {
    let (Some(email), Some(password)) = (&state.config.admin_email, &state.config.admin_password)
    else {
        return;
    };

    let existing = state
        .repo
        .find_user_by_email(&email.trim().to_lowercase())
        .await
        .expect("Failed to check for admin");

    if existing.is_none() {
        create_account(state, email, password, "Admin", UserRole::Admin)
            .await
            .expect("Failed to create admin");
        tracing::info!("Admin account created: {}", email);
    }
}

/// Periodically evict drivers whose last ping is too old and drop idle
/// entity locks.
fn spawn_sweeper(state: AppState) {
    let period = state.config.geo.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = state.geo.evict_stale();
            let pruned = state.rides.prune_locks();
            if evicted > 0 || pruned > 0 {
                tracing::debug!(evicted, pruned, "Sweep complete");
            }
        }
    });
}
