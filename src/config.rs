use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::entities::driver::VehicleClass;

#[derive(Clone, Debug)]
pub struct Config {
    /// Postgres URL; when unset the service keeps its records in memory.
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub jwt_expiration_hours: i64,
    pub server_host: String,
    pub server_port: u16,
    /// Admin account created at startup when both are set.
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
    pub fare: FareConfig,
    pub dispatch: DispatchConfig,
    pub geo: GeoConfig,
    pub routing: RoutingConfig,
    pub gateway: GatewayConfig,
}

/// Tariff inputs. Every rate is a named parameter so a deployment can
/// override it without a rebuild.
#[derive(Clone, Debug, PartialEq)]
pub struct FareConfig {
    pub base_fare: f64,
    pub per_km_rate: f64,
    pub per_min_rate: f64,
    pub economy_multiplier: f64,
    pub comfort_multiplier: f64,
    pub xl_multiplier: f64,
    pub bike_multiplier: f64,
    pub commission_rate: f64,
    pub max_surge_multiplier: f64,
    /// Surge applied to new requests until a demand model exists.
    pub default_surge_multiplier: f64,
    /// Used for pre-trip duration estimates.
    pub average_speed_kmh: f64,
}

impl FareConfig {
    pub fn class_multiplier(&self, class: VehicleClass) -> f64 {
        match class {
            VehicleClass::Economy => self.economy_multiplier,
            VehicleClass::Comfort => self.comfort_multiplier,
            VehicleClass::Xl => self.xl_multiplier,
            VehicleClass::Bike => self.bike_multiplier,
        }
    }
}

impl Default for FareConfig {
    fn default() -> Self {
        Self {
            base_fare: 2.50,
            per_km_rate: 1.20,
            per_min_rate: 0.30,
            economy_multiplier: 1.0,
            comfort_multiplier: 1.25,
            xl_multiplier: 1.6,
            bike_multiplier: 0.65,
            commission_rate: 0.15,
            max_surge_multiplier: 3.0,
            default_surge_multiplier: 1.0,
            average_speed_kmh: 40.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub start_radius_km: f64,
    pub max_radius_km: f64,
    pub candidate_limit: usize,
    pub offer_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            start_radius_km: 2.0,
            max_radius_km: 16.0,
            candidate_limit: 20,
            offer_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GeoConfig {
    pub cell_size_km: f64,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            cell_size_km: 2.0,
            stale_after: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RoutingProviderKind {
    Osrm,
    StraightLine,
}

impl FromStr for RoutingProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "osrm" => Ok(RoutingProviderKind::Osrm),
            "straight-line" | "straight_line" => Ok(RoutingProviderKind::StraightLine),
            _ => Err(format!(
                "Invalid routing provider: {}. Use 'osrm' or 'straight-line'",
                s
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RoutingConfig {
    pub provider: RoutingProviderKind,
    pub base_url: String,
    pub timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            provider: RoutingProviderKind::StraightLine,
            base_url: "https://router.project-osrm.org".to_string(),
            timeout: Duration::from_millis(3000),
            retry_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub driver_reconnect_grace: Duration,
    pub max_message_len: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            driver_reconnect_grace: Duration::from_secs(60),
            max_message_len: 500,
        }
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + ToString,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or_else(|_| panic!("{} must be a valid value", key))
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let fare_defaults = FareConfig::default();
        let dispatch_defaults = DispatchConfig::default();
        let geo_defaults = GeoConfig::default();
        let routing_defaults = RoutingConfig::default();
        let gateway_defaults = GatewayConfig::default();

        let config = Self {
            database_url: env::var("DATABASE_URL").ok(),
            jwt_secret: env::var("JWT_SECRET")
                .expect("JWT_SECRET must be set"),
            jwt_expiration_hours: env_or("JWT_EXPIRATION_HOURS", 24),
            server_host: env::var("SERVER_HOST")
                .unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env_or("SERVER_PORT", 3000),
            admin_email: env::var("ADMIN_EMAIL").ok(),
            admin_password: env::var("ADMIN_PASSWORD").ok(),
            fare: FareConfig {
                base_fare: env_or("FARE_BASE", fare_defaults.base_fare),
                per_km_rate: env_or("FARE_PER_KM", fare_defaults.per_km_rate),
                per_min_rate: env_or("FARE_PER_MIN", fare_defaults.per_min_rate),
                economy_multiplier: env_or("FARE_MULT_ECONOMY", fare_defaults.economy_multiplier),
                comfort_multiplier: env_or("FARE_MULT_COMFORT", fare_defaults.comfort_multiplier),
                xl_multiplier: env_or("FARE_MULT_XL", fare_defaults.xl_multiplier),
                bike_multiplier: env_or("FARE_MULT_BIKE", fare_defaults.bike_multiplier),
                commission_rate: env_or("FARE_COMMISSION_RATE", fare_defaults.commission_rate),
                max_surge_multiplier: env_or("FARE_MAX_SURGE", fare_defaults.max_surge_multiplier),
                default_surge_multiplier: env_or(
                    "FARE_SURGE_MULTIPLIER",
                    fare_defaults.default_surge_multiplier,
                ),
                average_speed_kmh: env_or("FARE_AVERAGE_SPEED_KMH", fare_defaults.average_speed_kmh),
            },
            dispatch: DispatchConfig {
                start_radius_km: env_or("DISPATCH_START_RADIUS_KM", dispatch_defaults.start_radius_km),
                max_radius_km: env_or("DISPATCH_MAX_RADIUS_KM", dispatch_defaults.max_radius_km),
                candidate_limit: env_or("DISPATCH_CANDIDATE_LIMIT", dispatch_defaults.candidate_limit),
                offer_timeout: Duration::from_secs(env_or(
                    "DISPATCH_OFFER_TIMEOUT_SECS",
                    dispatch_defaults.offer_timeout.as_secs(),
                )),
            },
            geo: GeoConfig {
                cell_size_km: env_or("GEO_CELL_SIZE_KM", geo_defaults.cell_size_km),
                stale_after: Duration::from_secs(env_or(
                    "GEO_STALE_AFTER_SECS",
                    geo_defaults.stale_after.as_secs(),
                )),
                sweep_interval: Duration::from_secs(env_or(
                    "GEO_SWEEP_INTERVAL_SECS",
                    geo_defaults.sweep_interval.as_secs(),
                )),
            },
            routing: RoutingConfig {
                provider: env::var("ROUTING_PROVIDER")
                    .unwrap_or_else(|_| "straight-line".to_string())
                    .parse()
                    .unwrap_or_else(|e: String| panic!("{}", e)),
                base_url: env::var("ROUTING_BASE_URL").unwrap_or(routing_defaults.base_url),
                timeout: Duration::from_millis(env_or(
                    "ROUTING_TIMEOUT_MS",
                    routing_defaults.timeout.as_millis() as u64,
                )),
                retry_backoff: Duration::from_millis(env_or(
                    "ROUTING_RETRY_BACKOFF_MS",
                    routing_defaults.retry_backoff.as_millis() as u64,
                )),
            },
            gateway: GatewayConfig {
                driver_reconnect_grace: Duration::from_secs(env_or(
                    "DRIVER_RECONNECT_GRACE_SECS",
                    gateway_defaults.driver_reconnect_grace.as_secs(),
                )),
                max_message_len: env_or("MAX_MESSAGE_LEN", gateway_defaults.max_message_len),
            },
        };

        if config.fare.default_surge_multiplier < 1.0 {
            panic!("FARE_SURGE_MULTIPLIER must be at least 1.0");
        }
        if config.dispatch.start_radius_km <= 0.0
            || config.dispatch.max_radius_km < config.dispatch.start_radius_km
        {
            panic!("DISPATCH_START_RADIUS_KM must be positive and not exceed DISPATCH_MAX_RADIUS_KM");
        }

        config
    }

    /// Configuration with every default and a fixed secret; used by tests.
    pub fn for_tests() -> Self {
        Self {
            database_url: None,
            jwt_secret: "test-secret".to_string(),
            jwt_expiration_hours: 1,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            admin_email: None,
            admin_password: None,
            fare: FareConfig::default(),
            dispatch: DispatchConfig::default(),
            geo: GeoConfig::default(),
            routing: RoutingConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}
