pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{Database, DatabaseConnection};
use uuid::Uuid;

use crate::entities::{driver, ride, user};
use crate::error::{AppError, AppResult};

pub use memory::InMemoryRepository;
pub use postgres::SeaOrmRepository;

pub async fn connect(database_url: &str) -> AppResult<DatabaseConnection> {
    Database::connect(database_url)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to connect to database: {}", e)))
}

/// Persistence for the records the dispatch core mutates. `save_*` is an
/// upsert: saving a record that was just loaded is a no-op.
#[async_trait]
pub trait RideRepository: Send + Sync {
    async fn load_driver(&self, id: Uuid) -> AppResult<Option<driver::Model>>;

    async fn save_driver(&self, driver: &driver::Model) -> AppResult<()>;

    async fn load_ride(&self, id: Uuid) -> AppResult<Option<ride::Model>>;

    async fn save_ride(&self, ride: &ride::Model) -> AppResult<()>;

    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<user::Model>>;

    async fn load_user(&self, id: Uuid) -> AppResult<Option<user::Model>>;

    async fn create_user(&self, user: &user::Model) -> AppResult<()>;

    /// One page (1-based) of COMPLETED or CANCELLED rides where the user is
    /// rider or driver, newest request first, with the total match count.
    async fn list_rides_for_user(
        &self,
        user_id: Uuid,
        page: u64,
        limit: u64,
    ) -> AppResult<(Vec<ride::Model>, u64)>;

    /// COMPLETED rides of a driver, finished at or after `since` if given.
    async fn completed_rides_for_driver(
        &self,
        driver_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<ride::Model>>;
}
