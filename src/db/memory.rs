use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::RideRepository;
use crate::entities::{driver, ride, user};
use crate::error::{AppError, AppResult};

/// Process-local store. Used when no `DATABASE_URL` is configured and by
/// tests.
#[derive(Default)]
pub struct InMemoryRepository {
    users: RwLock<HashMap<Uuid, user::Model>>,
    drivers: RwLock<HashMap<Uuid, driver::Model>>,
    rides: RwLock<HashMap<Uuid, ride::Model>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ride_count(&self) -> usize {
        self.rides.read().await.len()
    }
}

#[async_trait]
impl RideRepository for InMemoryRepository {
    async fn load_driver(&self, id: Uuid) -> AppResult<Option<driver::Model>> {
        Ok(self.drivers.read().await.get(&id).cloned())
    }

    async fn save_driver(&self, driver: &driver::Model) -> AppResult<()> {
        self.drivers.write().await.insert(driver.id, driver.clone());
        Ok(())
    }

    async fn load_ride(&self, id: Uuid) -> AppResult<Option<ride::Model>> {
        Ok(self.rides.read().await.get(&id).cloned())
    }

    async fn save_ride(&self, ride: &ride::Model) -> AppResult<()> {
        self.rides.write().await.insert(ride.id, ride.clone());
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<user::Model>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn load_user(&self, id: Uuid) -> AppResult<Option<user::Model>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn create_user(&self, user: &user::Model) -> AppResult<()> {
        let mut users = self.users.write().await;
        if users.values().any(|u| u.email == user.email) {
            return Err(AppError::Conflict("Email already registered".to_string()));
        }
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn list_rides_for_user(
        &self,
        user_id: Uuid,
        page: u64,
        limit: u64,
    ) -> AppResult<(Vec<ride::Model>, u64)> {
        let mut finished: Vec<ride::Model> = self
            .rides
            .read()
            .await
            .values()
            .filter(|r| r.status.is_terminal() && r.is_party(user_id))
            .cloned()
            .collect();
        finished.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));

        let total = finished.len() as u64;
        let skip = (page.saturating_sub(1) * limit) as usize;
        let rides = finished.into_iter().skip(skip).take(limit as usize).collect();
        Ok((rides, total))
    }

    async fn completed_rides_for_driver(
        &self,
        driver_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<ride::Model>> {
        Ok(self
            .rides
            .read()
            .await
            .values()
            .filter(|r| r.status == ride::RideStatus::Completed && r.driver_id == Some(driver_id))
            .filter(|r| match (since, r.completed_at) {
                (None, _) => true,
                (Some(since), Some(at)) => at >= since,
                (Some(_), None) => false,
            })
            .cloned()
            .collect())
    }
}
