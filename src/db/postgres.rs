use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, IntoActiveModel,
    PaginatorTrait, QueryFilter, QueryOrder,
};
use uuid::Uuid;

use super::RideRepository;
use crate::entities::{driver, ride, user};
use crate::error::{AppError, AppResult};

/// Postgres through SeaORM. Schema comes from the `migration` crate.
#[derive(Clone)]
pub struct SeaOrmRepository {
    db: DatabaseConnection,
}

impl SeaOrmRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl RideRepository for SeaOrmRepository {
    async fn load_driver(&self, id: Uuid) -> AppResult<Option<driver::Model>> {
        Ok(driver::Entity::find_by_id(id).one(&self.db).await?)
    }

    async fn save_driver(&self, model: &driver::Model) -> AppResult<()> {
        let exists = driver::Entity::find_by_id(model.id).one(&self.db).await?.is_some();
        let active = model.clone().into_active_model().reset_all();
        if exists {
            active.update(&self.db).await?;
        } else {
            active.insert(&self.db).await?;
        }
        Ok(())
    }

    async fn load_ride(&self, id: Uuid) -> AppResult<Option<ride::Model>> {
        Ok(ride::Entity::find_by_id(id).one(&self.db).await?)
    }

    async fn save_ride(&self, model: &ride::Model) -> AppResult<()> {
        let exists = ride::Entity::find_by_id(model.id).one(&self.db).await?.is_some();
        let active = model.clone().into_active_model().reset_all();
        if exists {
            active.update(&self.db).await?;
        } else {
            active.insert(&self.db).await?;
        }
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<user::Model>> {
        Ok(user::Entity::find()
            .filter(user::Column::Email.eq(email))
            .one(&self.db)
            .await?)
    }

    async fn load_user(&self, id: Uuid) -> AppResult<Option<user::Model>> {
        Ok(user::Entity::find_by_id(id).one(&self.db).await?)
    }

    async fn create_user(&self, model: &user::Model) -> AppResult<()> {
        if self.find_user_by_email(&model.email).await?.is_some() {
            return Err(AppError::Conflict("Email already registered".to_string()));
        }
        model.clone().into_active_model().reset_all().insert(&self.db).await?;
        Ok(())
    }

    async fn list_rides_for_user(
        &self,
        user_id: Uuid,
        page: u64,
        limit: u64,
    ) -> AppResult<(Vec<ride::Model>, u64)> {
        let party = Condition::any()
            .add(ride::Column::RiderId.eq(user_id))
            .add(ride::Column::DriverId.eq(user_id));
        let paginator = ride::Entity::find()
            .filter(party)
            .filter(ride::Column::Status.is_in([ride::RideStatus::Completed, ride::RideStatus::Cancelled]))
            .order_by_desc(ride::Column::RequestedAt)
            .paginate(&self.db, limit);

        let total = paginator.num_items().await?;
        let rides = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((rides, total))
    }

    async fn completed_rides_for_driver(
        &self,
        driver_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<ride::Model>> {
        let mut query = ride::Entity::find()
            .filter(ride::Column::DriverId.eq(driver_id))
            .filter(ride::Column::Status.eq(ride::RideStatus::Completed));
        if let Some(since) = since {
            query = query.filter(ride::Column::CompletedAt.gte(DateTimeWithTimeZone::from(since)));
        }
        Ok(query.all(&self.db).await?)
    }
}
