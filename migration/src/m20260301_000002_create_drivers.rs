use sea_orm_migration::{prelude::*, schema::*};

use super::m20260301_000001_create_users::Users;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Drivers::Table)
                    .if_not_exists()
                    .col(uuid(Drivers::Id).primary_key())
                    .col(string_len(Drivers::VehicleClass, 16).not_null())
                    .col(double(Drivers::Rating).not_null().default(5.0))
                    .col(boolean(Drivers::IsOnline).not_null().default(false))
                    .col(boolean(Drivers::IsAvailable).not_null().default(false))
                    .col(double_null(Drivers::CurrentLat))
                    .col(double_null(Drivers::CurrentLng))
                    .col(double_null(Drivers::Heading))
                    .col(timestamp_with_time_zone_null(Drivers::LocationUpdatedAt))
                    .col(uuid_null(Drivers::CurrentRideId))
                    .col(
                        timestamp_with_time_zone(Drivers::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_driver_user")
                            .from(Drivers::Table, Drivers::Id)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Drivers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Drivers {
    Table,
    Id,
    VehicleClass,
    Rating,
    IsOnline,
    IsAvailable,
    CurrentLat,
    CurrentLng,
    Heading,
    LocationUpdatedAt,
    CurrentRideId,
    CreatedAt,
}
