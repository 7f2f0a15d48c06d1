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
                    .table(Rides::Table)
                    .if_not_exists()
                    .col(uuid(Rides::Id).primary_key())
                    .col(uuid(Rides::RiderId).not_null())
                    .col(uuid_null(Rides::DriverId))
                    .col(double(Rides::PickupLat).not_null())
                    .col(double(Rides::PickupLng).not_null())
                    .col(double(Rides::DropoffLat).not_null())
                    .col(double(Rides::DropoffLng).not_null())
                    .col(string_len(Rides::VehicleClass, 16).not_null())
                    .col(string_len(Rides::Status, 16).not_null())
                    .col(double(Rides::SurgeMultiplier).not_null().default(1.0))
                    .col(double(Rides::EstimatedDistanceKm).not_null())
                    .col(double(Rides::EstimatedDurationMin).not_null())
                    .col(double(Rides::EstimatedFare).not_null())
                    .col(double_null(Rides::DistanceKm))
                    .col(double_null(Rides::DurationMin))
                    .col(double_null(Rides::BaseFare))
                    .col(double_null(Rides::DistanceFare))
                    .col(double_null(Rides::TimeFare))
                    .col(double_null(Rides::FinalFare))
                    .col(double_null(Rides::PlatformCommission))
                    .col(double_null(Rides::DriverEarnings))
                    .col(timestamp_with_time_zone(Rides::RequestedAt).not_null())
                    .col(timestamp_with_time_zone_null(Rides::OfferedAt))
                    .col(timestamp_with_time_zone_null(Rides::AcceptedAt))
                    .col(timestamp_with_time_zone_null(Rides::ArrivedAt))
                    .col(timestamp_with_time_zone_null(Rides::StartedAt))
                    .col(timestamp_with_time_zone_null(Rides::CompletedAt))
                    .col(timestamp_with_time_zone_null(Rides::CancelledAt))
                    .col(string_len_null(Rides::CancelledBy, 16))
                    .col(string_len_null(Rides::CancellationReason, 32))
                    .col(string_len_null(Rides::CancellationNote, 500))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_ride_rider")
                            .from(Rides::Table, Rides::RiderId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_ride_driver")
                            .from(Rides::Table, Rides::DriverId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_rides_rider_requested")
                    .table(Rides::Table)
                    .col(Rides::RiderId)
                    .col(Rides::RequestedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_rides_status")
                    .table(Rides::Table)
                    .col(Rides::Status)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Rides::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Rides {
    Table,
    Id,
    RiderId,
    DriverId,
    PickupLat,
    PickupLng,
    DropoffLat,
    DropoffLng,
    VehicleClass,
    Status,
    SurgeMultiplier,
    EstimatedDistanceKm,
    EstimatedDurationMin,
    EstimatedFare,
    DistanceKm,
    DurationMin,
    BaseFare,
    DistanceFare,
    TimeFare,
    FinalFare,
    PlatformCommission,
    DriverEarnings,
    RequestedAt,
    OfferedAt,
    AcceptedAt,
    ArrivedAt,
    StartedAt,
    CompletedAt,
    CancelledAt,
    CancelledBy,
    CancellationReason,
    CancellationNote,
}
