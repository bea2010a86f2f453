//! Migration to create the certificates table

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Certificates::Table)
                    .if_not_exists()
                    .col(pk_auto(Certificates::Id))
                    .col(big_integer(Certificates::UserId).not_null())
                    .col(string_len(Certificates::Domain, 255).not_null())
                    .col(text_null(Certificates::AltDomains))
                    .col(
                        string_len(Certificates::Status, 20)
                            .not_null()
                            .default("pending"),
                    )
                    .col(string_len_null(Certificates::CertPath, 500))
                    .col(string_len_null(Certificates::KeyPath, 500))
                    .col(string_len_null(Certificates::ChainPath, 500))
                    .col(timestamp_with_time_zone_null(Certificates::IssuedAt))
                    .col(timestamp_with_time_zone_null(Certificates::ExpiresAt))
                    .col(boolean(Certificates::AutoRenew).not_null().default(true))
                    .col(integer(Certificates::RenewDays).not_null().default(30))
                    .col(timestamp_with_time_zone_null(Certificates::LastRenewAt))
                    .col(timestamp_with_time_zone_null(Certificates::NextRenewAt))
                    .col(integer(Certificates::RenewAttempts).not_null().default(0))
                    .col(text_null(Certificates::LastError))
                    .col(
                        timestamp_with_time_zone(Certificates::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Certificates::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(timestamp_with_time_zone_null(Certificates::DeletedAt))
                    .to_owned(),
            )
            .await?;

        // Index on domain for natural-key lookups
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_certificates_domain")
                    .table(Certificates::Table)
                    .col(Certificates::Domain)
                    .to_owned(),
            )
            .await?;

        // Index on user for ownership-scoped listings
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_certificates_user_id")
                    .table(Certificates::Table)
                    .col(Certificates::UserId)
                    .to_owned(),
            )
            .await?;

        // Index on status for the scheduler sweeps
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_certificates_status")
                    .table(Certificates::Table)
                    .col(Certificates::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Certificates::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Certificates {
    #[sea_orm(iden = "certificates")]
    Table,
    Id,
    UserId,
    Domain,
    AltDomains,
    Status,
    CertPath,
    KeyPath,
    ChainPath,
    IssuedAt,
    ExpiresAt,
    AutoRenew,
    RenewDays,
    LastRenewAt,
    NextRenewAt,
    RenewAttempts,
    LastError,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}
