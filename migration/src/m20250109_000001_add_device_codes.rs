use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Pairing records for the CLI device authorization flow
        manager
            .create_table(
                Table::create()
                    .table(DeviceCodes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeviceCodes::DeviceCode)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DeviceCodes::UserCode).string().not_null())
                    .col(
                        ColumnDef::new(DeviceCodes::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(DeviceCodes::ApiKey).string())
                    .col(ColumnDef::new(DeviceCodes::ApprovedBy).string())
                    .col(ColumnDef::new(DeviceCodes::ClientInfo).string())
                    .col(
                        ColumnDef::new(DeviceCodes::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DeviceCodes::ExpiresAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DeviceCodes::ApprovedAt).big_integer())
                    .to_owned(),
            )
            .await?;

        // User codes are typed by humans and must map to exactly one handshake
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_codes_user_code")
                    .table(DeviceCodes::Table)
                    .col(DeviceCodes::UserCode)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // For external retention jobs that purge expired rows
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_codes_expires_at")
                    .table(DeviceCodes::Table)
                    .col(DeviceCodes::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DeviceCodes::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DeviceCodes {
    Table,
    DeviceCode,
    UserCode,
    Status,
    ApiKey,
    ApprovedBy,
    ClientInfo,
    CreatedAt,
    ExpiresAt,
    ApprovedAt,
}
