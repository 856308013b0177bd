use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Channels::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Channels::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Channels::ChannelType)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(ColumnDef::new(Channels::Key).text().not_null())
                    .col(ColumnDef::new(Channels::Status).integer().not_null().default(1))
                    .col(
                        ColumnDef::new(Channels::Name)
                            .string_len(128)
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Channels::Weight).integer().not_null().default(0))
                    .col(
                        ColumnDef::new(Channels::CreatedTime)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Channels::TestTime)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Channels::ResponseTime)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Channels::BaseUrl).string_len(512).null())
                    .col(ColumnDef::new(Channels::Models).text().not_null().default(""))
                    .col(
                        ColumnDef::new(Channels::Group)
                            .string_len(128)
                            .not_null()
                            .default("default"),
                    )
                    .col(
                        ColumnDef::new(Channels::UsedQuota)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Channels::ModelMapping).text().null())
                    .col(
                        ColumnDef::new(Channels::Priority)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Channels::Config).text().not_null().default("{}"))
                    .col(ColumnDef::new(Channels::SystemPrompt).text().null())
                    .col(
                        ColumnDef::new(Channels::SoftLimitUsd)
                            .double()
                            .not_null()
                            .default(0.0),
                    )
                    .col(ColumnDef::new(Channels::RpmLimit).integer().not_null().default(0))
                    .col(ColumnDef::new(Channels::DpmLimit).integer().not_null().default(0))
                    .col(ColumnDef::new(Channels::TpmLimit).integer().not_null().default(0))
                    .col(ColumnDef::new(Channels::DisableReason).string_len(256).null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_channels_status")
                    .table(Channels::Table)
                    .col(Channels::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Channels::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Channels {
    Table,
    Id,
    ChannelType,
    Key,
    Status,
    Name,
    Weight,
    CreatedTime,
    TestTime,
    ResponseTime,
    BaseUrl,
    Models,
    Group,
    UsedQuota,
    ModelMapping,
    Priority,
    Config,
    SystemPrompt,
    SoftLimitUsd,
    RpmLimit,
    DpmLimit,
    TpmLimit,
    DisableReason,
}
