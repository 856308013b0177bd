use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Logs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Logs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Logs::UserId).integer().not_null())
                    .col(ColumnDef::new(Logs::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(Logs::LogType).integer().not_null())
                    .col(ColumnDef::new(Logs::Content).text().not_null().default(""))
                    .col(ColumnDef::new(Logs::TokenId).integer().not_null().default(0))
                    .col(
                        ColumnDef::new(Logs::TokenName)
                            .string_len(64)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Logs::ModelName)
                            .string_len(128)
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Logs::Quota).big_integer().not_null().default(0))
                    .col(
                        ColumnDef::new(Logs::PromptTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Logs::CompletionTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Logs::ChannelId).integer().not_null().default(0))
                    .col(
                        ColumnDef::new(Logs::ElapsedTime)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Logs::FirstResponseTime)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Logs::IsStream)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Logs::RequestId)
                            .string_len(64)
                            .not_null()
                            .default(""),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_logs_token_id_created_at")
                    .table(Logs::Table)
                    .col(Logs::TokenId)
                    .col(Logs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_logs_user_id")
                    .table(Logs::Table)
                    .col(Logs::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Logs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Logs {
    Table,
    Id,
    UserId,
    CreatedAt,
    LogType,
    Content,
    TokenId,
    TokenName,
    ModelName,
    Quota,
    PromptTokens,
    CompletionTokens,
    ChannelId,
    ElapsedTime,
    FirstResponseTime,
    IsStream,
    RequestId,
}
