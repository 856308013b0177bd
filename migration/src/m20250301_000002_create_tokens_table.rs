use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Tokens::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Tokens::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Tokens::UserId).integer().not_null())
                    .col(
                        ColumnDef::new(Tokens::Key)
                            .string_len(64)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Tokens::Status).integer().not_null().default(1))
                    .col(
                        ColumnDef::new(Tokens::Name)
                            .string_len(64)
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Tokens::CreatedTime)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tokens::AccessedTime)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tokens::ExpiredTime)
                            .big_integer()
                            .not_null()
                            .default(-1),
                    )
                    .col(
                        ColumnDef::new(Tokens::RemainQuota)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tokens::UnlimitedQuota)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Tokens::UsedQuota)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tokens::HardLimitUsd)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Tokens::Models).text().null())
                    .col(ColumnDef::new(Tokens::Subnet).string_len(256).null())
                    .col(ColumnDef::new(Tokens::RpmLimit).integer().not_null().default(0))
                    .col(ColumnDef::new(Tokens::DpmLimit).integer().not_null().default(0))
                    .col(ColumnDef::new(Tokens::TpmLimit).integer().not_null().default(0))
                    .col(ColumnDef::new(Tokens::Email).string_len(128).null())
                    .col(
                        ColumnDef::new(Tokens::ExpiredAlert)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tokens::ExhaustedAlert)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Tokens::ModerationsEnable)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tokens_user_id")
                            .from(Tokens::Table, Tokens::UserId)
                            .to(Users::Table, Users::Id)
                            .on_update(ForeignKeyAction::Cascade)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tokens_user_id")
                    .table(Tokens::Table)
                    .col(Tokens::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tokens_status_expired")
                    .table(Tokens::Table)
                    .col(Tokens::Status)
                    .col(Tokens::ExpiredTime)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Tokens::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Tokens {
    Table,
    Id,
    UserId,
    Key,
    Status,
    Name,
    CreatedTime,
    AccessedTime,
    ExpiredTime,
    RemainQuota,
    UnlimitedQuota,
    UsedQuota,
    HardLimitUsd,
    Models,
    Subnet,
    RpmLimit,
    DpmLimit,
    TpmLimit,
    Email,
    ExpiredAlert,
    ExhaustedAlert,
    ModerationsEnable,
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
}
