use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Groups::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Groups::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Groups::Name)
                            .string_len(32)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Groups::Models).text().not_null().default(""))
                    .col(ColumnDef::new(Groups::Ratio).text().not_null().default("{}"))
                    .col(
                        ColumnDef::new(Groups::GroupRatio)
                            .double()
                            .not_null()
                            .default(1.0),
                    )
                    .col(
                        ColumnDef::new(Groups::ActiveNum)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Groups::Status).integer().not_null().default(1))
                    .col(
                        ColumnDef::new(Groups::CreatedTime)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Groups::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Groups {
    Table,
    Id,
    Name,
    Models,
    Ratio,
    GroupRatio,
    ActiveNum,
    Status,
    CreatedTime,
}
