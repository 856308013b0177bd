use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Files::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Files::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Files::Model).string_len(128).not_null())
                    .col(ColumnDef::new(Files::Url).string_len(1024).not_null())
                    .col(ColumnDef::new(Files::FileId).string_len(512).not_null())
                    .col(
                        ColumnDef::new(Files::MimeType)
                            .string_len(128)
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Files::CreatedTime).big_integer().not_null())
                    .col(ColumnDef::new(Files::ExpiredTime).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_files_model_url")
                    .table(Files::Table)
                    .col(Files::Model)
                    .col(Files::Url)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_files_expired_time")
                    .table(Files::Table)
                    .col(Files::ExpiredTime)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Files::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Files {
    Table,
    Id,
    Model,
    Url,
    FileId,
    MimeType,
    CreatedTime,
    ExpiredTime,
}
