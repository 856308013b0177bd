//! 选项表

use entity::{Options, options};
use sea_orm::sea_query::OnConflict;
use sea_orm::{EntityTrait, Set};

use super::Repository;
use crate::error::Result;

impl Repository {
    pub async fn list_options(&self) -> Result<Vec<(String, String)>> {
        Ok(Options::find()
            .all(self.connection())
            .await?
            .into_iter()
            .map(|row| (row.key, row.value))
            .collect())
    }

    pub async fn upsert_option(&self, key: &str, value: &str) -> Result<()> {
        let row = options::ActiveModel {
            key: Set(key.to_string()),
            value: Set(value.to_string()),
        };
        Options::insert(row)
            .on_conflict(
                OnConflict::column(options::Column::Key)
                    .update_column(options::Column::Value)
                    .to_owned(),
            )
            .exec(self.connection())
            .await?;
        Ok(())
    }
}
