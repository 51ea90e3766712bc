use crate::entities::{alias_records, prelude::*};
use anyhow::Result;
use chrono::Utc;
use sea_orm::{DatabaseConnection, EntityTrait, QueryOrder, Set};

/// Repository for channel-to-feed alias records
pub struct AliasRepository {
    conn: DatabaseConnection,
}

impl AliasRepository {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn get(&self, alias_key: &str) -> Result<Option<alias_records::Model>> {
        let row = AliasRecords::find_by_id(alias_key).one(&self.conn).await?;
        Ok(row)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        &self,
        alias_key: &str,
        feed_url: &str,
        feed_title: &str,
        alias_type: &str,
        confidence: f64,
        method: &str,
        verified_by: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let active_model = alias_records::ActiveModel {
            alias_key: Set(alias_key.to_string()),
            feed_url: Set(feed_url.to_string()),
            feed_title: Set(feed_title.to_string()),
            alias_type: Set(alias_type.to_string()),
            confidence: Set(confidence),
            method: Set(method.to_string()),
            verified_by: Set(verified_by.map(String::from)),
            created_at: Set(now.clone()),
            updated_at: Set(now),
        };

        AliasRecords::insert(active_model)
            .on_conflict(
                sea_orm::sea_query::OnConflict::column(alias_records::Column::AliasKey)
                    .update_columns([
                        alias_records::Column::FeedUrl,
                        alias_records::Column::FeedTitle,
                        alias_records::Column::AliasType,
                        alias_records::Column::Confidence,
                        alias_records::Column::Method,
                        alias_records::Column::VerifiedBy,
                        alias_records::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    pub async fn list_all(&self) -> Result<Vec<alias_records::Model>> {
        let rows = AliasRecords::find()
            .order_by_asc(alias_records::Column::AliasKey)
            .all(&self.conn)
            .await?;
        Ok(rows)
    }
}
