use crate::entities::{failure_log, prelude::*};
use anyhow::Result;
use chrono::{Duration, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use tracing::warn;

/// Repository for the append-only permanent failure log
pub struct FailureRepository {
    conn: DatabaseConnection,
}

impl FailureRepository {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn record(&self, reference: &str, kind: &str, reason: &str) -> Result<()> {
        let active_model = failure_log::ActiveModel {
            reference: Set(reference.to_string()),
            kind: Set(kind.to_string()),
            reason: Set(reason.to_string()),
            created_at: Set(Utc::now().to_rfc3339()),
            ..Default::default()
        };
        FailureLog::insert(active_model).exec(&self.conn).await?;
        warn!("Permanent failure recorded for {}: {}", reference, reason);
        Ok(())
    }

    pub async fn list_recent(&self, limit: u64) -> Result<Vec<failure_log::Model>> {
        let rows = FailureLog::find()
            .order_by_desc(failure_log::Column::CreatedAt)
            .paginate(&self.conn, limit)
            .fetch_page(0)
            .await?;
        Ok(rows)
    }

    pub async fn prune(&self, older_than_days: i64) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::days(older_than_days)).to_rfc3339();
        let result = FailureLog::delete_many()
            .filter(failure_log::Column::CreatedAt.lt(cutoff))
            .exec(&self.conn)
            .await?;
        Ok(result.rows_affected)
    }
}
