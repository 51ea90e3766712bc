use crate::entities::{prelude::*, stage_status};
use crate::models::{Stage, StageState, StageStatusInput};
use anyhow::Result;
use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};

/// Repository for the per-target, per-stage status ledger
pub struct StageRepository {
    conn: DatabaseConnection,
}

impl StageRepository {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn upsert(&self, input: &StageStatusInput) -> Result<()> {
        let active_model = stage_status::ActiveModel {
            target_id: Set(input.target_id.clone()),
            stage: Set(input.stage.as_str().to_string()),
            status: Set(input.status.as_str().to_string()),
            assigned_worker: Set(input.assigned_worker.clone()),
            metadata: Set(input
                .metadata
                .as_ref()
                .map(std::string::ToString::to_string)),
            updated_at: Set(Utc::now().to_rfc3339()),
        };

        StageStatus::insert(active_model)
            .on_conflict(
                sea_orm::sea_query::OnConflict::columns([
                    stage_status::Column::TargetId,
                    stage_status::Column::Stage,
                ])
                .update_columns([
                    stage_status::Column::Status,
                    stage_status::Column::AssignedWorker,
                    stage_status::Column::Metadata,
                    stage_status::Column::UpdatedAt,
                ])
                .to_owned(),
            )
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    pub async fn get(&self, target_id: &str, stage: Stage) -> Result<Option<stage_status::Model>> {
        let row = StageStatus::find_by_id((target_id.to_string(), stage.as_str().to_string()))
            .one(&self.conn)
            .await?;
        Ok(row)
    }

    pub async fn get_for_target(&self, target_id: &str) -> Result<Vec<stage_status::Model>> {
        let rows = StageStatus::find()
            .filter(stage_status::Column::TargetId.eq(target_id))
            .all(&self.conn)
            .await?;
        Ok(rows)
    }

    /// Target ids whose `stage` is still in flight, for resume after a
    /// restart. Failed rows stay out; those already went to the permanent
    /// failure log.
    pub async fn list_unfinished(&self, stage: Stage) -> Result<Vec<String>> {
        let rows = StageStatus::find()
            .filter(stage_status::Column::Stage.eq(stage.as_str()))
            .filter(stage_status::Column::Status.is_in([
                StageState::Queued.as_str(),
                StageState::InProgress.as_str(),
                StageState::Blocked.as_str(),
            ]))
            .order_by_asc(stage_status::Column::UpdatedAt)
            .all(&self.conn)
            .await?;
        Ok(rows.into_iter().map(|r| r.target_id).collect())
    }

    pub async fn list_with_status(
        &self,
        stage: Stage,
        status: StageState,
    ) -> Result<Vec<stage_status::Model>> {
        let rows = StageStatus::find()
            .filter(stage_status::Column::Stage.eq(stage.as_str()))
            .filter(stage_status::Column::Status.eq(status.as_str()))
            .order_by_asc(stage_status::Column::UpdatedAt)
            .all(&self.conn)
            .await?;
        Ok(rows)
    }

    pub async fn is_completed(&self, target_id: &str, stage: Stage) -> Result<bool> {
        let row = self.get(target_id, stage).await?;
        Ok(row.is_some_and(|r| r.status == StageState::Completed.as_str()))
    }
}
