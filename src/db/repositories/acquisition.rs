use crate::entities::{acquisition_records, prelude::*};
use crate::models::AcquisitionTarget;
use anyhow::Result;
use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};

/// Repository for per-target acquisition records
pub struct AcquisitionRepository {
    conn: DatabaseConnection,
}

impl AcquisitionRepository {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn get(&self, canonical_id: &str) -> Result<Option<acquisition_records::Model>> {
        let row = AcquisitionRecords::find_by_id(canonical_id)
            .one(&self.conn)
            .await?;
        Ok(row)
    }

    pub async fn upsert(&self, target: &AcquisitionTarget) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let active_model = acquisition_records::ActiveModel {
            canonical_id: Set(target.canonical_id.clone()),
            raw_reference: Set(target.raw_reference.clone()),
            kind: Set(target.kind.as_str().to_string()),
            title: Set(target.title.clone()),
            channel: Set(target.channel.clone()),
            audio_complete: Set(false),
            metadata_complete: Set(false),
            transcript_path: Set(None),
            summary_path: Set(None),
            created_at: Set(now.clone()),
            updated_at: Set(now),
        };

        // A freshly canonicalized target carries no titles yet; overwriting
        // on conflict would erase what an earlier metadata fetch stored.
        let mut update_columns = vec![
            acquisition_records::Column::RawReference,
            acquisition_records::Column::Kind,
            acquisition_records::Column::UpdatedAt,
        ];
        if target.title.is_some() {
            update_columns.push(acquisition_records::Column::Title);
        }
        if target.channel.is_some() {
            update_columns.push(acquisition_records::Column::Channel);
        }

        AcquisitionRecords::insert(active_model)
            .on_conflict(
                sea_orm::sea_query::OnConflict::column(acquisition_records::Column::CanonicalId)
                    .update_columns(update_columns)
                    .to_owned(),
            )
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    pub async fn set_metadata_complete(&self, canonical_id: &str) -> Result<()> {
        self.set_columns(canonical_id, |m| {
            m.metadata_complete = Set(true);
        })
        .await
    }

    pub async fn set_audio_complete(&self, canonical_id: &str) -> Result<()> {
        self.set_columns(canonical_id, |m| {
            m.audio_complete = Set(true);
        })
        .await
    }

    pub async fn set_transcript(&self, canonical_id: &str, path: &str) -> Result<()> {
        let path = path.to_string();
        self.set_columns(canonical_id, move |m| {
            m.transcript_path = Set(Some(path));
            // A transcript satisfies the content requirement even when the
            // audio itself was never downloaded.
            m.audio_complete = Set(true);
        })
        .await
    }

    pub async fn set_summary(&self, canonical_id: &str, path: &str) -> Result<()> {
        let path = path.to_string();
        self.set_columns(canonical_id, move |m| {
            m.summary_path = Set(Some(path));
        })
        .await
    }

    pub async fn list_incomplete(&self) -> Result<Vec<acquisition_records::Model>> {
        let rows = AcquisitionRecords::find()
            .filter(
                acquisition_records::Column::AudioComplete
                    .eq(false)
                    .or(acquisition_records::Column::MetadataComplete.eq(false)),
            )
            .order_by_asc(acquisition_records::Column::CreatedAt)
            .all(&self.conn)
            .await?;
        Ok(rows)
    }

    pub async fn list_all(&self) -> Result<Vec<acquisition_records::Model>> {
        let rows = AcquisitionRecords::find()
            .order_by_asc(acquisition_records::Column::CreatedAt)
            .all(&self.conn)
            .await?;
        Ok(rows)
    }

    async fn set_columns<F>(&self, canonical_id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut acquisition_records::ActiveModel),
    {
        let mut model = acquisition_records::ActiveModel {
            canonical_id: Set(canonical_id.to_string()),
            updated_at: Set(Utc::now().to_rfc3339()),
            ..Default::default()
        };
        apply(&mut model);
        AcquisitionRecords::update(model).exec(&self.conn).await?;
        Ok(())
    }
}
