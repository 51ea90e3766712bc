use anyhow::Result;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::entities::{acquisition_records, alias_records, failure_log, stage_status};
use crate::models::{AcquisitionTarget, Stage, StageState, StageStatusInput};

pub mod migrator;
pub mod repositories;

#[derive(Clone)]
pub struct Store {
    pub conn: DatabaseConnection,
}

impl Store {
    pub async fn new(db_url: &str) -> Result<Self> {
        Self::with_pool_options(db_url, 5, 1).await
    }

    pub async fn with_pool_options(
        db_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self> {
        use sea_orm_migration::MigratorTrait;

        if !db_url.starts_with(":memory:") {
            let path_str = db_url.trim_start_matches("sqlite:");
            if let Some(parent) = Path::new(path_str).parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            if !Path::new(path_str).exists() {
                std::fs::File::create(path_str)?;
            }
        }

        let mut opt = ConnectOptions::new(db_url.to_string());
        opt.max_connections(max_connections)
            .min_connections(min_connections)
            .connect_timeout(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .max_lifetime(Duration::from_secs(600))
            .sqlx_logging(false);

        let conn = Database::connect(opt).await?;

        migrator::Migrator::up(&conn, None).await?;

        info!(
            "Database connected & migrations applied (pool: {}-{})",
            min_connections, max_connections
        );

        Ok(Self { conn })
    }

    pub async fn ping(&self) -> Result<()> {
        let backend = self.conn.get_database_backend();
        self.conn
            .query_one(Statement::from_string(backend, "SELECT 1".to_string()))
            .await?;
        Ok(())
    }

    fn acquisition_repo(&self) -> repositories::acquisition::AcquisitionRepository {
        repositories::acquisition::AcquisitionRepository::new(self.conn.clone())
    }

    fn stage_repo(&self) -> repositories::stage::StageRepository {
        repositories::stage::StageRepository::new(self.conn.clone())
    }

    fn alias_repo(&self) -> repositories::alias::AliasRepository {
        repositories::alias::AliasRepository::new(self.conn.clone())
    }

    fn failure_repo(&self) -> repositories::failure::FailureRepository {
        repositories::failure::FailureRepository::new(self.conn.clone())
    }

    pub async fn get_record(
        &self,
        canonical_id: &str,
    ) -> Result<Option<acquisition_records::Model>> {
        self.acquisition_repo().get(canonical_id).await
    }

    pub async fn upsert_record(&self, target: &AcquisitionTarget) -> Result<()> {
        self.acquisition_repo().upsert(target).await
    }

    pub async fn set_metadata_complete(&self, canonical_id: &str) -> Result<()> {
        self.acquisition_repo()
            .set_metadata_complete(canonical_id)
            .await
    }

    pub async fn set_audio_complete(&self, canonical_id: &str) -> Result<()> {
        self.acquisition_repo()
            .set_audio_complete(canonical_id)
            .await
    }

    pub async fn set_transcript(&self, canonical_id: &str, path: &str) -> Result<()> {
        self.acquisition_repo()
            .set_transcript(canonical_id, path)
            .await
    }

    pub async fn set_summary(&self, canonical_id: &str, path: &str) -> Result<()> {
        self.acquisition_repo().set_summary(canonical_id, path).await
    }

    pub async fn list_incomplete_records(&self) -> Result<Vec<acquisition_records::Model>> {
        self.acquisition_repo().list_incomplete().await
    }

    pub async fn list_all_records(&self) -> Result<Vec<acquisition_records::Model>> {
        self.acquisition_repo().list_all().await
    }

    pub async fn upsert_stage(&self, input: &StageStatusInput) -> Result<()> {
        self.stage_repo().upsert(input).await
    }

    pub async fn get_stage(
        &self,
        target_id: &str,
        stage: Stage,
    ) -> Result<Option<stage_status::Model>> {
        self.stage_repo().get(target_id, stage).await
    }

    pub async fn get_stages_for_target(&self, target_id: &str) -> Result<Vec<stage_status::Model>> {
        self.stage_repo().get_for_target(target_id).await
    }

    pub async fn stage_completed(&self, target_id: &str, stage: Stage) -> Result<bool> {
        self.stage_repo().is_completed(target_id, stage).await
    }

    pub async fn list_unfinished_stage(&self, stage: Stage) -> Result<Vec<String>> {
        self.stage_repo().list_unfinished(stage).await
    }

    pub async fn list_stage_with_status(
        &self,
        stage: Stage,
        status: StageState,
    ) -> Result<Vec<stage_status::Model>> {
        self.stage_repo().list_with_status(stage, status).await
    }

    pub async fn get_alias(&self, alias_key: &str) -> Result<Option<alias_records::Model>> {
        self.alias_repo().get(alias_key).await
    }

    pub async fn upsert_alias(
        &self,
        alias_key: &str,
        feed_url: &str,
        feed_title: &str,
        confidence: f64,
    ) -> Result<()> {
        self.alias_repo()
            .upsert(
                alias_key,
                feed_url,
                feed_title,
                "channel",
                confidence,
                "fuzzy",
                Some("fuzzy_auto"),
            )
            .await
    }

    pub async fn list_aliases(&self) -> Result<Vec<alias_records::Model>> {
        self.alias_repo().list_all().await
    }

    pub async fn record_permanent_failure(
        &self,
        reference: &str,
        kind: &str,
        reason: &str,
    ) -> Result<()> {
        self.failure_repo().record(reference, kind, reason).await
    }

    pub async fn list_recent_failures(&self, limit: u64) -> Result<Vec<failure_log::Model>> {
        self.failure_repo().list_recent(limit).await
    }

    pub async fn prune_failures(&self, older_than_days: i64) -> Result<u64> {
        self.failure_repo().prune(older_than_days).await
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Fresh sqlite store in a uuid-suffixed temp file. A shared in-memory
    /// database does not survive the connection pool, so tests use real
    /// files.
    pub async fn temp_store() -> Store {
        let path = std::env::temp_dir().join(format!("scribarr-test-{}.db", uuid::Uuid::new_v4()));
        let url = format!("sqlite:{}", path.display());
        Store::new(&url).await.unwrap()
    }

    #[tokio::test]
    async fn migrations_apply_and_ping_works() {
        let store = temp_store().await;
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn stage_upsert_overwrites_in_place() {
        let store = temp_store().await;
        let queued = StageStatusInput::new("yt:abc", Stage::Metadata, StageState::Queued);
        store.upsert_stage(&queued).await.unwrap();
        let done = StageStatusInput::new("yt:abc", Stage::Metadata, StageState::Completed)
            .worker("acc-0");
        store.upsert_stage(&done).await.unwrap();

        let rows = store.get_stages_for_target("yt:abc").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "completed");
        assert_eq!(rows[0].assigned_worker.as_deref(), Some("acc-0"));
        assert!(store.stage_completed("yt:abc", Stage::Metadata).await.unwrap());
        assert!(!store.stage_completed("yt:abc", Stage::Audio).await.unwrap());
    }

    #[tokio::test]
    async fn titles_survive_bare_resubmission() {
        let store = temp_store().await;
        let id = "yt:resub00000";
        let enriched = AcquisitionTarget::new("resub00000", id, crate::models::TargetKind::Video)
            .with_titles(
                Some("Episode One".to_string()),
                Some("Widget Channel".to_string()),
            );
        store.upsert_record(&enriched).await.unwrap();
        store.set_metadata_complete(id).await.unwrap();

        // Same reference canonicalized again, titles not yet populated.
        let bare = AcquisitionTarget::new("resub00000", id, crate::models::TargetKind::Video);
        store.upsert_record(&bare).await.unwrap();

        let record = store.get_record(id).await.unwrap().unwrap();
        assert_eq!(record.title.as_deref(), Some("Episode One"));
        assert_eq!(record.channel.as_deref(), Some("Widget Channel"));
        assert!(record.metadata_complete);

        // Fresh metadata still overwrites.
        let updated = AcquisitionTarget::new("resub00000", id, crate::models::TargetKind::Video)
            .with_titles(Some("Episode One (remaster)".to_string()), None);
        store.upsert_record(&updated).await.unwrap();
        let record = store.get_record(id).await.unwrap().unwrap();
        assert_eq!(record.title.as_deref(), Some("Episode One (remaster)"));
        assert_eq!(record.channel.as_deref(), Some("Widget Channel"));
    }

    #[tokio::test]
    async fn alias_roundtrip_and_overwrite() {
        let store = temp_store().await;
        store
            .upsert_alias("channel:widget", "https://f.example/a.xml", "Widget", 0.93)
            .await
            .unwrap();
        store
            .upsert_alias("channel:widget", "https://f.example/b.xml", "Widget", 0.97)
            .await
            .unwrap();

        let alias = store.get_alias("channel:widget").await.unwrap().unwrap();
        assert_eq!(alias.feed_url, "https://f.example/b.xml");
        assert_eq!(alias.alias_type, "channel");
        assert_eq!(alias.verified_by.as_deref(), Some("fuzzy_auto"));
        assert_eq!(store.list_aliases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failure_log_append_and_prune() {
        let store = temp_store().await;
        store
            .record_permanent_failure("yt:x", "format", "requested format is not available")
            .await
            .unwrap();
        let rows = store.list_recent_failures(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "format");

        // Nothing is older than 30 days yet.
        assert_eq!(store.prune_failures(30).await.unwrap(), 0);
        assert_eq!(store.prune_failures(0).await.unwrap(), 1);
    }
}
