//! Policy-driven duplicate detection over prior acquisition records.

use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::db::Store;
use crate::entities::acquisition_records;
use crate::models::AcquisitionTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Any fully acquired prior record is a duplicate.
    #[default]
    SkipAll,
    /// Duplicate only when a transcript already exists.
    AllowRetranscribe,
    /// Duplicate only when a derived summary already exists.
    AllowResummary,
    /// Never a duplicate.
    ForceReprocess,
}

impl FromStr for DedupPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "skip_all" => Ok(Self::SkipAll),
            "allow_retranscribe" => Ok(Self::AllowRetranscribe),
            "allow_resummary" => Ok(Self::AllowResummary),
            "force_reprocess" => Ok(Self::ForceReprocess),
            other => anyhow::bail!("unknown dedup policy '{other}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupDecision {
    pub is_duplicate: bool,
    pub existing: Option<acquisition_records::Model>,
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
pub struct Partitioned {
    pub unique: Vec<AcquisitionTarget>,
    pub duplicates: Vec<(AcquisitionTarget, String)>,
}

#[derive(Clone)]
pub struct DedupService {
    store: Store,
}

impl DedupService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Decides whether `target` is already acquired under `policy`.
    ///
    /// A record only ever counts as duplicate when both audio and metadata
    /// are complete. Partial records are handed back as resume candidates
    /// with `is_duplicate` false.
    pub async fn check_duplicate(
        &self,
        target: &AcquisitionTarget,
        policy: DedupPolicy,
    ) -> Result<DedupDecision> {
        let existing = self
            .store
            .get_record(&target.canonical_id)
            .await
            .context("looking up prior acquisition record")?;

        let Some(record) = existing else {
            return Ok(DedupDecision {
                is_duplicate: false,
                existing: None,
                reason: None,
            });
        };

        if !(record.audio_complete && record.metadata_complete) {
            return Ok(DedupDecision {
                is_duplicate: false,
                reason: Some("partial record, resume".to_string()),
                existing: Some(record),
            });
        }

        let (is_duplicate, reason) = match policy {
            DedupPolicy::SkipAll => (true, "already fully acquired"),
            DedupPolicy::AllowRetranscribe => {
                if record.transcript_path.is_some() {
                    (true, "transcript already exists")
                } else {
                    (false, "complete but no transcript")
                }
            }
            DedupPolicy::AllowResummary => {
                if record.summary_path.is_some() {
                    (true, "summary already exists")
                } else {
                    (false, "complete but no summary")
                }
            }
            DedupPolicy::ForceReprocess => (false, "forced reprocess"),
        };

        Ok(DedupDecision {
            is_duplicate,
            reason: Some(reason.to_string()),
            existing: Some(record),
        })
    }

    /// Partitions a batch into unique targets and duplicates, preserving
    /// input order within each partition.
    pub async fn partition(
        &self,
        targets: Vec<AcquisitionTarget>,
        policy: DedupPolicy,
    ) -> Result<Partitioned> {
        let mut out = Partitioned::default();
        for target in targets {
            let decision = self.check_duplicate(&target, policy).await?;
            if decision.is_duplicate {
                let reason = decision.reason.unwrap_or_else(|| "duplicate".to_string());
                out.duplicates.push((target, reason));
            } else {
                out.unique.push(target);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::temp_store;
    use crate::models::TargetKind;

    fn target(id: &str) -> AcquisitionTarget {
        AcquisitionTarget::new(id, format!("yt:{id}"), TargetKind::Video)
    }

    #[tokio::test]
    async fn unknown_reference_is_not_duplicate() {
        let store = temp_store().await;
        let svc = DedupService::new(store);
        let d = svc
            .check_duplicate(&target("aaaaaaaaaaa"), DedupPolicy::SkipAll)
            .await
            .unwrap();
        assert!(!d.is_duplicate);
        assert!(d.existing.is_none());
    }

    #[tokio::test]
    async fn partial_record_is_never_duplicate_under_any_policy() {
        let store = temp_store().await;
        let t = target("bbbbbbbbbbb");
        store.upsert_record(&t).await.unwrap();
        store
            .set_metadata_complete(&t.canonical_id)
            .await
            .unwrap();

        let svc = DedupService::new(store);
        for policy in [
            DedupPolicy::SkipAll,
            DedupPolicy::AllowRetranscribe,
            DedupPolicy::AllowResummary,
            DedupPolicy::ForceReprocess,
        ] {
            let d = svc.check_duplicate(&t, policy).await.unwrap();
            assert!(!d.is_duplicate, "policy {policy:?}");
            assert!(d.existing.is_some(), "resume candidate under {policy:?}");
        }
    }

    #[tokio::test]
    async fn complete_record_policies() {
        let store = temp_store().await;
        let t = target("ccccccccccc");
        store.upsert_record(&t).await.unwrap();
        store.set_metadata_complete(&t.canonical_id).await.unwrap();
        store
            .set_transcript(&t.canonical_id, "/tmp/x.txt")
            .await
            .unwrap();

        let svc = DedupService::new(store);
        assert!(
            svc.check_duplicate(&t, DedupPolicy::SkipAll)
                .await
                .unwrap()
                .is_duplicate
        );
        assert!(
            svc.check_duplicate(&t, DedupPolicy::AllowRetranscribe)
                .await
                .unwrap()
                .is_duplicate
        );
        // No summary yet, so resummary is allowed through.
        assert!(
            !svc.check_duplicate(&t, DedupPolicy::AllowResummary)
                .await
                .unwrap()
                .is_duplicate
        );
        assert!(
            !svc.check_duplicate(&t, DedupPolicy::ForceReprocess)
                .await
                .unwrap()
                .is_duplicate
        );
    }

    #[tokio::test]
    async fn partition_preserves_order() {
        let store = temp_store().await;
        let dup = target("ddddddddddd");
        store.upsert_record(&dup).await.unwrap();
        store.set_metadata_complete(&dup.canonical_id).await.unwrap();
        store
            .set_transcript(&dup.canonical_id, "/tmp/d.txt")
            .await
            .unwrap();

        let svc = DedupService::new(store);
        let batch = vec![target("e0000000000"), dup.clone(), target("f0000000000")];
        let parts = svc.partition(batch, DedupPolicy::SkipAll).await.unwrap();
        assert_eq!(parts.unique.len(), 2);
        assert_eq!(parts.unique[0].canonical_id, "yt:e0000000000");
        assert_eq!(parts.unique[1].canonical_id, "yt:f0000000000");
        assert_eq!(parts.duplicates.len(), 1);
        assert_eq!(parts.duplicates[0].0.canonical_id, dup.canonical_id);
    }
}
