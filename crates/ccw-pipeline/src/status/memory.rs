use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{illegal_transition, ManifestRecord, ManifestStatus, ManifestStatusStore};
use crate::error::{PipelineError, PipelineResult};
use crate::manifest::DataSetManifest;

/// Status store kept in process memory, for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    records: Mutex<BTreeMap<String, ManifestRecord>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record.
    pub fn records(&self) -> Vec<ManifestRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn status_of(&self, manifest_key: &str) -> Option<ManifestStatus> {
        self.lock().get(manifest_key).map(|r| r.status)
    }

    /// Overwrite a record as-is, bypassing transition rules.
    pub fn seed(&self, record: ManifestRecord) {
        self.lock().insert(record.manifest_key.clone(), record);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ManifestRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ManifestStatusStore for InMemoryStatusStore {
    async fn insert_discovered(
        &self,
        manifest: &DataSetManifest,
        now: DateTime<Utc>,
    ) -> PipelineResult<ManifestRecord> {
        let manifest_key = manifest.manifest_key();
        let mut records = self.lock();
        if let Some(existing) = records.get(&manifest_key) {
            return Ok(existing.clone());
        }

        let record = ManifestRecord::discovered(manifest, now)?;
        records.insert(manifest_key, record.clone());
        Ok(record)
    }

    async fn read(&self, manifest_key: &str) -> PipelineResult<Option<ManifestRecord>> {
        Ok(self.lock().get(manifest_key).cloned())
    }

    async fn read_many(
        &self,
        manifest_keys: &[String],
    ) -> PipelineResult<HashMap<String, ManifestRecord>> {
        let records = self.lock();
        Ok(manifest_keys
            .iter()
            .filter_map(|key| {
                records.get(key).map(|record| {
                    let mut summary = record.clone();
                    summary.data_files.clear();
                    (key.clone(), summary)
                })
            })
            .collect())
    }

    async fn transition(
        &self,
        manifest_key: &str,
        from: ManifestStatus,
        to: ManifestStatus,
        now: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        if !from.can_transition_to(to) {
            return Err(illegal_transition(manifest_key, from, to));
        }

        let mut records = self.lock();
        let Some(record) = records.get_mut(manifest_key) else {
            return Ok(false);
        };
        if record.status != from {
            return Ok(false);
        }

        record.status = to;
        match to {
            ManifestStatus::Started => {
                record.started_at = Some(now);
                record.heartbeat_at = Some(now);
            }
            ManifestStatus::Completed => record.completed_at = Some(now),
            ManifestStatus::Discovered => {}
        }
        Ok(true)
    }

    async fn reclaim_stale(
        &self,
        manifest_key: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        let mut records = self.lock();
        match records.get_mut(manifest_key) {
            Some(record)
                if record.status == ManifestStatus::Started
                    && record.last_heartbeat().map_or(true, |beat| beat < stale_before) =>
            {
                record.started_at = Some(now);
                record.heartbeat_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn heartbeat(&self, manifest_key: &str, now: DateTime<Utc>) -> PipelineResult<bool> {
        let mut records = self.lock();
        match records.get_mut(manifest_key) {
            Some(record) if record.status == ManifestStatus::Started => {
                record.heartbeat_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_data_file(
        &self,
        manifest_key: &str,
        file_name: &str,
        status: ManifestStatus,
        now: DateTime<Utc>,
    ) -> PipelineResult<()> {
        let mut records = self.lock();
        let file = records
            .get_mut(manifest_key)
            .and_then(|r| r.data_files.iter_mut().find(|f| f.file_name == file_name))
            .ok_or_else(|| {
                PipelineError::Precondition(format!(
                    "no data file '{}' recorded for manifest '{}'",
                    file_name, manifest_key
                ))
            })?;

        file.status = status;
        match status {
            ManifestStatus::Started => file.started_at = Some(now),
            ManifestStatus::Completed => file.completed_at = Some(now),
            ManifestStatus::Discovered => {}
        }
        Ok(())
    }

    async fn list(
        &self,
        status: Option<ManifestStatus>,
        limit: i64,
    ) -> PipelineResult<Vec<ManifestRecord>> {
        let mut matching: Vec<ManifestRecord> = self
            .lock()
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .map(|mut r| {
                r.data_files.clear();
                r
            })
            .collect();

        matching.sort_by(|a, b| {
            b.manifest_timestamp
                .cmp(&a.manifest_timestamp)
                .then(b.sequence_id.cmp(&a.sequence_id))
        });
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::{DataSetLocation, DataSetManifestEntry, ManifestKey};
    use ccw_common::types::RifFileType;
    use std::sync::Arc;

    fn manifest(ts: &str) -> DataSetManifest {
        DataSetManifest::new(
            ManifestKey::new("Incoming", ts, 0).unwrap(),
            DataSetLocation::regular(),
            false,
            vec![DataSetManifestEntry {
                name: "beneficiaries.rif".to_string(),
                file_type: RifFileType::Beneficiary,
            }],
        )
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = InMemoryStatusStore::new();
        let m = manifest("2024-01-01T00:00:00Z");
        let first = store.insert_discovered(&m, Utc::now()).await.unwrap();
        store
            .transition(&first.manifest_key, ManifestStatus::Discovered, ManifestStatus::Started, Utc::now())
            .await
            .unwrap();

        let second = store.insert_discovered(&m, Utc::now()).await.unwrap();
        assert_eq!(second.status, ManifestStatus::Started);
        assert_eq!(second.data_files.len(), 1);
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_conditional_transition() {
        let store = InMemoryStatusStore::new();
        let key = store
            .insert_discovered(&manifest("2024-01-01T00:00:00Z"), Utc::now())
            .await
            .unwrap()
            .manifest_key;

        assert!(store
            .transition(&key, ManifestStatus::Discovered, ManifestStatus::Started, Utc::now())
            .await
            .unwrap());
        assert!(!store
            .transition(&key, ManifestStatus::Discovered, ManifestStatus::Started, Utc::now())
            .await
            .unwrap());
        assert!(store
            .transition(&key, ManifestStatus::Started, ManifestStatus::Completed, Utc::now())
            .await
            .unwrap());

        let record = store.read(&key).await.unwrap().unwrap();
        assert_eq!(record.status, ManifestStatus::Completed);
        assert!(record.started_at.is_some());
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_backward_transition_is_error() {
        let store = InMemoryStatusStore::new();
        let result = store
            .transition("k", ManifestStatus::Completed, ManifestStatus::Discovered, Utc::now())
            .await;
        assert!(matches!(result, Err(PipelineError::IllegalTransition { .. })));
    }

    #[tokio::test]
    async fn test_single_winner_under_contention() {
        let store = Arc::new(InMemoryStatusStore::new());
        let key = store
            .insert_discovered(&manifest("2024-01-01T00:00:00Z"), Utc::now())
            .await
            .unwrap()
            .manifest_key;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transition(&key, ManifestStatus::Discovered, ManifestStatus::Started, Utc::now())
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_reclaim_only_when_stale() {
        let store = InMemoryStatusStore::new();
        let start = Utc::now();
        let key = store
            .insert_discovered(&manifest("2024-01-01T00:00:00Z"), start)
            .await
            .unwrap()
            .manifest_key;
        store
            .transition(&key, ManifestStatus::Discovered, ManifestStatus::Started, start)
            .await
            .unwrap();

        assert!(!store.reclaim_stale(&key, start, start).await.unwrap());

        let later = start + chrono::Duration::hours(1);
        assert!(store
            .reclaim_stale(&key, later - chrono::Duration::minutes(30), later)
            .await
            .unwrap());
        assert_eq!(store.read(&key).await.unwrap().unwrap().started_at, Some(later));
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_claim_from_being_reclaimed() {
        let store = InMemoryStatusStore::new();
        let start = Utc::now();
        let timeout = chrono::Duration::minutes(30);
        let key = store
            .insert_discovered(&manifest("2024-01-01T00:00:00Z"), start)
            .await
            .unwrap()
            .manifest_key;
        assert!(!store.heartbeat(&key, start).await.unwrap());

        store
            .transition(&key, ManifestStatus::Discovered, ManifestStatus::Started, start)
            .await
            .unwrap();

        // Owner keeps beating well past the timeout measured from the start.
        let mut now = start;
        for _ in 0..10 {
            now += chrono::Duration::minutes(20);
            assert!(store.heartbeat(&key, now).await.unwrap());
            assert!(!store.reclaim_stale(&key, now - timeout, now).await.unwrap());
        }

        let record = store.read(&key).await.unwrap().unwrap();
        assert_eq!(record.started_at, Some(start));
        assert_eq!(record.heartbeat_at, Some(now));
        assert!(!record.is_stale(now, timeout));

        // Once the beats stop the claim can be taken over.
        let later = now + chrono::Duration::minutes(31);
        assert!(store.reclaim_stale(&key, later - timeout, later).await.unwrap());

        store
            .transition(&key, ManifestStatus::Started, ManifestStatus::Completed, later)
            .await
            .unwrap();
        assert!(!store.heartbeat(&key, later).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let store = InMemoryStatusStore::new();
        store
            .insert_discovered(&manifest("2024-01-01T00:00:00Z"), Utc::now())
            .await
            .unwrap();
        store
            .insert_discovered(&manifest("2024-02-01T00:00:00Z"), Utc::now())
            .await
            .unwrap();

        let listed = store.list(None, 10).await.unwrap();
        assert_eq!(listed[0].manifest_key, "Incoming/2024-02-01T00:00:00Z/0_manifest.xml");
        assert!(listed[0].data_files.is_empty());
        assert_eq!(store.list(Some(ManifestStatus::Completed), 10).await.unwrap().len(), 0);
        assert_eq!(store.list(None, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_data_file() {
        let store = InMemoryStatusStore::new();
        let key = store
            .insert_discovered(&manifest("2024-01-01T00:00:00Z"), Utc::now())
            .await
            .unwrap()
            .manifest_key;

        store
            .update_data_file(&key, "beneficiaries.rif", ManifestStatus::Started, Utc::now())
            .await
            .unwrap();
        assert!(store
            .update_data_file(&key, "missing.rif", ManifestStatus::Started, Utc::now())
            .await
            .is_err());
    }
}
