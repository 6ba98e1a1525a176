use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    io::AsyncWriteExt,
    sync::Mutex,
};
use uuid::Uuid;

use crate::ledger::{LedgerError, Period, UsageLedger, UsageRecord};

/// One JSON array per partition at `<root>/<client>/<YYYY-MM>.json`.
///
/// Appends rewrite the whole partition, so writers to the same partition are
/// serialized by a per-partition lock. The new content is written to a
/// temporary file, synced, and renamed over the old one; readers never see a
/// torn file.
pub struct FileLedger {
    root: PathBuf,
    locks: DashMap<(String, Period), Arc<Mutex<()>>>,
}

impl FileLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    fn partition_path(&self, client_id: &str, period: Period) -> PathBuf {
        self.root
            .join(encode_path_segment(client_id))
            .join(format!("{period}.json"))
    }

    fn lock_for(&self, client_id: &str, period: Period) -> Arc<Mutex<()>> {
        self.locks
            .entry((client_id.to_string(), period))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forgets an idle partition lock. Under the shard lock a strong count of
    /// one means no writer holds or waits on it.
    fn release_lock(&self, client_id: &str, period: Period) {
        self.locks
            .remove_if(&(client_id.to_string(), period), |_, lock| {
                Arc::strong_count(lock) == 1
            });
    }

    async fn rewrite_partition(path: &Path, record: UsageRecord) -> Result<(), LedgerError> {
        let mut records = Self::read_path(path).await?.unwrap_or_default();
        records.push(record);
        let body = serde_json::to_vec_pretty(&records)?;

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        if let Err(err) = Self::write_synced(&tmp, &body).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        if let Err(err) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Content must be on disk before the rename publishes it.
    async fn write_synced(path: &Path, body: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(body).await?;
        file.sync_all().await
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }

    async fn read_path(path: &Path) -> Result<Option<Vec<UsageRecord>>, LedgerError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl UsageLedger for FileLedger {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn append(&self, client_id: &str, record: UsageRecord) -> Result<(), LedgerError> {
        record.validate(client_id)?;
        let period = record.period();
        let path = self.partition_path(client_id, period);

        let lock = self.lock_for(client_id, period);
        let result = {
            let _guard = lock.lock().await;
            Self::rewrite_partition(&path, record).await
        };
        drop(lock);
        self.release_lock(client_id, period);
        result
    }

    async fn read_partition(
        &self,
        client_id: &str,
        period: Period,
    ) -> Result<Option<Vec<UsageRecord>>, LedgerError> {
        Self::read_path(&self.partition_path(client_id, period)).await
    }
}

/// Reversible, filesystem-safe encoding of a client id.
fn encode_path_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    if out.is_empty() {
        out.push('%');
    }
    out
}
