//! Batch payload uploads and the in-memory batch log.
//!
//! Uploads are content-addressed by Merkle root and idempotent: a second
//! upload of the same batch is a no-op that returns the same URL.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy_primitives::{B256, U256};
use dashmap::DashMap;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use serde::Serialize;
use tracing::debug;

use crate::error::BatcherError;

/// Storage key for a sealed batch payload.
pub fn batch_key(merkle_root: B256) -> String {
    format!("batches/{}", hex::encode(merkle_root))
}

pub trait ObjectStore: Send + Sync + 'static {
    /// Writes `bytes` under `key` unless the key already exists, and returns
    /// the public URL operators fetch the payload from.
    fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<String, BatcherError>> + Send;

    fn exists(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<bool, BatcherError>> + Send;
}

// ---------------------------------------------------------------------------
// S3 implementation
// ---------------------------------------------------------------------------

pub struct S3Store {
    bucket: Box<Bucket>,
    download_base_url: String,
}

impl S3Store {
    /// `endpoint` switches to a custom S3-compatible endpoint with
    /// path-style addressing (e.g. minio in local setups).
    pub fn new(
        bucket_name: &str,
        region: &str,
        endpoint: Option<&str>,
        download_base_url: &str,
    ) -> Result<Self, BatcherError> {
        let region = match endpoint {
            Some(endpoint) => Region::Custom {
                region: region.to_string(),
                endpoint: endpoint.to_string(),
            },
            None => region
                .parse()
                .map_err(|e| BatcherError::Storage(format!("invalid s3 region: {e}")))?,
        };
        let credentials = Credentials::default()
            .map_err(|e| BatcherError::Storage(format!("s3 credentials: {e}")))?;
        let mut bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| BatcherError::Storage(e.to_string()))?;
        if endpoint.is_some() {
            bucket = bucket.with_path_style();
        }
        Ok(Self {
            bucket,
            download_base_url: download_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.download_base_url, key)
    }
}

impl ObjectStore for S3Store {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, BatcherError> {
        if self.exists(key).await? {
            debug!(key, "payload already uploaded, skipping put");
            return Ok(self.url_for(key));
        }
        let response = self
            .bucket
            .put_object_with_content_type(key, &bytes, "application/cbor")
            .await
            .map_err(|e| BatcherError::Storage(e.to_string()))?;
        if response.status_code() / 100 != 2 {
            return Err(BatcherError::Storage(format!(
                "put {key} returned status {}",
                response.status_code()
            )));
        }
        Ok(self.url_for(key))
    }

    async fn exists(&self, key: &str) -> Result<bool, BatcherError> {
        match self.bucket.head_object(key).await {
            Ok((_, 200)) => Ok(true),
            Ok((_, 404)) => Ok(false),
            Ok((_, status)) => Err(BatcherError::Storage(format!(
                "head {key} returned status {status}"
            ))),
            Err(e) => Err(BatcherError::Storage(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Backing store for tests and local runs without an object store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|o| o.value().clone())
    }
}

impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, BatcherError> {
        self.objects.entry(key.to_string()).or_insert(bytes);
        Ok(format!("mem://{key}"))
    }

    async fn exists(&self, key: &str) -> Result<bool, BatcherError> {
        Ok(self.objects.contains_key(key))
    }
}

// ---------------------------------------------------------------------------
// Batch log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Open,
    Sealing,
    Submitted,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub merkle_root: B256,
    pub state: BatchState,
    pub entry_count: usize,
    pub fee_per_proof: U256,
    pub data_pointer: Option<String>,
    pub created_block: u64,
    pub sealed_block: Option<u64>,
    /// Block of the operators' `BatchVerified` event, once observed.
    pub verified_block: Option<u64>,
    pub submit_attempts: u32,
    pub tx_hash: Option<B256>,
    pub error: Option<String>,
    pub created_at: u64,
}

impl BatchRecord {
    pub fn new(merkle_root: B256, entry_count: usize, fee_per_proof: U256, created_block: u64) -> Self {
        Self {
            merkle_root,
            state: BatchState::Sealing,
            entry_count,
            fee_per_proof,
            data_pointer: None,
            created_block,
            sealed_block: None,
            verified_block: None,
            submit_attempts: 0,
            tx_hash: None,
            error: None,
            created_at: now_epoch(),
        }
    }
}

/// Terminal batch records are kept for a day for operator inspection, then
/// evicted.
const BATCH_RECORD_TTL_SECS: u64 = 86_400;

/// Operator-facing view of recent batches. Never exposed on the wire.
#[derive(Debug, Default)]
pub struct BatchLog {
    batches: DashMap<B256, BatchRecord>,
}

impl BatchLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: BatchRecord) {
        self.batches.insert(record.merkle_root, record);
    }

    pub fn update(&self, merkle_root: B256, apply: impl FnOnce(&mut BatchRecord)) {
        if let Some(mut record) = self.batches.get_mut(&merkle_root) {
            apply(record.value_mut());
        }
    }

    pub fn get(&self, merkle_root: B256) -> Option<BatchRecord> {
        self.batches.get(&merkle_root).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn spawn_eviction_task(self: &Arc<Self>) {
        let log = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                log.evict_expired();
            }
        });
    }

    fn evict_expired(&self) {
        let now = now_epoch();
        let before = self.batches.len();
        self.batches.retain(|_, rec| {
            !matches!(rec.state, BatchState::Confirmed | BatchState::Failed)
                || now.saturating_sub(rec.created_at) < BATCH_RECORD_TTL_SECS
        });
        let evicted = before - self.batches.len();
        if evicted > 0 {
            debug!(evicted, "batch log eviction complete");
        }
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_put_is_idempotent_by_key() {
        let store = MemoryStore::new();
        let url1 = store.put("batches/ab", vec![1, 2, 3]).await.unwrap();
        let url2 = store.put("batches/ab", vec![9, 9, 9]).await.unwrap();
        assert_eq!(url1, url2);
        // first write wins; the key is content-addressed
        assert_eq!(store.get("batches/ab").unwrap(), vec![1, 2, 3]);
        assert!(store.exists("batches/ab").await.unwrap());
        assert!(!store.exists("batches/cd").await.unwrap());
    }

    #[test]
    fn batch_key_is_hex_of_root() {
        let root = B256::repeat_byte(0xab);
        assert_eq!(batch_key(root), format!("batches/{}", "ab".repeat(32)));
    }

    #[test]
    fn batch_log_lifecycle() {
        let log = BatchLog::new();
        let root = B256::repeat_byte(1);
        log.insert(BatchRecord::new(root, 4, U256::from(10), 100));

        log.update(root, |rec| {
            rec.state = BatchState::Submitted;
            rec.submit_attempts = 1;
            rec.data_pointer = Some("mem://batches/x".into());
        });
        let rec = log.get(root).unwrap();
        assert_eq!(rec.state, BatchState::Submitted);
        assert_eq!(rec.submit_attempts, 1);
        assert_eq!(rec.entry_count, 4);

        log.update(root, |rec| rec.state = BatchState::Confirmed);
        assert_eq!(log.get(root).unwrap().state, BatchState::Confirmed);
    }

    #[test]
    fn eviction_only_touches_terminal_records() {
        let log = BatchLog::new();
        let mut old_confirmed = BatchRecord::new(B256::repeat_byte(1), 1, U256::ZERO, 1);
        old_confirmed.state = BatchState::Confirmed;
        old_confirmed.created_at = 0;
        log.insert(old_confirmed);

        let mut old_open = BatchRecord::new(B256::repeat_byte(2), 1, U256::ZERO, 1);
        old_open.state = BatchState::Submitted;
        old_open.created_at = 0;
        log.insert(old_open);

        log.evict_expired();
        assert!(log.get(B256::repeat_byte(1)).is_none());
        assert!(log.get(B256::repeat_byte(2)).is_some());
    }
}
