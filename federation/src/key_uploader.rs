//! Persists downloaded keys, one object per origin and batch.

use crate::blob_store::{APPLICATION_JSON, BlobError, BlobStore};
use crate::clock::Clock;
use crate::metrics_defs::{FEDERATED_KEYS, FEDERATED_KEYS_STORED, INVALID_ORIGIN};
use crate::types::{
    BatchTag, DownloadPage, ExposureKey, StoredExposureKey, StoredExposureKeyPayload, TestType,
};
use crate::validator::KeyValidator;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use shared::counter;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum UploaderError {
    #[error("failed to store federated keys at {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: BlobError,
    },

    #[error("failed to encode federated keys: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct FederatedKeyUploader {
    store: Arc<dyn BlobStore>,
    prefix: String,
    valid_origins: HashSet<String>,
    validator: Arc<KeyValidator>,
    clock: Arc<dyn Clock>,
}

impl FederatedKeyUploader {
    pub fn new(
        store: Arc<dyn BlobStore>,
        prefix: &str,
        valid_origins: impl IntoIterator<Item = String>,
        validator: Arc<KeyValidator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        FederatedKeyUploader {
            store,
            prefix: prefix.trim_end_matches('/').to_string(),
            valid_origins: valid_origins.into_iter().collect(),
            validator,
            clock,
        }
    }

    /// Object path of one origin's keys from one batch. Deterministic, so
    /// reprocessing a page overwrites what an earlier attempt wrote.
    pub fn object_path(&self, origin: &str, now: DateTime<Utc>, batch_tag: &BatchTag) -> String {
        format!(
            "{}/{origin}/{}/{batch_tag}.json",
            self.prefix,
            now.format("%Y%m%d")
        )
    }

    /// Validates, filters and stores the keys of one page. Returns the number of
    /// objects written.
    pub async fn accept_keys(&self, page: &DownloadPage) -> Result<usize, UploaderError> {
        let now = self.clock.now();
        let mut written = 0;

        for (origin, keys) in group_by_origin(page) {
            self.emit_statistics(now, origin, &keys);

            if !self.valid_origins.contains(origin) {
                tracing::warn!(
                    origin,
                    batch_tag = %page.batch_tag,
                    keys = keys.len(),
                    "discarding keys from origin that is not allow-listed"
                );
                counter!(INVALID_ORIGIN, "origin" => origin.to_string()).increment(1);
                continue;
            }

            let valid: Vec<StoredExposureKey> = keys
                .into_iter()
                .filter(|key| self.validator.check(now, key.fields()))
                .map(StoredExposureKey::from)
                .collect();

            if valid.is_empty() {
                tracing::info!(
                    origin,
                    batch_tag = %page.batch_tag,
                    "skip store because no valid keys were found"
                );
                continue;
            }

            let path = self.object_path(origin, now, &page.batch_tag);
            let count = valid.len();
            self.store_keys(&path, valid).await?;
            counter!(FEDERATED_KEYS_STORED, "origin" => origin.to_string()).increment(count as u64);
            tracing::info!(origin, path, keys = count, "stored federated keys");
            written += 1;
        }

        Ok(written)
    }

    fn emit_statistics(&self, now: DateTime<Utc>, origin: &str, keys: &[&ExposureKey]) {
        let mut by_test_type: BTreeMap<TestType, (u64, u64)> = BTreeMap::new();
        for key in keys {
            let entry = by_test_type.entry(key.test_type).or_default();
            if self.validator.validate(now, key.fields()).is_ok() {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }

        for (test_type, (valid, invalid)) in by_test_type {
            tracing::info!(
                origin,
                test_type = test_type.as_str(),
                valid,
                invalid,
                "downloaded federated keys"
            );
            counter!(FEDERATED_KEYS, "origin" => origin.to_string(), "test_type" => test_type.as_str(), "validity" => "valid")
                .increment(valid);
            counter!(FEDERATED_KEYS, "origin" => origin.to_string(), "test_type" => test_type.as_str(), "validity" => "invalid")
                .increment(invalid);
        }
    }

    async fn store_keys(
        &self,
        path: &str,
        keys: Vec<StoredExposureKey>,
    ) -> Result<(), UploaderError> {
        let payload = StoredExposureKeyPayload {
            temporary_exposure_keys: keys,
        };
        let body = serde_json::to_vec(&payload)?;
        self.store
            .put(path, APPLICATION_JSON, Bytes::from(body))
            .await
            .map_err(|source| UploaderError::Storage {
                path: path.to_string(),
                source,
            })
    }
}

/// Eligible keys of the page grouped by origin, origins in sorted order.
fn group_by_origin(page: &DownloadPage) -> BTreeMap<&str, Vec<&ExposureKey>> {
    let mut groups: BTreeMap<&str, Vec<&ExposureKey>> = BTreeMap::new();
    for key in page.exposures.iter().filter(|key| key.is_federation_eligible()) {
        groups.entry(key.origin.as_str()).or_default().push(key);
    }
    groups
}
