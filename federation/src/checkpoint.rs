use crate::blob_store::{APPLICATION_JSON, BlobError, BlobStore};
use crate::metrics_defs::CHECKPOINT_WRITES;
use crate::types::{BatchTag, FederationBatch};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use shared::counter;
use std::sync::Arc;

const DOWNLOAD_STATE_ID: &str = "lastDownloadState";
const UPLOAD_STATE_ID: &str = "lastUploadState";

#[derive(thiserror::Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint storage error: {0}")]
    Storage(#[from] BlobError),

    #[error("corrupt checkpoint record {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint timestamp out of range: {0}")]
    InvalidTimestamp(i64),
}

/// Durable record of how far each direction got. Writes must be durable
/// before they return; the two directions are independent records.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn read_download_checkpoint(&self) -> Result<Option<FederationBatch>, CheckpointError>;

    async fn write_download_checkpoint(&self, batch: &FederationBatch)
    -> Result<(), CheckpointError>;

    async fn read_upload_checkpoint(&self) -> Result<Option<DateTime<Utc>>, CheckpointError>;

    async fn write_upload_checkpoint(&self, uploaded_at: DateTime<Utc>)
    -> Result<(), CheckpointError>;
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadState {
    batch_tag: String,
    batch_date: NaiveDate,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadState {
    // milliseconds since 1970-01-01 00:00:00 UTC
    upload_timestamp_millis: i64,
}

/// Keeps each checkpoint as a small JSON object named after its record id,
/// below a table prefix.
pub struct BlobCheckpointStore {
    store: Arc<dyn BlobStore>,
    table: String,
}

impl BlobCheckpointStore {
    pub fn new(store: Arc<dyn BlobStore>, table: &str) -> Self {
        BlobCheckpointStore {
            store,
            table: table.trim_end_matches('/').to_string(),
        }
    }

    fn record_path(&self, id: &str) -> String {
        format!("{}/{id}.json", self.table)
    }

    async fn read_record<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>, CheckpointError> {
        let path = self.record_path(id);
        let Some(body) = self.store.get(&path).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|source| CheckpointError::Corrupt { path, source })
    }

    async fn write_record<T: Serialize + Sync>(&self, id: &str, record: &T) -> Result<(), CheckpointError> {
        let path = self.record_path(id);
        let body = serde_json::to_vec(record).map_err(|source| CheckpointError::Corrupt {
            path: path.clone(),
            source,
        })?;
        self.store
            .put(&path, APPLICATION_JSON, Bytes::from(body))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for BlobCheckpointStore {
    async fn read_download_checkpoint(&self) -> Result<Option<FederationBatch>, CheckpointError> {
        let state: Option<DownloadState> = self.read_record(DOWNLOAD_STATE_ID).await?;
        Ok(state.map(|s| FederationBatch::new(BatchTag::new(s.batch_tag), s.batch_date)))
    }

    async fn write_download_checkpoint(
        &self,
        batch: &FederationBatch,
    ) -> Result<(), CheckpointError> {
        let state = DownloadState {
            batch_tag: batch.batch_tag.to_string(),
            batch_date: batch.batch_date,
        };
        self.write_record(DOWNLOAD_STATE_ID, &state).await?;
        counter!(CHECKPOINT_WRITES, "direction" => "download").increment(1);
        tracing::info!(
            batch_tag = %batch.batch_tag,
            batch_date = %batch.batch_date,
            "download checkpoint updated"
        );
        Ok(())
    }

    async fn read_upload_checkpoint(&self) -> Result<Option<DateTime<Utc>>, CheckpointError> {
        let state: Option<UploadState> = self.read_record(UPLOAD_STATE_ID).await?;
        state
            .map(|s| {
                DateTime::from_timestamp_millis(s.upload_timestamp_millis)
                    .ok_or(CheckpointError::InvalidTimestamp(s.upload_timestamp_millis))
            })
            .transpose()
    }

    async fn write_upload_checkpoint(
        &self,
        uploaded_at: DateTime<Utc>,
    ) -> Result<(), CheckpointError> {
        let state = UploadState {
            upload_timestamp_millis: uploaded_at.timestamp_millis(),
        };
        self.write_record(UPLOAD_STATE_ID, &state).await?;
        counter!(CHECKPOINT_WRITES, "direction" => "upload").increment(1);
        tracing::info!(%uploaded_at, "upload checkpoint updated");
        Ok(())
    }
}
