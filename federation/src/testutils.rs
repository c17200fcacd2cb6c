use crate::blob_store::{BlobError, BlobStore, ObjectMeta};
use crate::budget::ExecutionAllowance;
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::clock::Clock;
use crate::gateway::{GatewayClient, GatewayError};
use crate::submissions::{BatchLimit, SubmissionError, SubmissionRepository};
use crate::types::{
    BatchTag, DownloadResponse, ExposureKey, ExposureUpload, FederationBatch, ReportType,
    StoredExposureKey, StoredExposureKeyPayload, Submission, TestType, UploadResult,
};
use crate::validator::ROLLING_INTERVAL_SECS;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// 2020-09-15 23:50:00 UTC
pub fn now() -> DateTime<Utc> {
    DateTime::from_timestamp(2667023 * ROLLING_INTERVAL_SECS, 0).unwrap()
}

/// A valid, federation eligible key. `seed` makes the key data distinct.
pub fn exposure_key(origin: &str, seed: u8) -> ExposureKey {
    ExposureKey {
        key_data: STANDARD.encode([seed; 16]),
        // 2020-09-14 00:00:00 UTC
        rolling_start_number: 2666736,
        transmission_risk_level: 3,
        rolling_period: 144,
        origin: origin.to_string(),
        regions: vec![origin.to_string()],
        test_type: TestType::LabResult,
        report_type: ReportType::ConfirmedTest,
        days_since_onset: Some(0),
    }
}

/// A submission holding one valid key.
pub fn submission(path: &str, submission_date: DateTime<Utc>, seed: u8) -> Submission {
    Submission {
        submission_date,
        object_path: path.to_string(),
        payload: StoredExposureKeyPayload {
            temporary_exposure_keys: vec![StoredExposureKey {
                key: STANDARD.encode([seed; 16]),
                rolling_start_number: 2666736,
                rolling_period: 144,
                transmission_risk: 3,
                days_since_onset_of_symptoms: Some(1),
            }],
        },
    }
}

pub struct FixedClock {
    now: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        FixedClock { now }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

/// Returns the given durations one per call, then keeps repeating the last one.
pub struct CountdownAllowance {
    remaining: Mutex<VecDeque<Duration>>,
}

impl CountdownAllowance {
    pub fn new(remaining: impl IntoIterator<Item = Duration>) -> Self {
        CountdownAllowance {
            remaining: Mutex::new(remaining.into_iter().collect()),
        }
    }
}

impl ExecutionAllowance for CountdownAllowance {
    fn remaining(&self) -> Duration {
        let mut remaining = self.remaining.lock();
        if remaining.len() > 1 {
            remaining.pop_front().unwrap_or_default()
        } else {
            remaining.front().copied().unwrap_or_default()
        }
    }
}

#[derive(Default)]
struct Objects {
    entries: BTreeMap<String, (Bytes, DateTime<Utc>)>,
    puts: usize,
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<Objects>,
    fail_on_put: Option<usize>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `n`th put (1-based) fails and stores nothing.
    pub fn failing_on_put(mut self, n: usize) -> Self {
        self.fail_on_put = Some(n);
        self
    }

    pub fn insert_at(&self, path: &str, body: Bytes, modified: DateTime<Utc>) {
        self.objects
            .lock()
            .entries
            .insert(path.to_string(), (body, modified));
    }

    pub fn paths(&self) -> Vec<String> {
        self.objects.lock().entries.keys().cloned().collect()
    }

    pub fn object(&self, path: &str) -> Option<String> {
        self.objects
            .lock()
            .entries
            .get(path)
            .map(|(body, _)| String::from_utf8_lossy(body).into_owned())
    }

    pub fn put_count(&self) -> usize {
        self.objects.lock().puts
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, path: &str, _content_type: &str, body: Bytes) -> Result<(), BlobError> {
        let mut objects = self.objects.lock();
        objects.puts += 1;
        if self.fail_on_put == Some(objects.puts) {
            return Err(BlobError::Io(std::io::Error::other("injected put failure")));
        }
        objects.entries.insert(path.to_string(), (body, Utc::now()));
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Bytes>, BlobError> {
        Ok(self
            .objects
            .lock()
            .entries
            .get(path)
            .map(|(body, _)| body.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BlobError> {
        Ok(self
            .objects
            .lock()
            .entries
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, (_, modified))| ObjectMeta {
                path: path.clone(),
                last_modified: *modified,
            })
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    download: Mutex<Option<FederationBatch>>,
    upload: Mutex<Option<DateTime<Utc>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload_checkpoint(&self) -> Option<DateTime<Utc>> {
        *self.upload.lock()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn read_download_checkpoint(&self) -> Result<Option<FederationBatch>, CheckpointError> {
        Ok(self.download.lock().clone())
    }

    async fn write_download_checkpoint(
        &self,
        batch: &FederationBatch,
    ) -> Result<(), CheckpointError> {
        *self.download.lock() = Some(batch.clone());
        Ok(())
    }

    async fn read_upload_checkpoint(&self) -> Result<Option<DateTime<Utc>>, CheckpointError> {
        Ok(*self.upload.lock())
    }

    async fn write_upload_checkpoint(
        &self,
        uploaded_at: DateTime<Utc>,
    ) -> Result<(), CheckpointError> {
        *self.upload.lock() = Some(uploaded_at);
        Ok(())
    }
}

/// Serves canned pages keyed by the requested batch tag. Unknown tags get
/// `NoMoreContent`. Clones share the recorded calls.
#[derive(Clone, Default)]
pub struct StubGateway {
    pages: HashMap<Option<String>, DownloadResponse>,
    failing_downloads: HashSet<Option<String>>,
    inserted: Option<usize>,
    fail_uploads: bool,
    download_calls: Arc<Mutex<Vec<(NaiveDate, Option<String>)>>>,
    uploads: Arc<Mutex<Vec<Vec<ExposureUpload>>>>,
}

impl StubGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, after: Option<&str>, response: DownloadResponse) -> Self {
        self.pages.insert(after.map(str::to_string), response);
        self
    }

    pub fn failing_download(mut self, after: Option<&str>) -> Self {
        self.failing_downloads.insert(after.map(str::to_string));
        self
    }

    /// Reports this many inserted keys for every upload instead of all of them.
    pub fn inserting(mut self, inserted: usize) -> Self {
        self.inserted = Some(inserted);
        self
    }

    pub fn failing_upload(mut self) -> Self {
        self.fail_uploads = true;
        self
    }

    pub fn download_calls(&self) -> Vec<(NaiveDate, Option<String>)> {
        self.download_calls.lock().clone()
    }

    pub fn uploads(&self) -> Vec<Vec<ExposureUpload>> {
        self.uploads.lock().clone()
    }

    fn failure() -> GatewayError {
        GatewayError::UnexpectedStatus {
            url: "http://gateway.invalid".into(),
            status: StatusCode::BAD_GATEWAY,
        }
    }
}

#[async_trait]
impl GatewayClient for StubGateway {
    async fn download(
        &self,
        date: NaiveDate,
        batch_tag: Option<&BatchTag>,
    ) -> Result<DownloadResponse, GatewayError> {
        let tag = batch_tag.map(|tag| tag.as_str().to_string());
        self.download_calls.lock().push((date, tag.clone()));
        if self.failing_downloads.contains(&tag) {
            return Err(Self::failure());
        }
        Ok(self
            .pages
            .get(&tag)
            .cloned()
            .unwrap_or(DownloadResponse::NoMoreContent))
    }

    async fn upload(&self, exposures: &[ExposureUpload]) -> Result<UploadResult, GatewayError> {
        if self.fail_uploads {
            return Err(Self::failure());
        }
        self.uploads.lock().push(exposures.to_vec());
        Ok(UploadResult {
            batch_tag: "stub-batch".into(),
            inserted_exposures: self.inserted.unwrap_or(exposures.len()),
        })
    }
}

/// Serves a fixed list of submissions and records each request.
pub struct StaticSubmissions {
    submissions: Vec<Submission>,
    requests: Mutex<Vec<(DateTime<Utc>, Option<BatchLimit>)>>,
}

impl StaticSubmissions {
    pub fn new(submissions: Vec<Submission>) -> Self {
        StaticSubmissions {
            submissions,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<(DateTime<Utc>, Option<BatchLimit>)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl SubmissionRepository for StaticSubmissions {
    async fn load_submissions(
        &self,
        since: DateTime<Utc>,
        limit: Option<BatchLimit>,
    ) -> Result<Vec<Submission>, SubmissionError> {
        self.requests.lock().push((since, limit));
        let mut found: Vec<Submission> = self
            .submissions
            .iter()
            .filter(|s| s.submission_date > since)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.submission_date);
        Ok(match limit {
            Some(limit) => limit.apply(found, |s| s.submission_date),
            None => found,
        })
    }
}
