//! The upload direction: pushes locally collected keys to the federation gateway.

use crate::budget::{ExecutionAllowance, TimeBudgetGuard};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::clock::Clock;
use crate::gateway::{GatewayClient, GatewayError};
use crate::metrics_defs::{UPLOAD_DURATION, UPLOAD_INCOMPLETE, UPLOAD_KEYS_SENT};
use crate::submissions::{BatchLimit, SubmissionError, SubmissionRepository};
use crate::types::{
    ExposureUpload, ReportType, RiskLevelOverride, StoredExposureKey, Submission, TestType,
    UploadStats,
};
use crate::validator::KeyValidator;
use chrono::{DateTime, Duration, Utc};
use shared::{counter, histogram};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum UploadError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("failed to load submissions: {0}")]
    Submissions(#[from] SubmissionError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Builds the gateway representation of locally stored keys.
#[derive(Clone, Debug)]
pub struct ExposureUploadFactory {
    region: String,
}

impl ExposureUploadFactory {
    pub fn new(region: &str) -> Self {
        ExposureUploadFactory {
            region: region.to_string(),
        }
    }

    pub fn create(&self, submission: &Submission) -> Vec<ExposureUpload> {
        let test_type = TestType::from_object_path(&submission.object_path);
        let report_type = match test_type {
            TestType::LabResult => ReportType::ConfirmedTest,
            _ => ReportType::Unknown,
        };

        submission
            .payload
            .temporary_exposure_keys
            .iter()
            .map(|key: &StoredExposureKey| ExposureUpload {
                key_data: key.key.clone(),
                rolling_start_number: key.rolling_start_number,
                transmission_risk_level: key.transmission_risk,
                rolling_period: key.rolling_period,
                regions: vec![self.region.clone()],
                test_type,
                report_type,
                days_since_onset: key.days_since_onset_of_symptoms.unwrap_or(0),
            })
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct UploadSettings {
    pub enabled: bool,
    pub max_subsequent_batch_upload_count: u32,
    /// Lookback used when no upload checkpoint exists yet.
    pub initial_upload_history_days: u32,
    /// Submissions per batch. 0 uploads everything in a single batch.
    /// Batches may stop a few short of this to keep submissions stored in
    /// the same instant together.
    pub max_upload_batch_size: usize,
    pub risk_level_override: RiskLevelOverride,
}

struct BatchOutcome {
    submission_count: usize,
    newest_submission: Option<DateTime<Utc>>,
}

pub struct DiagnosisKeysUploadService {
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn GatewayClient>,
    submissions: Arc<dyn SubmissionRepository>,
    checkpoints: Arc<dyn CheckpointStore>,
    validator: Arc<KeyValidator>,
    factory: ExposureUploadFactory,
    allowance: Arc<dyn ExecutionAllowance>,
    settings: UploadSettings,
}

impl DiagnosisKeysUploadService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn GatewayClient>,
        submissions: Arc<dyn SubmissionRepository>,
        checkpoints: Arc<dyn CheckpointStore>,
        validator: Arc<KeyValidator>,
        factory: ExposureUploadFactory,
        allowance: Arc<dyn ExecutionAllowance>,
        settings: UploadSettings,
    ) -> Self {
        DiagnosisKeysUploadService {
            clock,
            gateway,
            submissions,
            checkpoints,
            validator,
            factory,
            allowance,
            settings,
        }
    }

    pub async fn run(&self) -> Result<UploadStats, UploadError> {
        if !self.settings.enabled {
            tracing::info!("upload to federation gateway is disabled");
            return Ok(UploadStats::default());
        }

        let started = Instant::now();
        let result = self.upload_batches().await;
        histogram!(UPLOAD_DURATION).record(started.elapsed().as_secs_f64());
        result
    }

    async fn upload_batches(&self) -> Result<UploadStats, UploadError> {
        let mut stats = UploadStats::default();
        let mut since = match self.checkpoints.read_upload_checkpoint().await? {
            Some(uploaded_at) => {
                tracing::info!(%uploaded_at, "last uploaded submission from checkpoint");
                uploaded_at
            }
            None => self
                .clock
                .now()
                .checked_sub_signed(Duration::days(i64::from(
                    self.settings.initial_upload_history_days,
                )))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        };

        let limit = BatchLimit::for_batch_size(self.settings.max_upload_batch_size);
        let mut guard = TimeBudgetGuard::new(self.allowance.clone());

        for batch_number in 1..=self.settings.max_subsequent_batch_upload_count {
            let started = Instant::now();
            let outcome = self.upload_batch(since, limit, batch_number).await?;
            stats.submission_count += outcome.submission_count;

            let Some(newest) = outcome.newest_submission else {
                break;
            };
            let Some(limit) = limit else {
                break;
            };
            if outcome.submission_count < limit.soft || newest <= since {
                break;
            }
            since = newest;

            guard.record_iteration(started.elapsed());
            if !guard.should_continue() {
                tracing::warn!("not enough time left to complete another iteration");
                break;
            }
        }

        tracing::info!(
            submission_count = stats.submission_count,
            "upload to federation gateway finished"
        );
        Ok(stats)
    }

    async fn upload_batch(
        &self,
        since: DateTime<Utc>,
        limit: Option<BatchLimit>,
        batch_number: u32,
    ) -> Result<BatchOutcome, UploadError> {
        let submissions = self.submissions.load_submissions(since, limit).await?;
        let Some(newest) = submissions.iter().map(|s| s.submission_date).max() else {
            tracing::info!(%since, batch_number, "no new submissions to upload");
            return Ok(BatchOutcome {
                submission_count: 0,
                newest_submission: None,
            });
        };

        let now = self.clock.now();
        let risk_override = self.settings.risk_level_override;
        let exposures: Vec<ExposureUpload> = submissions
            .iter()
            .flat_map(|submission| self.factory.create(submission))
            .map(|mut upload| {
                upload.transmission_risk_level =
                    risk_override.apply(upload.transmission_risk_level);
                upload
            })
            .filter(|upload| self.validator.check(now, upload.fields()))
            .collect();

        tracing::info!(
            submissions = submissions.len(),
            keys = exposures.len(),
            batch_number,
            "loaded keys from submissions"
        );

        if exposures.is_empty() {
            tracing::info!(
                %since,
                batch_number,
                "no valid keys to upload, skipping past submissions"
            );
        } else {
            let result = self.gateway.upload(&exposures).await?;
            self.emit_statistics(&exposures, batch_number);

            if result.inserted_exposures != exposures.len() {
                tracing::warn!(
                    sent = exposures.len(),
                    inserted = result.inserted_exposures,
                    batch_number,
                    "federation gateway accepted fewer keys than were sent"
                );
                counter!(UPLOAD_INCOMPLETE).increment(1);
            } else {
                tracing::info!(
                    inserted = result.inserted_exposures,
                    gateway_batch_tag = %result.batch_tag,
                    batch_number,
                    "uploaded keys to federation gateway"
                );
            }
        }

        self.checkpoints.write_upload_checkpoint(newest).await?;
        Ok(BatchOutcome {
            submission_count: submissions.len(),
            newest_submission: Some(newest),
        })
    }

    fn emit_statistics(&self, exposures: &[ExposureUpload], batch_number: u32) {
        let mut by_test_type: BTreeMap<TestType, u64> = BTreeMap::new();
        for upload in exposures {
            *by_test_type.entry(upload.test_type).or_default() += 1;
        }
        for (test_type, count) in by_test_type {
            tracing::info!(
                test_type = test_type.as_str(),
                count,
                batch_number,
                "uploaded diagnosis keys"
            );
            counter!(UPLOAD_KEYS_SENT, "test_type" => test_type.as_str()).increment(count);
        }
    }
}
