//! The download direction: pages through the federation gateway and stores
//! what partners published, advancing the checkpoint after every page.
//!
//! A page is checkpointed only after its keys are durably stored, and the
//! next page is requested only after the checkpoint write returned. An
//! invocation that fails or gets killed therefore resumes with the first page
//! that was not fully processed.

use crate::budget::{ExecutionAllowance, TimeBudgetGuard};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::clock::Clock;
use crate::gateway::{GatewayClient, GatewayError};
use crate::key_uploader::{FederatedKeyUploader, UploaderError};
use crate::metrics_defs::{
    DOWNLOAD_DURATION, DOWNLOAD_KEYS_RECEIVED, DOWNLOAD_PAGES_PROCESSED,
    DOWNLOAD_STOPPED_BY_TIME_BUDGET,
};
use crate::types::{
    BatchTag, DownloadPage, DownloadResponse, DownloadStats, FederationBatch, RiskLevelOverride,
};
use chrono::{Days, NaiveDate};
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("failed to store downloaded keys: {0}")]
    Uploader(#[from] UploaderError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Clone, Debug)]
pub struct DownloadSettings {
    pub enabled: bool,
    /// Upper bound on pages processed by one invocation.
    pub max_subsequent_batch_download_count: u32,
    /// Lookback used when no checkpoint exists yet.
    pub initial_download_history_days: u32,
    pub risk_level_override: RiskLevelOverride,
}

pub struct DiagnosisKeysDownloadService {
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn GatewayClient>,
    uploader: FederatedKeyUploader,
    checkpoints: Arc<dyn CheckpointStore>,
    allowance: Arc<dyn ExecutionAllowance>,
    settings: DownloadSettings,
}

impl DiagnosisKeysDownloadService {
    pub fn new(
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn GatewayClient>,
        uploader: FederatedKeyUploader,
        checkpoints: Arc<dyn CheckpointStore>,
        allowance: Arc<dyn ExecutionAllowance>,
        settings: DownloadSettings,
    ) -> Self {
        DiagnosisKeysDownloadService {
            clock,
            gateway,
            uploader,
            checkpoints,
            allowance,
            settings,
        }
    }

    pub async fn run(&self) -> Result<DownloadStats, DownloadError> {
        if !self.settings.enabled {
            tracing::info!("download from federation gateway is disabled");
            return Ok(DownloadStats::default());
        }

        let started = Instant::now();
        let (date, batch_tag) = match self.checkpoints.read_download_checkpoint().await? {
            Some(batch) => {
                tracing::info!(
                    batch_tag = %batch.batch_tag,
                    batch_date = %batch.batch_date,
                    "resuming download from checkpoint"
                );
                (batch.batch_date, Some(batch.batch_tag))
            }
            None => {
                let today = self.clock.now().date_naive();
                let days = Days::new(u64::from(self.settings.initial_download_history_days));
                let date = today.checked_sub_days(days).unwrap_or(NaiveDate::MIN);
                tracing::info!(%date, "no download checkpoint, starting initial sync");
                (date, None)
            }
        };

        let result = self.download_from(date, batch_tag).await;
        histogram!(DOWNLOAD_DURATION).record(started.elapsed().as_secs_f64());
        result
    }

    async fn download_from(
        &self,
        date: NaiveDate,
        batch_tag: Option<BatchTag>,
    ) -> Result<DownloadStats, DownloadError> {
        let mut stats = DownloadStats::default();
        let max_pages = self.settings.max_subsequent_batch_download_count;
        if max_pages == 0 {
            return Ok(stats);
        }

        let mut guard = TimeBudgetGuard::new(self.allowance.clone());
        let fetch_started = Instant::now();
        let mut response = self.gateway.download(date, batch_tag.as_ref()).await?;
        let mut fetch_elapsed = fetch_started.elapsed();

        for iteration in 1..=max_pages {
            let page = match response {
                DownloadResponse::NoMoreContent => {
                    tracing::info!(iteration, "federation gateway has no more content");
                    break;
                }
                DownloadResponse::Page(page) => page,
            };

            let started = Instant::now();
            let page = self.apply_risk_level_override(page);
            self.uploader.accept_keys(&page).await?;

            let today = self.clock.now().date_naive();
            self.checkpoints
                .write_download_checkpoint(&FederationBatch::new(page.batch_tag.clone(), today))
                .await?;

            stats.processed_page_count += 1;
            counter!(DOWNLOAD_PAGES_PROCESSED).increment(1);
            counter!(DOWNLOAD_KEYS_RECEIVED).increment(page.exposures.len() as u64);
            tracing::info!(
                exposures = page.exposures.len(),
                batch_tag = %page.batch_tag,
                iteration,
                "downloaded exposures"
            );

            guard.record_iteration(fetch_elapsed + started.elapsed());
            if iteration == max_pages {
                break;
            }
            if !guard.should_continue() {
                tracing::warn!(
                    estimated_iteration_ms = guard.estimated_iteration_cost().as_millis() as u64,
                    "not enough time left to complete another iteration"
                );
                counter!(DOWNLOAD_STOPPED_BY_TIME_BUDGET).increment(1);
                break;
            }

            let fetch_started = Instant::now();
            response = self.gateway.download(date, Some(&page.batch_tag)).await?;
            fetch_elapsed = fetch_started.elapsed();
        }

        tracing::info!(
            processed_page_count = stats.processed_page_count,
            "download from federation gateway finished"
        );
        Ok(stats)
    }

    /// Runs before validation, so overridden levels are range checked too.
    fn apply_risk_level_override(&self, mut page: DownloadPage) -> DownloadPage {
        let risk_override = self.settings.risk_level_override;
        for key in &mut page.exposures {
            key.transmission_risk_level = risk_override.apply(key.transmission_risk_level);
        }
        page
    }
}
