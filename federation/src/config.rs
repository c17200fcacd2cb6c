use crate::download::DownloadSettings;
use crate::types::RiskLevelOverride;
use crate::upload::UploadSettings;
use crate::validator::{MAX_TRANSMISSION_RISK_LEVEL, ValidatorConfig};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Gateway base URL must be http or https: {0}")]
    InvalidGatewayUrl(String),

    #[error("Empty secret name for {0}")]
    EmptySecretName(&'static str),

    #[error("{0} must be at least 1")]
    ZeroBatchCount(&'static str),

    #[error("Risk level default {0} is outside 0..=7")]
    InvalidRiskLevelDefault(i32),

    #[error("Download is enabled but no origin is allow-listed")]
    NoValidOrigins,

    #[error("Upload region cannot be empty")]
    EmptyRegion,

    #[error("Upload is enabled but no submission prefix is configured")]
    NoSubmissionPrefixes,

    #[error("Safety margin must be shorter than the execution time")]
    SafetyMarginTooLarge,

    #[error("{field} is {days}, expected {min}..={max}")]
    DaysOutOfRange {
        field: &'static str,
        days: u32,
        min: u32,
        max: u32,
    },
}

/// Upper bound for every look-back period in days.
pub const MAX_HISTORY_DAYS: u32 = 365;

/// Where credentials are looked up.
#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum SecretStoreConfig {
    Env {
        #[serde(default)]
        prefix: Option<String>,
    },
    File {
        dir: String,
    },
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct GatewayConfig {
    /// Base URL of the federation gateway; endpoints are resolved below it.
    pub base_url: Url,
    /// Secret holding the bearer token.
    pub auth_token_secret: String,
    /// Secret holding the key upload payloads are signed with.
    pub signing_key_secret: String,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct StorageConfig {
    pub base_dir: String,
    #[serde(default = "default_checkpoint_table")]
    pub checkpoint_table: String,
    #[serde(default = "default_federated_key_prefix")]
    pub federated_key_prefix: String,
    /// Prefixes the mobile submissions to upload are stored under.
    #[serde(default)]
    pub submission_prefixes: Vec<String>,
}

fn default_checkpoint_table() -> String {
    "federation-state".into()
}

fn default_federated_key_prefix() -> String {
    "nearform".into()
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct DownloadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_batch_count")]
    pub max_subsequent_batch_download_count: u32,
    #[serde(default = "default_history_days")]
    pub initial_download_history_days: u32,
    #[serde(default)]
    pub risk_level_default_enabled: bool,
    #[serde(default)]
    pub risk_level_default: i32,
    #[serde(default)]
    pub valid_origins: Vec<String>,
}

impl DownloadConfig {
    pub fn settings(&self) -> DownloadSettings {
        DownloadSettings {
            enabled: self.enabled,
            max_subsequent_batch_download_count: self.max_subsequent_batch_download_count,
            initial_download_history_days: self.initial_download_history_days,
            risk_level_override: RiskLevelOverride {
                enabled: self.risk_level_default_enabled,
                default: self.risk_level_default,
            },
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct UploadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Region code attached to every uploaded key.
    pub region: String,
    #[serde(default = "default_max_batch_count")]
    pub max_subsequent_batch_upload_count: u32,
    #[serde(default = "default_history_days")]
    pub initial_upload_history_days: u32,
    #[serde(default)]
    pub max_upload_batch_size: usize,
    #[serde(default)]
    pub risk_level_default_enabled: bool,
    #[serde(default)]
    pub risk_level_default: i32,
}

impl UploadConfig {
    pub fn settings(&self) -> UploadSettings {
        UploadSettings {
            enabled: self.enabled,
            max_subsequent_batch_upload_count: self.max_subsequent_batch_upload_count,
            initial_upload_history_days: self.initial_upload_history_days,
            max_upload_batch_size: self.max_upload_batch_size,
            risk_level_override: RiskLevelOverride {
                enabled: self.risk_level_default_enabled,
                default: self.risk_level_default,
            },
        }
    }
}

#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
pub struct ExecutionConfig {
    /// Hard execution limit of the host. No limit when absent.
    pub max_execution_secs: Option<u64>,
    #[serde(default)]
    pub safety_margin_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_batch_count() -> u32 {
    100
}

fn default_history_days() -> u32 {
    14
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct FederationConfig {
    pub gateway: GatewayConfig,
    pub secrets: SecretStoreConfig,
    pub storage: StorageConfig,
    pub download: DownloadConfig,
    pub upload: Option<UploadConfig>,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub validation: ValidatorConfig,
}

impl FederationConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !matches!(self.gateway.base_url.scheme(), "http" | "https") {
            return Err(ValidationError::InvalidGatewayUrl(
                self.gateway.base_url.to_string(),
            ));
        }
        if self.gateway.auth_token_secret.is_empty() {
            return Err(ValidationError::EmptySecretName("auth_token_secret"));
        }
        if self.gateway.signing_key_secret.is_empty() {
            return Err(ValidationError::EmptySecretName("signing_key_secret"));
        }

        let download = &self.download;
        if download.max_subsequent_batch_download_count == 0 {
            return Err(ValidationError::ZeroBatchCount(
                "max_subsequent_batch_download_count",
            ));
        }
        validate_risk_level(download.risk_level_default_enabled, download.risk_level_default)?;
        validate_days(
            "initial_download_history_days",
            download.initial_download_history_days,
            0,
        )?;
        if download.enabled && download.valid_origins.is_empty() {
            return Err(ValidationError::NoValidOrigins);
        }

        if let Some(upload) = &self.upload {
            if upload.region.is_empty() {
                return Err(ValidationError::EmptyRegion);
            }
            if upload.max_subsequent_batch_upload_count == 0 {
                return Err(ValidationError::ZeroBatchCount(
                    "max_subsequent_batch_upload_count",
                ));
            }
            validate_risk_level(upload.risk_level_default_enabled, upload.risk_level_default)?;
            validate_days(
                "initial_upload_history_days",
                upload.initial_upload_history_days,
                0,
            )?;
            if upload.enabled && self.storage.submission_prefixes.is_empty() {
                return Err(ValidationError::NoSubmissionPrefixes);
            }
        }

        validate_days(
            "max_key_age_days",
            self.validation.max_key_age_days,
            1,
        )?;

        if let Some(max_execution_secs) = self.execution.max_execution_secs {
            if self.execution.safety_margin_secs >= max_execution_secs {
                return Err(ValidationError::SafetyMarginTooLarge);
            }
        }

        Ok(())
    }
}

fn validate_days(field: &'static str, days: u32, min: u32) -> Result<(), ValidationError> {
    if !(min..=MAX_HISTORY_DAYS).contains(&days) {
        return Err(ValidationError::DaysOutOfRange {
            field,
            days,
            min,
            max: MAX_HISTORY_DAYS,
        });
    }
    Ok(())
}

fn validate_risk_level(enabled: bool, default: i32) -> Result<(), ValidationError> {
    if enabled && !(0..=MAX_TRANSMISSION_RISK_LEVEL).contains(&default) {
        return Err(ValidationError::InvalidRiskLevelDefault(default));
    }
    Ok(())
}
