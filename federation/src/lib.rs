pub mod blob_store;
pub mod budget;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod download;
pub mod gateway;
pub mod key_uploader;
pub mod metrics_defs;
pub mod secrets;
pub mod signing;
pub mod submissions;
pub mod types;
pub mod upload;
pub mod validator;

#[cfg(test)]
mod testutils;

use blob_store::{BlobStore, FilesystemBlobStore};
use budget::{Deadline, ExecutionAllowance, Unbounded};
use checkpoint::{BlobCheckpointStore, CheckpointStore};
use clock::{Clock, SystemClock};
use config::{ExecutionConfig, FederationConfig, SecretStoreConfig, ValidationError};
use download::{DiagnosisKeysDownloadService, DownloadError};
use gateway::{GatewayClient, HttpGatewayClient};
use key_uploader::FederatedKeyUploader;
use secrets::{EnvSecretProvider, FileSecretProvider, SecretError, SecretProvider};
use signing::{HmacSigner, Jws, SigningError};
use std::sync::Arc;
use std::time::Duration;
use submissions::BlobSubmissionRepository;
use types::{DownloadStats, UploadStats};
use upload::{DiagnosisKeysUploadService, ExposureUploadFactory, UploadError};
use validator::KeyValidator;

#[derive(thiserror::Error, Debug)]
pub enum FederationError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),

    #[error("upload is not configured")]
    UploadNotConfigured,
}

pub fn get_secret_provider(config: &SecretStoreConfig) -> Arc<dyn SecretProvider> {
    match config {
        SecretStoreConfig::Env { prefix } => Arc::new(EnvSecretProvider::new(prefix.as_deref())),
        SecretStoreConfig::File { dir } => Arc::new(FileSecretProvider::new(dir)),
    }
}

fn execution_allowance(config: &ExecutionConfig) -> Arc<dyn ExecutionAllowance> {
    match config.max_execution_secs {
        Some(max_execution_secs) => Arc::new(Deadline::after(
            Duration::from_secs(max_execution_secs),
            Duration::from_secs(config.safety_margin_secs),
        )),
        None => Arc::new(Unbounded),
    }
}

/// Collaborators shared by both directions.
struct Components {
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn GatewayClient>,
    store: Arc<dyn BlobStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    validator: Arc<KeyValidator>,
    allowance: Arc<dyn ExecutionAllowance>,
}

impl Components {
    async fn build(config: &FederationConfig) -> Result<Self, FederationError> {
        config.validate()?;

        // Starts counting before anything slow happens
        let allowance = execution_allowance(&config.execution);

        let secrets = get_secret_provider(&config.secrets);
        let auth_token = secrets.get_secret(&config.gateway.auth_token_secret).await?;
        let signing_key = secrets
            .get_secret(&config.gateway.signing_key_secret)
            .await?;
        let signer = Arc::new(HmacSigner::new(signing_key.expose().as_bytes())?);
        let gateway = Arc::new(HttpGatewayClient::new(
            config.gateway.base_url.clone(),
            auth_token,
            Jws::new(signer),
        ));

        let store: Arc<dyn BlobStore> = Arc::new(FilesystemBlobStore::new(&config.storage.base_dir));
        let checkpoints = Arc::new(BlobCheckpointStore::new(
            store.clone(),
            &config.storage.checkpoint_table,
        ));

        Ok(Components {
            clock: Arc::new(SystemClock),
            gateway,
            store,
            checkpoints,
            validator: Arc::new(KeyValidator::new(config.validation)),
            allowance,
        })
    }
}

/// Runs one download invocation: fetches partner keys page by page and stores
/// them, resuming from the last checkpoint.
pub async fn run_download(config: &FederationConfig) -> Result<DownloadStats, FederationError> {
    let components = Components::build(config).await?;

    let uploader = FederatedKeyUploader::new(
        components.store.clone(),
        &config.storage.federated_key_prefix,
        config.download.valid_origins.iter().cloned(),
        components.validator.clone(),
        components.clock.clone(),
    );
    let service = DiagnosisKeysDownloadService::new(
        components.clock,
        components.gateway,
        uploader,
        components.checkpoints,
        components.allowance,
        config.download.settings(),
    );

    Ok(service.run().await?)
}

/// Runs one upload invocation: sends submissions stored since the last
/// successful upload to the gateway.
pub async fn run_upload(config: &FederationConfig) -> Result<UploadStats, FederationError> {
    let upload = config
        .upload
        .as_ref()
        .ok_or(FederationError::UploadNotConfigured)?;
    let components = Components::build(config).await?;

    let submissions = Arc::new(BlobSubmissionRepository::new(
        components.store.clone(),
        config.storage.submission_prefixes.clone(),
    ));
    let service = DiagnosisKeysUploadService::new(
        components.clock,
        components.gateway,
        submissions,
        components.checkpoints,
        components.validator,
        ExposureUploadFactory::new(&upload.region),
        components.allowance,
        upload.settings(),
    );

    Ok(service.run().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{method, path_regex, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(gateway: &str, secrets_dir: &std::path::Path, base_dir: &std::path::Path) -> FederationConfig {
        let yaml = format!(
            r#"
            gateway:
                base_url: {gateway}
                auth_token_secret: auth-token
                signing_key_secret: signing-key
            secrets:
                type: file
                dir: {secrets}
            storage:
                base_dir: {base}
                submission_prefixes: ["mobile/"]
            download:
                valid_origins: ["JE"]
            upload:
                region: GB-EAW
            "#,
            secrets = secrets_dir.display(),
            base = base_dir.display(),
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn secrets_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("auth-token"), "token").unwrap();
        std::fs::write(dir.path().join("signing-key"), "key").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_download_end_to_end() {
        let mock_server = MockServer::start().await;
        let rolling_start_number = validator::interval_number(Utc::now()) - 144;

        Mock::given(method("GET"))
            .and(path_regex("^/diagnosiskeys/download/[0-9]{4}-[0-9]{2}-[0-9]{2}$"))
            .and(query_param_is_missing("batchTag"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "batchTag": "first",
                "exposures": [{
                    "keyData": "ogNW4Ra+Zdds1ZOfvgDMrg==",
                    "rollingStartNumber": rolling_start_number,
                    "transmissionRiskLevel": 3,
                    "rollingPeriod": 144,
                    "origin": "JE",
                    "regions": ["JE"],
                    "testType": 1,
                    "reportType": 1,
                    "daysSinceOnset": 2
                }]
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("batchTag", "first"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;

        let secrets = secrets_dir();
        let storage = tempfile::tempdir().unwrap();
        let config = config(&mock_server.uri(), secrets.path(), storage.path());

        let stats = run_download(&config).await.unwrap();
        assert_eq!(stats.processed_page_count, 1);

        let today = Utc::now().format("%Y%m%d");
        let stored = storage.path().join(format!("nearform/JE/{today}/first.json"));
        assert!(stored.exists());
        assert!(
            storage
                .path()
                .join("federation-state/lastDownloadState.json")
                .exists()
        );

        // The next invocation resumes after the stored tag
        let stats = run_download(&config).await.unwrap();
        assert_eq!(stats.processed_page_count, 0);
    }

    #[tokio::test]
    async fn test_missing_secret() {
        let secrets = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        let config = config("http://127.0.0.1:1", secrets.path(), storage.path());

        assert!(matches!(
            run_download(&config).await,
            Err(FederationError::Secret(SecretError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_upload_without_submissions() {
        let mock_server = MockServer::start().await;
        let secrets = secrets_dir();
        let storage = tempfile::tempdir().unwrap();
        let config = config(&mock_server.uri(), secrets.path(), storage.path());

        let stats = run_upload(&config).await.unwrap();
        assert_eq!(stats.submission_count, 0);
        assert!(mock_server.received_requests().await.unwrap().is_empty());
    }
}
