use crate::metrics_defs::GATEWAY_REQUESTS;
use crate::secrets::SecretValue;
use crate::signing::{Jws, SigningError};
use crate::types::{BatchTag, DownloadPage, DownloadResponse, ExposureUpload, UploadResult};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::Serialize;
use shared::counter;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("HTTP client error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid gateway URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unexpected HTTP status {status} for {url}")]
    UnexpectedStatus { url: String, status: StatusCode },

    #[error("malformed gateway response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("could not sign upload payload: {0}")]
    Signing(#[from] SigningError),
}

/// The cross-border federation gateway.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Fetches the first batch published on `date`, or the batch following
    /// `batch_tag` when one is given.
    async fn download(
        &self,
        date: NaiveDate,
        batch_tag: Option<&BatchTag>,
    ) -> Result<DownloadResponse, GatewayError>;

    async fn upload(&self, exposures: &[ExposureUpload]) -> Result<UploadResult, GatewayError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest {
    batch_tag: String,
    payload: String,
}

pub struct HttpGatewayClient {
    client: reqwest::Client,
    base_url: Url,
    auth_token: SecretValue,
    jws: Jws,
}

impl HttpGatewayClient {
    pub fn new(base_url: Url, auth_token: SecretValue, jws: Jws) -> Self {
        HttpGatewayClient {
            client: reqwest::Client::new(),
            base_url,
            auth_token,
            jws,
        }
    }

    fn endpoint(&self, suffix: &str) -> Result<Url, GatewayError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}/{suffix}"))?)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.auth_token.expose())
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn download(
        &self,
        date: NaiveDate,
        batch_tag: Option<&BatchTag>,
    ) -> Result<DownloadResponse, GatewayError> {
        let mut url = self.endpoint(&format!(
            "diagnosiskeys/download/{}",
            date.format("%Y-%m-%d")
        ))?;
        if let Some(tag) = batch_tag {
            url.query_pairs_mut().append_pair("batchTag", tag.as_str());
        }

        let response = self
            .client
            .get(url.clone())
            .header("Authorization", self.bearer())
            .send()
            .await?;
        let status = response.status();
        tracing::debug!(%url, status = status.as_u16(), "gateway download");
        counter!(GATEWAY_REQUESTS, "operation" => "download", "status" => status.as_u16().to_string())
            .increment(1);

        match status {
            StatusCode::OK => {
                let body = response.bytes().await?;
                let page: DownloadPage = serde_json::from_slice(&body)?;
                Ok(DownloadResponse::Page(page))
            }
            StatusCode::NO_CONTENT => Ok(DownloadResponse::NoMoreContent),
            status => {
                tracing::error!(
                    batch_tag = batch_tag.map(BatchTag::as_str),
                    status = status.as_u16(),
                    "download from federation gateway failed"
                );
                Err(GatewayError::UnexpectedStatus {
                    url: url.to_string(),
                    status,
                })
            }
        }
    }

    async fn upload(&self, exposures: &[ExposureUpload]) -> Result<UploadResult, GatewayError> {
        let url = self.endpoint("diagnosiskeys/upload")?;
        let payload = serde_json::to_vec(exposures)?;
        let request = UploadRequest {
            batch_tag: uuid::Uuid::new_v4().to_string(),
            payload: self.jws.sign(&payload)?,
        };

        let response = self
            .client
            .post(url.clone())
            .header("Authorization", self.bearer())
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        tracing::debug!(%url, status = status.as_u16(), "gateway upload");
        counter!(GATEWAY_REQUESTS, "operation" => "upload", "status" => status.as_u16().to_string())
            .increment(1);

        if status != StatusCode::OK {
            tracing::error!(
                status = status.as_u16(),
                "upload to federation gateway failed"
            );
            return Err(GatewayError::UnexpectedStatus {
                url: url.to_string(),
                status,
            });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
