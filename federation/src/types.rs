use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque continuation token issued by the federation gateway. It only has
/// meaning as input to the next download call and as a checkpoint value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchTag(String);

impl BatchTag {
    pub fn new<T: Into<String>>(value: T) -> Self {
        BatchTag(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchTag {
    fn from(value: &str) -> Self {
        BatchTag::new(value)
    }
}

/// The resume point of the download direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FederationBatch {
    pub batch_tag: BatchTag,
    pub batch_date: NaiveDate,
}

impl FederationBatch {
    pub fn new(batch_tag: BatchTag, batch_date: NaiveDate) -> Self {
        FederationBatch {
            batch_tag,
            batch_date,
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownEnumValue {
    kind: &'static str,
    value: i32,
}

/// Test kit used for the diagnosis. Integer encoded on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum TestType {
    LabResult,
    RapidResult,
    RapidSelfReported,
}

impl TestType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TestType::LabResult => "LAB_RESULT",
            TestType::RapidResult => "RAPID_RESULT",
            TestType::RapidSelfReported => "RAPID_SELF_REPORTED",
        }
    }

    /// Derives the test type from a submission object path such as
    /// `mobile/RAPID_RESULT/abc.json`. Paths without a known segment are lab results.
    pub fn from_object_path(path: &str) -> Self {
        path.split('/')
            .find_map(|segment| match segment {
                "LAB_RESULT" => Some(TestType::LabResult),
                "RAPID_RESULT" => Some(TestType::RapidResult),
                "RAPID_SELF_REPORTED" => Some(TestType::RapidSelfReported),
                _ => None,
            })
            .unwrap_or(TestType::LabResult)
    }
}

impl TryFrom<i32> for TestType {
    type Error = UnknownEnumValue;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TestType::LabResult),
            2 => Ok(TestType::RapidResult),
            3 => Ok(TestType::RapidSelfReported),
            _ => Err(UnknownEnumValue {
                kind: "testType",
                value,
            }),
        }
    }
}

impl From<TestType> for i32 {
    fn from(value: TestType) -> Self {
        match value {
            TestType::LabResult => 1,
            TestType::RapidResult => 2,
            TestType::RapidSelfReported => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ReportType {
    Unknown,
    ConfirmedTest,
    ConfirmedClinicalDiagnosis,
    SelfReport,
    Recursive,
    Revoked,
}

impl TryFrom<i32> for ReportType {
    type Error = UnknownEnumValue;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReportType::Unknown),
            1 => Ok(ReportType::ConfirmedTest),
            2 => Ok(ReportType::ConfirmedClinicalDiagnosis),
            3 => Ok(ReportType::SelfReport),
            4 => Ok(ReportType::Recursive),
            5 => Ok(ReportType::Revoked),
            _ => Err(UnknownEnumValue {
                kind: "reportType",
                value,
            }),
        }
    }
}

impl From<ReportType> for i32 {
    fn from(value: ReportType) -> Self {
        match value {
            ReportType::Unknown => 0,
            ReportType::ConfirmedTest => 1,
            ReportType::ConfirmedClinicalDiagnosis => 2,
            ReportType::SelfReport => 3,
            ReportType::Recursive => 4,
            ReportType::Revoked => 5,
        }
    }
}

/// The fields of a key that the validator looks at, borrowed from whichever
/// representation the key is currently in.
#[derive(Clone, Copy, Debug)]
pub struct KeyFields<'a> {
    pub key: &'a str,
    pub rolling_start_number: i64,
    pub rolling_period: i32,
    pub transmission_risk_level: i32,
}

/// One key as published by a partner backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureKey {
    pub key_data: String,
    pub rolling_start_number: i64,
    pub transmission_risk_level: i32,
    pub rolling_period: i32,
    pub origin: String,
    #[serde(default)]
    pub regions: Vec<String>,
    pub test_type: TestType,
    pub report_type: ReportType,
    #[serde(default, alias = "daysSinceOnsetOfSymptoms")]
    pub days_since_onset: Option<i32>,
}

impl ExposureKey {
    pub fn fields(&self) -> KeyFields<'_> {
        KeyFields {
            key: &self.key_data,
            rolling_start_number: self.rolling_start_number,
            rolling_period: self.rolling_period,
            transmission_risk_level: self.transmission_risk_level,
        }
    }

    /// Only lab confirmed test results are eligible for federated distribution.
    pub fn is_federation_eligible(&self) -> bool {
        self.test_type == TestType::LabResult && self.report_type == ReportType::ConfirmedTest
    }
}

/// Replaces the transmission risk level of every key with a fixed value when enabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RiskLevelOverride {
    pub enabled: bool,
    pub default: i32,
}

impl RiskLevelOverride {
    pub fn apply(&self, transmission_risk_level: i32) -> i32 {
        if self.enabled {
            self.default
        } else {
            transmission_risk_level
        }
    }
}

/// One page of keys returned by the gateway.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadPage {
    pub batch_tag: BatchTag,
    pub exposures: Vec<ExposureKey>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadResponse {
    Page(DownloadPage),
    // The gateway has nothing after the requested batch.
    NoMoreContent,
}

/// Canonical persisted form of a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredExposureKey {
    pub key: String,
    pub rolling_start_number: i64,
    pub rolling_period: i32,
    pub transmission_risk: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_since_onset_of_symptoms: Option<i32>,
}

impl StoredExposureKey {
    pub fn fields(&self) -> KeyFields<'_> {
        KeyFields {
            key: &self.key,
            rolling_start_number: self.rolling_start_number,
            rolling_period: self.rolling_period,
            transmission_risk_level: self.transmission_risk,
        }
    }
}

impl From<&ExposureKey> for StoredExposureKey {
    fn from(key: &ExposureKey) -> Self {
        StoredExposureKey {
            key: key.key_data.clone(),
            rolling_start_number: key.rolling_start_number,
            rolling_period: key.rolling_period,
            transmission_risk: key.transmission_risk_level,
            days_since_onset_of_symptoms: key.days_since_onset,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredExposureKeyPayload {
    pub temporary_exposure_keys: Vec<StoredExposureKey>,
}

/// Key in the shape the gateway accepts on upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureUpload {
    pub key_data: String,
    pub rolling_start_number: i64,
    pub transmission_risk_level: i32,
    pub rolling_period: i32,
    pub regions: Vec<String>,
    pub test_type: TestType,
    pub report_type: ReportType,
    pub days_since_onset: i32,
}

impl ExposureUpload {
    pub fn fields(&self) -> KeyFields<'_> {
        KeyFields {
            key: &self.key_data,
            rolling_start_number: self.rolling_start_number,
            rolling_period: self.rolling_period,
            transmission_risk_level: self.transmission_risk_level,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub batch_tag: String,
    pub inserted_exposures: usize,
}

/// A locally stored mobile submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub submission_date: DateTime<Utc>,
    pub object_path: String,
    pub payload: StoredExposureKeyPayload,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStats {
    pub processed_page_count: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStats {
    pub submission_count: usize,
}
