//! Metrics definitions for the key federation engine.

use shared::metrics_defs::{MetricDef, MetricType};

pub const GATEWAY_REQUESTS: MetricDef = MetricDef {
    name: "gateway.requests",
    metric_type: MetricType::Counter,
    description: "Requests sent to the federation gateway. Tagged with operation and status.",
};

pub const DOWNLOAD_PAGES_PROCESSED: MetricDef = MetricDef {
    name: "download.pages_processed",
    metric_type: MetricType::Counter,
    description: "Downloaded pages that were persisted and checkpointed",
};

pub const DOWNLOAD_KEYS_RECEIVED: MetricDef = MetricDef {
    name: "download.keys_received",
    metric_type: MetricType::Counter,
    description: "Keys contained in downloaded pages, before filtering",
};

pub const DOWNLOAD_DURATION: MetricDef = MetricDef {
    name: "download.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a download invocation in seconds",
};

pub const DOWNLOAD_STOPPED_BY_TIME_BUDGET: MetricDef = MetricDef {
    name: "download.stopped_by_time_budget",
    metric_type: MetricType::Counter,
    description: "Download invocations that stopped early to stay within the execution allowance",
};

pub const FEDERATED_KEYS: MetricDef = MetricDef {
    name: "federated_keys",
    metric_type: MetricType::Counter,
    description: "Eligible downloaded keys. Tagged with origin, test_type and validity.",
};

pub const FEDERATED_KEYS_STORED: MetricDef = MetricDef {
    name: "federated_keys.stored",
    metric_type: MetricType::Counter,
    description: "Downloaded keys written to the blob store. Tagged with origin.",
};

pub const INVALID_ORIGIN: MetricDef = MetricDef {
    name: "federated_keys.invalid_origin",
    metric_type: MetricType::Counter,
    description: "Origin groups discarded because the origin is not allow-listed",
};

pub const KEY_VALIDATION_FAILED: MetricDef = MetricDef {
    name: "key_validation.failed",
    metric_type: MetricType::Counter,
    description: "Keys rejected by the validator. Tagged with reason.",
};

pub const CHECKPOINT_WRITES: MetricDef = MetricDef {
    name: "checkpoint.writes",
    metric_type: MetricType::Counter,
    description: "Checkpoint records written. Tagged with direction.",
};

pub const UPLOAD_KEYS_SENT: MetricDef = MetricDef {
    name: "upload.keys_sent",
    metric_type: MetricType::Counter,
    description: "Keys sent to the federation gateway. Tagged with test_type.",
};

pub const UPLOAD_INCOMPLETE: MetricDef = MetricDef {
    name: "upload.incomplete",
    metric_type: MetricType::Counter,
    description: "Upload batches where the gateway accepted fewer keys than were sent",
};

pub const UPLOAD_DURATION: MetricDef = MetricDef {
    name: "upload.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete an upload invocation in seconds",
};

pub const ALL_METRICS: &[MetricDef] = &[
    GATEWAY_REQUESTS,
    DOWNLOAD_PAGES_PROCESSED,
    DOWNLOAD_KEYS_RECEIVED,
    DOWNLOAD_DURATION,
    DOWNLOAD_STOPPED_BY_TIME_BUDGET,
    FEDERATED_KEYS,
    FEDERATED_KEYS_STORED,
    INVALID_ORIGIN,
    KEY_VALIDATION_FAILED,
    CHECKPOINT_WRITES,
    UPLOAD_KEYS_SENT,
    UPLOAD_INCOMPLETE,
    UPLOAD_DURATION,
];
