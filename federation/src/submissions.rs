use crate::blob_store::{BlobError, BlobStore, ObjectMeta};
use crate::types::{StoredExposureKeyPayload, Submission};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum SubmissionError {
    #[error("submission storage error: {0}")]
    Storage(#[from] BlobError),
}

/// Room left in a batch for submissions stored in the same instant as the
/// last one that fits.
pub const TIE_HEADROOM: usize = 4;

/// How many submissions one batch may take.
///
/// Loading normally stops after `soft` submissions. Submissions sharing the
/// timestamp of the last one taken are still included, up to `hard`, because
/// the next batch only loads submissions strictly newer than that timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchLimit {
    pub soft: usize,
    pub hard: usize,
}

impl BatchLimit {
    /// `None` for a batch size of 0, which means unlimited.
    pub fn for_batch_size(batch_size: usize) -> Option<Self> {
        match batch_size {
            0 => None,
            hard => Some(BatchLimit {
                soft: hard.saturating_sub(TIE_HEADROOM).max(1),
                hard,
            }),
        }
    }

    /// Cuts `items`, which must be sorted by `time`, without splitting a group
    /// of equal timestamps. A group that does not fit under `hard` is left for
    /// the next batch, unless it starts the batch, in which case it is taken
    /// whole.
    pub fn apply<T>(&self, mut items: Vec<T>, time: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
        let soft = self.soft.max(1);
        if items.len() <= soft {
            return items;
        }

        let boundary = time(&items[soft - 1]);
        let mut end = soft;
        while end < items.len() && end < self.hard && time(&items[end]) == boundary {
            end += 1;
        }

        if end < items.len() && time(&items[end]) == boundary {
            let group_start = items[..end]
                .iter()
                .rposition(|item| time(item) != boundary)
                .map_or(0, |last_older| last_older + 1);
            end = if group_start > 0 {
                group_start
            } else {
                items
                    .iter()
                    .position(|item| time(item) != boundary)
                    .unwrap_or(items.len())
            };
        }

        items.truncate(end);
        items
    }
}

/// Source of locally collected mobile submissions for the upload direction.
#[async_trait]
pub trait SubmissionRepository: Send + Sync {
    /// Submissions stored strictly after `since`, oldest first, cut by
    /// `limit` when one is given.
    async fn load_submissions(
        &self,
        since: DateTime<Utc>,
        limit: Option<BatchLimit>,
    ) -> Result<Vec<Submission>, SubmissionError>;
}

pub struct BlobSubmissionRepository {
    store: Arc<dyn BlobStore>,
    prefixes: Vec<String>,
}

impl BlobSubmissionRepository {
    pub fn new(store: Arc<dyn BlobStore>, prefixes: Vec<String>) -> Self {
        BlobSubmissionRepository { store, prefixes }
    }
}

#[async_trait]
impl SubmissionRepository for BlobSubmissionRepository {
    async fn load_submissions(
        &self,
        since: DateTime<Utc>,
        limit: Option<BatchLimit>,
    ) -> Result<Vec<Submission>, SubmissionError> {
        let mut candidates: Vec<ObjectMeta> = Vec::new();
        for prefix in &self.prefixes {
            let objects = self.store.list(prefix).await?;
            candidates.extend(objects.into_iter().filter(|meta| meta.last_modified > since));
        }
        candidates.sort_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.path.cmp(&b.path))
        });
        candidates.dedup_by(|a, b| a.path == b.path);
        if let Some(limit) = limit {
            candidates = limit.apply(candidates, |meta| meta.last_modified);
        }

        let mut submissions = Vec::with_capacity(candidates.len());
        for meta in candidates {
            let Some(body) = self.store.get(&meta.path).await? else {
                continue;
            };
            match serde_json::from_slice::<StoredExposureKeyPayload>(&body) {
                Ok(payload) => submissions.push(Submission {
                    submission_date: meta.last_modified,
                    object_path: meta.path,
                    payload,
                }),
                Err(e) => {
                    tracing::warn!(path = %meta.path, error = %e, "skipping unreadable submission");
                }
            }
        }

        Ok(submissions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::InMemoryBlobStore;
    use bytes::Bytes;
    use chrono::TimeZone;

    const PAYLOAD: &str = r#"{"temporaryExposureKeys":[{"key":"W2zb3BeMWt6Xr2u0ABG32Q==","rollingStartNumber":2666736,"rollingPeriod":144,"transmissionRisk":7}]}"#;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn store_with(objects: &[(&str, i64, &'static str)]) -> Arc<InMemoryBlobStore> {
        let store = Arc::new(InMemoryBlobStore::new());
        for (path, modified, body) in objects {
            store.insert_at(path, Bytes::from_static(body.as_bytes()), at(*modified));
        }
        store
    }

    #[tokio::test]
    async fn test_load_newer_submissions_in_order() {
        let store = store_with(&[
            ("mobile/LAB_RESULT/c.json", 300, PAYLOAD),
            ("mobile/LAB_RESULT/a.json", 100, PAYLOAD),
            ("mobile/RAPID_RESULT/b.json", 200, PAYLOAD),
            ("other/d.json", 400, PAYLOAD),
        ]);
        let repository = BlobSubmissionRepository::new(store, vec!["mobile/".into()]);

        let submissions = repository.load_submissions(at(100), None).await.unwrap();
        let paths: Vec<&str> = submissions.iter().map(|s| s.object_path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["mobile/RAPID_RESULT/b.json", "mobile/LAB_RESULT/c.json"]
        );
        assert_eq!(submissions[0].submission_date, at(200));
        assert_eq!(submissions[0].payload.temporary_exposure_keys.len(), 1);
    }

    #[tokio::test]
    async fn test_limit_and_unreadable_objects() {
        let store = store_with(&[
            ("mobile/a.json", 100, PAYLOAD),
            ("mobile/b.json", 200, "garbage"),
            ("mobile/c.json", 300, PAYLOAD),
            ("mobile/d.json", 400, PAYLOAD),
        ]);
        let repository = BlobSubmissionRepository::new(store, vec!["mobile/".into()]);

        let limit = BatchLimit { soft: 3, hard: 3 };
        let submissions = repository.load_submissions(at(0), Some(limit)).await.unwrap();
        let paths: Vec<&str> = submissions.iter().map(|s| s.object_path.as_str()).collect();
        assert_eq!(paths, vec!["mobile/a.json", "mobile/c.json"]);
    }

    #[tokio::test]
    async fn test_limit_takes_submissions_sharing_last_timestamp() {
        let store = store_with(&[
            ("mobile/a.json", 100, PAYLOAD),
            ("mobile/b.json", 200, PAYLOAD),
            ("mobile/c.json", 200, PAYLOAD),
            ("mobile/d.json", 300, PAYLOAD),
        ]);
        let repository = BlobSubmissionRepository::new(store, vec!["mobile/".into()]);

        let limit = BatchLimit { soft: 2, hard: 4 };
        let submissions = repository.load_submissions(at(0), Some(limit)).await.unwrap();
        let paths: Vec<&str> = submissions.iter().map(|s| s.object_path.as_str()).collect();
        assert_eq!(paths, vec!["mobile/a.json", "mobile/b.json", "mobile/c.json"]);
    }

    #[test]
    fn test_batch_limit_for_batch_size() {
        assert_eq!(BatchLimit::for_batch_size(0), None);
        assert_eq!(
            BatchLimit::for_batch_size(100),
            Some(BatchLimit { soft: 96, hard: 100 })
        );
        assert_eq!(
            BatchLimit::for_batch_size(2),
            Some(BatchLimit { soft: 1, hard: 2 })
        );
    }

    #[test]
    fn test_batch_limit_never_splits_equal_timestamps() {
        let limit = BatchLimit { soft: 2, hard: 3 };
        let cut = |times: &[i64]| limit.apply(times.to_vec(), |t| at(*t));

        assert_eq!(cut(&[1, 2, 3, 4]), vec![1, 2]);
        assert_eq!(cut(&[1, 2, 2, 3]), vec![1, 2, 2]);
        // The group of 2s does not fit under the hard cap, so it waits
        assert_eq!(cut(&[1, 2, 2, 2, 3]), vec![1]);
        // Unless nothing older precedes it
        assert_eq!(cut(&[2, 2, 2, 2, 3]), vec![2, 2, 2, 2]);
        assert_eq!(cut(&[1]), vec![1]);
    }

    #[tokio::test]
    async fn test_overlapping_prefixes() {
        let store = store_with(&[("mobile/LAB_RESULT/a.json", 100, PAYLOAD)]);
        let repository = BlobSubmissionRepository::new(
            store,
            vec!["mobile/".into(), "mobile/LAB_RESULT/".into()],
        );

        let submissions = repository.load_submissions(at(0), None).await.unwrap();
        assert_eq!(submissions.len(), 1);
    }
}
