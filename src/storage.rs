//! Object storage with append semantics, and the line log built on it.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use sha1::Sha1;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;

const OBJECT_TYPE_HEADER: &str = "x-oss-object-type";
const NEXT_POSITION_HEADER: &str = "x-oss-next-append-position";
const POSITION_CONFLICT_CODE: &str = "PositionNotEqualToLength";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("append position no longer matches object length")]
    PositionConflict,
    #[error("storage returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("storage unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("object storage is not configured")]
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub appendable: bool,
    pub next_append_position: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StorageError>;

    /// `None` when the object does not exist.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError>;

    /// Appends at `position` and returns the next append position. A stale
    /// position yields `PositionConflict`.
    async fn append(
        &self,
        key: &str,
        position: u64,
        body: Bytes,
        content_type: &str,
    ) -> Result<u64, StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { position: u64 },
    /// The object exists as a regular object; nothing was written.
    NotAppendable,
    /// Every attempt hit a position conflict; the line was dropped.
    Dropped { attempts: u32 },
}

/// Line-oriented log on top of appendable objects. Concurrent writers are
/// resolved by re-reading the position and retrying a bounded number of times.
pub struct TranscriptLog {
    store: Arc<dyn ObjectStore>,
    max_attempts: u32,
}

impl TranscriptLog {
    pub fn new(store: Arc<dyn ObjectStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn append_line(&self, key: &str, line: &str) -> Result<AppendOutcome, StorageError> {
        let body = Bytes::from(format!("{}\n", line));

        for attempt in 1..=self.max_attempts {
            let position = match self.store.head(key).await? {
                Some(meta) if !meta.appendable => {
                    warn!("{} is a regular object, cannot append. Skipping.", key);
                    return Ok(AppendOutcome::NotAppendable);
                }
                Some(meta) => meta.next_append_position,
                None => 0,
            };

            match self.store.append(key, position, body.clone(), "text/plain").await {
                Ok(next) => {
                    debug!("Appended to {} at {} (next {})", key, position, next);
                    return Ok(AppendOutcome::Appended { position });
                }
                Err(StorageError::PositionConflict) => {
                    info!(
                        "Append position mismatch for {} (attempt {}/{}), retrying...",
                        key, attempt, self.max_attempts
                    );
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            "Dropping line for {} after {} conflicting appends",
            key, self.max_attempts
        );
        Ok(AppendOutcome::Dropped {
            attempts: self.max_attempts,
        })
    }
}

/// Aliyun OSS over its REST API, signed with the V1 HMAC-SHA1 scheme.
pub struct OssStore {
    client: Client,
    endpoint: String,
    bucket: String,
    access_key_id: String,
    access_key_secret: String,
}

impl OssStore {
    /// Returns `None` unless bucket and credentials are all set.
    pub fn from_config(config: &StorageConfig) -> Option<Self> {
        let configured = [
            &config.oss_endpoint,
            &config.oss_bucket,
            &config.oss_access_key_id,
            &config.oss_access_key_secret,
        ]
        .iter()
        .all(|v| !v.trim().is_empty());
        if !configured {
            return None;
        }
        Some(Self {
            client: Client::new(),
            endpoint: config
                .oss_endpoint
                .trim_start_matches("https://")
                .trim_end_matches('/')
                .to_string(),
            bucket: config.oss_bucket.clone(),
            access_key_id: config.oss_access_key_id.clone(),
            access_key_secret: config.oss_access_key_secret.clone(),
        })
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        subresource: Option<String>,
        body: Option<(Bytes, &str)>,
    ) -> Result<reqwest::Response, StorageError> {
        let key = key.trim_start_matches('/');
        let mut url = format!("https://{}.{}/{}", self.bucket, self.endpoint, key);
        let mut resource = format!("/{}/{}", self.bucket, key);
        if let Some(sub) = &subresource {
            url.push('?');
            url.push_str(sub);
            resource.push('?');
            resource.push_str(sub);
        }

        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let content_type = body.as_ref().map(|(_, ct)| *ct).unwrap_or("");
        let signature = sign(
            &self.access_key_secret,
            method.as_str(),
            content_type,
            &date,
            &resource,
        );

        let mut req = self
            .client
            .request(method, url)
            .header("Date", date)
            .header("Authorization", format!("OSS {}:{}", self.access_key_id, signature));
        if let Some((bytes, content_type)) = body {
            req = req.header("Content-Type", content_type).body(bytes);
        }
        Ok(req.send().await?)
    }
}

#[async_trait]
impl ObjectStore for OssStore {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StorageError> {
        let resp = self.send(Method::PUT, key, None, Some((body, content_type))).await?;
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        let resp = self.send(Method::HEAD, key, None, None).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let headers = resp.headers();
        let object_type = headers
            .get(OBJECT_TYPE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let next_append_position = headers
            .get(NEXT_POSITION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .or(resp.content_length())
            .unwrap_or(0);

        Ok(Some(ObjectMeta {
            appendable: object_type != "Normal",
            next_append_position,
        }))
    }

    async fn append(
        &self,
        key: &str,
        position: u64,
        body: Bytes,
        content_type: &str,
    ) -> Result<u64, StorageError> {
        let len = body.len() as u64;
        let resp = self
            .send(
                Method::POST,
                key,
                Some(format!("append&position={}", position)),
                Some((body, content_type)),
            )
            .await?;

        if resp.status() == StatusCode::CONFLICT {
            return Err(StorageError::PositionConflict);
        }
        if !resp.status().is_success() {
            let err = status_error(resp).await;
            if let StorageError::Status { body, .. } = &err {
                if body.contains(POSITION_CONFLICT_CODE) {
                    return Err(StorageError::PositionConflict);
                }
            }
            return Err(err);
        }

        Ok(resp
            .headers()
            .get(NEXT_POSITION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(position + len))
    }
}

async fn status_error(resp: reqwest::Response) -> StorageError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    StorageError::Status { status, body }
}

/// V1 signature over `VERB\nMD5\nType\nDate\nResource`.
fn sign(secret: &str, verb: &str, content_type: &str, date: &str, resource: &str) -> String {
    let string_to_sign = format!("{}\n\n{}\n{}\n{}", verb, content_type, date, resource);
    // HMAC 接受任意长度的 key
    let mut mac = match Hmac::<Sha1>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(string_to_sign.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        /// `None` means the object does not exist yet.
        content: Mutex<Option<Vec<u8>>>,
        appendable: bool,
        /// Number of upcoming appends that lose the race.
        conflicts: Mutex<u32>,
        append_calls: Mutex<Vec<u64>>,
    }

    impl FakeStore {
        fn missing() -> Self {
            Self {
                appendable: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn put(&self, _key: &str, body: Bytes, _ct: &str) -> Result<(), StorageError> {
            *self.content.lock().unwrap() = Some(body.to_vec());
            Ok(())
        }

        async fn head(&self, _key: &str) -> Result<Option<ObjectMeta>, StorageError> {
            Ok(self.content.lock().unwrap().as_ref().map(|c| ObjectMeta {
                appendable: self.appendable,
                next_append_position: c.len() as u64,
            }))
        }

        async fn append(
            &self,
            _key: &str,
            position: u64,
            body: Bytes,
            _ct: &str,
        ) -> Result<u64, StorageError> {
            self.append_calls.lock().unwrap().push(position);
            let mut conflicts = self.conflicts.lock().unwrap();
            if *conflicts > 0 {
                *conflicts -= 1;
                // 模拟另一个写入者抢先追加
                let mut content = self.content.lock().unwrap();
                content.get_or_insert_with(Vec::new).extend_from_slice(b"other\n");
                return Err(StorageError::PositionConflict);
            }
            let mut content = self.content.lock().unwrap();
            let content = content.get_or_insert_with(Vec::new);
            content.extend_from_slice(&body);
            Ok(content.len() as u64)
        }
    }

    #[tokio::test]
    async fn missing_object_appends_at_zero() {
        let store = Arc::new(FakeStore::missing());
        let log = TranscriptLog::new(store.clone(), 3);
        let outcome = log.append_line("dataset/u1/transcripts.txt", "a\tb\tc").await.unwrap();
        assert_eq!(outcome, AppendOutcome::Appended { position: 0 });
        assert_eq!(store.content.lock().unwrap().as_deref(), Some(&b"a\tb\tc\n"[..]));
    }

    #[tokio::test]
    async fn conflict_rereads_position_and_retries() {
        let store = Arc::new(FakeStore::missing());
        *store.conflicts.lock().unwrap() = 1;
        let log = TranscriptLog::new(store.clone(), 3);

        let outcome = log.append_line("k", "line").await.unwrap();
        assert_eq!(outcome, AppendOutcome::Appended { position: 6 });
        assert_eq!(*store.append_calls.lock().unwrap(), vec![0, 6]);
        assert_eq!(store.content.lock().unwrap().as_deref(), Some(&b"other\nline\n"[..]));
    }

    #[tokio::test]
    async fn persistent_conflict_gives_up_after_max_attempts() {
        let store = Arc::new(FakeStore::missing());
        *store.conflicts.lock().unwrap() = u32::MAX;
        let log = TranscriptLog::new(store.clone(), 3);

        let outcome = log.append_line("k", "line").await.unwrap();
        assert_eq!(outcome, AppendOutcome::Dropped { attempts: 3 });
        assert_eq!(store.append_calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn regular_object_is_skipped() {
        let store = Arc::new(FakeStore {
            content: Mutex::new(Some(b"x".to_vec())),
            appendable: false,
            ..Default::default()
        });
        let log = TranscriptLog::new(store.clone(), 3);
        assert_eq!(log.append_line("k", "line").await.unwrap(), AppendOutcome::NotAppendable);
        assert!(store.append_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn v1_signature_matches_reference() {
        let signature = sign(
            "secret",
            "POST",
            "text/plain",
            "Mon, 19 Oct 2026 08:00:00 GMT",
            "/bucket/dataset/u1/transcripts.txt?append&position=0",
        );
        assert_eq!(signature, "ag6slTvYPWOD4BWtKIvia8Ex6k8=");
    }

    #[test]
    fn unconfigured_oss_is_disabled() {
        let mut config = crate::config::Config::default().storage;
        config.oss_bucket = String::new();
        assert!(OssStore::from_config(&config).is_none());
    }
}
