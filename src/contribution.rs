//! Persisting finished recordings: audio upload, contribution record and the
//! per-contributor transcript log.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::audio::Recording;
use crate::config::StorageConfig;
use crate::records::{ContributionRecord, RecordStore, RestRecordStore};
use crate::storage::{AppendOutcome, ObjectStore, OssStore, StorageError, TranscriptLog};

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("upload failed and local fallback could not be written: {0}")]
    Fallback(#[from] std::io::Error),
}

/// What the contributor says about a recording.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub contributor_id: String,
    /// Set for guided recordings of a corpus sentence.
    pub sentence_id: Option<String>,
    pub transcript: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Shorter than the minimum; nothing stored.
    Skipped { duration: Duration },
    Uploaded { path: String },
    SavedLocally { path: PathBuf },
}

pub struct Contributor {
    store: Option<Arc<dyn ObjectStore>>,
    records: Option<Arc<dyn RecordStore>>,
    transcripts: Option<TranscriptLog>,
    fallback_dir: PathBuf,
}

impl Contributor {
    pub fn new(
        store: Option<Arc<dyn ObjectStore>>,
        records: Option<Arc<dyn RecordStore>>,
        config: &StorageConfig,
    ) -> Self {
        let transcripts = store
            .clone()
            .map(|s| TranscriptLog::new(s, config.append_retries));
        Self {
            store,
            records,
            transcripts,
            fallback_dir: config.local_fallback_dir.clone(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        let store = OssStore::from_config(config).map(|s| Arc::new(s) as Arc<dyn ObjectStore>);
        let records = RestRecordStore::from_config(config).map(|r| Arc::new(r) as Arc<dyn RecordStore>);
        if store.is_none() {
            info!("Object storage not configured, recordings are kept locally");
        }
        Self::new(store, records, config)
    }

    pub async fn submit(
        &self,
        recording: &Recording,
        submission: &Submission,
    ) -> Result<SubmitOutcome, SubmitError> {
        if !recording.is_persistable() {
            info!(
                "Recording too short ({:.2}s), not saving",
                recording.duration.as_secs_f32()
            );
            return Ok(SubmitOutcome::Skipped {
                duration: recording.duration,
            });
        }

        let prefix = submission.sentence_id.as_deref().unwrap_or("recording");
        let filename = format!("{}_{}.wav", prefix, Utc::now().timestamp_millis());
        let path = format!("{}/{}", submission.contributor_id, filename);

        if let Err(e) = self.upload(&path, &recording.wav).await {
            warn!("Upload of {} failed, saving locally: {}", path, e);
            let local = self.fallback_dir.join(&path);
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&local, &recording.wav).await?;
            info!("Saved {} locally", local.display());
            return Ok(SubmitOutcome::SavedLocally { path: local });
        }
        info!("Uploaded {}", path);

        // 音频已经落盘，记录写入失败只记日志
        let record = ContributionRecord {
            contributor_id: submission.contributor_id.clone(),
            audio_path: path.clone(),
            transcript: submission.transcript.clone(),
            sentence_id: submission.sentence_id.clone(),
            is_free_recording: submission.sentence_id.is_none(),
            duration_seconds: recording.duration.as_secs_f64(),
            metadata: match &submission.metadata {
                Value::Null => Value::Object(Default::default()),
                other => other.clone(),
            },
        };
        match &self.records {
            Some(records) => {
                if let Err(e) = records.insert_contribution(&record).await {
                    warn!("Failed to insert contribution record for {}: {}", path, e);
                }
            }
            None => warn!("Record store not configured, skipping insert"),
        }

        if submission.sentence_id.is_some() {
            self.append_transcript(&submission.contributor_id, &path, &filename, submission)
                .await;
        }

        Ok(SubmitOutcome::Uploaded { path })
    }

    async fn upload(&self, path: &str, wav: &[u8]) -> Result<(), StorageError> {
        let store = self.store.as_ref().ok_or(StorageError::Disabled)?;
        store.put(path, Bytes::copy_from_slice(wav), "audio/wav").await
    }

    /// Line format: `uttId \t audioPath \t text`.
    async fn append_transcript(
        &self,
        contributor_id: &str,
        path: &str,
        filename: &str,
        submission: &Submission,
    ) {
        let Some(log) = &self.transcripts else {
            return;
        };
        let utt_id = filename.strip_suffix(".wav").unwrap_or(filename);
        let text = submission.transcript.as_deref().unwrap_or("");
        let line = format!("{}\t{}\t{}", utt_id, path, text);
        let key = format!("dataset/{}/transcripts.txt", contributor_id);

        match log.append_line(&key, &line).await {
            Ok(AppendOutcome::Appended { .. }) => {}
            Ok(outcome) => warn!("Transcript line for {} not written: {:?}", utt_id, outcome),
            Err(e) => warn!("Failed to append transcript for {}: {}", utt_id, e),
        }
    }
}
