//! Structured store for finished contributions.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::StorageConfig;

pub const CONTRIBUTIONS_TABLE: &str = "voice_contributions";

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("record store unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContributionRecord {
    pub contributor_id: String,
    pub audio_path: String,
    pub transcript: Option<String>,
    pub sentence_id: Option<String>,
    pub is_free_recording: bool,
    pub duration_seconds: f64,
    pub metadata: Value,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_contribution(&self, record: &ContributionRecord) -> Result<(), RecordError>;
}

/// PostgREST-style endpoint: `POST {records_url}/rest/v1/voice_contributions`.
pub struct RestRecordStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestRecordStore {
    pub fn from_config(config: &StorageConfig) -> Option<Self> {
        if config.records_url.trim().is_empty() {
            return None;
        }
        Some(Self {
            client: Client::new(),
            base_url: config.records_url.trim_end_matches('/').to_string(),
            api_key: config.records_key.clone(),
        })
    }
}

#[async_trait]
impl RecordStore for RestRecordStore {
    async fn insert_contribution(&self, record: &ContributionRecord) -> Result<(), RecordError> {
        let resp = self
            .client
            .post(format!("{}/rest/v1/{}", self.base_url, CONTRIBUTIONS_TABLE))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RecordError::Status { status, body });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_serializes_column_names() {
        let record = ContributionRecord {
            contributor_id: "u1".into(),
            audio_path: "u1/s9_1700000000000.wav".into(),
            transcript: Some("你好".into()),
            sentence_id: Some("s9".into()),
            is_free_recording: false,
            duration_seconds: 2.5,
            metadata: json!({}),
        };
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "contributor_id": "u1",
                "audio_path": "u1/s9_1700000000000.wav",
                "transcript": "你好",
                "sentence_id": "s9",
                "is_free_recording": false,
                "duration_seconds": 2.5,
                "metadata": {}
            })
        );
    }

    #[test]
    fn empty_url_disables_store() {
        let mut config = crate::config::Config::default().storage;
        config.records_url = String::new();
        assert!(RestRecordStore::from_config(&config).is_none());
    }
}
