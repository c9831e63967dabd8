//! Bearer-token verification against the external identity provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::config::IdentityConfig;

/// Minimal identity injected into the agent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("token rejected (HTTP {status})")]
    Rejected { status: u16 },
    #[error("identity provider unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed identity response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, IdentityError>;
}

#[derive(Debug, Deserialize)]
struct UserMetadata {
    full_name: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: Option<String>,
    email: Option<String>,
    user_metadata: Option<UserMetadata>,
}

impl UserResponse {
    fn into_identity(self) -> Result<Identity, IdentityError> {
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| IdentityError::Malformed("missing user id".to_string()))?;

        let from_metadata = self
            .user_metadata
            .and_then(|m| m.full_name.or(m.name))
            .filter(|n| !n.trim().is_empty());
        let from_email = self
            .email
            .as_deref()
            .and_then(|e| e.split('@').next())
            .filter(|local| !local.is_empty())
            .map(str::to_string);

        let display_name = from_metadata.or(from_email).unwrap_or_else(|| id.clone());
        Ok(Identity { id, display_name })
    }
}

/// Calls `GET {auth_url}/auth/v1/user` with the caller's token.
pub struct HttpIdentityVerifier {
    client: Client,
    auth_url: String,
    api_key: String,
}

impl HttpIdentityVerifier {
    /// Returns `None` when no identity provider is configured.
    pub fn from_config(config: &IdentityConfig) -> Option<Self> {
        if config.auth_url.trim().is_empty() {
            return None;
        }
        let client = match Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!("Failed to build identity client, sessions stay anonymous: {}", e);
                return None;
            }
        };
        Some(Self {
            client,
            auth_url: config.auth_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, IdentityError> {
        let resp = self
            .client
            .get(format!("{}/auth/v1/user", self.auth_url))
            .bearer_auth(token)
            .header("apikey", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(IdentityError::Rejected {
                status: resp.status().as_u16(),
            });
        }

        let user: UserResponse = resp
            .json()
            .await
            .map_err(|e| IdentityError::Malformed(e.to_string()))?;
        user.into_identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Identity, IdentityError> {
        serde_json::from_str::<UserResponse>(json).unwrap().into_identity()
    }

    #[test]
    fn display_name_prefers_metadata() {
        let identity = parse(
            r#"{"id":"u1","email":"amy@example.com","user_metadata":{"full_name":"Amy Chen"}}"#,
        )
        .unwrap();
        assert_eq!(identity.display_name, "Amy Chen");
    }

    #[test]
    fn display_name_falls_back_to_email_then_id() {
        let identity = parse(r#"{"id":"u1","email":"amy@example.com"}"#).unwrap();
        assert_eq!(identity.display_name, "amy");

        let identity = parse(r#"{"id":"u1"}"#).unwrap();
        assert_eq!(identity.display_name, "u1");
    }

    #[test]
    fn missing_id_is_malformed() {
        assert!(matches!(
            parse(r#"{"email":"amy@example.com"}"#),
            Err(IdentityError::Malformed(_))
        ));
    }

    #[test]
    fn empty_auth_url_disables_verification() {
        let config = IdentityConfig {
            auth_url: " ".into(),
            api_key: String::new(),
            timeout_ms: 1000,
        };
        assert!(HttpIdentityVerifier::from_config(&config).is_none());
    }

    #[tokio::test]
    async fn silent_provider_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // 接受连接但从不应答
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let config = IdentityConfig {
            auth_url: format!("http://{}", addr),
            api_key: String::new(),
            timeout_ms: 200,
        };
        let verifier = HttpIdentityVerifier::from_config(&config).unwrap();
        let res = tokio::time::timeout(Duration::from_secs(5), verifier.verify("t"))
            .await
            .expect("verify must give up on its own");
        assert!(matches!(res, Err(IdentityError::Transport(_))));
    }
}
