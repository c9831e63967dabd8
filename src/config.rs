use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 中继服务端配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelayConfig {
    pub listen_addr: String,
    /// 唯一允许升级为 WebSocket 的路径
    pub path: String,
    /// 下游语音 Agent 地址
    pub agent_url: String,
    /// 携带 bearer token 的查询参数名
    pub token_param: String,
    /// 身份校验的最长等待时间，超时按匿名处理
    pub verify_timeout_ms: u64,
}

/// 客户端链路配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClientConfig {
    pub relay_url: String,
    pub token: String,
    /// 必须与服务端 relay.token_param 一致
    pub token_param: String,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub max_reconnect_attempts: u32,
}

/// 音频配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Desired native capture rate; the hardware may negotiate another one
    pub capture_sample_rate: u32,
    /// Canonical rate every outbound frame is resampled to
    pub sample_rate: u32,
    /// Native samples per capture tick
    pub buffer_size: usize,
    /// Rate assumed for returned chunks that carry no metadata
    pub playback_sample_rate: u32,
    /// 下发音频流的编码格式，目前只支持 "pcm_s16le"
    pub stream_format: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IdentityConfig {
    pub auth_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    pub oss_endpoint: String,
    pub oss_bucket: String,
    pub oss_access_key_id: String,
    pub oss_access_key_secret: String,
    pub records_url: String,
    pub records_key: String,
    pub local_fallback_dir: PathBuf,
    pub append_retries: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub relay: RelayConfig,
    pub client: ClientConfig,
    pub audio: AudioConfig,
    pub identity: IdentityConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            relay: RelayConfig {
                listen_addr: env!("RELAY_LISTEN_ADDR").to_string(),
                path: env!("RELAY_PATH").to_string(),
                agent_url: env!("RELAY_AGENT_URL").to_string(),
                token_param: env!("RELAY_TOKEN_PARAM").to_string(),
                verify_timeout_ms: env!("RELAY_VERIFY_TIMEOUT_MS")
                    .parse()
                    .map_err(|_| "Failed to parse RELAY_VERIFY_TIMEOUT_MS")?,
            },
            client: ClientConfig {
                relay_url: env!("CLIENT_RELAY_URL").to_string(),
                token: env!("CLIENT_TOKEN").to_string(),
                token_param: env!("RELAY_TOKEN_PARAM").to_string(),
                reconnect_base_ms: env!("CLIENT_RECONNECT_BASE_MS")
                    .parse()
                    .map_err(|_| "Failed to parse CLIENT_RECONNECT_BASE_MS")?,
                reconnect_cap_ms: env!("CLIENT_RECONNECT_CAP_MS")
                    .parse()
                    .map_err(|_| "Failed to parse CLIENT_RECONNECT_CAP_MS")?,
                max_reconnect_attempts: env!("CLIENT_MAX_RECONNECT_ATTEMPTS")
                    .parse()
                    .map_err(|_| "Failed to parse CLIENT_MAX_RECONNECT_ATTEMPTS")?,
            },
            audio: AudioConfig {
                capture_device: env!("AUDIO_CAPTURE_DEVICE").to_string(),
                playback_device: env!("AUDIO_PLAYBACK_DEVICE").to_string(),
                capture_sample_rate: env!("AUDIO_CAPTURE_SAMPLE_RATE")
                    .parse()
                    .map_err(|_| "Failed to parse AUDIO_CAPTURE_SAMPLE_RATE")?,
                sample_rate: env!("AUDIO_SAMPLE_RATE")
                    .parse()
                    .map_err(|_| "Failed to parse AUDIO_SAMPLE_RATE")?,
                buffer_size: env!("AUDIO_BUFFER_SIZE")
                    .parse()
                    .map_err(|_| "Failed to parse AUDIO_BUFFER_SIZE")?,
                playback_sample_rate: env!("AUDIO_PLAYBACK_SAMPLE_RATE")
                    .parse()
                    .map_err(|_| "Failed to parse AUDIO_PLAYBACK_SAMPLE_RATE")?,
                stream_format: env!("AUDIO_STREAM_FORMAT").to_string(),
            },
            identity: IdentityConfig {
                auth_url: env!("IDENTITY_AUTH_URL").to_string(),
                api_key: env!("IDENTITY_API_KEY").to_string(),
                timeout_ms: env!("IDENTITY_TIMEOUT_MS")
                    .parse()
                    .map_err(|_| "Failed to parse IDENTITY_TIMEOUT_MS")?,
            },
            storage: StorageConfig {
                oss_endpoint: env!("STORAGE_OSS_ENDPOINT").to_string(),
                oss_bucket: env!("STORAGE_OSS_BUCKET").to_string(),
                oss_access_key_id: env!("STORAGE_OSS_ACCESS_KEY_ID").to_string(),
                oss_access_key_secret: env!("STORAGE_OSS_ACCESS_KEY_SECRET").to_string(),
                records_url: env!("STORAGE_RECORDS_URL").to_string(),
                records_key: env!("STORAGE_RECORDS_KEY").to_string(),
                local_fallback_dir: PathBuf::from(env!("STORAGE_LOCAL_FALLBACK_DIR")),
                append_retries: env!("STORAGE_APPEND_RETRIES")
                    .parse()
                    .map_err(|_| "Failed to parse STORAGE_APPEND_RETRIES")?,
            },
        })
    }

    /// 运行时覆盖密钥和地址，避免把凭据编进二进制
    pub fn apply_env_overrides(&mut self) {
        override_from_env("VOXRELAY_AGENT_URL", &mut self.relay.agent_url);
        override_from_env("VOXRELAY_RELAY_URL", &mut self.client.relay_url);
        override_from_env("VOXRELAY_TOKEN", &mut self.client.token);
        override_from_env("VOXRELAY_AUTH_URL", &mut self.identity.auth_url);
        override_from_env("VOXRELAY_AUTH_API_KEY", &mut self.identity.api_key);
        override_from_env("VOXRELAY_OSS_ACCESS_KEY_ID", &mut self.storage.oss_access_key_id);
        override_from_env(
            "VOXRELAY_OSS_ACCESS_KEY_SECRET",
            &mut self.storage.oss_access_key_secret,
        );
        override_from_env("VOXRELAY_RECORDS_KEY", &mut self.storage.records_key);
    }
}

impl RelayConfig {
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}

impl ClientConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}

fn override_from_env(key: &str, target: &mut String) {
    if let Ok(value) = std::env::var(key) {
        if !value.trim().is_empty() {
            *target = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baked_config_parses() {
        let config = Config::new().unwrap();
        assert!(config.relay.path.starts_with('/'));
        assert_eq!(config.audio.sample_rate, 16000);
        assert!(config.client.max_reconnect_attempts > 0);
        assert!(config.client.reconnect_base() <= config.client.reconnect_cap());
    }
}
