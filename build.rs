use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    relay: Relay,
    client: Client,
    audio: Audio,
    identity: Identity,
    storage: Storage,
}

#[derive(Deserialize)]
struct Relay {
    listen_addr: String,
    path: String,
    agent_url: String,
    token_param: String,
    verify_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Client {
    relay_url: String,
    token: String,
    reconnect_base_ms: u64,
    reconnect_cap_ms: u64,
    max_reconnect_attempts: u32,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    capture_sample_rate: u32,
    sample_rate: u32,
    buffer_size: usize,
    playback_sample_rate: u32,
    stream_format: String,
}

#[derive(Deserialize)]
struct Identity {
    auth_url: String,
    api_key: String,
    timeout_ms: u64,
}

#[derive(Deserialize)]
struct Storage {
    oss_endpoint: String,
    oss_bucket: String,
    oss_access_key_id: String,
    oss_access_key_secret: String,
    records_url: String,
    records_key: String,
    local_fallback_dir: String,
    append_retries: u32,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 中继服务端
    println!("cargo:rustc-env=RELAY_LISTEN_ADDR={}", config.relay.listen_addr);
    println!("cargo:rustc-env=RELAY_PATH={}", config.relay.path);
    println!("cargo:rustc-env=RELAY_AGENT_URL={}", config.relay.agent_url);
    println!("cargo:rustc-env=RELAY_TOKEN_PARAM={}", config.relay.token_param);
    println!("cargo:rustc-env=RELAY_VERIFY_TIMEOUT_MS={}", config.relay.verify_timeout_ms);

    // 客户端链路
    println!("cargo:rustc-env=CLIENT_RELAY_URL={}", config.client.relay_url);
    println!("cargo:rustc-env=CLIENT_TOKEN={}", config.client.token);
    println!("cargo:rustc-env=CLIENT_RECONNECT_BASE_MS={}", config.client.reconnect_base_ms);
    println!("cargo:rustc-env=CLIENT_RECONNECT_CAP_MS={}", config.client.reconnect_cap_ms);
    println!(
        "cargo:rustc-env=CLIENT_MAX_RECONNECT_ATTEMPTS={}",
        config.client.max_reconnect_attempts
    );

    // 音频配置
    println!("cargo:rustc-env=AUDIO_CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_CAPTURE_SAMPLE_RATE={}", config.audio.capture_sample_rate);
    println!("cargo:rustc-env=AUDIO_SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=AUDIO_BUFFER_SIZE={}", config.audio.buffer_size);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_SAMPLE_RATE={}", config.audio.playback_sample_rate);
    println!("cargo:rustc-env=AUDIO_STREAM_FORMAT={}", config.audio.stream_format);

    // 身份校验
    println!("cargo:rustc-env=IDENTITY_AUTH_URL={}", config.identity.auth_url);
    println!("cargo:rustc-env=IDENTITY_API_KEY={}", config.identity.api_key);
    println!("cargo:rustc-env=IDENTITY_TIMEOUT_MS={}", config.identity.timeout_ms);

    // 存储
    println!("cargo:rustc-env=STORAGE_OSS_ENDPOINT={}", config.storage.oss_endpoint);
    println!("cargo:rustc-env=STORAGE_OSS_BUCKET={}", config.storage.oss_bucket);
    println!("cargo:rustc-env=STORAGE_OSS_ACCESS_KEY_ID={}", config.storage.oss_access_key_id);
    println!(
        "cargo:rustc-env=STORAGE_OSS_ACCESS_KEY_SECRET={}",
        config.storage.oss_access_key_secret
    );
    println!("cargo:rustc-env=STORAGE_RECORDS_URL={}", config.storage.records_url);
    println!("cargo:rustc-env=STORAGE_RECORDS_KEY={}", config.storage.records_key);
    println!("cargo:rustc-env=STORAGE_LOCAL_FALLBACK_DIR={}", config.storage.local_fallback_dir);
    println!("cargo:rustc-env=STORAGE_APPEND_RETRIES={}", config.storage.append_retries);
}
