use crate::types::BitratePolicy;
use crate::upload::DEFAULT_MAX_CHUNK_SIZE;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Environment variable holding the default storage bearer token.
pub const TOKEN_ENV: &str = "STORAGE_TOKEN";

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// How long finished jobs stay queryable.
    #[serde(default = "default_progress_retention_secs")]
    pub progress_retention_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(skip)]
    pub token: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Parent of the engine's scratch directory. Defaults to the system temp dir.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    #[serde(default)]
    pub bitrate_policy: BitratePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            scratch_dir: None,
            bitrate_policy: BitratePolicy::default(),
        }
    }
}

fn default_max_upload_bytes() -> usize {
    1024 * 1024 * 1024
}

fn default_progress_retention_secs() -> u64 {
    300
}

fn default_base_url() -> String {
    "https://api.nft.storage".to_string()
}

fn default_gateway_url() -> String {
    "https://nftstorage.link".to_string()
}

fn default_max_chunk_size() -> usize {
    DEFAULT_MAX_CHUNK_SIZE
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        Self::from_yaml(&content, std::env::var(TOKEN_ENV).ok())
    }

    pub fn from_yaml(content: &str, token: Option<String>) -> Result<Self> {
        let mut config: Config =
            serde_yaml::from_str(content).context("Failed to parse config file")?;

        config.storage.token = match token.map(|t| t.trim().to_string()) {
            Some(t) if !t.is_empty() => t,
            _ => bail!("{TOKEN_ENV} must be set to the storage service token"),
        };
        if config.storage.max_chunk_size == 0 {
            bail!("storage.max_chunk_size must be greater than zero");
        }
        Ok(config)
    }
}
