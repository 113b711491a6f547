// 配置管理模块

pub mod env;

use crate::uploader::{
    default_max_concurrency, RetryPolicy, DEFAULT_BASE_INTERVAL_MS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_RETRY_MULTIPLIER, DEFAULT_UPLOAD_CHUNK_SIZE, MAX_RETRY_MULTIPLIER,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

pub use env::apply_env_overrides;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务端配置
    #[serde(default)]
    pub endpoint: EndpointConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 服务端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// 服务根地址
    #[serde(default)]
    pub base_url: String,
    /// 工作流运行 ID（容器接口路径的一部分）
    #[serde(default)]
    pub run_id: String,
    /// API 版本
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Bearer 令牌（一般通过环境变量提供）
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_version() -> String {
    "6.0-preview".to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            run_id: String::new(),
            api_version: default_api_version(),
            token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl EndpointConfig {
    /// 验证服务端配置是否完整
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            anyhow::bail!("未配置服务地址 (endpoint.base_url 或 ASSET_UPLOAD_URL)");
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            anyhow::bail!("服务地址必须以 http:// 或 https:// 开头: {}", self.base_url);
        }
        if self.run_id.is_empty() {
            anyhow::bail!("未配置运行 ID (endpoint.run_id 或 ASSET_UPLOAD_RUN_ID)");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("请求超时必须大于 0");
        }
        Ok(())
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分片大小（字节）
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: u64,
    /// 最大并发分片数
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// 单个分片最大尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 初始退避间隔（毫秒）
    #[serde(default = "default_base_interval_ms")]
    pub base_interval_ms: u64,
    /// 退避倍数
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// 是否尝试 gzip 压缩分片
    #[serde(default = "default_true")]
    pub gzip: bool,
    /// 是否复用连接
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    /// 分片请求的 Content-Type
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_chunk_size_bytes() -> u64 {
    DEFAULT_UPLOAD_CHUNK_SIZE
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_interval_ms() -> u64 {
    DEFAULT_BASE_INTERVAL_MS
}

fn default_multiplier() -> f64 {
    DEFAULT_RETRY_MULTIPLIER
}

fn default_true() -> bool {
    true
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size_bytes(),
            max_concurrency: default_max_concurrency(),
            max_attempts: default_max_attempts(),
            base_interval_ms: default_base_interval_ms(),
            multiplier: default_multiplier(),
            gzip: true,
            keep_alive: true,
            content_type: default_content_type(),
        }
    }
}

impl UploadConfig {
    /// 重试策略
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_interval_ms: self.base_interval_ms,
            multiplier: self.multiplier,
            max_attempts: self.max_attempts,
        }
    }

    /// 验证上传配置
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_bytes == 0 {
            anyhow::bail!("分片大小必须大于 0");
        }
        if self.max_concurrency == 0 {
            anyhow::bail!("最大并发数必须大于 0");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("最大尝试次数必须大于 0");
        }
        if !(1.0..=MAX_RETRY_MULTIPLIER).contains(&self.multiplier) {
            anyhow::bail!(
                "退避倍数必须在 1 到 {} 之间，当前值: {}",
                MAX_RETRY_MULTIPLIER,
                self.multiplier
            );
        }
        if reqwest::header::HeaderValue::from_str(&self.content_type).is_err() {
            anyhow::bail!("Content-Type 不合法: {:?}", self.content_type);
        }
        Ok(())
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传配置验证失败")?;

        Ok(config)
    }
}
