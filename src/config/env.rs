//! 环境变量覆盖
//!
//! 令牌、服务地址等由外部运行环境提供，数值型变量无法解析或为负数时忽略

use super::AppConfig;
use crate::uploader::MAX_RETRY_MULTIPLIER;
use tracing::{debug, warn};

pub const ENV_TOKEN: &str = "ASSET_UPLOAD_TOKEN";
pub const ENV_BASE_URL: &str = "ASSET_UPLOAD_URL";
pub const ENV_RUN_ID: &str = "ASSET_UPLOAD_RUN_ID";
pub const ENV_RETRY_MULTIPLIER: &str = "ASSET_UPLOAD_RETRY_MULTIPLIER";
pub const ENV_INITIAL_RETRY_INTERVAL_MS: &str = "ASSET_UPLOAD_INITIAL_RETRY_INTERVAL_MS";

/// 解析非负数值
pub fn parse_env_number(value: Option<&str>) -> Option<f64> {
    let value = value?.trim().parse::<f64>().ok()?;
    if value.is_finite() && value >= 0.0 {
        Some(value)
    } else {
        None
    }
}

/// 使用进程环境变量覆盖配置
pub fn apply_env_overrides(config: &mut AppConfig) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// 使用给定的变量来源覆盖配置
pub fn apply_overrides_from<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(token) = lookup(ENV_TOKEN).filter(|v| !v.is_empty()) {
        debug!("使用环境变量 {} 中的令牌", ENV_TOKEN);
        config.endpoint.token = Some(token);
    }

    if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
        config.endpoint.base_url = url;
    }

    if let Some(run_id) = lookup(ENV_RUN_ID).filter(|v| !v.is_empty()) {
        config.endpoint.run_id = run_id;
    }

    if let Some(raw) = lookup(ENV_RETRY_MULTIPLIER) {
        match parse_env_number(Some(&raw)) {
            Some(multiplier) if (1.0..=MAX_RETRY_MULTIPLIER).contains(&multiplier) => {
                config.upload.multiplier = multiplier
            }
            _ => warn!("忽略无效的 {}: {:?}", ENV_RETRY_MULTIPLIER, raw),
        }
    }

    if let Some(raw) = lookup(ENV_INITIAL_RETRY_INTERVAL_MS) {
        match parse_env_number(Some(&raw)) {
            Some(interval) => config.upload.base_interval_ms = interval as u64,
            None => warn!("忽略无效的 {}: {:?}", ENV_INITIAL_RETRY_INTERVAL_MS, raw),
        }
    }
}
