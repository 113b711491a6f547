//! 日志系统配置
//!
//! 控制台输出（stderr，stdout 留给上传报告）和可选的文件持久化。
//! 每次启动写入一个新文件，启动时自动清理过期日志

use crate::config::LogConfig;
use chrono::Local;
use std::fs;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "release-asset-uploader.";

/// 日志文件名后缀
const LOG_FILE_SUFFIX: &str = ".log";

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 生成本次启动的日志文件名
///
/// 格式: release-asset-uploader.YYYY-MM-DD-HHMMSS.log
fn log_file_name() -> String {
    format!(
        "{}{}{}",
        LOG_FILE_PREFIX,
        Local::now().format("%Y-%m-%d-%H%M%S"),
        LOG_FILE_SUFFIX
    )
}

/// 初始化日志系统
///
/// # Arguments
/// * `config` - 日志配置
///
/// # Returns
/// * `LogGuard` - 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(true)
        .with_writer(std::io::stderr);

    if !config.enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        return LogGuard { _file_guard: None };
    }

    if let Err(e) = fs::create_dir_all(&config.log_dir) {
        eprintln!("创建日志目录失败: {:?}, 错误: {}", config.log_dir, e);
        // 回退到只使用控制台输出
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        return LogGuard { _file_guard: None };
    }

    let file_appender = tracing_appender::rolling::never(&config.log_dir, log_file_name());
    let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);

    // 文件输出层（不带 ANSI 颜色）
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}",
        config.log_dir, config.retention_days, config.level
    );

    let deleted = cleanup_old_logs(&config.log_dir, config.retention_days);
    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 清理过期日志文件
///
/// 优先使用文件名中的日期判断，无法解析时使用修改时间
///
/// # Returns
/// 删除的文件数
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let now = Local::now().date_naive();
    let retention_duration = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted_count = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };

        if !filename.starts_with(LOG_FILE_PREFIX) || !filename.ends_with(LOG_FILE_SUFFIX) {
            continue;
        }

        let file_date = extract_date_from_filename(filename)
            .and_then(|date| chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d").ok());

        let should_delete = match file_date {
            Some(date) => now.signed_duration_since(date) > retention_duration,
            None => check_by_modified_time(&entry, retention_days),
        };

        if should_delete {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e);
            } else {
                deleted_count += 1;
                tracing::debug!("已删除过期日志文件: {:?}", path);
            }
        }
    }

    deleted_count
}

/// 从文件名中提取日期部分
///
/// release-asset-uploader.YYYY-MM-DD-HHMMSS.log -> YYYY-MM-DD
fn extract_date_from_filename(filename: &str) -> Option<String> {
    let name = filename.strip_prefix(LOG_FILE_PREFIX)?;
    let name = name.strip_suffix(LOG_FILE_SUFFIX)?;

    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() >= 3 {
        Some(format!("{}-{}-{}", parts[0], parts[1], parts[2]))
    } else {
        None
    }
}

/// 根据文件修改时间检查是否过期（后备方案）
fn check_by_modified_time(entry: &fs::DirEntry, retention_days: u32) -> bool {
    let now = chrono::Utc::now();
    let retention_duration = chrono::Duration::days(retention_days as i64);

    if let Ok(metadata) = entry.metadata() {
        if let Ok(modified) = metadata.modified() {
            let modified_datetime: chrono::DateTime<chrono::Utc> = modified.into();
            return now.signed_duration_since(modified_datetime) > retention_duration;
        }
    }

    false
}
