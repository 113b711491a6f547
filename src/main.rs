use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use release_asset_uploader::{
    config::{apply_env_overrides, AppConfig, DEFAULT_CONFIG_PATH},
    logging,
    uploader::{collect_files, HttpTransport, UploadEngine},
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 没有找到文件时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum IfNoFilesFound {
    /// 输出警告，正常退出
    Warn,
    /// 报错退出
    Error,
    /// 静默退出
    Ignore,
}

#[derive(Parser, Debug)]
#[command(name = "release-asset-uploader")]
#[command(version, about = "分片并发上传构建产物", long_about = None)]
struct Cli {
    #[arg(long, alias = "asset_name", help = "资产名称")]
    asset_name: String,

    #[arg(long, alias = "asset_path", help = "要上传的文件或文件夹")]
    path: PathBuf,

    #[arg(long, help = "根目录（默认：文件所在目录或文件夹本身）")]
    root: Option<PathBuf>,

    #[arg(long, alias = "asset_content_type", help = "分片请求的 Content-Type")]
    content_type: Option<String>,

    #[arg(long, alias = "upload_url", help = "服务根地址，覆盖配置文件和环境变量")]
    upload_url: Option<String>,

    #[arg(long, value_enum, default_value = "warn", help = "没有找到文件时的处理方式")]
    if_no_files_found: IfNoFilesFound,

    #[arg(short, long, value_name = "config file", default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // 先加载配置，日志配置也在其中
    let (mut config, load_error) = match AppConfig::load_from_file(&cli.config).await {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    match load_error {
        None => info!("配置文件加载成功: {}", cli.config),
        Some(e) => warn!("配置文件加载失败，使用默认配置: {:#}", e),
    }

    apply_env_overrides(&mut config);
    if let Some(url) = &cli.upload_url {
        config.endpoint.base_url = url.clone();
    }
    if let Some(content_type) = &cli.content_type {
        config.upload.content_type = content_type.clone();
    }

    match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("上传失败: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: AppConfig) -> Result<ExitCode> {
    info!("release-asset-uploader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    config.endpoint.validate().context("服务端配置不完整")?;
    config.upload.validate().context("上传配置不合法")?;

    let (default_root, files) = collect_files(&cli.path)?;
    let root = cli.root.clone().unwrap_or(default_root);

    if files.is_empty() {
        let message = format!("没有找到需要上传的文件: {:?}", cli.path);
        match cli.if_no_files_found {
            IfNoFilesFound::Error => anyhow::bail!(message),
            IfNoFilesFound::Warn => warn!("{}", message),
            IfNoFilesFound::Ignore => info!("{}", message),
        }
        return Ok(ExitCode::SUCCESS);
    }

    let token = config
        .endpoint
        .token
        .clone()
        .context("未配置访问令牌 (ASSET_UPLOAD_TOKEN)")?;
    let transport = HttpTransport::new(&config.endpoint, &config.upload, token)?;
    let engine = UploadEngine::new(Arc::new(transport), config.upload.clone());

    // Ctrl+C 触发取消
    let cancel_token = CancellationToken::new();
    {
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("收到 Ctrl+C，正在取消上传...");
                cancel_token.cancel();
            }
        });
    }

    let report = engine
        .upload_files(&cli.asset_name, &root, &files, cancel_token)
        .await?;

    let json = serde_json::to_string_pretty(&report).context("序列化上传报告失败")?;
    println!("{}", json);

    if report.is_success() {
        info!("上传成功: {}", cli.asset_name);
        Ok(ExitCode::SUCCESS)
    } else {
        error!(
            "上传未全部成功: 失败 {} 个文件, 已取消={}",
            report.failed_items.len(),
            report.cancelled
        );
        Ok(ExitCode::FAILURE)
    }
}
