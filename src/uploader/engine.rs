// 上传引擎
//
// 上传流程：
// 1. 校验资产名称和所有容器内路径（任何网络请求之前）
// 2. 创建远程容器（失败则整个上传中止，不会调度任何分片）
// 3. 为每个文件规划分片并放入全局队列
// 4. 运行 worker 池，直到所有分片到达终态
// 5. 上报最终大小（失败只记录日志）
// 6. 汇总每个文件的结果
//
// 取消：worker 完成当前请求后退出，返回部分结果，不再上报大小

use crate::config::UploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::uploader::{
    build_upload_specifications, check_asset_name, check_upload_path, plan_chunks,
    send_with_retries, AggregateReport, ChunkJob, ChunkQueue, ChunkScheduler, FileUploadState,
    Transport, UploadSpecification,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 上传引擎
///
/// 负责协调一个资产的完整上传过程：
/// - 创建容器
/// - 分片并发上传
/// - 上报最终大小
/// - 生成汇总报告
pub struct UploadEngine {
    /// 传输层
    transport: Arc<dyn Transport>,
    /// 上传配置
    config: UploadConfig,
}

impl UploadEngine {
    pub fn new(transport: Arc<dyn Transport>, config: UploadConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// 上传本地文件列表
    ///
    /// # 参数
    /// * `asset_name` - 资产名称
    /// * `root_dir` - 根目录，容器内路径相对于它计算
    /// * `files` - 本地文件列表
    /// * `cancel_token` - 取消令牌
    pub async fn upload_files(
        &self,
        asset_name: &str,
        root_dir: &Path,
        files: &[PathBuf],
        cancel_token: CancellationToken,
    ) -> UploadResult<AggregateReport> {
        check_asset_name(asset_name)?;
        let specifications = build_upload_specifications(asset_name, root_dir, files)?;
        self.upload(asset_name, specifications, cancel_token).await
    }

    /// 执行上传
    ///
    /// # 返回
    /// - 配置不合法：`UploadError::InvalidArgument`
    /// - 容器创建失败：`UploadError::ContainerCreation`
    /// - 创建容器前后被取消：`cancelled = true` 的报告，所有文件列在 `failed_items` 中
    /// - 其他情况：汇总报告，失败的文件列在 `failed_items` 中
    pub async fn upload(
        &self,
        asset_name: &str,
        specifications: Vec<UploadSpecification>,
        cancel_token: CancellationToken,
    ) -> UploadResult<AggregateReport> {
        // 1. 配置和名称校验
        self.config
            .validate()
            .map_err(|e| UploadError::InvalidArgument(format!("{:#}", e)))?;
        check_asset_name(asset_name)?;
        for spec in &specifications {
            check_upload_path(&spec.upload_path)?;
        }

        if specifications.is_empty() {
            warn!("没有需要上传的文件: {}", asset_name);
            return Ok(AggregateReport::empty(asset_name));
        }

        info!(
            "开始上传资产: name={}, 文件数={}, 分片大小={}, 并发数={}",
            asset_name,
            specifications.len(),
            self.config.chunk_size_bytes,
            self.config.max_concurrency
        );

        // 2. 创建容器
        let Some(resource_url) = self.create_container(asset_name, &cancel_token).await? else {
            warn!("创建容器期间上传已取消: {}", asset_name);
            let outcomes = specifications
                .into_iter()
                .map(|spec| FileUploadState::failed(spec, "上传已取消".to_string()).to_outcome())
                .collect();
            return Ok(AggregateReport::from_outcomes(asset_name, outcomes, true));
        };
        info!("远程容器已创建: {}", resource_url);

        // 3. 规划分片
        let queue = Arc::new(ChunkQueue::new());
        let mut files = Vec::with_capacity(specifications.len());

        for (file_id, spec) in specifications.into_iter().enumerate() {
            let total_size = match tokio::fs::metadata(&spec.absolute_path).await {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    error!("读取文件信息失败: {:?}, {}", spec.absolute_path, e);
                    files.push(Arc::new(FileUploadState::failed(
                        spec,
                        UploadError::Io(e).to_string(),
                    )));
                    continue;
                }
            };

            let chunks = plan_chunks(file_id, total_size, self.config.chunk_size_bytes)?;
            info!(
                "文件分片规划: {} ({} bytes, {} 个分片)",
                spec.upload_path,
                total_size,
                chunks.len()
            );

            files.push(Arc::new(FileUploadState::new(spec, total_size, chunks.len())));
            for chunk in chunks {
                queue.enqueue(ChunkJob::new(chunk));
            }
        }

        // 4. 运行 worker 池
        let files = Arc::new(files);
        let scheduler = ChunkScheduler::new(
            self.transport.clone(),
            self.config.retry_policy(),
            self.config.max_concurrency,
        );
        scheduler
            .run(&resource_url, files.clone(), queue, cancel_token.clone())
            .await;

        let cancelled = cancel_token.is_cancelled();
        if cancelled {
            for file in files.iter() {
                file.mark_failed("上传已取消".to_string());
            }
        }

        let outcomes = files.iter().map(|f| f.to_outcome()).collect();
        let mut report = AggregateReport::from_outcomes(asset_name, outcomes, cancelled);

        // 5. 上报最终大小
        if cancelled {
            warn!("上传已取消，跳过上报最终大小");
        } else {
            report.size_finalized = self
                .finalize_size(asset_name, report.uploaded_bytes, &cancel_token)
                .await;
        }

        if report.failed_items.is_empty() {
            info!(
                "资产上传完成: name={}, {} 个文件, {}/{} bytes",
                asset_name,
                report.files.len(),
                report.uploaded_bytes,
                report.total_bytes
            );
        } else {
            warn!(
                "资产上传结束，{} 个文件失败: name={}, 失败列表={:?}",
                report.failed_items.len(),
                asset_name,
                report.failed_items
            );
        }

        Ok(report)
    }

    /// 创建远程容器（可重试错误按重试策略处理）
    ///
    /// # 返回
    /// 资源 URL；创建完成前被取消时返回 `None`
    async fn create_container(
        &self,
        asset_name: &str,
        cancel_token: &CancellationToken,
    ) -> UploadResult<Option<String>> {
        let transport = self.transport.clone();
        let name = asset_name.to_string();
        let policy = self.config.retry_policy();

        let result = send_with_retries(&policy, "创建容器", cancel_token, move || {
            let transport = transport.clone();
            let name = name.clone();
            async move {
                let container = transport.create_container(&name).await;
                (container.response, container.resource_url)
            }
        })
        .await;

        match result {
            Ok((_, Some(url))) if !url.is_empty() => Ok(Some(url)),
            Err(failure) if failure.response.is_none() && cancel_token.is_cancelled() => Ok(None),
            Ok((response, _)) => {
                let err = UploadError::ContainerCreation(format!(
                    "响应中没有资源 URL ({})",
                    response.describe()
                ));
                error!("{}", err);
                Err(err)
            }
            Err(failure) => {
                let err = UploadError::ContainerCreation(failure.describe());
                error!("{}", err);
                Err(err)
            }
        }
    }

    /// 上报最终大小
    ///
    /// # 返回
    /// 是否上报成功
    async fn finalize_size(
        &self,
        asset_name: &str,
        size: u64,
        cancel_token: &CancellationToken,
    ) -> bool {
        let transport = self.transport.clone();
        let name = asset_name.to_string();
        let policy = self.config.retry_policy();

        let result = send_with_retries(&policy, "上报大小", cancel_token, move || {
            let transport = transport.clone();
            let name = name.clone();
            async move { (transport.finalize_size(&name, size).await, ()) }
        })
        .await;

        match result {
            Ok(_) => {
                info!("最终大小已上报: name={}, size={}", asset_name, size);
                true
            }
            Err(failure) => {
                warn!("{}", UploadError::FinalizeSize(failure.describe()));
                false
            }
        }
    }
}
