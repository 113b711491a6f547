// 上传任务定义
//
// - UploadSpecification: 本地文件 -> 容器内路径
// - FileUploadState: 单个文件的共享上传状态（多个 worker 并发更新）
// - FileUploadOutcome / AggregateReport: 最终结果

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

/// 上传清单项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSpecification {
    /// 本地文件绝对路径
    pub absolute_path: PathBuf,
    /// 容器内路径
    pub upload_path: String,
}

impl UploadSpecification {
    pub fn new(absolute_path: impl Into<PathBuf>, upload_path: impl Into<String>) -> Self {
        Self {
            absolute_path: absolute_path.into(),
            upload_path: upload_path.into(),
        }
    }
}

/// 文件上传状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileUploadStatus {
    /// 等待中
    Pending,
    /// 上传中
    Uploading,
    /// 已完成
    Succeeded,
    /// 失败
    Failed,
}

impl FileUploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileUploadStatus::Succeeded | FileUploadStatus::Failed)
    }
}

#[derive(Debug)]
struct FileProgress {
    status: FileUploadStatus,
    bytes_uploaded: u64,
    completed_chunks: usize,
    error: Option<String>,
}

/// 单个文件的上传状态
///
/// 字节累加与"是否全部完成"的判断在同一把锁内完成，
/// 保证最后一个分片真正成功之前文件不会被标记为成功
#[derive(Debug)]
pub struct FileUploadState {
    pub spec: UploadSpecification,
    /// 文件总大小
    pub total_size: u64,
    /// 分片总数
    pub total_chunks: usize,
    progress: Mutex<FileProgress>,
    retries: AtomicU32,
}

impl FileUploadState {
    pub fn new(spec: UploadSpecification, total_size: u64, total_chunks: usize) -> Self {
        Self {
            spec,
            total_size,
            total_chunks,
            progress: Mutex::new(FileProgress {
                status: FileUploadStatus::Pending,
                bytes_uploaded: 0,
                completed_chunks: 0,
                error: None,
            }),
            retries: AtomicU32::new(0),
        }
    }

    /// 直接构造一个失败状态（例如读取文件信息失败，没有任何分片）
    pub fn failed(spec: UploadSpecification, error: String) -> Self {
        let state = Self::new(spec, 0, 0);
        state.mark_failed(error);
        state
    }

    pub fn upload_path(&self) -> &str {
        &self.spec.upload_path
    }

    pub fn status(&self) -> FileUploadStatus {
        self.progress.lock().status
    }

    pub fn is_failed(&self) -> bool {
        self.status() == FileUploadStatus::Failed
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.progress.lock().bytes_uploaded
    }

    pub fn completed_chunks(&self) -> usize {
        self.progress.lock().completed_chunks
    }

    /// 标记为上传中
    pub fn mark_uploading(&self) {
        let mut progress = self.progress.lock();
        if progress.status == FileUploadStatus::Pending {
            progress.status = FileUploadStatus::Uploading;
        }
    }

    /// 记录一个分片上传成功
    ///
    /// # 返回
    /// 该分片是否是文件的最后一个分片（文件因此变为成功）
    pub fn record_chunk_success(&self, bytes: u64) -> bool {
        let mut progress = self.progress.lock();
        progress.bytes_uploaded += bytes;
        progress.completed_chunks += 1;

        if progress.status.is_terminal() {
            return false;
        }

        if progress.completed_chunks >= self.total_chunks {
            progress.status = FileUploadStatus::Succeeded;
            true
        } else {
            progress.status = FileUploadStatus::Uploading;
            false
        }
    }

    /// 标记文件失败
    ///
    /// # 返回
    /// 是否为第一次标记失败（已经成功或失败的文件不会被改写）
    pub fn mark_failed(&self, error: String) -> bool {
        let mut progress = self.progress.lock();
        if progress.status.is_terminal() {
            return false;
        }
        progress.status = FileUploadStatus::Failed;
        progress.error = Some(error);
        true
    }

    /// 记录一次退避重试
    pub fn record_retry(&self) -> u32 {
        self.retries.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 生成最终结果，非终态的文件按失败处理
    pub fn to_outcome(&self) -> FileUploadOutcome {
        let progress = self.progress.lock();
        let succeeded = progress.status == FileUploadStatus::Succeeded;
        let error = match (&progress.error, progress.status) {
            (Some(e), _) => Some(e.clone()),
            (None, status) if !status.is_terminal() => Some("上传未完成".to_string()),
            _ => None,
        };

        FileUploadOutcome {
            upload_path: self.spec.upload_path.clone(),
            absolute_path: self.spec.absolute_path.clone(),
            succeeded,
            bytes_uploaded: progress.bytes_uploaded,
            total_size: self.total_size,
            retries: self.retries.load(Ordering::SeqCst),
            error,
        }
    }
}

/// 单个文件的上传结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileUploadOutcome {
    /// 容器内路径
    pub upload_path: String,
    /// 本地路径
    pub absolute_path: PathBuf,
    /// 是否成功
    pub succeeded: bool,
    /// 已上传字节数（原始大小）
    pub bytes_uploaded: u64,
    /// 文件大小
    pub total_size: u64,
    /// 退避重试次数
    pub retries: u32,
    /// 错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 汇总报告
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateReport {
    /// 资产名称
    pub asset_name: String,
    /// 成功文件的已上传字节数之和
    pub uploaded_bytes: u64,
    /// 所有文件的大小之和
    pub total_bytes: u64,
    /// 失败文件的容器内路径
    pub failed_items: Vec<String>,
    /// 每个文件的结果
    pub files: Vec<FileUploadOutcome>,
    /// 最终大小是否上报成功
    pub size_finalized: bool,
    /// 是否被取消
    pub cancelled: bool,
}

impl AggregateReport {
    /// 汇总所有文件结果
    pub fn from_outcomes(asset_name: &str, files: Vec<FileUploadOutcome>, cancelled: bool) -> Self {
        let uploaded_bytes = files
            .iter()
            .filter(|f| f.succeeded)
            .map(|f| f.bytes_uploaded)
            .sum();
        let total_bytes = files.iter().map(|f| f.total_size).sum();
        let failed_items = files
            .iter()
            .filter(|f| !f.succeeded)
            .map(|f| f.upload_path.clone())
            .collect();

        Self {
            asset_name: asset_name.to_string(),
            uploaded_bytes,
            total_bytes,
            failed_items,
            files,
            size_finalized: false,
            cancelled,
        }
    }

    /// 空报告（没有任何文件）
    pub fn empty(asset_name: &str) -> Self {
        Self::from_outcomes(asset_name, Vec::new(), false)
    }

    /// 是否所有文件都上传成功
    pub fn is_success(&self) -> bool {
        self.failed_items.is_empty() && !self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn spec(name: &str) -> UploadSpecification {
        UploadSpecification::new(format!("/tmp/{}", name), format!("asset/{}", name))
    }

    #[test]
    fn test_file_succeeds_after_last_chunk() {
        let state = FileUploadState::new(spec("a.bin"), 300, 3);
        assert_eq!(state.status(), FileUploadStatus::Pending);

        assert!(!state.record_chunk_success(100));
        assert_eq!(state.status(), FileUploadStatus::Uploading);
        assert!(!state.record_chunk_success(100));
        assert!(state.record_chunk_success(100));
        assert_eq!(state.status(), FileUploadStatus::Succeeded);
        assert_eq!(state.bytes_uploaded(), 300);

        let outcome = state.to_outcome();
        assert!(outcome.succeeded);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_failed_file_never_succeeds() {
        let state = FileUploadState::new(spec("b.bin"), 200, 2);
        assert!(!state.record_chunk_success(100));
        assert!(state.mark_failed("403".to_string()));
        assert!(!state.mark_failed("again".to_string()));

        // 失败后到达的分片不会把文件改为成功
        assert!(!state.record_chunk_success(100));
        let outcome = state.to_outcome();
        assert!(!outcome.succeeded);
        assert_eq!(outcome.error.as_deref(), Some("403"));
    }

    #[test]
    fn test_concurrent_completion_exactly_once() {
        let chunks = 64;
        let state = Arc::new(FileUploadState::new(spec("c.bin"), chunks as u64 * 10, chunks));

        let handles: Vec<_> = (0..chunks)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || state.record_chunk_success(10))
            })
            .collect();

        let completions = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|done| *done)
            .count();

        assert_eq!(completions, 1);
        assert_eq!(state.bytes_uploaded(), chunks as u64 * 10);
        assert_eq!(state.status(), FileUploadStatus::Succeeded);
    }

    #[test]
    fn test_unfinished_file_reported_as_failed() {
        let state = FileUploadState::new(spec("d.bin"), 100, 2);
        state.record_chunk_success(50);
        let outcome = state.to_outcome();
        assert!(!outcome.succeeded);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_report_counts_only_succeeded_bytes() {
        let ok = FileUploadState::new(spec("ok.bin"), 100, 1);
        ok.record_chunk_success(100);

        let partial = FileUploadState::new(spec("partial.bin"), 200, 2);
        partial.record_chunk_success(100);
        partial.mark_failed("fatal".to_string());

        let report = AggregateReport::from_outcomes(
            "asset",
            vec![ok.to_outcome(), partial.to_outcome()],
            false,
        );

        assert_eq!(report.uploaded_bytes, 100);
        assert_eq!(report.total_bytes, 300);
        assert_eq!(report.failed_items, vec!["asset/partial.bin".to_string()]);
        assert!(!report.is_success());
    }

    #[test]
    fn test_report_serialization() {
        let report = AggregateReport::empty("asset");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["uploadedBytes"], 0);
        assert_eq!(json["totalBytes"], 0);
        assert_eq!(json["failedItems"], serde_json::json!([]));
        assert!(report.is_success());
    }
}
