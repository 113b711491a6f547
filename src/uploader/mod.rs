// 上传引擎模块
//
// - 名称校验：任何网络请求之前拒绝非法名称和路径
// - 分片规划：把文件切成连续的字节范围
// - 错误分类与指数退避重试
// - 全局分片调度器：固定数量 worker，每个分片独立重试
// - 上传协调：创建容器 -> 上传分片 -> 上报大小 -> 汇总报告

pub mod chunk;
pub mod engine;
pub mod name;
pub mod retry;
pub mod scheduler;
pub mod specification;
pub mod task;
pub mod transport;

pub use chunk::{content_range, plan_chunks, UploadChunk, DEFAULT_UPLOAD_CHUNK_SIZE};
pub use engine::UploadEngine;
pub use name::{check_asset_name, check_upload_path};
pub use retry::{
    classify_status, retry_after_ms, send_with_retries, Disposition, RetryFailure, RetryPolicy,
    DEFAULT_BASE_INTERVAL_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_MULTIPLIER, MAX_BACKOFF_MS,
    MAX_RETRY_MULTIPLIER,
};
pub use scheduler::{ChunkJob, ChunkQueue, ChunkScheduler, ChunkState};
pub use specification::{build_upload_specifications, collect_files};
pub use task::{
    AggregateReport, FileUploadOutcome, FileUploadState, FileUploadStatus, UploadSpecification,
};
pub use transport::{
    encode_body, upload_headers, ChunkPayload, ContainerResponse, EncodedBody, HttpTransport,
    Transport, TransportResponse,
};

/// 默认并发上限
pub const MAX_DEFAULT_CONCURRENCY: usize = 8;

/// 默认最大并发分片数：CPU 核数，最多 8 个
pub fn default_max_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DEFAULT_CONCURRENCY)
}
