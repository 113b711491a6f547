// 上传分片调度器
//
// 功能：
// - 固定数量的 worker 共享一个分片队列
// - 每个分片独立走一遍状态机：Pending -> InFlight -> {Succeeded | Retrying -> InFlight | Failed}
// - 可重试错误：退避等待后重新放回队列，直到达到最大尝试次数
// - 不可重试错误：立即标记文件失败，该文件剩余分片直接丢弃
// - 一个文件失败不影响其他文件的分片
// - 取消：worker 完成当前请求后不再领取新分片

use crate::error::UploadError;
use crate::uploader::{
    classify_status, ChunkPayload, Disposition, FileUploadState, RetryPolicy, Transport,
    UploadChunk,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// 在队列中等待
    Pending,
    /// 正在上传
    InFlight,
    /// 等待退避后重试
    Retrying,
    /// 上传成功（终态）
    Succeeded,
    /// 上传失败（终态）
    Failed,
}

/// 队列中的分片任务（携带该分片的重试状态）
#[derive(Debug, Clone)]
pub struct ChunkJob {
    pub chunk: UploadChunk,
    pub state: ChunkState,
    /// 已失败的尝试次数
    pub attempt_count: u32,
    /// 最近一次错误
    pub last_error: Option<String>,
}

impl ChunkJob {
    pub fn new(chunk: UploadChunk) -> Self {
        Self {
            chunk,
            state: ChunkState::Pending,
            attempt_count: 0,
            last_error: None,
        }
    }
}

/// 分片队列
///
/// `outstanding` 统计尚未到达终态的分片数（包括队列中、上传中、退避中的分片），
/// 队列为空且 `outstanding` 为 0 时所有 worker 退出
#[derive(Debug, Default)]
pub struct ChunkQueue {
    jobs: Mutex<VecDeque<ChunkJob>>,
    outstanding: AtomicUsize,
    notify: Notify,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 放入一个新分片
    pub fn enqueue(&self, job: ChunkJob) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().push_back(job);
        self.notify.notify_one();
    }

    /// 重新放入重试分片（不改变未完成计数）
    pub fn requeue(&self, mut job: ChunkJob) {
        job.state = ChunkState::Pending;
        self.jobs.lock().push_back(job);
        self.notify.notify_one();
    }

    /// 某个分片到达终态
    pub fn finish(&self) {
        let previous = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            self.notify.notify_waiters();
        }
    }

    /// 未完成的分片数
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// 队列中等待的分片数
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 领取下一个分片
    ///
    /// 队列为空但仍有分片在上传/退避时等待；全部完成或被取消时返回 `None`
    pub async fn next(&self, cancel_token: &CancellationToken) -> Option<ChunkJob> {
        loop {
            if cancel_token.is_cancelled() {
                return None;
            }

            // 先注册通知再检查队列，避免错过唤醒
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(mut job) = self.jobs.lock().pop_front() {
                job.state = ChunkState::InFlight;
                return Some(job);
            }

            if self.outstanding() == 0 {
                return None;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel_token.cancelled() => return None,
            }
        }
    }
}

/// worker 共享的上下文
struct WorkerContext {
    transport: Arc<dyn Transport>,
    resource_url: String,
    files: Arc<Vec<Arc<FileUploadState>>>,
    queue: Arc<ChunkQueue>,
    policy: RetryPolicy,
    cancel_token: CancellationToken,
}

/// 全局上传分片调度器
///
/// 负责把所有文件的分片分发给固定数量的 worker
pub struct ChunkScheduler {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    max_concurrency: usize,
}

impl ChunkScheduler {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy, max_concurrency: usize) -> Self {
        Self {
            transport,
            policy,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// 运行 worker 池直到队列清空且所有分片到达终态（或被取消）
    ///
    /// # 参数
    /// * `resource_url` - 容器资源 URL
    /// * `files` - 所有文件的共享状态（按 file_id 索引）
    /// * `queue` - 已填充的分片队列
    /// * `cancel_token` - 取消令牌
    pub async fn run(
        &self,
        resource_url: &str,
        files: Arc<Vec<Arc<FileUploadState>>>,
        queue: Arc<ChunkQueue>,
        cancel_token: CancellationToken,
    ) {
        let workers = self.max_concurrency.min(queue.outstanding().max(1));
        info!(
            "[调度器] 开始上传 {} 个分片, worker 数: {}",
            queue.outstanding(),
            workers
        );

        let context = Arc::new(WorkerContext {
            transport: self.transport.clone(),
            resource_url: resource_url.to_string(),
            files,
            queue,
            policy: self.policy.clone(),
            cancel_token,
        });

        let mut join_set = JoinSet::new();
        for worker_id in 1..=workers {
            let context = context.clone();
            join_set.spawn(async move { run_worker(worker_id, context).await });
        }

        while let Some(result) = join_set.join_next().await {
            if let Err(e) = result {
                error!("[调度器] worker 异常退出: {}", e);
            }
        }

        if context.cancel_token.is_cancelled() {
            warn!(
                "[调度器] 上传已取消, 剩余 {} 个分片未完成",
                context.queue.outstanding()
            );
        } else {
            info!("[调度器] 所有分片处理完成");
        }
    }
}

async fn run_worker(worker_id: usize, ctx: Arc<WorkerContext>) {
    debug!("[worker#{}] 启动", worker_id);

    while let Some(job) = ctx.queue.next(&ctx.cancel_token).await {
        let file_id = job.chunk.file_id;
        let index = job.chunk.index;

        // 分片在独立任务中处理，任务异常时该分片仍然计入终态
        let task_ctx = ctx.clone();
        let handle =
            tokio::spawn(async move { process_chunk(worker_id, &task_ctx, job).await });

        if let Err(e) = handle.await {
            error!("[worker#{}] 分片 #{} 处理异常: {}", worker_id, index, e);
            if let Some(file) = ctx.files.get(file_id) {
                file.mark_failed(format!("分片 #{} 处理异常: {}", index, e));
            }
            ctx.queue.finish();
        }
    }

    debug!("[worker#{}] 退出", worker_id);
}

/// 处理单个分片：上传一次并根据分类结果决定终态或重试
async fn process_chunk(worker_id: usize, ctx: &WorkerContext, mut job: ChunkJob) {
    let Some(file) = ctx.files.get(job.chunk.file_id).cloned() else {
        error!("[worker#{}] 分片指向不存在的文件: {}", worker_id, job.chunk.file_id);
        ctx.queue.finish();
        return;
    };

    // 文件已失败，剩余分片直接丢弃
    if file.is_failed() {
        debug!(
            "[worker#{}] 丢弃分片 #{} ({} 已失败)",
            worker_id,
            job.chunk.index,
            file.upload_path()
        );
        ctx.queue.finish();
        return;
    }

    file.mark_uploading();

    let data = match job.chunk.read_data(&file.spec.absolute_path).await {
        Ok(data) => data,
        Err(e) => {
            error!(
                "[worker#{}] 读取分片失败: path={}, 分片#{}, {}",
                worker_id,
                file.upload_path(),
                job.chunk.index,
                e
            );
            file.mark_failed(format!("读取文件失败: {}", e));
            ctx.queue.finish();
            return;
        }
    };

    let response = ctx
        .transport
        .upload_chunk(
            &ctx.resource_url,
            ChunkPayload {
                upload_path: file.spec.upload_path.clone(),
                chunk: job.chunk.clone(),
                data,
            },
        )
        .await;

    let disposition = classify_status(response.status);
    match disposition {
        Disposition::Success => {
            job.state = ChunkState::Succeeded;
            let completed = file.record_chunk_success(job.chunk.size());
            debug!(
                "[worker#{}] 分片 #{} ✓ {} ({}/{})",
                worker_id,
                job.chunk.index,
                file.upload_path(),
                file.completed_chunks(),
                file.total_chunks
            );
            if completed {
                info!(
                    "文件上传完成: {} ({} bytes)",
                    file.upload_path(),
                    file.bytes_uploaded()
                );
            }
            ctx.queue.finish();
        }
        Disposition::Fatal => {
            job.state = ChunkState::Failed;
            error!(
                "[worker#{}] 分片 #{} 上传失败（不可重试）: {}, {}",
                worker_id,
                job.chunk.index,
                file.upload_path(),
                response.describe()
            );
            file.mark_failed(chunk_error(&file, &job, disposition, response.describe()));
            ctx.queue.finish();
        }
        Disposition::Throttled | Disposition::Retryable => {
            job.attempt_count += 1;
            job.last_error = Some(response.describe());

            if ctx.policy.is_exhausted(job.attempt_count) {
                job.state = ChunkState::Failed;
                error!(
                    "[worker#{}] 分片 #{} 上传失败，已达最大尝试次数 ({}): {}, {}",
                    worker_id,
                    job.chunk.index,
                    ctx.policy.max_attempts,
                    file.upload_path(),
                    response.describe()
                );
                file.mark_failed(chunk_error(
                    &file,
                    &job,
                    disposition,
                    format!("{} 次尝试后仍失败: {}", job.attempt_count, response.describe()),
                ));
                ctx.queue.finish();
                return;
            }

            job.state = ChunkState::Retrying;
            let delay = ctx.policy.delay_for(
                disposition,
                job.attempt_count,
                response.retry_after.as_deref(),
            );
            file.record_retry();
            warn!(
                "[worker#{}] 分片 #{} 上传失败，等待 {}ms 后重试 ({}/{}): {}, {}",
                worker_id,
                job.chunk.index,
                delay.as_millis(),
                job.attempt_count,
                ctx.policy.max_attempts,
                file.upload_path(),
                response.describe()
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => ctx.queue.requeue(job),
                _ = ctx.cancel_token.cancelled() => {
                    debug!("[worker#{}] 退避期间被取消, 放弃分片 #{}", worker_id, job.chunk.index);
                    ctx.queue.finish();
                }
            }
        }
    }
}

fn chunk_error(
    file: &FileUploadState,
    job: &ChunkJob,
    disposition: Disposition,
    detail: String,
) -> String {
    UploadError::ChunkUpload {
        upload_path: file.upload_path().to_string(),
        range: job.chunk.range.clone(),
        disposition,
        detail,
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::{plan_chunks, ContainerResponse, TransportResponse, UploadSpecification};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    /// 按 (路径, 起始字节) 返回预设状态码的传输层
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<HashMap<(String, u64), VecDeque<u16>>>,
        calls: Mutex<Vec<(String, u64)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedTransport {
        fn script(&self, path: &str, start: u64, statuses: &[u16]) {
            self.scripts
                .lock()
                .insert((path.to_string(), start), statuses.iter().copied().collect());
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn create_container(&self, _asset_name: &str) -> ContainerResponse {
            ContainerResponse::default()
        }

        async fn upload_chunk(&self, _resource_url: &str, payload: ChunkPayload) -> TransportResponse {
            let key = (payload.upload_path.clone(), payload.chunk.range.start);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.calls.lock().push(key.clone());
            let status = self
                .scripts
                .lock()
                .get_mut(&key)
                .and_then(|q| q.pop_front())
                .unwrap_or(201);
            TransportResponse::status(status)
        }

        async fn finalize_size(&self, _asset_name: &str, _size: u64) -> TransportResponse {
            TransportResponse::status(200)
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_interval_ms: 1,
            multiplier: 1.5,
            max_attempts,
        }
    }

    fn temp_file(size: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![7u8; size]).unwrap();
        file.flush().unwrap();
        file
    }

    fn prepare(
        files: &[(&NamedTempFile, &str, u64)],
        chunk_size: u64,
    ) -> (Arc<Vec<Arc<FileUploadState>>>, Arc<ChunkQueue>) {
        let queue = Arc::new(ChunkQueue::new());
        let mut states = Vec::new();
        for (file_id, (file, upload_path, size)) in files.iter().enumerate() {
            let chunks = plan_chunks(file_id, *size, chunk_size).unwrap();
            states.push(Arc::new(FileUploadState::new(
                UploadSpecification::new(file.path(), *upload_path),
                *size,
                chunks.len(),
            )));
            for chunk in chunks {
                queue.enqueue(ChunkJob::new(chunk));
            }
        }
        (Arc::new(states), queue)
    }

    #[tokio::test]
    async fn test_queue_drains_and_exits() {
        let queue = ChunkQueue::new();
        let token = CancellationToken::new();
        queue.enqueue(ChunkJob::new(UploadChunk::new(0, 0, 0..1, 1)));
        assert_eq!(queue.outstanding(), 1);

        let job = queue.next(&token).await.unwrap();
        assert_eq!(job.state, ChunkState::InFlight);
        assert!(queue.is_empty());

        queue.finish();
        assert!(queue.next(&token).await.is_none());
    }

    #[tokio::test]
    async fn test_queue_waits_for_requeue() {
        let queue = Arc::new(ChunkQueue::new());
        let token = CancellationToken::new();
        queue.enqueue(ChunkJob::new(UploadChunk::new(0, 0, 0..1, 1)));
        let job = queue.next(&token).await.unwrap();

        // 另一个 worker 在队列为空时等待，直到分片被重新放回
        let waiter = {
            let queue = queue.clone();
            let token = token.clone();
            tokio::spawn(async move { queue.next(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.requeue(job);

        let job = waiter.await.unwrap().unwrap();
        assert_eq!(job.chunk.index, 0);
        queue.finish();
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_queue_cancelled() {
        let queue = ChunkQueue::new();
        let token = CancellationToken::new();
        queue.enqueue(ChunkJob::new(UploadChunk::new(0, 0, 0..1, 1)));
        token.cancel();
        assert!(queue.next(&token).await.is_none());
    }

    #[tokio::test]
    async fn test_concurrency_bounded() {
        let file = temp_file(64);
        let (files, queue) = prepare(&[(&file, "asset/a.bin", 64)], 4);
        let transport = Arc::new(ScriptedTransport::default());

        let scheduler = ChunkScheduler::new(transport.clone(), fast_policy(5), 3);
        scheduler
            .run("http://container", files.clone(), queue.clone(), CancellationToken::new())
            .await;

        assert_eq!(transport.calls.lock().len(), 16);
        assert!(transport.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert!(files[0].to_outcome().succeeded);
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let file = temp_file(10);
        let (files, queue) = prepare(&[(&file, "asset/a.bin", 10)], 4);
        let transport = Arc::new(ScriptedTransport::default());
        transport.script("asset/a.bin", 4, &[503, 429, 200]);

        let scheduler = ChunkScheduler::new(transport.clone(), fast_policy(5), 2);
        scheduler
            .run("http://container", files.clone(), queue, CancellationToken::new())
            .await;

        let outcome = files[0].to_outcome();
        assert!(outcome.succeeded);
        assert_eq!(outcome.retries, 2);
        assert_eq!(outcome.bytes_uploaded, 10);
        assert_eq!(transport.calls.lock().len(), 5);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let file = temp_file(4);
        let (files, queue) = prepare(&[(&file, "asset/a.bin", 4)], 4);
        let transport = Arc::new(ScriptedTransport::default());
        transport.script("asset/a.bin", 0, &[502, 502, 502, 502]);

        let scheduler = ChunkScheduler::new(transport.clone(), fast_policy(3), 2);
        scheduler
            .run("http://container", files.clone(), queue, CancellationToken::new())
            .await;

        let outcome = files[0].to_outcome();
        assert!(!outcome.succeeded);
        // 3 次尝试，2 次退避
        assert_eq!(transport.calls.lock().len(), 3);
        assert_eq!(outcome.retries, 2);
    }

    #[tokio::test]
    async fn test_fatal_abandons_file_but_not_others() {
        let bad = temp_file(40);
        let good = temp_file(40);
        let (files, queue) = prepare(
            &[(&bad, "asset/bad.bin", 40), (&good, "asset/good.bin", 40)],
            4,
        );
        let transport = Arc::new(ScriptedTransport::default());
        transport.script("asset/bad.bin", 0, &[403]);

        // 单 worker，保证坏文件的第一个分片最先处理
        let scheduler = ChunkScheduler::new(transport.clone(), fast_policy(5), 1);
        scheduler
            .run("http://container", files.clone(), queue.clone(), CancellationToken::new())
            .await;

        let bad_outcome = files[0].to_outcome();
        let good_outcome = files[1].to_outcome();
        assert!(!bad_outcome.succeeded);
        assert_eq!(bad_outcome.retries, 0);
        assert!(good_outcome.succeeded);
        assert_eq!(good_outcome.bytes_uploaded, 40);

        let calls = transport.calls.lock();
        let bad_calls = calls.iter().filter(|(p, _)| p == "asset/bad.bin").count();
        assert_eq!(bad_calls, 1);
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_workers() {
        let file = temp_file(4);
        let (files, queue) = prepare(&[(&file, "asset/a.bin", 4)], 4);
        let transport = Arc::new(ScriptedTransport::default());
        transport.script("asset/a.bin", 0, &[503, 503, 503, 503]);

        let policy = RetryPolicy {
            base_interval_ms: 60_000,
            multiplier: 1.5,
            max_attempts: 5,
        };
        let token = CancellationToken::new();
        let scheduler = ChunkScheduler::new(transport.clone(), policy, 1);

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.run("http://container", files.clone(), queue, token),
        )
        .await
        .expect("取消后调度器应该尽快退出");

        assert!(!files[0].to_outcome().succeeded);
        assert_eq!(transport.calls.lock().len(), 1);
    }

    /// 上传第一个分片时 panic 的传输层
    struct PanicOnFirstChunk {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for PanicOnFirstChunk {
        async fn create_container(&self, _asset_name: &str) -> ContainerResponse {
            ContainerResponse::default()
        }

        async fn upload_chunk(&self, _resource_url: &str, payload: ChunkPayload) -> TransportResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if payload.upload_path == "asset/broken.bin" && payload.chunk.index == 0 {
                panic!("连接池状态异常");
            }
            TransportResponse::status(201)
        }

        async fn finalize_size(&self, _asset_name: &str, _size: u64) -> TransportResponse {
            TransportResponse::status(200)
        }
    }

    #[tokio::test]
    async fn test_worker_panic_fails_file_and_pool_completes() {
        let broken = temp_file(8);
        let healthy = temp_file(8);
        let (files, queue) = prepare(
            &[(&broken, "asset/broken.bin", 8), (&healthy, "asset/healthy.bin", 8)],
            4,
        );
        let transport = Arc::new(PanicOnFirstChunk {
            calls: AtomicUsize::new(0),
        });

        let scheduler = ChunkScheduler::new(transport.clone(), fast_policy(5), 2);
        tokio::time::timeout(
            Duration::from_secs(3),
            scheduler.run("http://container", files.clone(), queue.clone(), CancellationToken::new()),
        )
        .await
        .expect("分片处理异常后调度器仍应结束");

        assert_eq!(queue.outstanding(), 0);
        let broken_outcome = files[0].to_outcome();
        assert!(!broken_outcome.succeeded);
        assert!(broken_outcome.error.unwrap().contains("处理异常"));
        assert!(files[1].to_outcome().succeeded);
    }
}
