// 上传分片规划
//
// 分片规则：
// - 按固定分片大小把文件切成连续、不重叠的字节范围
// - 最后一个分片可以小于分片大小
// - 空文件也会产生一个零长度分片，保证每个文件至少有一次上传请求

use crate::error::{UploadError, UploadResult};
use anyhow::Context;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;
use tracing::debug;

/// 默认上传分片大小: 8MB
pub const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// 上传分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// 所属文件索引
    pub file_id: usize,
    /// 分片索引
    pub index: usize,
    /// 字节范围（左闭右开）
    pub range: Range<u64>,
    /// 文件总大小
    pub total_size: u64,
}

impl UploadChunk {
    pub fn new(file_id: usize, index: usize, range: Range<u64>, total_size: u64) -> Self {
        Self {
            file_id,
            index,
            range,
            total_size,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 起始字节
    pub fn start_byte(&self) -> u64 {
        self.range.start
    }

    /// 结束字节（闭区间），零长度分片没有结束字节
    pub fn end_byte(&self) -> Option<u64> {
        self.range.end.checked_sub(1).filter(|_| self.size() > 0)
    }

    /// Content-Range 请求头的值
    pub fn content_range(&self) -> String {
        match self.end_byte() {
            Some(end) => content_range(self.range.start, end, self.total_size),
            None => format!("bytes */{}", self.total_size),
        }
    }

    /// 读取分片数据
    ///
    /// 在阻塞线程池中执行，避免阻塞异步运行时
    pub async fn read_data(&self, file_path: &Path) -> UploadResult<Vec<u8>> {
        let file_path = file_path.to_path_buf();
        let start = self.range.start;
        let size = self.size() as usize;
        let index = self.index;

        let data = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
            let mut buffer = vec![0u8; size];
            if size == 0 {
                return Ok(buffer);
            }

            let mut file = std::fs::File::open(&file_path)
                .with_context(|| format!("无法打开文件: {:?}", file_path))?;
            file.seek(SeekFrom::Start(start)).context("文件定位失败")?;
            file.read_exact(&mut buffer).context("读取分片数据失败")?;
            Ok(buffer)
        })
        .await
        .map_err(|e| UploadError::Io(std::io::Error::other(e)))?
        .map_err(|e| UploadError::Io(std::io::Error::other(format!("{:#}", e))))?;

        debug!(
            "读取分片 #{}: bytes={}..{}, 大小={} bytes",
            index,
            self.range.start,
            self.range.end,
            data.len()
        );

        Ok(data)
    }
}

/// 格式化 Content-Range（start 和 end 都是闭区间）
///
/// 例如从 0 开始的 200 字节分片: `bytes 0-199/200`
pub fn content_range(start: u64, end: u64, total: u64) -> String {
    format!("bytes {}-{}/{}", start, end, total)
}

/// 计算文件的分片列表
///
/// # 参数
/// * `file_id` - 文件索引
/// * `total_size` - 文件总大小
/// * `chunk_size` - 分片大小（必须大于 0）
pub fn plan_chunks(file_id: usize, total_size: u64, chunk_size: u64) -> UploadResult<Vec<UploadChunk>> {
    if chunk_size == 0 {
        return Err(UploadError::InvalidArgument(
            "分片大小必须大于 0".to_string(),
        ));
    }

    if total_size == 0 {
        return Ok(vec![UploadChunk::new(file_id, 0, 0..0, 0)]);
    }

    let mut chunks = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
    let mut offset = 0u64;
    let mut index = 0;

    while offset < total_size {
        let end = std::cmp::min(offset.saturating_add(chunk_size), total_size);
        chunks.push(UploadChunk::new(file_id, index, offset..end, total_size));
        offset = end;
        index += 1;
    }

    Ok(chunks)
}
