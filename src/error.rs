// 上传错误类型
//
// - InvalidName: 名称/路径包含非法字符（任何网络请求之前失败）
// - ContainerCreation: 远程容器创建失败，整个上传中止
// - ChunkUpload: 单个分片失败，只影响所属文件
// - FinalizeSize: 最终大小上报失败，仅记录日志

use crate::uploader::Disposition;
use std::ops::Range;
use thiserror::Error;

/// 上传错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 名称或路径非法
    #[error("名称不合法: {name:?}, {reason}")]
    InvalidName { name: String, reason: String },

    /// 参数错误
    #[error("参数错误: {0}")]
    InvalidArgument(String),

    /// 上传清单构建失败（根目录不存在、文件不在根目录下等）
    #[error("上传清单构建失败: {0}")]
    Specification(String),

    /// 远程容器创建失败
    #[error("远程容器创建失败: {0}")]
    ContainerCreation(String),

    /// 分片上传失败
    #[error(
        "分片上传失败: path={upload_path}, bytes={}, disposition={disposition:?}, {detail}",
        byte_range(range)
    )]
    ChunkUpload {
        upload_path: String,
        range: Range<u64>,
        disposition: Disposition,
        detail: String,
    },

    /// 最终大小上报失败
    #[error("上报最终大小失败: {0}")]
    FinalizeSize(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;

/// 闭区间形式的字节范围，空范围为 `*`
fn byte_range(range: &Range<u64>) -> String {
    if range.is_empty() {
        "*".to_string()
    } else {
        format!("{}-{}", range.start, range.end - 1)
    }
}
