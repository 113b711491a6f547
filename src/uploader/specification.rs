//! 上传清单构建
//!
//! 负责:
//! - 把本地文件列表按根目录映射为容器内路径（`资产名/相对路径`）
//! - 遍历本地文件或文件夹，得到待上传文件列表

use crate::error::{UploadError, UploadResult};
use crate::uploader::name::check_upload_path;
use crate::uploader::UploadSpecification;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// 构建上传清单
///
/// # 参数
/// - `asset_name`: 资产名称，作为容器内路径的第一级
/// - `root_dir`: 根目录，所有文件都必须位于其下
/// - `files`: 本地文件列表（目录会被跳过）
pub fn build_upload_specifications(
    asset_name: &str,
    root_dir: &Path,
    files: &[PathBuf],
) -> UploadResult<Vec<UploadSpecification>> {
    let root = std::fs::canonicalize(root_dir).map_err(|e| {
        UploadError::Specification(format!("根目录不存在: {}: {}", root_dir.display(), e))
    })?;
    if !root.is_dir() {
        return Err(UploadError::Specification(format!(
            "根目录不是文件夹: {}",
            root_dir.display()
        )));
    }

    let mut specifications = Vec::with_capacity(files.len());

    for file in files {
        let absolute = std::fs::canonicalize(file).map_err(|e| {
            UploadError::Specification(format!("文件不存在: {}: {}", file.display(), e))
        })?;

        if absolute.is_dir() {
            debug!("跳过目录: {}", absolute.display());
            continue;
        }

        let relative = absolute.strip_prefix(&root).map_err(|_| {
            UploadError::Specification(format!(
                "文件 {} 不在根目录 {} 下",
                absolute.display(),
                root.display()
            ))
        })?;

        let upload_path = to_upload_path(asset_name, relative);
        check_upload_path(&upload_path)?;

        specifications.push(UploadSpecification::new(absolute, upload_path));
    }

    info!(
        "上传清单构建完成: 资产={}, 文件数={}",
        asset_name,
        specifications.len()
    );

    Ok(specifications)
}

/// 拼接容器内路径，统一使用 `/` 分隔
fn to_upload_path(asset_name: &str, relative: &Path) -> String {
    let mut upload_path = asset_name.to_string();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            upload_path.push('/');
            upload_path.push_str(&part.to_string_lossy());
        }
    }
    upload_path
}

/// 收集待上传文件
///
/// - 单个文件：根目录为其父目录
/// - 文件夹：递归收集所有文件，根目录为该文件夹
///
/// # 返回
/// `(根目录, 按路径排序的文件列表)`
pub fn collect_files(path: &Path) -> UploadResult<(PathBuf, Vec<PathBuf>)> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        UploadError::Specification(format!("路径不存在: {}: {}", path.display(), e))
    })?;

    if metadata.is_file() {
        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        return Ok((root, vec![path.to_path_buf()]));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| {
            UploadError::Specification(format!("遍历目录失败: {}: {}", path.display(), e))
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();

    info!("文件夹扫描完成: {}, {} 个文件", path.display(), files.len());
    Ok((path.to_path_buf(), files))
}
