// 名称校验
//
// 资产名称和文件路径中不允许出现部分文件系统（如 NTFS）不支持的字符，
// 服务端也会拒绝这些字符，所以在任何网络请求之前就直接失败。
// 路径允许包含 `\` 和 `/`，单独的资产名称不允许。

use crate::error::{UploadError, UploadResult};

/// 路径中的非法字符
pub const INVALID_PATH_CHARACTERS: [char; 7] = ['"', ':', '<', '>', '|', '*', '?'];

/// 名称中的非法字符（路径非法字符 + 路径分隔符）
pub const INVALID_NAME_CHARACTERS: [char; 9] = ['"', ':', '<', '>', '|', '*', '?', '\\', '/'];

/// 校验资产名称
pub fn check_asset_name(name: &str) -> UploadResult<()> {
    check_characters(name, &INVALID_NAME_CHARACTERS, "资产名称")
}

/// 校验上传路径
pub fn check_upload_path(path: &str) -> UploadResult<()> {
    check_characters(path, &INVALID_PATH_CHARACTERS, "上传路径")
}

fn check_characters(value: &str, invalid: &[char], label: &str) -> UploadResult<()> {
    if value.is_empty() {
        return Err(UploadError::InvalidName {
            name: value.to_string(),
            reason: format!("{}不能为空", label),
        });
    }

    if let Some(c) = invalid.iter().find(|c| value.contains(**c)) {
        return Err(UploadError::InvalidName {
            name: value.to_string(),
            reason: format!(
                "{}包含非法字符 {:?}，非法字符包括: {}",
                label,
                c,
                invalid.iter().collect::<String>()
            ),
        });
    }

    Ok(())
}
