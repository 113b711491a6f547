// Release Asset Uploader
// 分片并发上传构建产物的核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志模块
pub mod logging;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use error::{UploadError, UploadResult};
pub use uploader::{
    AggregateReport, FileUploadOutcome, HttpTransport, Transport, UploadEngine,
    UploadSpecification,
};
