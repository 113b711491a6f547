// 上传传输层
//
// 三种请求：
// 1. 创建容器（POST），返回后续所有分片 PUT 使用的资源 URL
// 2. 上传分片（PUT），附带 Content-Range，可选 gzip 压缩
// 3. 上报最终大小（PATCH）
//
// 传输层只负责发请求并把状态码/响应头交给分类器，不做任何重试

use crate::config::{EndpointConfig, UploadConfig};
use crate::uploader::UploadChunk;
use anyhow::Context;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 压缩后携带原始长度的请求头
pub const UNCOMPRESSED_LENGTH_HEADER: &str = "x-tfs-filelength";

/// 单次请求的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP 状态码，网络层错误时为空
    pub status: Option<u16>,
    /// Retry-After 响应头原始值
    pub retry_after: Option<String>,
    /// 网络层错误信息
    pub error: Option<String>,
}

impl TransportResponse {
    pub fn status(code: u16) -> Self {
        Self {
            status: Some(code),
            ..Default::default()
        }
    }

    pub fn transport_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_retry_after(mut self, value: impl Into<String>) -> Self {
        self.retry_after = Some(value.into());
        self
    }

    /// 诊断信息
    pub fn describe(&self) -> String {
        match (self.status, &self.error) {
            (Some(code), _) => match &self.retry_after {
                Some(retry_after) => format!("status={}, retry-after={}", code, retry_after),
                None => format!("status={}", code),
            },
            (None, Some(error)) => format!("transport error: {}", error),
            (None, None) => "no response".to_string(),
        }
    }
}

/// 创建容器的响应
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerResponse {
    pub response: TransportResponse,
    /// 容器资源 URL
    pub resource_url: Option<String>,
}

/// 待上传的分片
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    /// 容器内的路径
    pub upload_path: String,
    /// 分片信息
    pub chunk: UploadChunk,
    /// 分片原始数据
    pub data: Vec<u8>,
}

/// 传输层接口
#[async_trait]
pub trait Transport: Send + Sync {
    /// 创建远程容器
    async fn create_container(&self, asset_name: &str) -> ContainerResponse;

    /// 上传一个分片
    async fn upload_chunk(&self, resource_url: &str, payload: ChunkPayload) -> TransportResponse;

    /// 上报最终大小
    async fn finalize_size(&self, asset_name: &str, size: u64) -> TransportResponse;
}

/// 编码后的请求体
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    pub bytes: Vec<u8>,
    /// 是否为 gzip 压缩内容
    pub gzip: bool,
    /// 原始长度
    pub raw_len: u64,
}

/// 编码分片请求体
///
/// 只有压缩后严格变小时才使用压缩内容，否则发送原始数据
pub fn encode_body(data: Vec<u8>, try_gzip: bool) -> EncodedBody {
    let raw_len = data.len() as u64;

    if try_gzip && !data.is_empty() {
        match gzip(&data) {
            Ok(compressed) if compressed.len() < data.len() => {
                return EncodedBody {
                    bytes: compressed,
                    gzip: true,
                    raw_len,
                };
            }
            Ok(_) => {}
            Err(e) => warn!("分片压缩失败，发送原始数据: {}", e),
        }
    }

    EncodedBody {
        bytes: data,
        gzip: false,
        raw_len,
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// 构建上传请求头
///
/// # 参数
/// * `api_version` - 服务端 API 版本
/// * `content_type` - 内容类型
/// * `keep_alive` - 是否复用连接
/// * `body` - 编码后的请求体（决定 Content-Length 和压缩相关请求头）
/// * `content_range` - 分片字节范围
pub fn upload_headers(
    api_version: &str,
    content_type: &str,
    keep_alive: bool,
    body: Option<&EncodedBody>,
    content_range: Option<&str>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();

    if let Ok(value) = HeaderValue::from_str(&format!("application/json;api-version={}", api_version)) {
        headers.insert(ACCEPT, value);
    }

    if !content_type.is_empty() {
        match HeaderValue::from_str(content_type) {
            Ok(value) => {
                headers.insert(CONTENT_TYPE, value);
            }
            Err(_) => warn!("Content-Type 不合法，已忽略: {:?}", content_type),
        }
    }

    if keep_alive {
        headers.insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));
        // 连接至少保持 10 秒
        headers.insert(HeaderName::from_static("keep-alive"), HeaderValue::from_static("10"));
    }

    if let Some(body) = body {
        if body.gzip {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            headers.insert(
                HeaderName::from_static(UNCOMPRESSED_LENGTH_HEADER),
                HeaderValue::from(body.raw_len),
            );
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.bytes.len() as u64));
    }

    if let Some(range) = content_range {
        if let Ok(value) = HeaderValue::from_str(range) {
            headers.insert(CONTENT_RANGE, value);
        }
    }

    headers
}

/// 基于 reqwest 的传输层实现
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: EndpointConfig,
    token: String,
    content_type: String,
    gzip: bool,
    keep_alive: bool,
}

#[derive(Serialize)]
struct CreateContainerRequest<'a> {
    #[serde(rename = "Type")]
    container_type: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
}

#[derive(Deserialize)]
struct CreateContainerBody {
    #[serde(rename = "fileContainerResourceUrl")]
    file_container_resource_url: Option<String>,
}

#[derive(Serialize)]
struct PatchSizeRequest {
    #[serde(rename = "Size")]
    size: u64,
}

impl HttpTransport {
    /// 创建传输层
    ///
    /// # 参数
    /// * `endpoint` - 服务端地址配置
    /// * `upload` - 上传配置（压缩、连接复用、内容类型）
    /// * `token` - Bearer 令牌
    pub fn new(endpoint: &EndpointConfig, upload: &UploadConfig, token: String) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(endpoint.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        info!(
            "初始化上传客户端: base_url={}, api_version={}, gzip={}, keep_alive={}",
            endpoint.base_url, endpoint.api_version, upload.gzip, upload.keep_alive
        );

        Ok(Self {
            client,
            endpoint: endpoint.clone(),
            token,
            content_type: upload.content_type.clone(),
            gzip: upload.gzip,
            keep_alive: upload.keep_alive,
        })
    }

    /// 容器接口地址
    pub fn container_url(&self) -> String {
        format!(
            "{}/_apis/pipelines/workflows/{}/artifacts?api-version={}",
            self.endpoint.base_url.trim_end_matches('/'),
            self.endpoint.run_id,
            self.endpoint.api_version
        )
    }

    /// 分片上传地址
    pub fn item_url(resource_url: &str, upload_path: &str) -> String {
        let separator = if resource_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}itemPath={}",
            resource_url,
            separator,
            urlencoding::encode(upload_path)
        )
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> (TransportResponse, Option<reqwest::Response>) {
        match request.bearer_auth(&self.token).send().await {
            Ok(response) => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string());
                let result = TransportResponse {
                    status: Some(response.status().as_u16()),
                    retry_after,
                    error: None,
                };
                if !response.status().is_success() {
                    debug!(
                        "HTTP 诊断信息: status={}, headers={:?}",
                        response.status(),
                        response.headers()
                    );
                }
                (result, Some(response))
            }
            Err(e) => {
                warn!("请求发送失败: {}", e);
                (TransportResponse::transport_error(e.to_string()), None)
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn create_container(&self, asset_name: &str) -> ContainerResponse {
        let url = self.container_url();
        info!("创建远程容器: name={}, url={}", asset_name, url);

        let request = self
            .client
            .post(&url)
            .headers(upload_headers(
                &self.endpoint.api_version,
                "application/json",
                false,
                None,
                None,
            ))
            .json(&CreateContainerRequest {
                container_type: "actions_storage",
                name: asset_name,
            });

        let (response, raw) = self.execute(request).await;
        let resource_url = match raw {
            Some(raw) if raw.status().is_success() => match raw.json::<CreateContainerBody>().await {
                Ok(body) => body.file_container_resource_url,
                Err(e) => {
                    warn!("解析创建容器响应失败: {}", e);
                    None
                }
            },
            _ => None,
        };

        ContainerResponse {
            response,
            resource_url,
        }
    }

    async fn upload_chunk(&self, resource_url: &str, payload: ChunkPayload) -> TransportResponse {
        let ChunkPayload {
            upload_path,
            chunk,
            data,
        } = payload;

        let try_gzip = self.gzip;
        let body = match tokio::task::spawn_blocking(move || encode_body(data, try_gzip)).await {
            Ok(body) => body,
            Err(e) => return TransportResponse::transport_error(format!("分片编码任务异常: {}", e)),
        };

        let content_range = chunk.content_range();
        let headers = upload_headers(
            &self.endpoint.api_version,
            &self.content_type,
            self.keep_alive,
            Some(&body),
            Some(&content_range),
        );

        debug!(
            "上传分片: path={}, range={}, wire={} bytes, gzip={}",
            upload_path,
            content_range,
            body.bytes.len(),
            body.gzip
        );

        let request = self
            .client
            .put(Self::item_url(resource_url, &upload_path))
            .headers(headers)
            .body(body.bytes);

        self.execute(request).await.0
    }

    async fn finalize_size(&self, asset_name: &str, size: u64) -> TransportResponse {
        let url = format!(
            "{}&artifactName={}",
            self.container_url(),
            urlencoding::encode(asset_name)
        );
        info!("上报最终大小: name={}, size={}", asset_name, size);

        let request = self
            .client
            .patch(&url)
            .headers(upload_headers(
                &self.endpoint.api_version,
                "application/json",
                false,
                None,
                None,
            ))
            .json(&PatchSizeRequest { size });

        self.execute(request).await.0
    }
}
