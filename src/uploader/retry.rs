// 错误分类与重试退避
//
// 状态码分类：
// - 2xx            -> Success
// - 429            -> Throttled（优先使用 Retry-After，否则走退避计算）
// - 413/502/503/504 -> Retryable
// - 无状态码（网络错误、超时、连接重置）-> Retryable
// - 其他           -> Fatal（包括 403 和所有未列出的 4xx）
//
// 退避延迟：
// - retry_count=0: base
// - retry_count=n: [base*mult*n, base*mult*n*mult) 区间内均匀随机，
//   避免大量并发分片在同一时刻集中重试

use crate::error::{UploadError, UploadResult};
use crate::uploader::transport::TransportResponse;
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 默认最大尝试次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// 默认初始退避间隔（毫秒）
pub const DEFAULT_BASE_INTERVAL_MS: u64 = 3000;

/// 默认退避倍数
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 1.5;

/// 退避倍数上限
pub const MAX_RETRY_MULTIPLIER: f64 = 10.0;

/// 单次退避等待上限（毫秒）
pub const MAX_BACKOFF_MS: u64 = 10 * 60 * 1000;

/// 可重试的状态码
const RETRYABLE_STATUS_CODES: [u16; 4] = [413, 502, 503, 504];

/// 限流状态码
const THROTTLED_STATUS_CODE: u16 = 429;

/// 请求结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// 成功
    Success,
    /// 不可重试，直接失败
    Fatal,
    /// 被限流（可重试）
    Throttled,
    /// 临时错误（可重试）
    Retryable,
}

impl Disposition {
    /// 是否值得重试
    pub fn is_retriable(&self) -> bool {
        matches!(self, Disposition::Throttled | Disposition::Retryable)
    }
}

/// 根据状态码分类
///
/// `None` 表示没有拿到 HTTP 响应（超时、连接被重置等）
pub fn classify_status(status: Option<u16>) -> Disposition {
    match status {
        None => Disposition::Retryable,
        Some(code) if (200..300).contains(&code) => Disposition::Success,
        Some(THROTTLED_STATUS_CODE) => Disposition::Throttled,
        Some(code) if RETRYABLE_STATUS_CODES.contains(&code) => Disposition::Retryable,
        Some(_) => Disposition::Fatal,
    }
}

/// 解析 Retry-After 请求头（秒）并转换为毫秒
pub fn retry_after_ms(value: Option<&str>) -> Option<u64> {
    let value = value?;
    match value.trim().parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs >= 0.0 => {
            info!("Retry-After 请求头存在, 值为 {}", value);
            Some((secs * 1000.0) as u64)
        }
        _ => {
            info!("Retry-After 请求头的值 {:?} 不是数字，无法使用", value);
            None
        }
    }
}

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 初始退避间隔（毫秒）
    pub base_interval_ms: u64,
    /// 退避倍数
    pub multiplier: f64,
    /// 最大尝试次数（包括第一次）
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_interval_ms: DEFAULT_BASE_INTERVAL_MS,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// 计算退避延迟（毫秒）
    ///
    /// # 参数
    /// * `retry_count` - 已重试次数，不能为负数
    pub fn backoff_ms(&self, retry_count: i64) -> UploadResult<f64> {
        if retry_count < 0 {
            return Err(UploadError::InvalidArgument(format!(
                "重试次数不能为负数: {}",
                retry_count
            )));
        }

        let base = self.base_interval_ms as f64;
        if retry_count == 0 {
            return Ok(base);
        }

        let min_time = base * self.multiplier * retry_count as f64;
        let max_time = min_time * self.multiplier;

        // [min_time, max_time) 区间内均匀随机；区间为空或溢出时取下界
        if min_time < max_time && max_time.is_finite() {
            Ok(rand::thread_rng().gen_range(min_time..max_time))
        } else {
            Ok(min_time)
        }
    }

    /// 计算退避延迟，最长不超过 `MAX_BACKOFF_MS`
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let ms = self
            .backoff_ms(retry_count as i64)
            .unwrap_or(self.base_interval_ms as f64);
        if ms.is_finite() && ms < MAX_BACKOFF_MS as f64 {
            Duration::from_secs_f64(ms.max(0.0) / 1000.0)
        } else {
            Duration::from_millis(MAX_BACKOFF_MS)
        }
    }

    /// 计算下一次重试前的等待时间
    ///
    /// 限流时优先使用服务端给出的 Retry-After
    pub fn delay_for(
        &self,
        disposition: Disposition,
        attempt_count: u32,
        retry_after: Option<&str>,
    ) -> Duration {
        if disposition == Disposition::Throttled {
            if let Some(ms) = retry_after_ms(retry_after) {
                return Duration::from_millis(ms);
            }
        }
        self.backoff(attempt_count)
    }

    /// 失败次数是否已经用完尝试预算
    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }
}

/// 带重试的请求失败信息
#[derive(Debug)]
pub struct RetryFailure {
    /// 最后一次的分类
    pub disposition: Disposition,
    /// 已尝试次数
    pub attempts: u32,
    /// 最后一次响应（被取消时为空）
    pub response: Option<TransportResponse>,
}

impl RetryFailure {
    pub fn describe(&self) -> String {
        match &self.response {
            Some(response) => format!(
                "{:?} after {} attempt(s): {}",
                self.disposition,
                self.attempts,
                response.describe()
            ),
            None => format!("cancelled after {} attempt(s)", self.attempts),
        }
    }
}

/// 对单个控制请求（创建容器、上报大小）执行重试循环
///
/// 分类和退避规则与分片上传一致
pub async fn send_with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    cancel_token: &CancellationToken,
    mut call: F,
) -> Result<(TransportResponse, T), RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = (TransportResponse, T)>,
{
    let mut attempt_count = 0u32;

    loop {
        if cancel_token.is_cancelled() {
            return Err(RetryFailure {
                disposition: Disposition::Fatal,
                attempts: attempt_count,
                response: None,
            });
        }

        let (response, value) = call().await;
        let disposition = classify_status(response.status);

        match disposition {
            Disposition::Success => return Ok((response, value)),
            Disposition::Fatal => {
                warn!("[{}] 请求失败（不可重试）: {}", label, response.describe());
                return Err(RetryFailure {
                    disposition,
                    attempts: attempt_count + 1,
                    response: Some(response),
                });
            }
            Disposition::Throttled | Disposition::Retryable => {
                attempt_count += 1;
                if policy.is_exhausted(attempt_count) {
                    warn!(
                        "[{}] 请求失败，已达最大尝试次数 ({}): {}",
                        label,
                        policy.max_attempts,
                        response.describe()
                    );
                    return Err(RetryFailure {
                        disposition,
                        attempts: attempt_count,
                        response: Some(response),
                    });
                }

                let delay =
                    policy.delay_for(disposition, attempt_count, response.retry_after.as_deref());
                warn!(
                    "[{}] 请求失败，等待 {}ms 后重试 ({}/{}): {}",
                    label,
                    delay.as_millis(),
                    attempt_count,
                    policy.max_attempts,
                    response.describe()
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel_token.cancelled() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_interval_ms: 1,
            multiplier: 1.5,
            max_attempts: 3,
        }
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(Some(200)), Disposition::Success);
        assert_eq!(classify_status(Some(201)), Disposition::Success);
        assert_eq!(classify_status(Some(299)), Disposition::Success);
        assert_eq!(classify_status(Some(403)), Disposition::Fatal);
        assert_eq!(classify_status(Some(400)), Disposition::Fatal);
        assert_eq!(classify_status(Some(404)), Disposition::Fatal);
        assert_eq!(classify_status(Some(500)), Disposition::Fatal);
        assert_eq!(classify_status(Some(301)), Disposition::Fatal);
        assert_eq!(classify_status(Some(429)), Disposition::Throttled);
        assert_eq!(classify_status(Some(413)), Disposition::Retryable);
        assert_eq!(classify_status(Some(502)), Disposition::Retryable);
        assert_eq!(classify_status(Some(503)), Disposition::Retryable);
        assert_eq!(classify_status(Some(504)), Disposition::Retryable);
        assert_eq!(classify_status(None), Disposition::Retryable);
    }

    #[test]
    fn test_retry_worthy_codes() {
        for code in [413, 429, 502, 503, 504] {
            assert!(classify_status(Some(code)).is_retriable(), "{} 应该可重试", code);
        }
        assert!(!classify_status(Some(403)).is_retriable());
        assert!(!classify_status(Some(200)).is_retriable());
    }

    #[test]
    fn test_retry_after_ms() {
        assert_eq!(retry_after_ms(Some("3")), Some(3000));
        assert_eq!(retry_after_ms(Some(" 1.5 ")), Some(1500));
        assert_eq!(retry_after_ms(Some("soon")), None);
        assert_eq!(retry_after_ms(Some("-1")), None);
        assert_eq!(retry_after_ms(None), None);
    }

    #[test]
    fn test_backoff_zero_and_negative() {
        let policy = RetryPolicy {
            base_interval_ms: 3000,
            multiplier: 1.5,
            max_attempts: 5,
        };
        assert_eq!(policy.backoff_ms(0).unwrap(), 3000.0);
        assert!(matches!(
            policy.backoff_ms(-1),
            Err(UploadError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_delay_for_throttled_uses_retry_after() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(Disposition::Throttled, 1, Some("2")),
            Duration::from_millis(2000)
        );

        // Retry-After 无法解析时回退到退避计算
        let delay = policy.delay_for(Disposition::Throttled, 1, Some("later"));
        assert!(delay >= Duration::from_millis(4500) && delay < Duration::from_millis(6750));

        // 非限流错误忽略 Retry-After
        let delay = policy.delay_for(Disposition::Retryable, 1, Some("2"));
        assert!(delay >= Duration::from_millis(4500));
    }

    #[test]
    fn test_backoff_capped_for_huge_multiplier() {
        let policy = RetryPolicy {
            base_interval_ms: 3000,
            multiplier: 1e200,
            max_attempts: 5,
        };
        assert_eq!(policy.backoff(2), Duration::from_millis(MAX_BACKOFF_MS));
        assert_eq!(policy.backoff(4), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[test]
    fn test_backoff_without_growth() {
        let policy = RetryPolicy {
            base_interval_ms: 200,
            multiplier: 1.0,
            max_attempts: 5,
        };
        assert_eq!(policy.backoff_ms(3).unwrap(), 600.0);
        let delay = policy.backoff(3);
        assert!(delay > Duration::from_millis(599) && delay <= Duration::from_millis(600));
    }

    #[test]
    fn test_is_exhausted() {
        let policy = fast_policy();
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }

    #[tokio::test]
    async fn test_send_with_retries_recovers() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result = send_with_retries(&fast_policy(), "test", &token, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                let status = if n < 2 { 503 } else { 200 };
                (TransportResponse::status(status), n)
            }
        })
        .await;

        let (response, value) = result.unwrap();
        assert_eq!(response.status, Some(200));
        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_send_with_retries_exhausted() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result = send_with_retries(&fast_policy(), "test", &token, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { (TransportResponse::transport_error("connection reset"), ()) }
        })
        .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.disposition, Disposition::Retryable);
        assert_eq!(failure.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_send_with_retries_fatal_not_retried() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();

        let result = send_with_retries(&fast_policy(), "test", &token, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { (TransportResponse::status(403), ()) }
        })
        .await;

        assert_eq!(result.unwrap_err().disposition, Disposition::Fatal);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn prop_backoff_within_range(
            retry_count in 1i64..50,
            base in 1u64..10_000,
            multiplier in 1.01f64..4.0,
        ) {
            let policy = RetryPolicy { base_interval_ms: base, multiplier, max_attempts: 5 };
            let min_time = base as f64 * multiplier * retry_count as f64;
            let max_time = min_time * multiplier;
            let delay = policy.backoff_ms(retry_count).unwrap();
            prop_assert!(delay >= min_time);
            prop_assert!(delay < max_time);
        }
    }
}
