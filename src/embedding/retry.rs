//! 임베딩 호출 재시도 (지수 백오프)
//!
//! `ProviderError::is_retryable()`인 실패만 재시도합니다. 프로바이더가
//! `Retry-After`를 주면 계산된 백오프보다 길 때 그 값을 따릅니다.

use std::future::Future;
use std::time::Duration;

use crate::config::IngestionConfig;
use crate::error::ProviderError;

/// 백오프 상한
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// 재시도 정책
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
        }
    }

    pub fn from_config(config: &IngestionConfig) -> Self {
        Self::new(config.max_retries, config.initial_backoff())
    }

    /// 재시도 없음
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// `attempt`번째 실패 후 대기 시간 (0-based)
    fn delay_for(&self, attempt: u32, err: &ProviderError) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_BACKOFF);

        match err.retry_after() {
            Some(hint) if hint > exp => hint.min(MAX_BACKOFF),
            _ => exp,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&IngestionConfig::default())
    }
}

/// 일시적 실패를 백오프하며 재시도
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt, &err);
                tracing::warn!(
                    "{} failed ({}), retrying in {:?} (attempt {}/{})",
                    what,
                    err,
                    delay,
                    attempt + 1,
                    policy.max_retries
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unavailable() -> ProviderError {
        ProviderError::Unavailable {
            provider: "test".into(),
            status: 503,
            message: "busy".into(),
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast_policy(3), "embed", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(unavailable())
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&fast_policy(3), "embed", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::InvalidCredential {
                provider: "test".into(),
                status: 401,
            })
        })
        .await;

        assert!(matches!(result, Err(ProviderError::InvalidCredential { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&fast_policy(2), "embed", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(unavailable())
        })
        .await;

        assert!(matches!(result, Err(ProviderError::Unavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_grows_and_honors_retry_after() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_for(0, &unavailable()), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3, &unavailable()), Duration::from_millis(800));

        let limited = ProviderError::RateLimited {
            provider: "test".into(),
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(policy.delay_for(0, &limited), Duration::from_secs(5));
        assert_eq!(policy.delay_for(30, &unavailable()), MAX_BACKOFF);
    }
}
