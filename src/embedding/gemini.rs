//! Google Gemini 임베딩 프로바이더
//!
//! source: https://ai.google.dev/gemini-api/docs/embeddings
//!
//! 클라이언트 측 Rate Limiter로 무료 티어 한도(60 RPM)를 지킵니다.
//! 429 응답은 여기서 재시도하지 않고 `ProviderError::RateLimited`로 올려보내며,
//! 백오프는 인제스트 단계의 `retry::with_backoff`가 담당합니다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{parse_retry_after, Credential, Embedder};
use crate::error::{ConfigError, ProviderError, RagError};

const PROVIDER: &str = "gemini";

/// Gemini API 기본 주소
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// 기본 모델 (gemini-embedding-001 - MRL 지원)
pub const DEFAULT_MODEL: &str = "gemini-embedding-001";

/// 기본 임베딩 차원
pub const DEFAULT_DIMENSION: usize = 768;

/// MRL로 선택 가능한 출력 차원
const SUPPORTED_DIMENSIONS: [usize; 3] = [768, 1536, 3072];

/// Rate Limiter 설정 (Gemini 무료 티어: 60 RPM)
const RATE_LIMIT_RPM: u32 = 60;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
/// 호출 간 최소 딜레이 (1000ms = 60 RPM 준수)
const MIN_DELAY_MS: u64 = 1000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Rate Limiter
// ============================================================================

/// Rate Limiter with minimum delay between requests
#[derive(Debug)]
struct RateLimiter {
    requests: Vec<Instant>,
    max_requests: u32,
    window: Duration,
    min_delay: Duration,
    last_request: Option<Instant>,
}

impl RateLimiter {
    fn new(max_requests: u32, window: Duration, min_delay: Duration) -> Self {
        Self {
            requests: Vec::new(),
            max_requests,
            window,
            min_delay,
            last_request: None,
        }
    }

    /// 요청 가능 여부 확인 및 대기
    async fn acquire(&mut self) {
        // 1. 최소 딜레이 적용 (버스트 방지)
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                let wait_time = self.min_delay - elapsed;
                tracing::debug!("Min delay: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        let now = Instant::now();

        // 2. 윈도우 밖의 오래된 요청 제거
        self.requests.retain(|&t| now.duration_since(t) < self.window);

        // 3. Rate limit 초과 시 대기
        if self.requests.len() >= self.max_requests as usize {
            if let Some(&oldest) = self.requests.first() {
                let wait_time = self.window.saturating_sub(now.duration_since(oldest));
                if !wait_time.is_zero() {
                    tracing::debug!("Rate limit reached, waiting {:?}", wait_time);
                    tokio::time::sleep(wait_time).await;
                }
                let now = Instant::now();
                self.requests.retain(|&t| now.duration_since(t) < self.window);
            }
        }

        // 4. 현재 요청 기록
        let now = Instant::now();
        self.requests.push(now);
        self.last_request = Some(now);
    }
}

// ============================================================================
// GeminiEmbedder
// ============================================================================

/// Google Gemini 임베딩 구현체
pub struct GeminiEmbedder {
    api_key: Credential,
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl GeminiEmbedder {
    /// # Arguments
    /// * `api_key` - Google AI API 키
    /// * `model` - 모델 ID
    /// * `dimension` - 출력 차원 (768, 1536, 3072 중 선택)
    pub fn new(api_key: Credential, model: &str, dimension: usize) -> Result<Self, RagError> {
        if !SUPPORTED_DIMENSIONS.contains(&dimension) {
            return Err(ConfigError::InvalidDimension(dimension as i64).into());
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ProviderError::Transport {
                provider: PROVIDER.to_string(),
                source,
            })?;

        Ok(Self {
            api_key,
            client,
            base_url: GEMINI_BASE_URL.to_string(),
            model: model.to_string(),
            dimension,
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(
                RATE_LIMIT_RPM,
                RATE_LIMIT_WINDOW,
                Duration::from_millis(MIN_DELAY_MS),
            ))),
        })
    }

    /// API 주소 변경 (프록시, 테스트 서버)
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Rate Limiter 설정 변경
    pub fn with_rate_limit(mut self, max_per_minute: u32, min_delay: Duration) -> Self {
        self.rate_limiter = Arc::new(Mutex::new(RateLimiter::new(
            max_per_minute,
            RATE_LIMIT_WINDOW,
            min_delay,
        )));
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1beta/models/{}:embedContent", self.base_url, self.model)
    }

    async fn request(&self, text: &str, task_type: &'static str) -> Result<Vec<f32>, ProviderError> {
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyInput);
        }

        let request = EmbedRequest {
            model: format!("models/{}", self.model),
            content: EmbedContent {
                parts: vec![EmbedPart {
                    text: text.to_string(),
                }],
            },
            task_type,
            output_dimensionality: Some(self.dimension),
        };

        {
            let mut limiter = self.rate_limiter.lock().await;
            limiter.acquire().await;
        }

        // API 키는 URL이 아닌 헤더로 전송
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: PROVIDER.to_string(),
                source,
            })?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|source| ProviderError::Transport {
                provider: PROVIDER.to_string(),
                source,
            })?;

        if !status.is_success() {
            let message = serde_json::from_str::<GeminiError>(&body)
                .map(|e| format!("{} {}", e.error.status, e.error.message).trim().to_string())
                .unwrap_or(body);
            if status.as_u16() == 429 {
                tracing::warn!("Gemini rate limit hit (429)");
            }
            return Err(ProviderError::from_status(PROVIDER, status, retry_after, message));
        }

        let parsed: EmbedResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::InvalidResponse {
                provider: PROVIDER.to_string(),
                message: e.to_string(),
            })?;

        Ok(parsed.embedding.values)
    }
}

/// Gemini API 요청 본문
#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: EmbedContent,
    #[serde(rename = "taskType")]
    task_type: &'static str,
    #[serde(rename = "outputDimensionality", skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

/// Gemini API 응답
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

/// Gemini API 에러 응답
#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
    #[serde(default)]
    status: String,
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.request(text, "RETRIEVAL_DOCUMENT").await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        // Gemini는 embedContent 단건 호출 - Rate limiter가 속도를 조절함
        let mut results = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            tracing::debug!("Embedding batch {}/{}", i + 1, texts.len());
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.request(text, "RETRIEVAL_QUERY").await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use secrecy::Secret;

    fn embedder(server: &mockito::Server) -> GeminiEmbedder {
        GeminiEmbedder::new(Secret::new("fake_key".to_string()), DEFAULT_MODEL, 768)
            .unwrap()
            .with_base_url(&server.url())
            .with_rate_limit(1000, Duration::ZERO)
    }

    #[test]
    fn test_invalid_dimension() {
        let result = GeminiEmbedder::new(Secret::new("fake_key".to_string()), DEFAULT_MODEL, 999);
        assert!(matches!(
            result,
            Err(RagError::Config(ConfigError::InvalidDimension(999)))
        ));
    }

    #[test]
    fn test_valid_dimensions() {
        for dim in SUPPORTED_DIMENSIONS {
            let result = GeminiEmbedder::new(Secret::new("fake_key".to_string()), DEFAULT_MODEL, dim);
            assert!(result.is_ok());
        }
    }

    #[tokio::test]
    async fn test_embed_sends_key_in_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1beta/models/gemini-embedding-001:embedContent")
            .match_header("x-goog-api-key", "fake_key")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "taskType": "RETRIEVAL_DOCUMENT",
                "outputDimensionality": 768
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"embedding":{"values":[0.1,0.2,0.3]}}"#)
            .create_async()
            .await;

        let values = embedder(&server).embed("hello").await.unwrap();
        assert_eq!(values, vec![0.1, 0.2, 0.3]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_query_task_type() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1beta/models/gemini-embedding-001:embedContent")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "taskType": "RETRIEVAL_QUERY"
            })))
            .with_status(200)
            .with_body(r#"{"embedding":{"values":[1.0]}}"#)
            .create_async()
            .await;

        embedder(&server).embed_query("what?").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_classification() {
        let mut server = mockito::Server::new_async().await;
        let _limited = server
            .mock("POST", Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "7")
            .with_body(r#"{"error":{"message":"quota","status":"RESOURCE_EXHAUSTED"}}"#)
            .create_async()
            .await;

        let err = embedder(&server).embed("hello").await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { .. }));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        server.reset();
        let _denied = server
            .mock("POST", Matcher::Any)
            .with_status(403)
            .with_body(r#"{"error":{"message":"API key not valid","status":"PERMISSION_DENIED"}}"#)
            .create_async()
            .await;

        let err = embedder(&server).embed("hello").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidCredential { status: 403, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_input_rejected_locally() {
        let server = mockito::Server::new_async().await;
        let err = embedder(&server).embed("   ").await.unwrap_err();
        assert!(matches!(err, ProviderError::EmptyInput));
    }
}
