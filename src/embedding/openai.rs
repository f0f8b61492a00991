//! OpenAI 임베딩 프로바이더 (`/v1/embeddings`)
//!
//! 한 요청에 여러 입력을 보낼 수 있어 `embed_batch`가 네이티브 배치입니다.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use super::{parse_retry_after, Credential, Embedder};
use crate::error::ProviderError;

const PROVIDER: &str = "openai";
const OPENAI_BASE_URL: &str = "https://api.openai.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub const SMALL_MODEL: &str = "text-embedding-3-small";
pub const SMALL_DIMENSION: usize = 1536;
pub const LARGE_MODEL: &str = "text-embedding-3-large";
pub const LARGE_DIMENSION: usize = 3072;

// ============================================================================
// Endpoint
// ============================================================================

fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn has_version_suffix(base_url: &str) -> bool {
    let Some(last_segment) = base_url.rsplit('/').next() else {
        return false;
    };
    let Some(rest) = last_segment.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

/// base URL → 임베딩 엔드포인트 (`/v1` 등 버전 경로가 있으면 그대로 사용)
fn embeddings_endpoint(base_url: &str) -> String {
    let normalized = normalize_base_url(base_url);
    if normalized.ends_with("/embeddings") {
        return normalized;
    }
    if has_version_suffix(&normalized) {
        return format!("{normalized}/embeddings");
    }
    format!("{normalized}/v1/embeddings")
}

// ============================================================================
// OpenAiEmbedder
// ============================================================================

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: Credential,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    pub fn new(api_key: Credential, model: &str, dimension: usize) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ProviderError::Transport {
                provider: PROVIDER.to_string(),
                source,
            })?;

        Ok(Self {
            client,
            api_key,
            endpoint: embeddings_endpoint(OPENAI_BASE_URL),
            model: model.to_string(),
            dimension,
        })
    }

    /// OpenAI 호환 서버 사용
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.endpoint = embeddings_endpoint(url);
        self
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OpenAiError {
    error: OpenAiErrorDetail,
}

#[derive(Deserialize)]
struct OpenAiErrorDetail {
    message: String,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: PROVIDER.to_string(),
                message: "empty embedding response".to_string(),
            })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() || texts.iter().any(|t| t.trim().is_empty()) {
            return Err(ProviderError::EmptyInput);
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let transport = |source| ProviderError::Transport {
            provider: PROVIDER.to_string(),
            source,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.map_err(transport)?;

        if !status.is_success() {
            let message = serde_json::from_str::<OpenAiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(ProviderError::from_status(PROVIDER, status, retry_after, message));
        }

        let mut parsed: EmbeddingResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::InvalidResponse {
                provider: PROVIDER.to_string(),
                message: e.to_string(),
            })?;

        if parsed.data.len() != texts.len() {
            return Err(ProviderError::InvalidResponse {
                provider: PROVIDER.to_string(),
                message: format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    parsed.data.len()
                ),
            });
        }

        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
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
    use secrecy::Secret;

    fn embedder(server: &mockito::Server) -> OpenAiEmbedder {
        OpenAiEmbedder::new(Secret::new("sk-test".to_string()), SMALL_MODEL, 3)
            .unwrap()
            .with_base_url(&server.url())
    }

    #[test]
    fn endpoint_from_host_base_uses_v1_embeddings() {
        assert_eq!(
            embeddings_endpoint("https://api.openai.com"),
            "https://api.openai.com/v1/embeddings"
        );
    }

    #[test]
    fn endpoint_from_version_suffix_appends_embeddings_once() {
        assert_eq!(
            embeddings_endpoint("https://proxy.internal/v1/"),
            "https://proxy.internal/v1/embeddings"
        );
        assert_eq!(
            embeddings_endpoint("https://api.example.com/v1/embeddings"),
            "https://api.example.com/v1/embeddings"
        );
    }

    #[tokio::test]
    async fn test_batch_preserves_input_order() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/embeddings")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data":[
                    {"index":1,"embedding":[0.0,1.0,0.0]},
                    {"index":0,"embedding":[1.0,0.0,0.0]}
                ]}"#,
            )
            .create_async()
            .await;

        let vectors = embedder(&server)
            .embed_batch(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();

        assert_eq!(vectors[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0, 0.0]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_key_is_not_retryable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/embeddings")
            .with_status(401)
            .with_body(r#"{"error":{"message":"Incorrect API key provided"}}"#)
            .create_async()
            .await;

        let err = embedder(&server).embed("hello").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidCredential { status: 401, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/embeddings")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let err = embedder(&server).embed("hello").await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_input() {
        let server = mockito::Server::new_async().await;
        let err = embedder(&server)
            .embed_batch(&["ok".to_string(), "".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::EmptyInput));
    }
}
