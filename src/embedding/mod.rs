//! 임베딩 모듈 - 텍스트 벡터화
//!
//! - `Embedder`: 프로바이더 공통 트레이트
//! - `EmbedderRegistry`: model id → (프로바이더, 차원, 생성 함수)
//! - `CredentialStore`: 테넌트별 프로바이더 API 키 공급 (키는 저장하지 않음)
//!
//! ## 사용법
//! ```rust,ignore
//! let registry = EmbedderRegistry::with_defaults();
//! let embedder = registry.resolve("gemini-embedding-001", &tenant, &EnvCredentialStore::new()).await?;
//! let embedding = embedder.embed("Hello, world!").await?;
//! ```

pub mod gemini;
pub mod hashing;
pub mod openai;
pub mod retry;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

pub use gemini::GeminiEmbedder;
pub use hashing::HashingEmbedder;
pub use openai::OpenAiEmbedder;
pub use retry::{with_backoff, RetryPolicy};

use crate::error::{ConfigError, ProviderError, RagError};
use crate::ident::TenantId;

/// 프로바이더 API 키 (로그/Debug 출력에 노출되지 않음)
pub type Credential = Secret<String>;

pub const GOOGLE_PROVIDER: &str = "google";
pub const OPENAI_PROVIDER: &str = "openai";

// ============================================================================
// Embedder Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 텍스트를 고정 길이 벡터로 변환합니다. 벡터 길이는 모델의 속성이며,
/// 테이블 차원과의 비교는 호출자 책임입니다.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// 단일 텍스트 임베딩 (문서용)
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// 배치 임베딩 (기본 구현: 순차 호출)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 검색 쿼리 임베딩 (프로바이더가 구분하지 않으면 `embed`와 동일)
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.embed(text).await
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 모델 ID
    fn model_id(&self) -> &str;
}

// ============================================================================
// Credential Store
// ============================================================================

/// 테넌트별 임베딩 API 키 공급자
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credential(&self, tenant: &TenantId, provider: &str)
        -> Result<Credential, ProviderError>;
}

/// 환경변수 기반 자격 증명 (모든 테넌트가 같은 키 사용)
///
/// - google: `GEMINI_API_KEY` > `GOOGLE_AI_API_KEY`
/// - openai: `OPENAI_API_KEY`
#[derive(Debug, Clone)]
pub struct EnvCredentialStore {
    vars: HashMap<String, Vec<String>>,
}

impl EnvCredentialStore {
    pub fn new() -> Self {
        let mut vars = HashMap::new();
        vars.insert(
            GOOGLE_PROVIDER.to_string(),
            vec!["GEMINI_API_KEY".to_string(), "GOOGLE_AI_API_KEY".to_string()],
        );
        vars.insert(OPENAI_PROVIDER.to_string(), vec!["OPENAI_API_KEY".to_string()]);
        Self { vars }
    }

    /// 프로바이더의 키를 읽을 환경변수 지정 (우선순위 순)
    pub fn with_vars(mut self, provider: &str, vars: &[&str]) -> Self {
        self.vars.insert(
            provider.to_string(),
            vars.iter().map(|v| v.to_string()).collect(),
        );
        self
    }
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn credential(
        &self,
        _tenant: &TenantId,
        provider: &str,
    ) -> Result<Credential, ProviderError> {
        let vars = self.vars.get(provider).map(Vec::as_slice).unwrap_or(&[]);

        for var in vars {
            if let Ok(key) = std::env::var(var) {
                if !key.is_empty() {
                    tracing::debug!("Using {} API key from {}", provider, var);
                    return Ok(Secret::new(key));
                }
            }
        }

        Err(ProviderError::MissingCredential {
            provider: provider.to_string(),
        })
    }
}

/// 메모리 기반 자격 증명 (테넌트 + 프로바이더별)
#[derive(Default)]
pub struct StaticCredentialStore {
    keys: HashMap<(Option<TenantId>, String), Credential>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 모든 테넌트에 적용되는 키
    pub fn with_key(mut self, provider: &str, key: impl Into<String>) -> Self {
        self.keys
            .insert((None, provider.to_string()), Secret::new(key.into()));
        self
    }

    /// 특정 테넌트 전용 키 (공용 키보다 우선)
    pub fn with_tenant_key(
        mut self,
        tenant: &TenantId,
        provider: &str,
        key: impl Into<String>,
    ) -> Self {
        self.keys.insert(
            (Some(tenant.clone()), provider.to_string()),
            Secret::new(key.into()),
        );
        self
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn credential(
        &self,
        tenant: &TenantId,
        provider: &str,
    ) -> Result<Credential, ProviderError> {
        self.keys
            .get(&(Some(tenant.clone()), provider.to_string()))
            .or_else(|| self.keys.get(&(None, provider.to_string())))
            .map(|key| Secret::new(key.expose_secret().clone()))
            .ok_or_else(|| ProviderError::MissingCredential {
                provider: provider.to_string(),
            })
    }
}

// ============================================================================
// Embedder Registry
// ============================================================================

/// 자격 증명으로 임베더를 만드는 함수
pub type EmbedderFactory =
    Arc<dyn Fn(Option<Credential>) -> Result<Arc<dyn Embedder>, RagError> + Send + Sync>;

/// 등록된 모델 정보
#[derive(Clone)]
pub struct ModelSpec {
    pub model_id: String,
    pub provider: String,
    pub dimension: usize,
    /// false면 자격 증명 없이 생성 (로컬 모델)
    pub requires_credential: bool,
    factory: EmbedderFactory,
}

impl fmt::Debug for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSpec")
            .field("model_id", &self.model_id)
            .field("provider", &self.provider)
            .field("dimension", &self.dimension)
            .field("requires_credential", &self.requires_credential)
            .finish()
    }
}

/// (model id, 자격 증명 SHA-256)
type InstanceKey = (String, Option<Vec<u8>>);

/// model id → 프로바이더/차원/생성 함수
///
/// 프로바이더는 모델 이름 부분 문자열이 아니라 등록 정보로 결정됩니다.
/// 생성된 임베더는 (모델, 자격 증명)마다 하나만 만들어 재사용하므로
/// 프로바이더 rate limiter 상태가 호출 사이에 유지됩니다.
#[derive(Clone, Default)]
pub struct EmbedderRegistry {
    models: HashMap<String, ModelSpec>,
    instances: Arc<Mutex<HashMap<InstanceKey, Arc<dyn Embedder>>>>,
}

impl EmbedderRegistry {
    /// 빈 레지스트리
    pub fn empty() -> Self {
        Self::default()
    }

    /// 기본 모델 등록 (Gemini 1개 + OpenAI 2개 + 로컬 해싱)
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        registry.register(
            gemini::DEFAULT_MODEL,
            GOOGLE_PROVIDER,
            gemini::DEFAULT_DIMENSION,
            Arc::new(|credential| {
                let credential = require_credential(credential, GOOGLE_PROVIDER)?;
                let embedder = GeminiEmbedder::new(
                    credential,
                    gemini::DEFAULT_MODEL,
                    gemini::DEFAULT_DIMENSION,
                )?;
                Ok(Arc::new(embedder) as Arc<dyn Embedder>)
            }),
        );

        for (model, dimension) in [
            (openai::SMALL_MODEL, openai::SMALL_DIMENSION),
            (openai::LARGE_MODEL, openai::LARGE_DIMENSION),
        ] {
            registry.register(
                model,
                OPENAI_PROVIDER,
                dimension,
                Arc::new(move |credential| {
                    let credential = require_credential(credential, OPENAI_PROVIDER)?;
                    let embedder = OpenAiEmbedder::new(credential, model, dimension)?;
                    Ok(Arc::new(embedder) as Arc<dyn Embedder>)
                }),
            );
        }

        registry.register_local(
            hashing::MODEL_ID,
            hashing::DEFAULT_DIMENSION,
            Arc::new(|_| {
                Ok(Arc::new(HashingEmbedder::new(
                    hashing::MODEL_ID,
                    hashing::DEFAULT_DIMENSION,
                )) as Arc<dyn Embedder>)
            }),
        );

        registry
    }

    /// 자격 증명이 필요한 모델 등록 (같은 ID면 교체)
    pub fn register(
        &mut self,
        model_id: &str,
        provider: &str,
        dimension: usize,
        factory: EmbedderFactory,
    ) {
        self.insert(model_id, provider, dimension, true, factory);
    }

    /// 자격 증명 없이 생성하는 모델 등록
    pub fn register_local(
        &mut self,
        model_id: &str,
        dimension: usize,
        factory: EmbedderFactory,
    ) {
        self.insert(model_id, "local", dimension, false, factory);
    }

    fn insert(
        &mut self,
        model_id: &str,
        provider: &str,
        dimension: usize,
        requires_credential: bool,
        factory: EmbedderFactory,
    ) {
        // 등록이 바뀌면 기존 인스턴스는 버림
        self.instances = Arc::default();
        self.models.insert(
            model_id.to_string(),
            ModelSpec {
                model_id: model_id.to_string(),
                provider: provider.to_string(),
                dimension,
                requires_credential,
                factory,
            },
        );
    }

    /// 모델 정보 조회
    pub fn spec(&self, model_id: &str) -> Result<&ModelSpec, ConfigError> {
        self.models
            .get(model_id)
            .ok_or_else(|| ConfigError::UnknownModel(model_id.to_string()))
    }

    /// 등록된 모델 (ID순)
    pub fn models(&self) -> Vec<&ModelSpec> {
        let mut models: Vec<&ModelSpec> = self.models.values().collect();
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        models
    }

    /// 모델 ID + 테넌트 자격 증명으로 임베더 생성
    pub async fn resolve(
        &self,
        model_id: &str,
        tenant: &TenantId,
        credentials: &dyn CredentialStore,
    ) -> Result<Arc<dyn Embedder>, RagError> {
        let spec = self.spec(model_id)?;

        let credential = if spec.requires_credential {
            Some(credentials.credential(tenant, &spec.provider).await?)
        } else {
            None
        };

        let key: InstanceKey = (
            spec.model_id.clone(),
            credential
                .as_ref()
                .map(|c| Sha256::digest(c.expose_secret().as_bytes()).to_vec()),
        );

        let mut instances = self.instances.lock().await;
        if let Some(embedder) = instances.get(&key) {
            return Ok(embedder.clone());
        }

        let embedder = (spec.factory)(credential)?;
        instances.insert(key, embedder.clone());
        tracing::debug!(
            "Resolved embedder {} ({}, dim={}) for tenant {}",
            spec.model_id,
            spec.provider,
            spec.dimension,
            tenant
        );
        Ok(embedder)
    }
}

impl fmt::Debug for EmbedderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.models()).finish()
    }
}

/// `Retry-After` 헤더 (초 단위)
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn require_credential(
    credential: Option<Credential>,
    provider: &str,
) -> Result<Credential, ProviderError> {
    credential.ok_or_else(|| ProviderError::MissingCredential {
        provider: provider.to_string(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEmbedder(usize);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Ok(vec![0.5; self.0])
        }

        fn dimension(&self) -> usize {
            self.0
        }

        fn model_id(&self) -> &str {
            "fixed"
        }
    }

    fn tenant() -> TenantId {
        TenantId::parse("t1").unwrap()
    }

    #[test]
    fn test_default_models() {
        let registry = EmbedderRegistry::with_defaults();

        let gemini = registry.spec("gemini-embedding-001").unwrap();
        assert_eq!(gemini.provider, GOOGLE_PROVIDER);
        assert_eq!(gemini.dimension, 768);

        let small = registry.spec("text-embedding-3-small").unwrap();
        assert_eq!(small.provider, OPENAI_PROVIDER);
        assert_eq!(small.dimension, 1536);

        assert_eq!(registry.spec("text-embedding-3-large").unwrap().dimension, 3072);
        assert!(!registry.spec(hashing::MODEL_ID).unwrap().requires_credential);
        assert!(matches!(
            registry.spec("word2vec"),
            Err(ConfigError::UnknownModel(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_requires_credential() {
        let registry = EmbedderRegistry::with_defaults();
        let credentials = StaticCredentialStore::new();

        let result = registry
            .resolve("text-embedding-3-small", &tenant(), &credentials)
            .await;
        assert!(matches!(
            result,
            Err(RagError::Provider(ProviderError::MissingCredential { .. }))
        ));

        let credentials = StaticCredentialStore::new().with_key(OPENAI_PROVIDER, "sk-test");
        let embedder = registry
            .resolve("text-embedding-3-small", &tenant(), &credentials)
            .await
            .unwrap();
        assert_eq!(embedder.dimension(), 1536);
        assert_eq!(embedder.model_id(), "text-embedding-3-small");
    }

    #[tokio::test]
    async fn test_local_model_skips_credentials() {
        let mut registry = EmbedderRegistry::empty();
        registry.register_local(
            "fixed",
            3,
            Arc::new(|_| Ok(Arc::new(FixedEmbedder(3)) as Arc<dyn Embedder>)),
        );

        let embedder = registry
            .resolve("fixed", &tenant(), &StaticCredentialStore::new())
            .await
            .unwrap();
        assert_eq!(embedder.embed("x").await.unwrap().len(), 3);
        assert_eq!(embedder.embed_query("x").await.unwrap().len(), 3);
        assert_eq!(
            embedder
                .embed_batch(&["a".to_string(), "b".to_string()])
                .await
                .unwrap()
                .len(),
            2
        );
    }

    fn same_instance(a: &Arc<dyn Embedder>, b: &Arc<dyn Embedder>) -> bool {
        std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
    }

    #[tokio::test]
    async fn test_resolve_reuses_instance_per_credential() {
        let registry = EmbedderRegistry::with_defaults();
        let t1 = tenant();
        let t2 = TenantId::parse("t2").unwrap();
        let credentials = StaticCredentialStore::new()
            .with_key(GOOGLE_PROVIDER, "shared")
            .with_tenant_key(&t2, GOOGLE_PROVIDER, "own");

        let first = registry
            .resolve(gemini::DEFAULT_MODEL, &t1, &credentials)
            .await
            .unwrap();
        let again = registry
            .resolve(gemini::DEFAULT_MODEL, &t1, &credentials)
            .await
            .unwrap();
        let other_key = registry
            .resolve(gemini::DEFAULT_MODEL, &t2, &credentials)
            .await
            .unwrap();

        assert!(same_instance(&first, &again));
        assert!(!same_instance(&first, &other_key));

        // 클론도 같은 인스턴스를 공유
        let cloned = registry.clone();
        let shared = cloned
            .resolve(gemini::DEFAULT_MODEL, &t1, &credentials)
            .await
            .unwrap();
        assert!(same_instance(&first, &shared));
    }

    #[tokio::test]
    async fn test_reregistering_drops_cached_instance() {
        let mut registry = EmbedderRegistry::empty();
        registry.register_local(
            "fixed",
            3,
            Arc::new(|_| Ok(Arc::new(FixedEmbedder(3)) as Arc<dyn Embedder>)),
        );
        let credentials = StaticCredentialStore::new();
        let before = registry.resolve("fixed", &tenant(), &credentials).await.unwrap();

        registry.register_local(
            "fixed",
            4,
            Arc::new(|_| Ok(Arc::new(FixedEmbedder(4)) as Arc<dyn Embedder>)),
        );
        let after = registry.resolve("fixed", &tenant(), &credentials).await.unwrap();

        assert_eq!(before.dimension(), 3);
        assert_eq!(after.dimension(), 4);
    }

    #[tokio::test]
    async fn test_tenant_key_overrides_shared_key() {
        let t1 = tenant();
        let t2 = TenantId::parse("t2").unwrap();
        let store = StaticCredentialStore::new()
            .with_key(GOOGLE_PROVIDER, "shared")
            .with_tenant_key(&t1, GOOGLE_PROVIDER, "own");

        let own = store.credential(&t1, GOOGLE_PROVIDER).await.unwrap();
        assert_eq!(own.expose_secret(), "own");
        let shared = store.credential(&t2, GOOGLE_PROVIDER).await.unwrap();
        assert_eq!(shared.expose_secret(), "shared");
    }

    #[tokio::test]
    async fn test_env_store_unknown_provider() {
        let store = EnvCredentialStore::new().with_vars("custom", &["PALANK_RAG_TEST_UNSET_KEY"]);
        let result = store.credential(&tenant(), "custom").await;
        assert!(matches!(result, Err(ProviderError::MissingCredential { .. })));

        let result = store.credential(&tenant(), "nobody").await;
        assert!(matches!(result, Err(ProviderError::MissingCredential { .. })));
    }
}
