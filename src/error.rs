//! 에러 타입
//!
//! 호출자가 "재시도할 만한 실패"와 "치명적 실패"를 에러 메시지 문자열 매칭 없이
//! 구분할 수 있도록 분류된 에러를 제공합니다.
//!
//! - `ConfigError`: 잘못된 설정/식별자. 즉시 실패, 재시도 없음
//! - `ProviderError`: 임베딩 API 실패 (인증, rate limit, 장애)
//! - `StoreError`: 테넌트 저장소/테이블 DDL·DML 실패
//! - `LoaderError`: 외부 소스에서 문서를 가져오는 중 실패

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// 크레이트 공통 Result
pub type Result<T, E = RagError> = std::result::Result<T, E>;

// ============================================================================
// ConfigError
// ============================================================================

/// 설정 / 식별자 오류
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid tenant id '{value}': {reason}")]
    InvalidTenantId { value: String, reason: &'static str },

    #[error("invalid table name '{value}': {reason}")]
    InvalidTableName { value: String, reason: &'static str },

    #[error("invalid vector dimension: {0}")]
    InvalidDimension(i64),

    #[error("invalid chunking parameters: chunk_size={chunk_size}, overlap={overlap}")]
    InvalidChunking { chunk_size: usize, overlap: usize },

    #[error("limit must be greater than zero")]
    InvalidLimit,

    #[error("query text is empty")]
    EmptyQuery,

    #[error("source display name is empty")]
    EmptyDisplayName,

    #[error("unsupported source kind: {0}")]
    UnsupportedSourceKind(String),

    #[error("missing required settings for {kind}: {}", .fields.join(", "))]
    MissingSettings {
        kind: &'static str,
        fields: Vec<String>,
    },

    #[error("invalid setting '{key}': {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unknown embedding model: {0}")]
    UnknownModel(String),

    #[error("invalid configuration value '{key}': {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("failed to read config file {path:?}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

// ============================================================================
// ProviderError
// ============================================================================

/// 임베딩 프로바이더 오류
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no credential configured for provider '{provider}'")]
    MissingCredential { provider: String },

    #[error("credential rejected by {provider} (status {status})")]
    InvalidCredential { provider: String, status: u16 },

    #[error("rate limited by {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("embedding input is empty")]
    EmptyInput,

    #[error("{provider} rejected the request (status {status}): {message}")]
    BadRequest {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider} is unavailable (status {status}): {message}")]
    Unavailable {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("failed to reach {provider}: {source}")]
    Transport {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected response from {provider}: {message}")]
    InvalidResponse { provider: String, message: String },
}

impl ProviderError {
    /// 백오프 후 재시도할 가치가 있는 실패인지
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Unavailable { .. } | Self::Transport { .. }
        )
    }

    /// 프로바이더가 알려준 대기 시간 (Retry-After)
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// HTTP 상태 코드를 분류된 에러로 변환
    pub(crate) fn from_status(
        provider: &str,
        status: reqwest::StatusCode,
        retry_after: Option<Duration>,
        message: String,
    ) -> Self {
        let provider = provider.to_string();
        match status.as_u16() {
            401 | 403 => Self::InvalidCredential {
                provider,
                status: status.as_u16(),
            },
            429 => Self::RateLimited {
                provider,
                retry_after,
            },
            code if status.is_server_error() => Self::Unavailable {
                provider,
                status: code,
                message,
            },
            code => Self::BadRequest {
                provider,
                status: code,
                message,
            },
        }
    }
}

// ============================================================================
// StoreError
// ============================================================================

/// 테넌트 저장소 오류
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("administrative store root unavailable at {path:?}: {source}")]
    AdminUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("insufficient privileges for {path:?}: {source}")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tenant store i/o failure at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("vector dimension mismatch for table {table}: expected {expected}, got {actual}")]
    DimensionMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid store request: {0}")]
    InvalidRequest(String),

    #[error("vector store error ({context}): {source}")]
    Lance {
        context: &'static str,
        #[source]
        source: lancedb::Error,
    },

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("corrupt table {table}: {message}")]
    Corrupt { table: String, message: String },

    #[error("catalog lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// io::Error를 권한 오류와 일반 I/O 오류로 분류
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path, source },
            _ => Self::Io { path, source },
        }
    }

    /// lancedb 에러 변환 (TableNotFound는 별도 variant로)
    pub(crate) fn lance(context: &'static str) -> impl FnOnce(lancedb::Error) -> Self {
        move |source| match source {
            lancedb::Error::TableNotFound { name } => Self::TableNotFound(name),
            source => Self::Lance { context, source },
        }
    }

    pub fn is_table_not_found(&self) -> bool {
        matches!(self, Self::TableNotFound(_))
    }
}

// ============================================================================
// LoaderError
// ============================================================================

/// 소스 로딩 오류
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("file not found: {0:?}")]
    NotFound(PathBuf),

    #[error("unsupported file type: {0:?}")]
    UnsupportedFile(PathBuf),

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file {path:?} is {size} bytes, larger than the {limit} byte limit")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("failed to extract text from PDF {path:?}: {message}")]
    Pdf { path: PathBuf, message: String },

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("response from {url} is larger than the {limit} byte limit")]
    ResponseTooLarge { url: String, limit: u64 },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("unexpected response from {url}: {message}")]
    InvalidResponse { url: String, message: String },

    #[error("loader task failed: {0}")]
    Task(String),
}

// ============================================================================
// RagError
// ============================================================================

/// 에러 분류 (로그, degraded 소스 보고용)
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Provider,
    Store,
    Source,
}

/// 파이프라인 최상위 에러
#[derive(Debug, Error)]
pub enum RagError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("source '{0}' produced no content to embed")]
    NoContent(String),
}

impl RagError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Provider(_) => ErrorKind::Provider,
            Self::Store(_) => ErrorKind::Store,
            Self::Loader(_) | Self::NoContent(_) => ErrorKind::Source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn as_store(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
