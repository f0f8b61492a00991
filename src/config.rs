//! 설정 모듈
//!
//! TOML 파일(선택) → 환경변수 순으로 설정을 읽습니다.
//! 데이터 위치 기본값: `<data_local_dir>/.palank-tenant-rag/`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 데이터 디렉토리 환경변수
pub const DATA_DIR_ENV: &str = "PALANK_RAG_DATA_DIR";

/// 기본 데이터 디렉토리 경로
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".palank-tenant-rag")
}

// ============================================================================
// RagConfig
// ============================================================================

/// 전체 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// 테넌트 데이터베이스 루트 (관리자 전용 경로)
    pub data_dir: PathBuf,
    pub chunking: ChunkingConfig,
    pub ingestion: IngestionConfig,
    pub retrieval: RetrievalConfig,
    pub loader: LoaderConfig,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            chunking: ChunkingConfig::default(),
            ingestion: IngestionConfig::default(),
            retrieval: RetrievalConfig::default(),
            loader: LoaderConfig::default(),
        }
    }
}

/// 청킹 설정 (단위: 문자 수)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 200,
        }
    }
}

/// 인제스트(임베딩) 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// 임베딩 요청 1회당 청크 수
    pub embed_batch_size: usize,
    /// 동시에 진행할 임베딩 요청 수
    pub embed_concurrency: usize,
    /// 일시적 프로바이더 오류 재시도 횟수
    pub max_retries: u32,
    /// 재시도 초기 백오프 (ms, 지수 증가)
    pub initial_backoff_ms: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            embed_batch_size: 16,
            embed_concurrency: 4,
            max_retries: 3,
            initial_backoff_ms: 500,
        }
    }
}

impl IngestionConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

/// 검색 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_limit: usize,
    /// 전체 쿼리 타임아웃 (ms)
    pub query_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 5,
            query_timeout_ms: 10_000,
        }
    }
}

impl RetrievalConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// 소스 로더 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// 최대 파일 크기 (바이트, 0이면 제한 없음)
    pub max_file_size: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024, // 10MB
            request_timeout_secs: 30,
            user_agent: concat!("palank-tenant-rag/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl LoaderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ============================================================================
// Loading
// ============================================================================

impl RagConfig {
    /// 설정 로드
    ///
    /// 1. `path`가 있으면 TOML 파일 읽기 (없으면 기본값)
    /// 2. `PALANK_RAG_DATA_DIR` 환경변수로 data_dir 덮어쓰기
    /// 3. 값 검증
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.is_empty() {
                tracing::debug!("Using data dir from {}", DATA_DIR_ENV);
                config.data_dir = PathBuf::from(dir);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 읽기
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// 지정 디렉토리를 쓰는 기본 설정 (테스트, 임베드 용도)
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.chunk_size == 0 || self.chunking.overlap >= self.chunking.chunk_size {
            return Err(ConfigError::InvalidChunking {
                chunk_size: self.chunking.chunk_size,
                overlap: self.chunking.overlap,
            });
        }
        if self.ingestion.embed_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ingestion.embed_batch_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.ingestion.embed_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ingestion.embed_concurrency",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.retrieval.default_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retrieval.default_limit",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.retrieval.query_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retrieval.query_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
