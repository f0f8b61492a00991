//! palank-tenant-rag - 멀티 테넌트 벡터 지식 저장소
//!
//! 테넌트마다 격리된 저장소(LanceDB 벡터 테이블 + SQLite 카탈로그)에
//! 지식 소스를 인제스트하고, 여러 소스를 한 번에 검색합니다.
//!
//! - 인제스트: 로더 → 청킹 → 임베딩 → 소스 테이블
//! - 검색: 쿼리 임베딩 → 소스별 병렬 검색 → 점수순 병합

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod ident;
pub mod ingest;
pub mod knowledge;
pub mod loader;
pub mod retrieval;
pub mod service;
pub mod tenant;

// Re-exports
pub use config::RagConfig;
pub use embedding::{
    CredentialStore, Embedder, EmbedderRegistry, EnvCredentialStore, HashingEmbedder,
    StaticCredentialStore,
};
pub use error::{ConfigError, LoaderError, ProviderError, RagError, Result, StoreError};
pub use ident::{TableName, TenantId};
pub use ingest::{IngestionReport, RegisteredSource};
pub use knowledge::{ChunkRecord, SimilarChunk};
pub use loader::{SourceKind, SourceSpec};
pub use retrieval::{ContextOutcome, DegradedSource, RankedChunk, RetrievalOutcome, SourceFailure};
pub use service::KnowledgeService;
pub use tenant::{IngestionRun, KnowledgeSource};
