//! 검색 오케스트레이터 - 여러 소스에 동시 검색 후 병합/랭킹
//!
//! 소스마다 `search_similar` 하나를 동시에 실행합니다. 소스별 실패는 서로
//! 격리되어 해당 소스만 degraded로 기록되고, 전체 타임아웃이 지나면 끝나지
//! 않은 소스는 `TimedOut`으로 처리하고 이미 끝난 결과만 사용합니다.
//!
//! 같은 임베딩 모델을 쓰는 소스끼리는 질의 임베딩을 한 번만 계산합니다.
//! 실패도 한 번만: 에러는 처음 시도한 소스에 붙고 나머지 소스는
//! `EmbeddingFailed`로 표시됩니다. 같은 테이블을 여러 번 요청하면 한 번만
//! 검색합니다.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::config::RetrievalConfig;
use crate::embedding::{CredentialStore, EmbedderRegistry};
use crate::error::{ConfigError, ErrorKind, RagError, Result, StoreError};
use crate::ident::TableName;
use crate::knowledge::{Metadata, SimilarChunk};
use crate::tenant::{KnowledgeSource, TenantStore};

// ============================================================================
// Types
// ============================================================================

/// 출처가 붙은 검색 결과
#[derive(Debug, Clone, Serialize)]
pub struct RankedChunk {
    pub content: String,
    pub metadata: Metadata,
    pub source_id: String,
    pub source_name: String,
    pub table_name: TableName,
    /// 1 - 코사인 거리
    pub score: f32,
    /// 소스 테이블 내 행 ID
    pub row_id: i64,
}

/// 소스 실패 원인
#[derive(Debug)]
pub enum SourceFailure {
    /// 전체 질의 타임아웃 안에 끝나지 않음
    TimedOut,
    Failed(RagError),
    /// 같은 모델의 질의 임베딩이 다른 소스에서 이미 실패 (에러는 그 소스에 기록)
    EmbeddingFailed { model_id: String, kind: ErrorKind },
}

impl SourceFailure {
    pub fn error(&self) -> Option<&RagError> {
        match self {
            Self::Failed(e) => Some(e),
            Self::TimedOut | Self::EmbeddingFailed { .. } => None,
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::TimedOut => None,
            Self::Failed(e) => Some(e.kind()),
            Self::EmbeddingFailed { kind, .. } => Some(*kind),
        }
    }
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => f.write_str("timed out"),
            Self::Failed(e) => write!(f, "{}", e),
            Self::EmbeddingFailed { model_id, .. } => {
                write!(f, "query embedding with {} failed", model_id)
            }
        }
    }
}

/// 모델별 질의 임베딩 (실패하면 에러 분류만 남김)
type QueryVector = OnceCell<std::result::Result<Vec<f32>, ErrorKind>>;

/// 검색에서 빠진 소스
#[derive(Debug)]
pub struct DegradedSource {
    pub table_name: TableName,
    /// 카탈로그에 없으면 None
    pub source_name: Option<String>,
    pub failure: SourceFailure,
}

/// 다중 소스 검색 결과
#[derive(Debug, Default)]
pub struct RetrievalOutcome {
    /// score 내림차순
    pub hits: Vec<RankedChunk>,
    pub degraded: Vec<DegradedSource>,
}

impl RetrievalOutcome {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// 생성 단계에 넘길 컨텍스트
#[derive(Debug)]
pub enum ContextOutcome {
    /// 관련 청크 있음 (일부 소스 실패 가능)
    Found {
        hits: Vec<RankedChunk>,
        degraded: Vec<DegradedSource>,
    },
    /// 검색은 성공했지만 결과 없음
    NoRelevantContext { degraded: Vec<DegradedSource> },
    /// 모든 소스 실패 - 컨텍스트를 구할 수 없음
    Unavailable { degraded: Vec<DegradedSource> },
}

// ============================================================================
// Retriever
// ============================================================================

/// 다중 소스 검색기
pub struct Retriever {
    registry: Arc<EmbedderRegistry>,
    credentials: Arc<dyn CredentialStore>,
    default_limit: usize,
    timeout: Duration,
}

impl Retriever {
    pub fn new(
        registry: Arc<EmbedderRegistry>,
        credentials: Arc<dyn CredentialStore>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            registry,
            credentials,
            default_limit: config.default_limit,
            timeout: config.query_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 다중 소스 검색
    ///
    /// 일부 소스 실패는 `degraded`로 보고합니다. 요청한 소스가 전부 에러로
    /// 실패하면 첫 번째 소스의 에러를 돌려줍니다.
    pub async fn query(
        &self,
        store: &TenantStore,
        tables: &[TableName],
        query_text: &str,
        limit: Option<usize>,
    ) -> Result<RetrievalOutcome> {
        let tables = unique(tables);
        let mut outcome = self.fan_out(store, &tables, query_text, limit).await?;

        let all_failed = !tables.is_empty() && outcome.hits.is_empty() && {
            outcome.degraded.len() == tables.len()
                && outcome
                    .degraded
                    .iter()
                    .all(|d| !matches!(d.failure, SourceFailure::TimedOut))
        };
        if all_failed {
            if let Some(index) = outcome.degraded.iter().position(|d| d.failure.error().is_some()) {
                if let SourceFailure::Failed(e) = outcome.degraded.remove(index).failure {
                    return Err(e);
                }
            }
        }

        Ok(outcome)
    }

    /// 생성 단계용 검색 (소스 실패로는 에러를 내지 않음)
    pub async fn retrieve_context(
        &self,
        store: &TenantStore,
        tables: &[TableName],
        query_text: &str,
        limit: Option<usize>,
    ) -> Result<ContextOutcome> {
        let tables = unique(tables);
        let outcome = self.fan_out(store, &tables, query_text, limit).await?;

        if !outcome.hits.is_empty() {
            return Ok(ContextOutcome::Found {
                hits: outcome.hits,
                degraded: outcome.degraded,
            });
        }

        if !tables.is_empty() && outcome.degraded.len() == tables.len() {
            tracing::warn!("No context available: all {} sources failed", tables.len());
            return Ok(ContextOutcome::Unavailable {
                degraded: outcome.degraded,
            });
        }

        Ok(ContextOutcome::NoRelevantContext {
            degraded: outcome.degraded,
        })
    }

    /// 소스별 검색 → 병합 (설정 오류만 에러)
    async fn fan_out(
        &self,
        store: &TenantStore,
        tables: &[TableName],
        query_text: &str,
        limit: Option<usize>,
    ) -> Result<RetrievalOutcome> {
        if query_text.trim().is_empty() {
            return Err(ConfigError::EmptyQuery.into());
        }
        let limit = limit.unwrap_or(self.default_limit);
        if limit == 0 {
            return Err(ConfigError::InvalidLimit.into());
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut degraded: Vec<(usize, DegradedSource)> = Vec::new();

        // 카탈로그 조회 (없는 테이블은 바로 degraded)
        let mut found: Vec<(usize, KnowledgeSource)> = Vec::with_capacity(tables.len());
        for (position, table) in tables.iter().enumerate() {
            let failure: RagError = match store.catalog().get_by_table(table) {
                Ok(Some(source)) => {
                    found.push((position, source));
                    continue;
                }
                Ok(None) => StoreError::TableNotFound(table.to_string()).into(),
                Err(e) => e.into(),
            };
            tracing::warn!("Source {} skipped: {}", table, failure);
            degraded.push((
                position,
                DegradedSource {
                    table_name: table.clone(),
                    source_name: None,
                    failure: SourceFailure::Failed(failure),
                },
            ));
        }

        // 모델별 질의 임베딩 (한 번만 계산)
        let mut cells: HashMap<String, QueryVector> = HashMap::new();
        for (_, source) in &found {
            cells
                .entry(source.embedding_model_id.clone())
                .or_default();
        }

        let searches = found.iter().map(|(_, source)| {
            let cell = cells.get(&source.embedding_model_id);
            let search = async move {
                match cell {
                    Some(cell) => {
                        self.search_source(store, source, cell, query_text, limit)
                            .await
                    }
                    None => Err(SourceFailure::Failed(
                        ConfigError::UnknownModel(source.embedding_model_id.clone()).into(),
                    )),
                }
            };
            tokio::time::timeout_at(deadline, search)
        });
        let results = join_all(searches).await;

        let mut ranked: Vec<(usize, RankedChunk)> = Vec::new();
        for ((position, source), result) in found.into_iter().zip(results) {
            let failure = match result {
                Ok(Ok(hits)) => {
                    tracing::debug!("{} returned {} hits", source.table_name, hits.len());
                    ranked.extend(hits.into_iter().map(|hit| (position, attribute(&source, hit))));
                    continue;
                }
                Ok(Err(failure)) => {
                    tracing::warn!("Source {} failed: {}", source.table_name, failure);
                    failure
                }
                Err(_) => {
                    tracing::warn!("Source {} timed out after {:?}", source.table_name, self.timeout);
                    SourceFailure::TimedOut
                }
            };
            degraded.push((
                position,
                DegradedSource {
                    table_name: source.table_name,
                    source_name: Some(source.display_name),
                    failure,
                },
            ));
        }

        degraded.sort_by_key(|(position, _)| *position);
        let mut outcome = RetrievalOutcome {
            hits: Vec::new(),
            degraded: degraded.into_iter().map(|(_, d)| d).collect(),
        };

        // score 내림차순 → 요청 순서 → 행 ID
        ranked.sort_by(|(pa, a), (pb, b)| {
            b.score
                .total_cmp(&a.score)
                .then(pa.cmp(pb))
                .then(a.row_id.cmp(&b.row_id))
        });
        ranked.truncate(limit);
        outcome.hits = ranked.into_iter().map(|(_, hit)| hit).collect();

        tracing::info!(
            "Query over {} sources returned {} hits ({} degraded)",
            tables.len(),
            outcome.hits.len(),
            outcome.degraded.len()
        );
        Ok(outcome)
    }

    async fn search_source(
        &self,
        store: &TenantStore,
        source: &KnowledgeSource,
        cell: &QueryVector,
        query_text: &str,
        limit: usize,
    ) -> std::result::Result<Vec<SimilarChunk>, SourceFailure> {
        let mut own_error = None;
        let slot = &mut own_error;
        let vector = cell
            .get_or_init(|| async move {
                match self.embed_query(store, &source.embedding_model_id, query_text).await {
                    Ok(vector) => Ok(vector),
                    Err(e) => {
                        let kind = e.kind();
                        *slot = Some(e);
                        Err(kind)
                    }
                }
            })
            .await;

        let vector = match (vector, own_error) {
            (Ok(vector), _) => vector,
            (Err(_), Some(e)) => return Err(SourceFailure::Failed(e)),
            (Err(kind), None) => {
                return Err(SourceFailure::EmbeddingFailed {
                    model_id: source.embedding_model_id.clone(),
                    kind: *kind,
                })
            }
        };

        store
            .tables()
            .search_similar(&source.table_name, vector, limit)
            .await
            .map_err(|e| SourceFailure::Failed(e.into()))
    }

    async fn embed_query(
        &self,
        store: &TenantStore,
        model_id: &str,
        query_text: &str,
    ) -> Result<Vec<f32>> {
        let embedder = self
            .registry
            .resolve(model_id, store.tenant(), self.credentials.as_ref())
            .await?;
        Ok(embedder.embed_query(query_text).await?)
    }
}

impl fmt::Debug for Retriever {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retriever")
            .field("default_limit", &self.default_limit)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// 중복 테이블 제거 (처음 나온 순서 유지)
fn unique(tables: &[TableName]) -> Vec<TableName> {
    let mut seen = HashSet::new();
    tables
        .iter()
        .filter(|table| seen.insert(table.as_str()))
        .cloned()
        .collect()
}

fn attribute(source: &KnowledgeSource, hit: SimilarChunk) -> RankedChunk {
    RankedChunk {
        content: hit.content,
        metadata: hit.metadata,
        source_id: source.id.clone(),
        source_name: source.display_name.clone(),
        table_name: source.table_name.clone(),
        score: hit.score,
        row_id: hit.id,
    }
}

// ============================================================================
// Tests
// ============================================================================
