//! 인제스트 파이프라인 - 로드 → 청킹 → 임베딩 → 저장
//!
//! 소스 등록 시 새 테이블을 만들어 채우고, 완전히 채워진 뒤에만 카탈로그 행을
//! 삽입합니다. 중간에 실패하면 만들던 테이블을 지우고 실패한 실행을 기록하므로,
//! 반쯤 채워진 소스는 남지 않습니다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::Value;

use crate::config::{LoaderConfig, RagConfig};
use crate::embedding::{with_backoff, Embedder, RetryPolicy};
use crate::error::{ProviderError, RagError, Result};
use crate::ident::TableName;
use crate::knowledge::{ChunkRecord, Chunker, Metadata, WindowChunker};
use crate::loader::{build_loader, LoadOutcome, SkippedDocument, SourceKind, SourceSpec};
use crate::tenant::{KnowledgeSource, NewIngestionRun, RunStatus, TenantStore};

// ============================================================================
// Report Types
// ============================================================================

/// 인제스트 결과 보고서
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionReport {
    pub documents_total: usize,
    pub documents_loaded: usize,
    pub documents_skipped: usize,
    pub skipped: Vec<SkippedDocument>,
    pub chunk_count: usize,
    pub total_bytes: u64,
    /// 로드된 문서의 문자 수 (청킹 단위와 동일)
    pub total_chars: usize,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl IngestionReport {
    fn record_load(&mut self, outcome: &LoadOutcome) {
        self.documents_total = outcome.documents_total;
        self.documents_loaded = outcome.documents_loaded();
        self.documents_skipped = outcome.skipped.len();
        self.skipped = outcome.skipped.clone();
        self.total_bytes = outcome.total_bytes;
        self.total_chars = outcome.total_chars();
    }

    fn to_run(
        &self,
        source_id: Option<String>,
        table: &TableName,
        started_at: chrono::DateTime<Utc>,
        error: Option<&RagError>,
    ) -> NewIngestionRun {
        NewIngestionRun {
            source_id,
            table_name: table.clone(),
            documents_total: self.documents_total,
            documents_loaded: self.documents_loaded,
            documents_skipped: self.documents_skipped,
            chunk_count: self.chunk_count,
            total_bytes: self.total_bytes,
            total_chars: self.total_chars,
            status: if error.is_some() {
                RunStatus::Failed
            } else {
                RunStatus::Succeeded
            },
            error: error.map(|e| e.to_string()),
            started_at,
            finished_at: Utc::now(),
        }
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// 등록된 소스 + 보고서
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredSource {
    pub source: KnowledgeSource,
    pub report: IngestionReport,
}

/// 임베딩 대기 중인 청크
struct PendingChunk {
    text: String,
    metadata: Metadata,
}

// ============================================================================
// Ingestor
// ============================================================================

/// 인제스트 실행기
#[derive(Debug, Clone)]
pub struct Ingestor {
    chunker: WindowChunker,
    loader: LoaderConfig,
    batch_size: usize,
    concurrency: usize,
    retry: RetryPolicy,
}

impl Ingestor {
    pub fn from_config(config: &RagConfig) -> Result<Self> {
        Ok(Self {
            chunker: WindowChunker::from_config(&config.chunking)?,
            loader: config.loader.clone(),
            batch_size: config.ingestion.embed_batch_size.max(1),
            concurrency: config.ingestion.embed_concurrency.max(1),
            retry: RetryPolicy::from_config(&config.ingestion),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 새 소스 등록 (새 테이블 생성 + 채우기 + 카탈로그 행 삽입)
    pub async fn register(
        &self,
        store: &TenantStore,
        spec: &SourceSpec,
        embedder: Arc<dyn Embedder>,
    ) -> Result<RegisteredSource> {
        spec.validate()?;
        let table = TableName::generate(store.tenant(), &spec.display_name)?;
        let started_at = Utc::now();
        let started = Instant::now();
        let mut report = IngestionReport::default();

        tracing::info!(
            "Registering source '{}' ({}) for tenant {} as {}",
            spec.display_name,
            spec.source_kind,
            store.tenant(),
            table
        );

        let result: Result<KnowledgeSource> = async {
            self.populate(
                store,
                &table,
                spec.source_kind,
                &spec.connection_settings,
                embedder.as_ref(),
                &mut report,
            )
            .await?;

            let now = Utc::now();
            let source = KnowledgeSource {
                id: uuid::Uuid::new_v4().to_string(),
                tenant_id: store.tenant().clone(),
                display_name: spec.display_name.trim().to_string(),
                source_kind: spec.source_kind,
                connection_settings: spec.connection_settings.clone(),
                embedding_model_id: spec.embedding_model_id.clone(),
                table_name: table.clone(),
                embedding_dimension: embedder.dimension(),
                created_at: now,
                updated_at: now,
            };

            if let Err(e) = store.catalog().insert_source(&source) {
                discard_table(store, &table).await;
                return Err(e.into());
            }
            Ok(source)
        }
        .await;

        report.elapsed = started.elapsed();

        match result {
            Ok(source) => {
                record_run(store, &report.to_run(Some(source.id.clone()), &table, started_at, None));
                tracing::info!(
                    "Registered source {} ({} chunks from {}/{} documents in {:?})",
                    table,
                    report.chunk_count,
                    report.documents_loaded,
                    report.documents_total,
                    report.elapsed
                );
                Ok(RegisteredSource { source, report })
            }
            Err(e) => {
                record_run(store, &report.to_run(None, &table, started_at, Some(&e)));
                tracing::warn!("Ingestion of '{}' failed: {}", spec.display_name, e);
                Err(e)
            }
        }
    }

    /// 기존 소스를 새 모델로 재임베딩
    ///
    /// 새 테이블을 채운 뒤 카탈로그 행을 한 번에 옮기고, 그 다음 옛 테이블을
    /// 지웁니다. 실패하면 새 테이블만 지우고 기존 소스는 그대로 둡니다.
    pub async fn reembed(
        &self,
        store: &TenantStore,
        source: &KnowledgeSource,
        embedder: Arc<dyn Embedder>,
    ) -> Result<RegisteredSource> {
        let table = TableName::generate(store.tenant(), &source.display_name)?;
        let started_at = Utc::now();
        let started = Instant::now();
        let mut report = IngestionReport::default();

        tracing::info!(
            "Re-embedding {} with {} into {}",
            source.table_name,
            embedder.model_id(),
            table
        );

        let result: Result<()> = async {
            self.populate(
                store,
                &table,
                source.source_kind,
                &source.connection_settings,
                embedder.as_ref(),
                &mut report,
            )
            .await?;

            let repointed = store
                .catalog()
                .repoint(
                    &source.id,
                    &source.table_name,
                    &table,
                    embedder.model_id(),
                    embedder.dimension(),
                );
            match repointed {
                Ok(true) => Ok(()),
                Ok(false) => {
                    tracing::warn!(
                        "Source {} no longer points at {}, discarding {}",
                        source.id,
                        source.table_name,
                        table
                    );
                    discard_table(store, &table).await;
                    Err(RagError::Store(crate::error::StoreError::TableNotFound(
                        source.table_name.to_string(),
                    )))
                }
                Err(e) => {
                    discard_table(store, &table).await;
                    Err(e.into())
                }
            }
        }
        .await;

        report.elapsed = started.elapsed();

        match result {
            Ok(()) => {
                discard_table(store, &source.table_name).await;
                record_run(store, &report.to_run(Some(source.id.clone()), &table, started_at, None));

                let updated = store
                    .catalog()
                    .get_by_id(&source.id)?
                    .ok_or_else(|| crate::error::StoreError::TableNotFound(table.to_string()))?;
                Ok(RegisteredSource {
                    source: updated,
                    report,
                })
            }
            Err(e) => {
                record_run(
                    store,
                    &report.to_run(Some(source.id.clone()), &table, started_at, Some(&e)),
                );
                tracing::warn!("Re-embedding of {} failed: {}", source.table_name, e);
                Err(e)
            }
        }
    }

    /// 로드 → 청킹 → 임베딩 → 테이블 생성/삽입
    ///
    /// 테이블은 임베딩이 모두 끝난 뒤에 만들어지고, 삽입이 실패하면 지워집니다.
    async fn populate(
        &self,
        store: &TenantStore,
        table: &TableName,
        kind: SourceKind,
        settings: &Value,
        embedder: &dyn Embedder,
        report: &mut IngestionReport,
    ) -> Result<()> {
        let loader = build_loader(kind, settings, &self.loader)?;
        let outcome = loader.load().await?;
        report.record_load(&outcome);

        let pending = self.chunk(&outcome);
        report.chunk_count = pending.len();
        if pending.is_empty() {
            return Err(RagError::NoContent(table.to_string()));
        }
        tracing::debug!(
            "Split {} documents into {} chunks",
            outcome.documents_loaded(),
            pending.len()
        );

        let texts: Vec<String> = pending.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embed_all(embedder, texts).await?;

        let records: Vec<ChunkRecord> = pending
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| ChunkRecord {
                content: chunk.text,
                metadata: chunk.metadata,
                embedding,
            })
            .collect();

        let tables = store.tables();
        tables
            .create_source_table(table, embedder.dimension())
            .await?;

        if let Err(e) = tables.store_chunks(table, &records).await {
            discard_table(store, table).await;
            return Err(e.into());
        }

        Ok(())
    }

    /// 문서별 청킹 (청크 메타데이터 = 문서 출처 + 위치)
    fn chunk(&self, outcome: &LoadOutcome) -> Vec<PendingChunk> {
        let mut pending = Vec::new();

        for (doc_index, doc) in outcome.documents.iter().enumerate() {
            if doc.text.trim().is_empty() {
                continue;
            }

            for chunk in self.chunker.split(&doc.text) {
                let mut metadata = doc.metadata.clone();
                metadata.insert("document_index".to_string(), Value::from(doc_index));
                metadata.insert("chunk_index".to_string(), Value::from(chunk.index));
                metadata.insert("char_start".to_string(), Value::from(chunk.char_start));
                metadata.insert("char_end".to_string(), Value::from(chunk.char_end));

                pending.push(PendingChunk {
                    text: chunk.text,
                    metadata,
                });
            }
        }

        pending
    }

    /// 배치 단위 임베딩 (동시 실행 수 제한, 일시적 실패는 백오프 재시도)
    async fn embed_all(
        &self,
        embedder: &dyn Embedder,
        texts: Vec<String>,
    ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        let batches: Vec<Vec<String>> = texts
            .chunks(self.batch_size)
            .map(<[String]>::to_vec)
            .collect();
        let total = batches.len();
        let retry = self.retry;

        let results: Vec<Vec<Vec<f32>>> = stream::iter(batches.into_iter().enumerate())
            .map(|(i, batch)| async move {
                let what = format!("embedding batch {}/{}", i + 1, total);
                let vectors = with_backoff(&retry, &what, || embedder.embed_batch(&batch)).await?;
                if vectors.len() != batch.len() {
                    return Err(ProviderError::InvalidResponse {
                        provider: embedder.model_id().to_string(),
                        message: format!(
                            "expected {} embeddings, got {}",
                            batch.len(),
                            vectors.len()
                        ),
                    });
                }
                tracing::debug!("Embedded batch {}/{} ({} chunks)", i + 1, total, batch.len());
                Ok(vectors)
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        Ok(results.into_iter().flatten().collect())
    }
}

/// 테이블 삭제 (실패는 로그만)
async fn discard_table(store: &TenantStore, table: &TableName) {
    if let Err(e) = store.tables().drop_source_table(table).await {
        tracing::warn!("Failed to drop table {}: {}", table, e);
    }
}

/// 실행 기록 (실패해도 원래 결과를 가리지 않음)
fn record_run(store: &TenantStore, run: &NewIngestionRun) {
    if let Err(e) = store.catalog().record_ingestion(run) {
        tracing::warn!("Failed to record ingestion run for {}: {}", run.table_name, e);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::error::StoreError;
    use crate::ident::TenantId;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// 선언한 차원과 다른 길이의 벡터를 돌려주는 임베더
    struct WrongLengthEmbedder;

    #[async_trait]
    impl Embedder for WrongLengthEmbedder {
        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
            Ok(vec![0.1; 5])
        }

        fn dimension(&self) -> usize {
            8
        }

        fn model_id(&self) -> &str {
            "wrong-length"
        }
    }

    /// 항상 인증 실패
    struct RejectingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for RejectingEmbedder {
        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::InvalidCredential {
                provider: "test".to_string(),
                status: 401,
            })
        }

        fn dimension(&self) -> usize {
            8
        }

        fn model_id(&self) -> &str {
            "rejecting"
        }
    }

    async fn open_store(dir: &TempDir) -> TenantStore {
        let tenant = TenantId::parse("acme").unwrap();
        let path = dir.path().join("acme");
        std::fs::create_dir_all(&path).unwrap();
        TenantStore::open(tenant, path).await.unwrap()
    }

    fn ingestor() -> Ingestor {
        let mut config = RagConfig::default();
        config.chunking.chunk_size = 40;
        config.chunking.overlap = 10;
        config.ingestion.embed_batch_size = 2;
        Ingestor::from_config(&config)
            .unwrap()
            .with_retry(RetryPolicy::none())
    }

    fn text_spec(documents: Value) -> SourceSpec {
        SourceSpec::new(
            "Product Docs",
            SourceKind::Text,
            json!({ "documents": documents }),
            "local-hash",
        )
    }

    #[tokio::test]
    async fn test_register_populates_table_and_catalog() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let embedder = Arc::new(HashingEmbedder::new("local-hash", 16));

        let registered = ingestor()
            .register(
                &store,
                &text_spec(json!([
                    "Alpha is the first letter.",
                    "Beta comes second in the alphabet and this sentence is long enough to split.",
                    "   "
                ])),
                embedder,
            )
            .await
            .unwrap();

        let report = &registered.report;
        assert_eq!(report.documents_total, 3);
        assert_eq!(report.documents_loaded, 3);
        assert!(report.chunk_count >= 3);

        let table = &registered.source.table_name;
        assert!(table.as_str().starts_with("vector_acme_"));
        assert_eq!(store.tables().count(table).await.unwrap(), report.chunk_count);
        assert_eq!(registered.source.embedding_dimension, 16);

        let stored = store.catalog().get_by_table(table).unwrap().unwrap();
        assert_eq!(stored.id, registered.source.id);

        let runs = store.catalog().list_ingestions(&stored.id).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Succeeded);
        assert_eq!(runs[0].chunk_count, report.chunk_count);
    }

    #[tokio::test]
    async fn test_chunk_metadata_carries_provenance() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let embedder = Arc::new(HashingEmbedder::new("local-hash", 16));

        let registered = ingestor()
            .register(
                &store,
                &text_spec(json!(["apples and oranges", "the quick brown fox"])),
                embedder.clone(),
            )
            .await
            .unwrap();

        let query = embedder.embed("the quick brown fox").await.unwrap();
        let hits = store
            .tables()
            .search_similar(&registered.source.table_name, &query, 1)
            .await
            .unwrap();
        assert_eq!(hits[0].content, "the quick brown fox");
        assert_eq!(hits[0].metadata["document_index"], json!(1));
        assert_eq!(hits[0].metadata["chunk_index"], json!(0));
        assert_eq!(hits[0].metadata["source"], json!("inline"));
        assert!(hits[0].metadata.contains_key("content_hash"));
    }

    #[tokio::test]
    async fn test_no_content_fails_without_table() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let result = ingestor()
            .register(
                &store,
                &text_spec(json!(["", "  \n "])),
                Arc::new(HashingEmbedder::new("local-hash", 16)),
            )
            .await;

        assert!(matches!(result, Err(RagError::NoContent(_))));
        assert!(store.tables().list_tables().await.unwrap().is_empty());
        assert!(store.catalog().list_sources().unwrap().is_empty());

        let runs = store.catalog().recent_ingestions(10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].source_id.is_none());
    }

    #[tokio::test]
    async fn test_wrong_dimension_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let result = ingestor()
            .register(
                &store,
                &text_spec(json!(["some text"])),
                Arc::new(WrongLengthEmbedder),
            )
            .await;

        assert!(matches!(
            result,
            Err(RagError::Store(StoreError::DimensionMismatch { .. }))
        ));
        assert!(store.tables().list_tables().await.unwrap().is_empty());
        assert!(store.catalog().list_sources().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_is_not_retried_when_fatal() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let embedder = Arc::new(RejectingEmbedder {
            calls: AtomicUsize::new(0),
        });

        let result = ingestor()
            .with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
            .register(&store, &text_spec(json!(["some text"])), embedder.clone())
            .await;

        assert!(matches!(
            result,
            Err(RagError::Provider(ProviderError::InvalidCredential { .. }))
        ));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        assert!(store.tables().list_tables().await.unwrap().is_empty());

        let runs = store.catalog().recent_ingestions(10).unwrap();
        assert!(runs[0].error.as_deref().unwrap_or("").contains("rejected"));
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_before_loading() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let spec = SourceSpec::new("Site", SourceKind::WebScraper, json!({}), "local-hash");
        let result = ingestor()
            .register(&store, &spec, Arc::new(HashingEmbedder::new("local-hash", 16)))
            .await;
        assert!(matches!(result, Err(RagError::Config(_))));
    }

    #[tokio::test]
    async fn test_reembed_moves_source_to_new_table() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let ingestor = ingestor();

        let original = ingestor
            .register(
                &store,
                &text_spec(json!(["first doc", "second doc"])),
                Arc::new(HashingEmbedder::new("local-hash", 16)),
            )
            .await
            .unwrap();

        let reembedded = ingestor
            .reembed(
                &store,
                &original.source,
                Arc::new(HashingEmbedder::new("local-hash-wide", 32)),
            )
            .await
            .unwrap();

        let old_table = &original.source.table_name;
        let new_table = &reembedded.source.table_name;
        assert_ne!(old_table, new_table);
        assert_eq!(reembedded.source.id, original.source.id);
        assert_eq!(reembedded.source.embedding_model_id, "local-hash-wide");
        assert_eq!(reembedded.source.embedding_dimension, 32);

        assert!(!store.tables().table_exists(old_table).await.unwrap());
        assert_eq!(store.tables().table_dimension(new_table).await.unwrap(), 32);
        assert!(store.catalog().get_by_table(old_table).unwrap().is_none());

        let runs = store.catalog().list_ingestions(&original.source.id).unwrap();
        assert_eq!(runs.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_reembed_keeps_original() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let ingestor = ingestor();

        let original = ingestor
            .register(
                &store,
                &text_spec(json!(["first doc"])),
                Arc::new(HashingEmbedder::new("local-hash", 16)),
            )
            .await
            .unwrap();

        let result = ingestor
            .reembed(&store, &original.source, Arc::new(WrongLengthEmbedder))
            .await;
        assert!(result.is_err());

        let table = &original.source.table_name;
        assert!(store.tables().table_exists(table).await.unwrap());
        assert_eq!(store.tables().list_tables().await.unwrap().len(), 1);
        let stored = store.catalog().get_by_table(table).unwrap().unwrap();
        assert_eq!(stored.embedding_model_id, "local-hash");
    }

    #[tokio::test]
    async fn test_stale_reembed_discards_its_table() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let ingestor = ingestor();

        let original = ingestor
            .register(
                &store,
                &text_spec(json!(["first doc"])),
                Arc::new(HashingEmbedder::new("local-hash", 16)),
            )
            .await
            .unwrap();

        let first = ingestor
            .reembed(
                &store,
                &original.source,
                Arc::new(HashingEmbedder::new("local-hash-wide", 32)),
            )
            .await
            .unwrap();

        // 같은 (이제 낡은) 스냅샷으로 다시 재임베딩
        let second = ingestor
            .reembed(
                &store,
                &original.source,
                Arc::new(HashingEmbedder::new("local-hash-wide", 32)),
            )
            .await;
        assert!(matches!(
            second,
            Err(RagError::Store(StoreError::TableNotFound(_)))
        ));

        let tables = store.tables().list_tables().await.unwrap();
        let sources = store.catalog().list_sources().unwrap();
        assert_eq!(tables.len(), sources.len());
        assert_eq!(tables, vec![first.source.table_name.to_string()]);
        assert_eq!(sources[0].table_name, first.source.table_name);
    }
}
