//! KnowledgeService - 멀티 테넌트 지식 저장소의 공개 진입점
//!
//! 테넌트별 핸들(`TenantStore`)을 열고 닫는 수명 주기를 이 객체가 소유합니다.
//! 전역 연결 캐시는 없고, 서비스 인스턴스마다 자기 캐시를 가집니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let service = KnowledgeService::from_config(RagConfig::load(None)?)?;
//! let tenant = TenantId::parse("acme")?;
//! let registered = service.register_source(&tenant, &spec).await?;
//! let outcome = service
//!     .query(&tenant, &[registered.source.table_name.as_str()], "question", None)
//!     .await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::RagConfig;
use crate::embedding::{CredentialStore, Embedder, EmbedderRegistry, EnvCredentialStore};
use crate::error::{ConfigError, RagError, Result, StoreError};
use crate::ident::{TableName, TenantId};
use crate::ingest::{Ingestor, RegisteredSource};
use crate::knowledge::SimilarChunk;
use crate::loader::{build_loader, SourceSpec};
use crate::retrieval::{
    ContextOutcome, DegradedSource, RetrievalOutcome, Retriever, SourceFailure,
};
use crate::tenant::{IngestionRun, KnowledgeSource, TenantAdmin, TenantStore};

/// 멀티 테넌트 지식 서비스
pub struct KnowledgeService {
    config: RagConfig,
    admin: TenantAdmin,
    registry: Arc<EmbedderRegistry>,
    credentials: Arc<dyn CredentialStore>,
    ingestor: Ingestor,
    retriever: Retriever,
    stores: RwLock<HashMap<TenantId, Arc<TenantStore>>>,
}

impl KnowledgeService {
    pub fn new(
        config: RagConfig,
        registry: EmbedderRegistry,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(registry);

        Ok(Self {
            admin: TenantAdmin::new(&config.data_dir),
            ingestor: Ingestor::from_config(&config)?,
            retriever: Retriever::new(registry.clone(), credentials.clone(), &config.retrieval),
            registry,
            credentials,
            stores: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// 기본 모델 + 환경 변수 자격 증명
    pub fn from_config(config: RagConfig) -> Result<Self> {
        Self::new(
            config,
            EmbedderRegistry::with_defaults(),
            Arc::new(EnvCredentialStore::new()),
        )
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn registry(&self) -> &EmbedderRegistry {
        &self.registry
    }

    // ========================================================================
    // Tenant lifecycle
    // ========================================================================

    /// 테넌트 저장소 보장 (멱등) + 핸들 열기
    pub async fn ensure_tenant_store(&self, tenant: &TenantId) -> Result<Arc<TenantStore>> {
        if let Some(store) = self.stores.read().await.get(tenant) {
            return Ok(store.clone());
        }

        let mut stores = self.stores.write().await;
        if let Some(store) = stores.get(tenant) {
            return Ok(store.clone());
        }

        let dir = self.admin.provision(tenant).await?;
        let store = Arc::new(TenantStore::open(tenant.clone(), dir).await?);
        stores.insert(tenant.clone(), store.clone());
        Ok(store)
    }

    /// 이미 프로비저닝된 테넌트만 열기 (없으면 None, 새로 만들지 않음)
    pub async fn tenant_store(&self, tenant: &TenantId) -> Result<Option<Arc<TenantStore>>> {
        if let Some(store) = self.stores.read().await.get(tenant) {
            return Ok(Some(store.clone()));
        }
        if !self.admin.exists(tenant).await {
            return Ok(None);
        }
        self.ensure_tenant_store(tenant).await.map(Some)
    }

    pub async fn list_tenants(&self) -> Result<Vec<TenantId>> {
        Ok(self.admin.list_tenants().await?)
    }

    /// 캐시된 핸들 해제
    pub async fn close_tenant(&self, tenant: &TenantId) -> bool {
        let closed = self.stores.write().await.remove(tenant).is_some();
        if closed {
            tracing::debug!("Closed tenant store {}", tenant);
        }
        closed
    }

    /// 핸들 해제 + 테넌트 저장소 삭제
    pub async fn teardown_tenant(&self, tenant: &TenantId) -> Result<bool> {
        self.close_tenant(tenant).await;
        Ok(self.admin.destroy(tenant).await?)
    }

    // ========================================================================
    // Sources
    // ========================================================================

    /// 소스 등록 (설정 검증 → 테넌트 보장 → 인제스트)
    pub async fn register_source(
        &self,
        tenant: &TenantId,
        spec: &SourceSpec,
    ) -> Result<RegisteredSource> {
        spec.validate()?;
        build_loader(spec.source_kind, &spec.connection_settings, &self.config.loader)?;
        let embedder = self.resolve_embedder(&spec.embedding_model_id, tenant).await?;

        let store = self.ensure_tenant_store(tenant).await?;
        self.ingestor.register(&store, spec, embedder).await
    }

    /// 소스 삭제 (테이블 먼저, 그 다음 카탈로그 행)
    ///
    /// 카탈로그 행을 지웠으면 true.
    pub async fn delete_source(&self, tenant: &TenantId, table: &str) -> Result<bool> {
        let table = TableName::parse(table)?;
        let Some(store) = self.tenant_store(tenant).await? else {
            return Ok(false);
        };

        store.tables().drop_source_table(&table).await?;
        let removed = store.catalog().delete_by_table(&table)?;
        tracing::info!("Deleted source {} for tenant {} (catalog row: {})", table, tenant, removed);
        Ok(removed)
    }

    /// 소스를 다른 임베딩 모델로 재임베딩
    pub async fn reembed_source(
        &self,
        tenant: &TenantId,
        table: &str,
        model_id: &str,
    ) -> Result<RegisteredSource> {
        let table = TableName::parse(table)?;
        let store = self
            .tenant_store(tenant)
            .await?
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let source = store
            .catalog()
            .get_by_table(&table)?
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;

        let embedder = self.resolve_embedder(model_id, tenant).await?;
        self.ingestor.reembed(&store, &source, embedder).await
    }

    pub async fn list_sources(&self, tenant: &TenantId) -> Result<Vec<KnowledgeSource>> {
        match self.tenant_store(tenant).await? {
            Some(store) => Ok(store.catalog().list_sources()?),
            None => Ok(vec![]),
        }
    }

    pub async fn get_source(
        &self,
        tenant: &TenantId,
        table: &str,
    ) -> Result<Option<KnowledgeSource>> {
        let table = TableName::parse(table)?;
        match self.tenant_store(tenant).await? {
            Some(store) => Ok(store.catalog().get_by_table(&table)?),
            None => Ok(None),
        }
    }

    /// 소스의 인제스트 이력 (최신순)
    pub async fn ingestion_history(
        &self,
        tenant: &TenantId,
        source_id: &str,
    ) -> Result<Vec<IngestionRun>> {
        match self.tenant_store(tenant).await? {
            Some(store) => Ok(store.catalog().list_ingestions(source_id)?),
            None => Ok(vec![]),
        }
    }

    // ========================================================================
    // Retrieval
    // ========================================================================

    /// 다중 소스 검색 (전부 실패하면 첫 소스의 에러)
    pub async fn query<S: AsRef<str>>(
        &self,
        tenant: &TenantId,
        tables: &[S],
        query_text: &str,
        limit: Option<usize>,
    ) -> Result<RetrievalOutcome> {
        let tables = parse_tables(tables)?;
        match self.tenant_store(tenant).await? {
            Some(store) => {
                self.retriever
                    .query(&store, &tables, query_text, limit)
                    .await
            }
            None => {
                validate_query(query_text, limit)?;
                match tables.first() {
                    Some(first) => Err(StoreError::TableNotFound(first.to_string()).into()),
                    None => Ok(RetrievalOutcome::default()),
                }
            }
        }
    }

    /// 생성 단계용 검색 (소스 실패는 `ContextOutcome`으로 보고)
    pub async fn retrieve_context<S: AsRef<str>>(
        &self,
        tenant: &TenantId,
        tables: &[S],
        query_text: &str,
        limit: Option<usize>,
    ) -> Result<ContextOutcome> {
        let tables = parse_tables(tables)?;
        match self.tenant_store(tenant).await? {
            Some(store) => {
                self.retriever
                    .retrieve_context(&store, &tables, query_text, limit)
                    .await
            }
            None => {
                validate_query(query_text, limit)?;
                if tables.is_empty() {
                    return Ok(ContextOutcome::NoRelevantContext { degraded: vec![] });
                }
                let degraded = tables
                    .into_iter()
                    .map(|table| DegradedSource {
                        failure: SourceFailure::Failed(
                            StoreError::TableNotFound(table.to_string()).into(),
                        ),
                        table_name: table,
                        source_name: None,
                    })
                    .collect();
                Ok(ContextOutcome::Unavailable { degraded })
            }
        }
    }

    // ========================================================================
    // Table-level operations
    // ========================================================================

    /// 소스 테이블 직접 생성 (없으면 테넌트도 프로비저닝)
    pub async fn create_source_table(&self, tenant: &TenantId, table: &str, dim: i64) -> Result<()> {
        let table = TableName::parse(table)?;
        if dim <= 0 {
            return Err(ConfigError::InvalidDimension(dim).into());
        }
        let store = self.ensure_tenant_store(tenant).await?;
        Ok(store
            .tables()
            .create_source_table(&table, dim as usize)
            .await?)
    }

    /// 소스 테이블 직접 삭제 (없어도 성공)
    pub async fn drop_source_table(&self, tenant: &TenantId, table: &str) -> Result<()> {
        let table = TableName::parse(table)?;
        match self.tenant_store(tenant).await? {
            Some(store) => Ok(store.tables().drop_source_table(&table).await?),
            None => Ok(()),
        }
    }

    /// 단일 테이블 유사도 검색
    pub async fn search_similar(
        &self,
        tenant: &TenantId,
        table: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<SimilarChunk>> {
        let table = TableName::parse(table)?;
        if limit == 0 {
            return Err(ConfigError::InvalidLimit.into());
        }
        let store = self
            .tenant_store(tenant)
            .await?
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        Ok(store.tables().search_similar(&table, query, limit).await?)
    }

    async fn resolve_embedder(
        &self,
        model_id: &str,
        tenant: &TenantId,
    ) -> Result<Arc<dyn Embedder>> {
        self.registry
            .resolve(model_id, tenant, self.credentials.as_ref())
            .await
    }
}

impl std::fmt::Debug for KnowledgeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeService")
            .field("data_dir", &self.config.data_dir)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn parse_tables<S: AsRef<str>>(tables: &[S]) -> Result<Vec<TableName>> {
    tables
        .iter()
        .map(|t| TableName::parse(t.as_ref()).map_err(RagError::from))
        .collect()
}

fn validate_query(query_text: &str, limit: Option<usize>) -> Result<()> {
    if query_text.trim().is_empty() {
        return Err(ConfigError::EmptyQuery.into());
    }
    if limit == Some(0) {
        return Err(ConfigError::InvalidLimit.into());
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
