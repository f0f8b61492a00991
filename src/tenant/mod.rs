//! Tenant 모듈 - 테넌트별 격리 저장소
//!
//! 테넌트 하나 = 디렉토리 하나:
//!
//! ```text
//! <data_dir>/tenants/<tenant_id>/
//!     vectors.lance/   # LanceDB (소스별 벡터 테이블)
//!     catalog.db       # SQLite (소스 카탈로그 + 인제스트 이력)
//! ```
//!
//! `TenantAdmin`만 루트 디렉토리를 알고, 테넌트 범위 코드는 자기 디렉토리에
//! 묶인 `TenantStore`만 받습니다.

pub mod catalog;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub use catalog::{IngestionRun, KnowledgeSource, NewIngestionRun, RunStatus, SourceCatalog};

use crate::error::StoreError;
use crate::ident::TenantId;
use crate::knowledge::{LanceSourceTables, SourceTables};

const TENANTS_DIR: &str = "tenants";
const VECTORS_DIR: &str = "vectors.lance";
const CATALOG_FILE: &str = "catalog.db";

// ============================================================================
// TenantAdmin
// ============================================================================

/// 관리자 핸들 - 테넌트 DB 생성/삭제 권한
#[derive(Debug, Clone)]
pub struct TenantAdmin {
    root: PathBuf,
}

impl TenantAdmin {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            root: data_dir.as_ref().join(TENANTS_DIR),
        }
    }

    fn tenant_dir(&self, tenant: &TenantId) -> PathBuf {
        self.root.join(tenant.as_str())
    }

    /// 테넌트 저장소 디렉토리 보장 (멱등)
    ///
    /// 동시에 호출되어도 `create_dir`의 원자성에 의존하며, "이미 존재"는 성공입니다.
    pub async fn provision(&self, tenant: &TenantId) -> Result<PathBuf, StoreError> {
        if let Err(e) = tokio::fs::create_dir_all(&self.root).await {
            return Err(match e.kind() {
                ErrorKind::PermissionDenied => StoreError::PermissionDenied {
                    path: self.root.clone(),
                    source: e,
                },
                _ => StoreError::AdminUnavailable {
                    path: self.root.clone(),
                    source: e,
                },
            });
        }

        let dir = self.tenant_dir(tenant);
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => tracing::info!("Provisioned tenant store for {}", tenant),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::debug!("Tenant store for {} already exists", tenant);
            }
            Err(e) => return Err(StoreError::io(&dir, e)),
        }

        Ok(dir)
    }

    /// 테넌트 저장소 존재 여부
    pub async fn exists(&self, tenant: &TenantId) -> bool {
        tokio::fs::metadata(self.tenant_dir(tenant))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// 테넌트 저장소 삭제 (없으면 false)
    pub async fn destroy(&self, tenant: &TenantId) -> Result<bool, StoreError> {
        let dir = self.tenant_dir(tenant);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!("Destroyed tenant store for {}", tenant);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&dir, e)),
        }
    }

    /// 프로비저닝된 테넌트 목록
    pub async fn list_tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(StoreError::io(&self.root, e)),
        };

        let mut tenants = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.root, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = TenantId::parse(name) {
                    tenants.push(id);
                }
            }
        }
        tenants.sort();
        Ok(tenants)
    }
}

// ============================================================================
// TenantStore
// ============================================================================

/// 테넌트 범위 핸들 - 해당 테넌트의 벡터 테이블과 카탈로그만 접근
pub struct TenantStore {
    tenant: TenantId,
    dir: PathBuf,
    tables: LanceSourceTables,
    catalog: SourceCatalog,
}

impl TenantStore {
    /// 프로비저닝된 디렉토리에서 열기 (벡터 DB + 카탈로그 스키마 초기화)
    pub async fn open(tenant: TenantId, dir: PathBuf) -> Result<Self, StoreError> {
        let tables = LanceSourceTables::open(&dir.join(VECTORS_DIR)).await?;
        let catalog = SourceCatalog::open(&dir.join(CATALOG_FILE))?;

        tracing::debug!("Opened tenant store {} at {:?}", tenant, dir);
        Ok(Self {
            tenant,
            dir,
            tables,
            catalog,
        })
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tables(&self) -> &dyn SourceTables {
        &self.tables
    }

    pub fn catalog(&self) -> &SourceCatalog {
        &self.catalog
    }
}

impl std::fmt::Debug for TenantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantStore")
            .field("tenant", &self.tenant)
            .field("dir", &self.dir)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::TableName;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let admin = TenantAdmin::new(dir.path());
        let tenant = TenantId::parse("t1").unwrap();

        let a = admin.provision(&tenant).await.unwrap();
        let b = admin.provision(&tenant).await.unwrap();
        assert_eq!(a, b);
        assert!(admin.exists(&tenant).await);
    }

    #[tokio::test]
    async fn test_concurrent_provision() {
        let dir = TempDir::new().unwrap();
        let admin = TenantAdmin::new(dir.path());
        let tenant = TenantId::parse("racer").unwrap();

        let results = futures::future::join_all((0..8).map(|_| admin.provision(&tenant))).await;
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_admin_unavailable() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let admin = TenantAdmin::new(&blocker);
        let tenant = TenantId::parse("t1").unwrap();
        let err = admin.provision(&tenant).await.unwrap_err();
        assert!(matches!(err, StoreError::AdminUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_destroy_and_list() {
        let dir = TempDir::new().unwrap();
        let admin = TenantAdmin::new(dir.path());
        assert!(admin.list_tenants().await.unwrap().is_empty());

        let t1 = TenantId::parse("t1").unwrap();
        let t2 = TenantId::parse("t2").unwrap();
        admin.provision(&t2).await.unwrap();
        admin.provision(&t1).await.unwrap();
        assert_eq!(admin.list_tenants().await.unwrap(), vec![t1.clone(), t2.clone()]);

        assert!(admin.destroy(&t1).await.unwrap());
        assert!(!admin.destroy(&t1).await.unwrap());
        assert_eq!(admin.list_tenants().await.unwrap(), vec![t2]);
    }

    #[tokio::test]
    async fn test_tenant_stores_are_isolated() {
        let dir = TempDir::new().unwrap();
        let admin = TenantAdmin::new(dir.path());
        let t1 = TenantId::parse("t1").unwrap();
        let t2 = TenantId::parse("t2").unwrap();

        let s1 = TenantStore::open(t1.clone(), admin.provision(&t1).await.unwrap())
            .await
            .unwrap();
        let s2 = TenantStore::open(t2.clone(), admin.provision(&t2).await.unwrap())
            .await
            .unwrap();

        let table = TableName::parse("vector_t1_abcd_docs").unwrap();
        s1.tables().create_source_table(&table, 4).await.unwrap();

        assert!(s1.tables().table_exists(&table).await.unwrap());
        assert!(!s2.tables().table_exists(&table).await.unwrap());
        assert!(s2.tables().list_tables().await.unwrap().is_empty());
    }
}
