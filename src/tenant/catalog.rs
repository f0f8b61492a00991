//! Source Catalog - rusqlite 기반 테넌트별 소스 카탈로그
//!
//! 테넌트 DB마다 `catalog.db` 하나. 소스 레코드(`knowledge_sources`)와
//! 인제스트 실행 이력(`ingestion_runs`)을 저장합니다.
//!
//! 카탈로그 행은 벡터 테이블이 완전히 채워진 뒤에만 삽입되고, 삭제 시에는
//! 테이블을 먼저 지운 뒤 행을 지웁니다. 따라서 카탈로그는 삭제된 테이블을
//! 가리키지 않습니다.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::ident::{TableName, TenantId};
use crate::loader::SourceKind;

// ============================================================================
// Types
// ============================================================================

/// 등록된 지식 소스
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSource {
    pub id: String,
    pub tenant_id: TenantId,
    pub display_name: String,
    pub source_kind: SourceKind,
    /// 소스 종류별 연결 설정 (불투명 JSON)
    pub connection_settings: serde_json::Value,
    pub embedding_model_id: String,
    pub table_name: TableName,
    pub embedding_dimension: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 인제스트 실행 결과 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// 새 인제스트 실행 기록 입력용 구조체
#[derive(Debug, Clone)]
pub struct NewIngestionRun {
    /// 성공하기 전에는 소스 ID가 없을 수 있음 (최초 등록 실패)
    pub source_id: Option<String>,
    pub table_name: TableName,
    pub documents_total: usize,
    pub documents_loaded: usize,
    pub documents_skipped: usize,
    pub chunk_count: usize,
    pub total_bytes: u64,
    pub total_chars: usize,
    pub status: RunStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// 저장된 인제스트 실행 기록
#[derive(Debug, Clone, Serialize)]
pub struct IngestionRun {
    pub id: i64,
    pub source_id: Option<String>,
    pub table_name: String,
    pub documents_total: usize,
    pub documents_loaded: usize,
    pub documents_skipped: usize,
    pub chunk_count: usize,
    pub total_bytes: u64,
    pub total_chars: usize,
    pub status: RunStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ============================================================================
// SourceCatalog
// ============================================================================

const SOURCE_COLUMNS: &str = "id, tenant_id, display_name, source_kind, connection_settings, \
     embedding_model_id, table_name, embedding_dimension, created_at, updated_at";

const RUN_COLUMNS: &str = "id, source_id, table_name, documents_total, documents_loaded, \
     documents_skipped, chunk_count, total_bytes, total_chars, status, error, started_at, \
     finished_at";

/// 테넌트 소스 카탈로그 (동기)
pub struct SourceCatalog {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SourceCatalog {
    /// 카탈로그 열기 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let catalog = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        };

        catalog.initialize()?;
        Ok(catalog)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// 스키마 초기화
    fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS knowledge_sources (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                display_name TEXT NOT NULL,
                source_kind TEXT NOT NULL,
                connection_settings TEXT NOT NULL,
                embedding_model_id TEXT NOT NULL,
                table_name TEXT NOT NULL UNIQUE,
                embedding_dimension INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ingestion_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT,
                table_name TEXT NOT NULL,
                documents_total INTEGER NOT NULL,
                documents_loaded INTEGER NOT NULL,
                documents_skipped INTEGER NOT NULL,
                chunk_count INTEGER NOT NULL,
                total_bytes INTEGER NOT NULL,
                total_chars INTEGER NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ingestion_runs_source ON ingestion_runs(source_id);
            "#,
        )?;

        tracing::debug!("Source catalog initialized at {:?}", self.db_path);
        Ok(())
    }

    /// 소스 등록
    pub fn insert_source(&self, source: &KnowledgeSource) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let settings = serde_json::to_string(&source.connection_settings)?;

        conn.execute(
            &format!(
                "INSERT INTO knowledge_sources ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                SOURCE_COLUMNS
            ),
            params![
                source.id,
                source.tenant_id.as_str(),
                source.display_name,
                source.source_kind.as_str(),
                settings,
                source.embedding_model_id,
                source.table_name.as_str(),
                source.embedding_dimension as i64,
                source.created_at.to_rfc3339(),
                source.updated_at.to_rfc3339(),
            ],
        )?;

        tracing::info!(
            "Registered source {} ({}) -> {}",
            source.display_name,
            source.id,
            source.table_name
        );
        Ok(())
    }

    /// 테이블 이름으로 소스 조회
    pub fn get_by_table(&self, table: &TableName) -> Result<Option<KnowledgeSource>, StoreError> {
        let conn = self.lock()?;
        let source = conn
            .query_row(
                &format!(
                    "SELECT {} FROM knowledge_sources WHERE table_name = ?1",
                    SOURCE_COLUMNS
                ),
                params![table.as_str()],
                row_to_source,
            )
            .optional()?;
        Ok(source)
    }

    /// ID로 소스 조회
    pub fn get_by_id(&self, id: &str) -> Result<Option<KnowledgeSource>, StoreError> {
        let conn = self.lock()?;
        let source = conn
            .query_row(
                &format!("SELECT {} FROM knowledge_sources WHERE id = ?1", SOURCE_COLUMNS),
                params![id],
                row_to_source,
            )
            .optional()?;
        Ok(source)
    }

    /// 소스 목록 (생성 순)
    pub fn list_sources(&self) -> Result<Vec<KnowledgeSource>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM knowledge_sources ORDER BY created_at ASC, id ASC",
            SOURCE_COLUMNS
        ))?;

        let sources = stmt
            .query_map([], row_to_source)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    /// 소스 행 삭제 (삭제된 행이 있으면 true)
    pub fn delete_by_table(&self, table: &TableName) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "DELETE FROM knowledge_sources WHERE table_name = ?1",
            params![table.as_str()],
        )?;
        Ok(rows > 0)
    }

    /// 소스가 새 테이블/모델을 가리키도록 변경 (단일 UPDATE)
    ///
    /// 행이 아직 `from`을 가리킬 때만 바뀝니다. 다른 재임베딩이 먼저 옮겼으면
    /// false.
    pub fn repoint(
        &self,
        source_id: &str,
        from: &TableName,
        to: &TableName,
        model_id: &str,
        dimension: usize,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE knowledge_sources
             SET table_name = ?3, embedding_model_id = ?4, embedding_dimension = ?5, updated_at = ?6
             WHERE id = ?1 AND table_name = ?2",
            params![
                source_id,
                from.as_str(),
                to.as_str(),
                model_id,
                dimension as i64,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(rows > 0)
    }

    /// 인제스트 실행 기록 추가
    pub fn record_ingestion(&self, run: &NewIngestionRun) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ingestion_runs (source_id, table_name, documents_total, documents_loaded,
                 documents_skipped, chunk_count, total_bytes, total_chars, status, error,
                 started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                run.source_id,
                run.table_name.as_str(),
                run.documents_total as i64,
                run.documents_loaded as i64,
                run.documents_skipped as i64,
                run.chunk_count as i64,
                run.total_bytes as i64,
                run.total_chars as i64,
                run.status.as_str(),
                run.error,
                run.started_at.to_rfc3339(),
                run.finished_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 소스의 인제스트 이력 (최신순)
    pub fn list_ingestions(&self, source_id: &str) -> Result<Vec<IngestionRun>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM ingestion_runs WHERE source_id = ?1 ORDER BY id DESC",
            RUN_COLUMNS
        ))?;

        let runs = stmt
            .query_map(params![source_id], row_to_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// 소스 ID 없이 기록된 실패 이력 포함 전체 (최신순)
    pub fn recent_ingestions(&self, limit: usize) -> Result<Vec<IngestionRun>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM ingestion_runs ORDER BY id DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;

        let runs = stmt
            .query_map(params![limit as i64], row_to_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

/// RFC3339 문자열을 DateTime<Utc>로 파싱
fn parse_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn row_to_source(row: &Row<'_>) -> rusqlite::Result<KnowledgeSource> {
    let tenant_id = TenantId::parse(row.get::<_, String>(1)?).map_err(|e| conversion_error(1, e))?;
    let source_kind = row
        .get::<_, String>(3)?
        .parse::<SourceKind>()
        .map_err(|e| conversion_error(3, e))?;
    let connection_settings = serde_json::from_str(&row.get::<_, String>(4)?)
        .map_err(|e| conversion_error(4, e))?;
    let table_name =
        TableName::parse(row.get::<_, String>(6)?).map_err(|e| conversion_error(6, e))?;

    Ok(KnowledgeSource {
        id: row.get(0)?,
        tenant_id,
        display_name: row.get(2)?,
        source_kind,
        connection_settings,
        embedding_model_id: row.get(5)?,
        table_name,
        embedding_dimension: row.get::<_, i64>(7)? as usize,
        created_at: parse_datetime(row, 8)?,
        updated_at: parse_datetime(row, 9)?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<IngestionRun> {
    let status_raw: String = row.get(9)?;
    let status = RunStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            Type::Text,
            format!("unknown run status '{}'", status_raw).into(),
        )
    })?;

    Ok(IngestionRun {
        id: row.get(0)?,
        source_id: row.get(1)?,
        table_name: row.get(2)?,
        documents_total: row.get::<_, i64>(3)? as usize,
        documents_loaded: row.get::<_, i64>(4)? as usize,
        documents_skipped: row.get::<_, i64>(5)? as usize,
        chunk_count: row.get::<_, i64>(6)? as usize,
        total_bytes: row.get::<_, i64>(7)? as u64,
        total_chars: row.get::<_, i64>(8)? as usize,
        status,
        error: row.get(10)?,
        started_at: parse_datetime(row, 11)?,
        finished_at: parse_datetime(row, 12)?,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_catalog() -> (TempDir, SourceCatalog) {
        let dir = TempDir::new().unwrap();
        let catalog = SourceCatalog::open(&dir.path().join("catalog.db")).unwrap();
        (dir, catalog)
    }

    fn sample_source(table: &str) -> KnowledgeSource {
        let now = Utc::now();
        KnowledgeSource {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: TenantId::parse("t1").unwrap(),
            display_name: "Docs".to_string(),
            source_kind: SourceKind::Text,
            connection_settings: serde_json::json!({ "text": "hello" }),
            embedding_model_id: "gemini-embedding-001".to_string(),
            table_name: TableName::parse(table).unwrap(),
            embedding_dimension: 768,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_run(source_id: Option<String>, status: RunStatus) -> NewIngestionRun {
        NewIngestionRun {
            source_id,
            table_name: TableName::parse("vector_t1_abcd_docs").unwrap(),
            documents_total: 3,
            documents_loaded: 2,
            documents_skipped: 1,
            chunk_count: 4,
            total_bytes: 120,
            total_chars: 118,
            status,
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let (_dir, catalog) = create_test_catalog();
        let source = sample_source("vector_t1_abcd_docs");
        catalog.insert_source(&source).unwrap();

        let by_table = catalog
            .get_by_table(&source.table_name)
            .unwrap()
            .unwrap();
        assert_eq!(by_table.id, source.id);
        assert_eq!(by_table.source_kind, SourceKind::Text);
        assert_eq!(by_table.connection_settings["text"], "hello");
        assert_eq!(by_table.embedding_dimension, 768);

        let by_id = catalog.get_by_id(&source.id).unwrap().unwrap();
        assert_eq!(by_id.table_name, source.table_name);

        let missing = TableName::parse("vector_t1_none_docs").unwrap();
        assert!(catalog.get_by_table(&missing).unwrap().is_none());
    }

    #[test]
    fn test_table_name_unique() {
        let (_dir, catalog) = create_test_catalog();
        catalog
            .insert_source(&sample_source("vector_t1_abcd_docs"))
            .unwrap();
        let result = catalog.insert_source(&sample_source("vector_t1_abcd_docs"));
        assert!(matches!(result, Err(StoreError::Catalog(_))));
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, catalog) = create_test_catalog();
        let a = sample_source("vector_t1_aaaa_docs");
        let b = sample_source("vector_t1_bbbb_docs");
        catalog.insert_source(&a).unwrap();
        catalog.insert_source(&b).unwrap();
        assert_eq!(catalog.list_sources().unwrap().len(), 2);

        assert!(catalog.delete_by_table(&a.table_name).unwrap());
        assert!(!catalog.delete_by_table(&a.table_name).unwrap());

        let remaining = catalog.list_sources().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, b.id);
    }

    #[test]
    fn test_repoint() {
        let (_dir, catalog) = create_test_catalog();
        let source = sample_source("vector_t1_aaaa_docs");
        catalog.insert_source(&source).unwrap();

        let new_table = TableName::parse("vector_t1_bbbb_docs").unwrap();
        assert!(catalog
            .repoint(
                &source.id,
                &source.table_name,
                &new_table,
                "text-embedding-3-small",
                1536
            )
            .unwrap());

        assert!(catalog.get_by_table(&source.table_name).unwrap().is_none());
        let moved = catalog.get_by_table(&new_table).unwrap().unwrap();
        assert_eq!(moved.id, source.id);
        assert_eq!(moved.embedding_model_id, "text-embedding-3-small");
        assert_eq!(moved.embedding_dimension, 1536);
        assert!(moved.updated_at >= source.updated_at);

        // 이미 옮겨진 행은 옛 테이블 기준으로 다시 옮길 수 없음
        let stale = TableName::parse("vector_t1_cccc_docs").unwrap();
        assert!(!catalog
            .repoint(&source.id, &source.table_name, &stale, "local-hash", 256)
            .unwrap());
        assert_eq!(
            catalog.get_by_id(&source.id).unwrap().unwrap().table_name,
            new_table
        );
    }

    #[test]
    fn test_ingestion_history() {
        let (_dir, catalog) = create_test_catalog();
        let source = sample_source("vector_t1_abcd_docs");
        catalog.insert_source(&source).unwrap();

        catalog
            .record_ingestion(&sample_run(Some(source.id.clone()), RunStatus::Succeeded))
            .unwrap();
        let mut failed = sample_run(Some(source.id.clone()), RunStatus::Failed);
        failed.error = Some("rate limited".to_string());
        catalog.record_ingestion(&failed).unwrap();
        catalog
            .record_ingestion(&sample_run(None, RunStatus::Failed))
            .unwrap();

        let runs = catalog.list_ingestions(&source.id).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].error.as_deref(), Some("rate limited"));
        assert_eq!(runs[1].status, RunStatus::Succeeded);
        assert_eq!(runs[1].documents_skipped, 1);
        assert_eq!(runs[1].total_bytes, 120);

        assert_eq!(catalog.recent_ingestions(10).unwrap().len(), 3);
    }
}
