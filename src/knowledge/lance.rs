//! LanceDB Source Tables - 소스별 벡터 테이블
//!
//! 테넌트 DB 하나(= LanceDB 디렉토리 하나)에 소스 테이블 여러 개를 둡니다.
//! 테이블 스키마는 고정입니다:
//!
//! | column    | type                              |
//! |-----------|-----------------------------------|
//! | id        | Int64 (삽입 순서로 증가)             |
//! | content   | Utf8                              |
//! | metadata  | Utf8 (JSON object)                |
//! | embedding | FixedSizeList<Float32>(dim)       |
//!
//! ref: https://lancedb.github.io/lancedb/

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::DistanceType;
use tokio::sync::Mutex;

use super::vector::{
    compare_by_score, distance_to_score, ChunkRecord, Metadata, SimilarChunk, SourceTables,
};
use crate::error::StoreError;
use crate::ident::TableName;

const ID_COLUMN: &str = "id";
const CONTENT_COLUMN: &str = "content";
const METADATA_COLUMN: &str = "metadata";
const EMBEDDING_COLUMN: &str = "embedding";
/// LanceDB가 검색 결과에 자동 추가하는 거리 컬럼
const DISTANCE_COLUMN: &str = "_distance";

// ============================================================================
// LanceSourceTables
// ============================================================================

/// LanceDB 기반 소스 테이블 구현
///
/// `Connection`은 테넌트의 모든 소스가 공유합니다. 테이블 이름별 잠금은
/// DDL(생성/삭제)과 id 할당이 필요한 append에만 쓰이고, 검색은 잠그지 않습니다.
pub struct LanceSourceTables {
    db: Connection,
    table_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LanceSourceTables {
    /// LanceDB 디렉토리 열기 (없으면 생성)
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| StoreError::io(path, e))?;
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| StoreError::InvalidRequest(format!("non UTF-8 path: {:?}", path)))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .map_err(StoreError::lance("connect"))?;

        Ok(Self {
            db,
            table_locks: Mutex::new(HashMap::new()),
        })
    }

    /// 소스 테이블 스키마
    fn create_schema(dim: i32) -> Schema {
        Schema::new(vec![
            Field::new(ID_COLUMN, DataType::Int64, false),
            Field::new(CONTENT_COLUMN, DataType::Utf8, false),
            Field::new(METADATA_COLUMN, DataType::Utf8, false),
            Field::new(
                EMBEDDING_COLUMN,
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dim,
                ),
                false,
            ),
        ])
    }

    /// 레코드들을 Arrow RecordBatch로 변환
    fn records_to_batch(
        schema: SchemaRef,
        dim: i32,
        first_id: i64,
        records: &[ChunkRecord],
    ) -> Result<RecordBatch, StoreError> {
        let ids: Vec<i64> = (0..records.len() as i64).map(|i| first_id + i).collect();
        let contents: Vec<&str> = records.iter().map(|r| r.content.as_str()).collect();
        let metadata = records
            .iter()
            .map(|r| serde_json::to_string(&r.metadata))
            .collect::<Result<Vec<String>, _>>()?;

        let embeddings_flat: Vec<f32> = records
            .iter()
            .flat_map(|r| r.embedding.iter().copied())
            .collect();

        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings = FixedSizeListArray::try_new(
            field,
            dim,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )?;

        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(contents)),
                Arc::new(StringArray::from(metadata)),
                Arc::new(embeddings),
            ],
        )?;

        Ok(batch)
    }

    /// 테이블 이름별 잠금 핸들
    async fn table_lock(&self, table: &TableName) -> Arc<Mutex<()>> {
        let mut locks = self.table_locks.lock().await;
        locks
            .entry(table.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn open_table(
        &self,
        table: &TableName,
        context: &'static str,
    ) -> Result<lancedb::table::Table, StoreError> {
        self.db
            .open_table(table.as_str())
            .execute()
            .await
            .map_err(StoreError::lance(context))
    }

    /// 스키마에서 embedding 컬럼의 고정 차원 읽기
    async fn dimension_of(
        table_name: &TableName,
        table: &lancedb::table::Table,
    ) -> Result<usize, StoreError> {
        let schema = table
            .schema()
            .await
            .map_err(StoreError::lance("read schema"))?;

        let field = schema
            .field_with_name(EMBEDDING_COLUMN)
            .map_err(|_| StoreError::Corrupt {
                table: table_name.to_string(),
                message: "missing embedding column".to_string(),
            })?;

        match field.data_type() {
            DataType::FixedSizeList(_, size) if *size > 0 => Ok(*size as usize),
            other => Err(StoreError::Corrupt {
                table: table_name.to_string(),
                message: format!("unexpected embedding type {:?}", other),
            }),
        }
    }

    fn check_dimension(table: &TableName, expected: usize, actual: usize) -> Result<(), StoreError> {
        if expected != actual {
            return Err(StoreError::DimensionMismatch {
                table: table.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// 검색 결과 배치에서 SimilarChunk 추출
    fn batch_to_hits(table: &TableName, batch: &RecordBatch) -> Result<Vec<SimilarChunk>, StoreError> {
        let corrupt = |column: &str| StoreError::Corrupt {
            table: table.to_string(),
            message: format!("missing {} column", column),
        };

        let ids = batch
            .column_by_name(ID_COLUMN)
            .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
            .ok_or_else(|| corrupt(ID_COLUMN))?;

        let contents = batch
            .column_by_name(CONTENT_COLUMN)
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| corrupt(CONTENT_COLUMN))?;

        let metadata = batch
            .column_by_name(METADATA_COLUMN)
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| corrupt(METADATA_COLUMN))?;

        let distances = batch
            .column_by_name(DISTANCE_COLUMN)
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
            .ok_or_else(|| corrupt(DISTANCE_COLUMN))?;

        let mut hits = Vec::with_capacity(batch.num_rows());
        for i in 0..batch.num_rows() {
            let metadata: Metadata = serde_json::from_str(metadata.value(i))?;
            hits.push(SimilarChunk {
                id: ids.value(i),
                content: contents.value(i).to_string(),
                metadata,
                score: distance_to_score(distances.value(i)),
            });
        }

        Ok(hits)
    }
}

#[async_trait]
impl SourceTables for LanceSourceTables {
    async fn create_source_table(&self, table: &TableName, dim: usize) -> Result<(), StoreError> {
        if dim == 0 || dim > i32::MAX as usize {
            return Err(StoreError::InvalidRequest(format!(
                "vector dimension must be in 1..={}, got {}",
                i32::MAX,
                dim
            )));
        }

        let lock = self.table_lock(table).await;
        let _guard = lock.lock().await;

        let schema = Arc::new(Self::create_schema(dim as i32));
        match self
            .db
            .create_empty_table(table.as_str(), schema)
            .execute()
            .await
        {
            Ok(_) => {
                tracing::info!("Created source table {} (dim={})", table, dim);
                Ok(())
            }
            Err(lancedb::Error::TableAlreadyExists { .. }) => {
                // 차원은 변경 불가 - 같은 차원일 때만 no-op
                let existing = self.open_table(table, "open existing table").await?;
                let existing_dim = Self::dimension_of(table, &existing).await?;
                Self::check_dimension(table, existing_dim, dim)?;
                tracing::debug!("Source table {} already exists", table);
                Ok(())
            }
            Err(e) => Err(StoreError::lance("create table")(e)),
        }
    }

    async fn drop_source_table(&self, table: &TableName) -> Result<(), StoreError> {
        let lock = self.table_lock(table).await;
        let _guard = lock.lock().await;

        match self.db.drop_table(table.as_str()).await {
            Ok(()) => {
                tracing::info!("Dropped source table {}", table);
                Ok(())
            }
            Err(lancedb::Error::TableNotFound { .. }) => {
                tracing::debug!("Source table {} did not exist", table);
                Ok(())
            }
            Err(e) => Err(StoreError::lance("drop table")(e)),
        }
    }

    async fn table_exists(&self, table: &TableName) -> Result<bool, StoreError> {
        Ok(self
            .list_tables()
            .await?
            .iter()
            .any(|name| name == table.as_str()))
    }

    async fn table_dimension(&self, table: &TableName) -> Result<usize, StoreError> {
        let handle = self.open_table(table, "open table").await?;
        Self::dimension_of(table, &handle).await
    }

    async fn store_chunks(
        &self,
        table: &TableName,
        chunks: &[ChunkRecord],
    ) -> Result<usize, StoreError> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let lock = self.table_lock(table).await;
        let _guard = lock.lock().await;

        let handle = self.open_table(table, "open table for insert").await?;
        let dim = Self::dimension_of(table, &handle).await?;

        // 쓰기 전에 전부 검증 - 한 개라도 어긋나면 아무것도 쓰지 않음
        for chunk in chunks {
            Self::check_dimension(table, dim, chunk.embedding.len())?;
        }

        // 행은 삭제하지 않으므로 현재 행 수가 다음 id
        let first_id = handle
            .count_rows(None)
            .await
            .map_err(StoreError::lance("count rows"))? as i64;

        let schema = Arc::new(Self::create_schema(dim as i32));
        let batch = Self::records_to_batch(schema.clone(), dim as i32, first_id, chunks)?;

        // 단일 배치 = 단일 커밋
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        handle
            .add(batches)
            .execute()
            .await
            .map_err(StoreError::lance("add rows"))?;

        tracing::debug!("Stored {} chunks in {}", chunks.len(), table);
        Ok(chunks.len())
    }

    async fn search_similar(
        &self,
        table: &TableName,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<SimilarChunk>, StoreError> {
        if limit == 0 {
            return Err(StoreError::InvalidRequest(
                "limit must be greater than zero".to_string(),
            ));
        }

        let handle = self.open_table(table, "open table for search").await?;
        let dim = Self::dimension_of(table, &handle).await?;
        Self::check_dimension(table, dim, query.len())?;

        let rows = handle
            .count_rows(None)
            .await
            .map_err(StoreError::lance("count rows"))?;
        if rows == 0 {
            return Ok(vec![]);
        }

        let stream = handle
            .vector_search(query.to_vec())
            .map_err(StoreError::lance("build vector search"))?
            .column(EMBEDDING_COLUMN)
            .distance_type(DistanceType::Cosine)
            .limit(limit)
            .execute()
            .await
            .map_err(StoreError::lance("execute vector search"))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(StoreError::lance("read search results"))?;

        let mut hits = Vec::new();
        for batch in &batches {
            hits.extend(Self::batch_to_hits(table, batch)?);
        }

        hits.sort_by(compare_by_score);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self, table: &TableName) -> Result<usize, StoreError> {
        let handle = self.open_table(table, "open table for count").await?;
        handle
            .count_rows(None)
            .await
            .map_err(StoreError::lance("count rows"))
    }

    async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        self.db
            .table_names()
            .execute()
            .await
            .map_err(StoreError::lance("list tables"))
    }
}

// ============================================================================
// Tests
// ============================================================================
