//! Vector Store - 소스 테이블 트레이트 및 공통 타입
//!
//! 소스 하나당 테이블 하나. 테이블의 벡터 차원은 생성 시점에 고정되며
//! 다른 길이의 벡터는 삽입/검색 모두 명시적으로 실패합니다.

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StoreError;
use crate::ident::TableName;

/// 청크 메타데이터 (불투명한 구조화 값, 개별 인덱싱하지 않음)
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Types
// ============================================================================

/// 벡터 엔트리 (저장용)
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// 청크 텍스트
    pub content: String,
    /// 출처 메타데이터
    pub metadata: Metadata,
    /// 임베딩 벡터
    pub embedding: Vec<f32>,
}

/// 검색 결과
#[derive(Debug, Clone, Serialize)]
pub struct SimilarChunk {
    /// 행 ID (삽입 순서)
    pub id: i64,
    pub content: String,
    pub metadata: Metadata,
    /// 유사도 (1 - 코사인 거리, 높을수록 유사)
    pub score: f32,
}

// ============================================================================
// SourceTables Trait
// ============================================================================

/// 테넌트 하나의 소스 테이블 관리 + 쓰기 + 검색
#[async_trait]
pub trait SourceTables: Send + Sync {
    /// 테이블 생성 (이미 있으면 no-op)
    async fn create_source_table(&self, table: &TableName, dim: usize) -> Result<(), StoreError>;

    /// 테이블 삭제 (없어도 성공)
    async fn drop_source_table(&self, table: &TableName) -> Result<(), StoreError>;

    /// 테이블 존재 여부
    async fn table_exists(&self, table: &TableName) -> Result<bool, StoreError>;

    /// 테이블의 고정 벡터 차원
    async fn table_dimension(&self, table: &TableName) -> Result<usize, StoreError>;

    /// 청크 일괄 삽입 (전부 성공 또는 전부 실패)
    async fn store_chunks(&self, table: &TableName, chunks: &[ChunkRecord])
        -> Result<usize, StoreError>;

    /// 유사도 검색 (score 내림차순)
    async fn search_similar(
        &self,
        table: &TableName,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<SimilarChunk>, StoreError>;

    /// 행 개수
    async fn count(&self, table: &TableName) -> Result<usize, StoreError>;

    /// 이 테넌트 DB의 모든 테이블 이름
    async fn list_tables(&self) -> Result<Vec<String>, StoreError>;
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 거리를 유사도 점수로 변환
#[inline]
pub fn distance_to_score(distance: f32) -> f32 {
    1.0 - distance
}

/// score 내림차순, 같으면 삽입 순서(id 오름차순)
pub fn compare_by_score(a: &SimilarChunk, b: &SimilarChunk) -> Ordering {
    b.score.total_cmp(&a.score).then(a.id.cmp(&b.id))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: i64, score: f32) -> SimilarChunk {
        SimilarChunk {
            id,
            content: String::new(),
            metadata: Metadata::new(),
            score,
        }
    }

    #[test]
    fn test_distance_to_score() {
        assert!((distance_to_score(0.0) - 1.0).abs() < 1e-6);
        assert!((distance_to_score(1.0) - 0.0).abs() < 1e-6);
        assert!((distance_to_score(2.0) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ordering_ties_by_insertion() {
        let mut hits = vec![hit(3, 0.5), hit(1, 0.9), hit(2, 0.5), hit(0, 0.1)];
        hits.sort_by(compare_by_score);
        let ids: Vec<i64> = hits.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 0]);
    }
}
