//! Knowledge 모듈 - 청킹 + 소스별 벡터 테이블
//!
//! - `chunker`: 문서를 겹치는 고정 크기 청크로 분할
//! - `vector`: 소스 테이블 트레이트와 공통 타입
//! - `lance`: LanceDB 구현체

pub mod chunker;
pub mod lance;
pub mod vector;

pub use chunker::{split, Chunker, TextChunk, WindowChunker};
pub use lance::LanceSourceTables;
pub use vector::{
    compare_by_score, distance_to_score, ChunkRecord, Metadata, SimilarChunk, SourceTables,
};
