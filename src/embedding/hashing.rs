//! 로컬 해싱 임베더 - 네트워크/자격 증명 없이 결정적 벡터 생성
//!
//! 단어 단위 feature hashing:
//! 1. 소문자 영숫자 토큰으로 분리
//! 2. 토큰의 SHA-256으로 차원 인덱스와 부호 결정
//! 3. 누적 후 단위 길이로 정규화 (코사인 유사도 유효)
//!
//! 같은 텍스트는 항상 같은 벡터, 단어가 많이 겹칠수록 유사도가 높습니다.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::Embedder;
use crate::error::ProviderError;

/// 레지스트리 기본 모델 ID
pub const MODEL_ID: &str = "local-hash";
pub const DEFAULT_DIMENSION: usize = 256;

/// Feature hashing 임베더
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    model_id: String,
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(model_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dimension: dimension.max(1),
        }
    }

    fn vectorize(&self, text: &str) -> Option<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        let mut tokens = 0usize;

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };

            vector[index] += sign;
            tokens += 1;
        }

        if tokens == 0 {
            return None;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        } else {
            // 부호가 모두 상쇄된 경우: 첫 차원 고정
            vector[0] = 1.0;
        }
        Some(vector)
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(MODEL_ID, DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.vectorize(text).ok_or(ProviderError::EmptyInput)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
