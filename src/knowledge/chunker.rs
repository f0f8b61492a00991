//! Text Chunking Module
//!
//! 문서를 임베딩용 청크로 분할합니다. I/O가 없는 순수 함수이며 같은 입력에는
//! 항상 같은 출력을 돌려줍니다.
//!
//! 보장:
//! - 모든 청크의 길이 ≤ `chunk_size` (단위: 문자 = Unicode scalar value)
//! - 연속된 청크는 정확히 `overlap` 문자만큼 겹침
//! - 첫 청크 + 이후 청크의 겹치지 않는 부분을 이으면 원문과 동일
//!
//! 가능하면 공백 직후에서 자르고, 공백이 없으면 `chunk_size` 위치에서 자릅니다.

use serde::Serialize;

use crate::config::ChunkingConfig;
use crate::error::ConfigError;

// ============================================================================
// Types
// ============================================================================

/// 분할된 청크
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextChunk {
    /// 문서 내 청크 순번 (0-based)
    pub index: usize,
    /// 청크 텍스트
    pub text: String,
    /// 원문 기준 시작 문자 위치 (포함)
    pub char_start: usize,
    /// 원문 기준 끝 문자 위치 (미포함)
    pub char_end: usize,
}

impl TextChunk {
    pub fn char_len(&self) -> usize {
        self.char_end - self.char_start
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 텍스트를 청크로 분할
    fn split(&self, text: &str) -> Vec<TextChunk>;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// WindowChunker
// ============================================================================

/// 고정 크기 + 고정 오버랩 슬라이딩 윈도우 청커
#[derive(Debug, Clone, Copy)]
pub struct WindowChunker {
    chunk_size: usize,
    overlap: usize,
}

impl WindowChunker {
    /// `overlap < chunk_size`, `chunk_size > 0` 이어야 합니다.
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, ConfigError> {
        if chunk_size == 0 || overlap >= chunk_size {
            return Err(ConfigError::InvalidChunking {
                chunk_size,
                overlap,
            });
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn from_config(config: &ChunkingConfig) -> Result<Self, ConfigError> {
        Self::new(config.chunk_size, config.overlap)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }
}

impl Chunker for WindowChunker {
    fn split(&self, text: &str) -> Vec<TextChunk> {
        // 공백뿐인 문서는 임베딩할 내용이 없음
        if text.trim().is_empty() {
            return vec![];
        }

        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        let mut chunks = Vec::new();
        let mut start = 0;

        loop {
            let hard_end = (start + self.chunk_size).min(total);

            if hard_end == total {
                chunks.push(make_chunk(&chars, chunks.len(), start, total));
                break;
            }

            // 다음 시작점(end - overlap)이 반드시 앞으로 가도록 최소 끝 위치 보장
            let min_end = start + self.overlap + 1;
            let end = (min_end..=hard_end)
                .rev()
                .find(|&e| chars[e - 1].is_whitespace())
                .unwrap_or(hard_end);

            chunks.push(make_chunk(&chars, chunks.len(), start, end));
            start = end - self.overlap;
        }

        chunks
    }

    fn name(&self) -> &'static str {
        "WindowChunker"
    }
}

/// `Split(document, chunkSize, overlap)`
pub fn split(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<TextChunk>, ConfigError> {
    Ok(WindowChunker::new(chunk_size, overlap)?.split(text))
}

fn make_chunk(chars: &[char], index: usize, start: usize, end: usize) -> TextChunk {
    TextChunk {
        index,
        text: chars[start..end].iter().collect(),
        char_start: start,
        char_end: end,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn reconstruct(chunks: &[TextChunk], overlap: usize) -> String {
        let mut out = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if i == 0 {
                out.push_str(&chunk.text);
            } else {
                out.extend(chunk.text.chars().skip(overlap));
            }
        }
        out
    }

    fn assert_invariants(text: &str, chunk_size: usize, overlap: usize) {
        let chunks = split(text, chunk_size, overlap).unwrap();
        assert!(!chunks.is_empty());

        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= chunk_size);
            assert_eq!(chunk.char_len(), chunk.text.chars().count());
        }

        for pair in chunks.windows(2) {
            assert_eq!(pair[1].char_start, pair[0].char_end - overlap);
            let tail: String = pair[0].text.chars().skip(pair[0].char_len() - overlap).collect();
            let head: String = pair[1].text.chars().take(overlap).collect();
            assert_eq!(tail, head);
        }

        assert_eq!(reconstruct(&chunks, overlap), text);
    }

    #[test]
    fn test_empty_and_blank() {
        assert!(split("", 10, 2).unwrap().is_empty());
        assert!(split("   \n\t ", 10, 2).unwrap().is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = split("The quick brown fox.", 100, 20).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "The quick brown fox.");
        assert_eq!(chunks[0].char_start, 0);
        assert_eq!(chunks[0].char_end, 20);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(split("abc", 0, 0).is_err());
        assert!(split("abc", 4, 4).is_err());
        assert!(split("abc", 4, 5).is_err());
    }

    #[test]
    fn test_prefers_whitespace_boundary() {
        let chunks = split("alpha beta gamma delta", 12, 2).unwrap();
        assert_eq!(chunks[0].text, "alpha beta ");
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 12));
        assert_eq!(reconstruct(&chunks, 2), "alpha beta gamma delta");
    }

    #[test]
    fn test_hard_cut_without_whitespace() {
        let text = "a".repeat(25);
        let chunks = split(&text, 10, 3).unwrap();
        assert_eq!(chunks[0].char_len(), 10);
        assert_eq!(chunks[1].char_start, 7);
        assert_invariants(&text, 10, 3);
    }

    #[test]
    fn test_invariants_various() {
        let prose = "Retrieval augmented generation grounds answers in stored knowledge. \
                     Each source is split into overlapping windows before embedding.\n\n\
                     Short line.\nAnother line with more words in it.";
        for (size, overlap) in [(20, 0), (20, 5), (33, 10), (64, 16), (7, 6), (500, 100)] {
            assert_invariants(prose, size, overlap);
        }
    }

    #[test]
    fn test_multibyte_text() {
        let text = "안녕하세요 세계 여러분 반갑습니다 멀티바이트 문자도 안전하게 분할합니다";
        assert_invariants(text, 8, 2);
    }

    #[test]
    fn test_deterministic() {
        let text = "one two three four five six seven eight nine ten ".repeat(20);
        let a = split(&text, 50, 10).unwrap();
        let b = split(&text, 50, 10).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_indices_are_sequential() {
        let text = "word ".repeat(100);
        let chunks = split(&text, 40, 8).unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
        }
    }
}
