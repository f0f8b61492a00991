//! PDF 텍스트 추출
//!
//! pdf-extract 크레이트를 사용합니다. CPU 바운드이므로 호출자는
//! `spawn_blocking`에서 실행해야 합니다.

use std::path::Path;

use crate::error::LoaderError;

/// PDF에서 페이지별 텍스트 추출
///
/// (페이지 번호, 텍스트) 목록을 반환합니다. 페이지 번호는 1부터 시작합니다.
/// 텍스트가 없는 PDF(스캔 문서 등)는 빈 목록입니다.
pub fn extract_pages(path: &Path) -> Result<Vec<(usize, String)>, LoaderError> {
    let bytes = std::fs::read(path).map_err(|source| LoaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let text = pdf_extract::extract_text_from_mem(&bytes).map_err(|e| LoaderError::Pdf {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    if text.trim().is_empty() {
        tracing::warn!(
            "No text extracted from PDF: {:?}. It might be a scanned document.",
            path
        );
        return Ok(vec![]);
    }

    Ok(split_pdf_pages(&text)
        .into_iter()
        .enumerate()
        .map(|(i, text)| (i + 1, text))
        .collect())
}

/// PDF 텍스트를 페이지별로 분리
fn split_pdf_pages(text: &str) -> Vec<String> {
    // 폼피드 문자 (\x0c)
    let pages: Vec<String> = text
        .split('\x0c')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if pages.len() > 1 {
        return pages;
    }

    // "--- Page 1 ---" 형태의 구분 줄
    if let Ok(page_pattern) =
        regex::Regex::new(r"(?m)^[\s]*[-=]+[\s]*(?:Page[\s]*)?(\d+)[\s]*[-=]+[\s]*$")
    {
        let pages: Vec<String> = page_pattern
            .split(text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if pages.len() > 1 {
            return pages;
        }
    }

    vec![text.trim().to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pdf_pages_with_formfeed() {
        let pages = split_pdf_pages("Page 1 content\x0cPage 2 content\x0c\x0cPage 3 content");
        assert_eq!(pages, vec!["Page 1 content", "Page 2 content", "Page 3 content"]);
    }

    #[test]
    fn test_split_pdf_pages_with_markers() {
        let text = "Intro text\n--- Page 2 ---\nSecond page\n=== 3 ===\nThird page";
        let pages = split_pdf_pages(text);
        assert_eq!(pages, vec!["Intro text", "Second page", "Third page"]);
    }

    #[test]
    fn test_split_pdf_pages_no_separator() {
        let pages = split_pdf_pages("  Just some text without page breaks ");
        assert_eq!(pages, vec!["Just some text without page breaks"]);
    }

    #[test]
    fn test_invalid_pdf_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"not a pdf at all").unwrap();

        assert!(matches!(extract_pages(&path), Err(LoaderError::Pdf { .. })));
    }
}
