//! 로컬 파일 / 폴더 로더
//!
//! .gitignore 패턴을 존중하고, 지원하는 확장자만 수집합니다.
//! - 텍스트 파일: UTF-8로 읽기
//! - PDF: 페이지별 문서

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ignore::WalkBuilder;
use serde_json::Value;

use super::{
    optional_bool, optional_str_list, pdf, require_strings, LoadOutcome, Settings, SourceKind,
    SourceLoader,
};
use crate::config::LoaderConfig;
use crate::error::{LoaderError, Result};
use crate::knowledge::Metadata;

// ============================================================================
// File Types
// ============================================================================

/// 지원하는 파일 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// 텍스트 파일 (마크다운, 코드 등)
    Text,
    /// PDF 파일
    Pdf,
}

impl FileType {
    /// 확장자로 파일 타입 결정
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_lowercase();
        match ext.as_str() {
            "md" | "txt" | "rs" | "ts" | "tsx" | "js" | "jsx" | "py" | "json" | "toml" | "yaml"
            | "yml" | "html" | "css" | "scss" | "go" | "java" | "c" | "cpp" | "h" | "hpp"
            | "sh" | "bash" | "zsh" | "sql" | "xml" | "csv" | "rst" | "log" => Some(FileType::Text),

            "pdf" => Some(FileType::Pdf),

            _ => None,
        }
    }

    /// 파일 경로에서 타입 결정
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }
}

/// 파일 하나 읽기 → (문서 텍스트, 메타데이터) 목록, 읽은 바이트 수
async fn read_file(
    path: &Path,
    max_file_size: u64,
) -> std::result::Result<(Vec<(String, Metadata)>, u64), LoaderError> {
    let file_type =
        FileType::from_path(path).ok_or_else(|| LoaderError::UnsupportedFile(path.to_path_buf()))?;

    let size = tokio::fs::metadata(path)
        .await
        .map_err(|source| LoaderError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();

    if max_file_size > 0 && size > max_file_size {
        return Err(LoaderError::TooLarge {
            path: path.to_path_buf(),
            size,
            limit: max_file_size,
        });
    }

    let source = path.to_string_lossy().to_string();
    let base_metadata = || {
        let mut metadata = Metadata::new();
        metadata.insert("source".to_string(), Value::String(source.clone()));
        metadata
    };

    match file_type {
        FileType::Text => {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|source| LoaderError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            let text = String::from_utf8(bytes).map_err(|_| LoaderError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "file is not valid UTF-8",
                ),
            })?;
            Ok((vec![(text, base_metadata())], size))
        }
        FileType::Pdf => {
            // PDF 추출은 CPU 바운드이므로 spawn_blocking 사용
            let owned = path.to_path_buf();
            let pages = tokio::task::spawn_blocking(move || pdf::extract_pages(&owned))
                .await
                .map_err(|e| LoaderError::Task(e.to_string()))??;

            let total_pages = pages.len();
            let docs = pages
                .into_iter()
                .map(|(page, text)| {
                    let mut metadata = base_metadata();
                    metadata.insert("page".to_string(), Value::from(page));
                    metadata.insert("total_pages".to_string(), Value::from(total_pages));
                    (text, metadata)
                })
                .collect();
            Ok((docs, size))
        }
    }
}

fn absolute(path: &str) -> std::result::Result<PathBuf, LoaderError> {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        return Ok(path);
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&path))
        .map_err(|source| LoaderError::Io { path, source })
}

// ============================================================================
// FileLoader
// ============================================================================

/// 단일 파일 로더 (실패는 소스 전체 실패)
#[derive(Debug, Clone)]
pub struct FileLoader {
    path: String,
    max_file_size: u64,
}

impl FileLoader {
    pub fn from_settings(settings: &Settings, config: &LoaderConfig) -> Result<Self> {
        let values = require_strings(SourceKind::File, settings, &["path"])?;
        Ok(Self {
            path: values[0].to_string(),
            max_file_size: config.max_file_size,
        })
    }
}

#[async_trait]
impl SourceLoader for FileLoader {
    async fn load(&self) -> std::result::Result<LoadOutcome, LoaderError> {
        let path = absolute(&self.path)?;
        if !path.is_file() {
            return Err(LoaderError::NotFound(path));
        }

        let (docs, bytes) = read_file(&path, self.max_file_size).await?;

        let mut outcome = LoadOutcome {
            total_bytes: bytes,
            ..Default::default()
        };
        for (text, metadata) in docs {
            outcome.push(text, metadata);
        }

        tracing::info!("Loaded {} documents from {:?}", outcome.documents.len(), path);
        Ok(outcome)
    }

    fn kind(&self) -> SourceKind {
        SourceKind::File
    }
}

// ============================================================================
// DirectoryLoader
// ============================================================================

/// 폴더 재귀 로더 (읽지 못한 파일은 건너뛰고 기록)
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    path: String,
    /// .gitignore 패턴 존중 여부
    respect_gitignore: bool,
    /// 숨김 파일 포함 여부
    include_hidden: bool,
    /// 특정 확장자만 수집 (비어있으면 모든 지원 확장자)
    extensions: Vec<String>,
    max_file_size: u64,
}

impl DirectoryLoader {
    pub fn from_settings(settings: &Settings, config: &LoaderConfig) -> Result<Self> {
        let values = require_strings(SourceKind::Directory, settings, &["path"])?;
        Ok(Self {
            path: values[0].to_string(),
            respect_gitignore: optional_bool(settings, "respect_gitignore", true)?,
            include_hidden: optional_bool(settings, "include_hidden", false)?,
            extensions: optional_str_list(settings, "extensions")?
                .unwrap_or_default()
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_string())
                .collect(),
            max_file_size: config.max_file_size,
        })
    }

    /// 확장자 필터
    fn wants(&self, path: &Path) -> bool {
        if FileType::from_path(path).is_none() {
            return false;
        }
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    /// 대상 파일 경로 수집 (정렬된 순서)
    fn collect_paths(&self, root: &Path) -> Vec<PathBuf> {
        // ignore 크레이트로 .gitignore 지원
        let walker = WalkBuilder::new(root)
            .hidden(!self.include_hidden)
            .git_ignore(self.respect_gitignore)
            .git_global(self.respect_gitignore)
            .git_exclude(self.respect_gitignore)
            .require_git(false)
            .sort_by_file_path(|a, b| a.cmp(b))
            .build();

        let mut paths = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Failed to read entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }

            if self.wants(entry.path()) {
                paths.push(entry.into_path());
            }
        }
        paths
    }
}

#[async_trait]
impl SourceLoader for DirectoryLoader {
    async fn load(&self) -> std::result::Result<LoadOutcome, LoaderError> {
        let root = absolute(&self.path)?;
        if !root.is_dir() {
            return Err(LoaderError::NotFound(root));
        }

        let walker = self.clone();
        let walk_root = root.clone();
        let paths = tokio::task::spawn_blocking(move || walker.collect_paths(&walk_root))
            .await
            .map_err(|e| LoaderError::Task(e.to_string()))?;

        let mut outcome = LoadOutcome::default();
        for path in paths {
            match read_file(&path, self.max_file_size).await {
                Ok((docs, bytes)) => {
                    outcome.total_bytes += bytes;
                    for (text, metadata) in docs {
                        outcome.push(text, metadata);
                    }
                }
                Err(e) => outcome.skip(path.to_string_lossy(), e),
            }
        }

        tracing::info!(
            "Loaded {} documents from {:?} ({} skipped)",
            outcome.documents.len(),
            root,
            outcome.skipped.len()
        );
        Ok(outcome)
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Directory
    }
}

// ============================================================================
// Tests
// ============================================================================
