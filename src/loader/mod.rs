//! 소스 로더 모듈 - 외부 소스를 원문 문서 목록으로 정규화
//!
//! 소스 종류(`SourceKind`)마다 로더 하나:
//! - `text`: 인라인 텍스트
//! - `file` / `directory`: 로컬 파일 (.gitignore 존중, PDF 페이지별 추출)
//! - `web_scraper`: URL 목록 (HTML 본문 추출)
//! - `airtable`: Airtable 테이블 레코드
//!
//! 설정 검증(필수 키, URL 형식)은 `build_loader`에서 외부 호출 전에 끝납니다.
//! 일부 문서 실패는 건너뛰되, 전체/건너뜀 개수를 `LoadOutcome`에 남깁니다.

pub mod airtable;
pub mod file;
pub mod pdf;
pub mod text;
pub mod web;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub use airtable::AirtableLoader;
pub use file::{DirectoryLoader, FileLoader, FileType};
pub use text::InlineTextLoader;
pub use web::{normalize_url, WebScraperLoader};

use crate::config::LoaderConfig;
use crate::error::{ConfigError, LoaderError, Result};
use crate::knowledge::Metadata;

// ============================================================================
// Source Kind
// ============================================================================

/// 소스 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Text,
    File,
    Directory,
    WebScraper,
    Airtable,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        Self::Text,
        Self::File,
        Self::Directory,
        Self::WebScraper,
        Self::Airtable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::File => "file",
            Self::Directory => "directory",
            Self::WebScraper => "web_scraper",
            Self::Airtable => "airtable",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConfigError::UnsupportedSourceKind(s.to_string()))
    }
}

// ============================================================================
// Source Spec
// ============================================================================

/// 소스 등록 요청
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub display_name: String,
    pub source_kind: SourceKind,
    /// 소스 종류별 설정 (JSON object)
    #[serde(default = "empty_settings")]
    pub connection_settings: Value,
    pub embedding_model_id: String,
}

fn empty_settings() -> Value {
    Value::Object(serde_json::Map::new())
}

impl SourceSpec {
    pub fn new(
        display_name: impl Into<String>,
        source_kind: SourceKind,
        connection_settings: Value,
        embedding_model_id: impl Into<String>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            source_kind,
            connection_settings,
            embedding_model_id: embedding_model_id.into(),
        }
    }

    /// 로더 생성 전 공통 검증
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.display_name.trim().is_empty() {
            return Err(ConfigError::EmptyDisplayName);
        }
        settings_object(&self.connection_settings)?;
        Ok(())
    }
}

// ============================================================================
// Documents
// ============================================================================

/// 로더가 만든 원문 문서
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub text: String,
    /// 출처 메타데이터 (경로, URL, 레코드 ID 등)
    pub metadata: Metadata,
}

/// 건너뛴 문서
#[derive(Debug, Clone, Serialize)]
pub struct SkippedDocument {
    /// 경로, URL 등
    pub origin: String,
    pub reason: String,
}

/// 로딩 결과
#[derive(Debug, Clone, Default)]
pub struct LoadOutcome {
    pub documents: Vec<RawDocument>,
    pub skipped: Vec<SkippedDocument>,
    /// 시도한 문서 수 (로드 + 건너뜀)
    pub documents_total: usize,
    /// 가져온 원본 바이트 수
    pub total_bytes: u64,
}

impl LoadOutcome {
    /// 문서 추가 (content_hash 메타데이터 부여)
    pub fn push(&mut self, text: String, mut metadata: Metadata) {
        metadata.insert("content_hash".to_string(), Value::String(content_hash(&text)));
        self.documents.push(RawDocument { text, metadata });
        self.documents_total += 1;
    }

    /// 실패한 문서 기록
    pub fn skip(&mut self, origin: impl Into<String>, reason: impl ToString) {
        let origin = origin.into();
        let reason = reason.to_string();
        tracing::warn!("Skipping {}: {}", origin, reason);
        self.skipped.push(SkippedDocument { origin, reason });
        self.documents_total += 1;
    }

    pub fn documents_loaded(&self) -> usize {
        self.documents.len()
    }

    /// 모든 문서의 문자 수 (Unicode scalar value)
    pub fn total_chars(&self) -> usize {
        self.documents.iter().map(|d| d.text.chars().count()).sum()
    }
}

/// SHA-256 콘텐츠 해시 (hex)
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// SourceLoader Trait
// ============================================================================

/// 소스 로더 트레이트
#[async_trait]
pub trait SourceLoader: Send + Sync {
    /// 문서 로드 (유한, 순서 보장)
    async fn load(&self) -> std::result::Result<LoadOutcome, LoaderError>;

    fn kind(&self) -> SourceKind;
}

/// 소스 종류 + 설정으로 로더 생성 (설정 검증 포함, 네트워크 호출 없음)
pub fn build_loader(
    kind: SourceKind,
    settings: &Value,
    config: &LoaderConfig,
) -> Result<Box<dyn SourceLoader>> {
    let settings = settings_object(settings)?;

    let loader: Box<dyn SourceLoader> = match kind {
        SourceKind::Text => Box::new(InlineTextLoader::from_settings(settings)?),
        SourceKind::File => Box::new(FileLoader::from_settings(settings, config)?),
        SourceKind::Directory => Box::new(DirectoryLoader::from_settings(settings, config)?),
        SourceKind::WebScraper => Box::new(WebScraperLoader::from_settings(settings, config)?),
        SourceKind::Airtable => Box::new(AirtableLoader::from_settings(settings, config)?),
    };

    Ok(loader)
}

/// 로더용 HTTP 클라이언트
pub(crate) fn http_client(config: &LoaderConfig) -> std::result::Result<reqwest::Client, LoaderError> {
    reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .timeout(config.request_timeout())
        .build()
        .map_err(|source| LoaderError::Http {
            url: String::new(),
            source,
        })
}

// ============================================================================
// Settings Helpers
// ============================================================================

pub(crate) type Settings = serde_json::Map<String, Value>;

fn settings_object(value: &Value) -> std::result::Result<&Settings, ConfigError> {
    value.as_object().ok_or_else(|| ConfigError::InvalidSetting {
        key: "connection_settings".to_string(),
        reason: "must be a JSON object".to_string(),
    })
}

/// 필수 문자열 키 확인 (빠진 키를 모두 모아 한 번에 보고)
pub(crate) fn require_strings<'a>(
    kind: SourceKind,
    settings: &'a Settings,
    keys: &[&str],
) -> std::result::Result<Vec<&'a str>, ConfigError> {
    let mut values = Vec::with_capacity(keys.len());
    let mut missing = Vec::new();

    for key in keys {
        match settings.get(*key).and_then(Value::as_str).map(str::trim) {
            Some(value) if !value.is_empty() => values.push(value),
            _ => missing.push(key.to_string()),
        }
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingSettings {
            kind: kind.as_str(),
            fields: missing,
        });
    }
    Ok(values)
}

pub(crate) fn optional_str<'a>(settings: &'a Settings, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub(crate) fn optional_bool(
    settings: &Settings,
    key: &str,
    default: bool,
) -> std::result::Result<bool, ConfigError> {
    match settings.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(ConfigError::InvalidSetting {
            key: key.to_string(),
            reason: "must be a boolean".to_string(),
        }),
    }
}

/// 문자열 배열 (없으면 None)
pub(crate) fn optional_str_list(
    settings: &Settings,
    key: &str,
) -> std::result::Result<Option<Vec<String>>, ConfigError> {
    let invalid = || ConfigError::InvalidSetting {
        key: key.to_string(),
        reason: "must be an array of strings".to_string(),
    };

    match settings.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(invalid()),
    }
}

// ============================================================================
// Tests
// ============================================================================
