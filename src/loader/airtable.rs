//! Airtable 로더 - 테이블 레코드를 문서로
//!
//! 설정: `api_token`, `base_id`, `table_id` (필수), `view`, `api_url` (선택)
//!
//! 레코드 하나가 문서 하나입니다. 필드는 `key: value` 줄로 렌더링됩니다.

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use super::{
    http_client, normalize_url, optional_str, require_strings, LoadOutcome, Settings, SourceKind,
    SourceLoader,
};
use crate::config::LoaderConfig;
use crate::error::{LoaderError, Result};
use crate::knowledge::Metadata;

const DEFAULT_API_URL: &str = "https://api.airtable.com";
const PAGE_SIZE: &str = "100";

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    records: Vec<AirtableRecord>,
    offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AirtableRecord {
    id: String,
    #[serde(rename = "createdTime")]
    created_time: Option<String>,
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
}

/// Airtable 테이블 로더
pub struct AirtableLoader {
    api_token: Secret<String>,
    base_id: String,
    table_id: String,
    view: Option<String>,
    api_url: Url,
    client: reqwest::Client,
}

impl std::fmt::Debug for AirtableLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AirtableLoader")
            .field("base_id", &self.base_id)
            .field("table_id", &self.table_id)
            .field("view", &self.view)
            .field("api_url", &self.api_url.as_str())
            .finish_non_exhaustive()
    }
}

impl AirtableLoader {
    pub fn from_settings(settings: &Settings, config: &LoaderConfig) -> Result<Self> {
        let values = require_strings(
            SourceKind::Airtable,
            settings,
            &["api_token", "base_id", "table_id"],
        )?;

        let api_url = normalize_url(optional_str(settings, "api_url").unwrap_or(DEFAULT_API_URL))?;

        Ok(Self {
            api_token: Secret::new(values[0].to_string()),
            base_id: values[1].to_string(),
            table_id: values[2].to_string(),
            view: optional_str(settings, "view").map(str::to_string),
            api_url,
            client: http_client(config)?,
        })
    }

    /// 페이지 요청 URL
    fn page_url(&self, offset: Option<&str>) -> std::result::Result<Url, LoaderError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| LoaderError::InvalidResponse {
                url: self.api_url.to_string(),
                message: "api url cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .extend(["v0", self.base_id.as_str(), self.table_id.as_str()]);

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("pageSize", PAGE_SIZE);
            if let Some(view) = &self.view {
                query.append_pair("view", view);
            }
            if let Some(offset) = offset {
                query.append_pair("offset", offset);
            }
        }

        Ok(url)
    }

    async fn fetch_page(&self, offset: Option<&str>) -> std::result::Result<ListResponse, LoaderError> {
        let url = self.page_url(offset)?;
        tracing::debug!("Fetching Airtable page: {}", url);

        let response = self
            .client
            .get(url.clone())
            .bearer_auth(self.api_token.expose_secret())
            .send()
            .await
            .map_err(|source| LoaderError::Http {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LoaderError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .json::<ListResponse>()
            .await
            .map_err(|e| LoaderError::InvalidResponse {
                url: url.to_string(),
                message: e.to_string(),
            })
    }
}

/// 필드를 "key: value" 줄로
fn render_fields(fields: &serde_json::Map<String, Value>) -> String {
    fields
        .iter()
        .filter_map(|(key, value)| {
            let rendered = match value {
                Value::Null => return None,
                Value::String(s) => s.trim().to_string(),
                Value::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", "),
                other => other.to_string(),
            };
            (!rendered.is_empty()).then(|| format!("{}: {}", key, rendered))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl SourceLoader for AirtableLoader {
    async fn load(&self) -> std::result::Result<LoadOutcome, LoaderError> {
        let mut outcome = LoadOutcome::default();
        let mut offset: Option<String> = None;

        loop {
            let page = self.fetch_page(offset.as_deref()).await?;

            for record in page.records {
                let text = render_fields(&record.fields);
                outcome.total_bytes += text.len() as u64;

                if text.is_empty() {
                    outcome.skip(format!("airtable:{}", record.id), "record has no fields");
                    continue;
                }

                let mut metadata = Metadata::new();
                metadata.insert("source".to_string(), Value::String("airtable".to_string()));
                metadata.insert("base_id".to_string(), Value::String(self.base_id.clone()));
                metadata.insert("table_id".to_string(), Value::String(self.table_id.clone()));
                metadata.insert("record_id".to_string(), Value::String(record.id));
                if let Some(created) = record.created_time {
                    metadata.insert("created_time".to_string(), Value::String(created));
                }
                outcome.push(text, metadata);
            }

            match page.offset {
                Some(next) if !next.is_empty() => offset = Some(next),
                _ => break,
            }
        }

        tracing::info!(
            "Loaded {} Airtable records from {}/{}",
            outcome.documents.len(),
            self.base_id,
            self.table_id
        );
        Ok(outcome)
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Airtable
    }
}

// ============================================================================
// Tests
// ============================================================================
