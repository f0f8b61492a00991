//! 웹 스크래퍼 로더 - URL 목록에서 본문 텍스트 추출
//!
//! 설정: `urls: [string]`, `requests_per_second: number` (선택)
//!
//! 응답 실패(전송 오류, 2xx 아닌 상태, `loader.max_file_size` 초과)나 본문이
//! 없는 페이지는 건너뜁니다.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use url::Url;

use super::{http_client, optional_str_list, LoadOutcome, Settings, SourceKind, SourceLoader};
use crate::config::LoaderConfig;
use crate::error::{ConfigError, LoaderError, Result};
use crate::knowledge::Metadata;

/// URL 정규화 (스킴이 없으면 https, http/https만 허용)
pub fn normalize_url(raw: &str) -> std::result::Result<Url, ConfigError> {
    let trimmed = raw.trim();
    let invalid = |reason: &str| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    if trimmed.is_empty() {
        return Err(invalid("empty url"));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let url = Url::parse(&candidate).map_err(|e| invalid(&e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(&format!("unsupported scheme '{}'", other))),
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(invalid("missing host"));
    }

    Ok(url)
}

/// 웹 페이지 로더
#[derive(Debug, Clone)]
pub struct WebScraperLoader {
    urls: Vec<Url>,
    requests_per_second: Option<f64>,
    /// 본문 최대 크기 (None이면 제한 없음)
    max_body_size: Option<u64>,
    client: reqwest::Client,
}

impl WebScraperLoader {
    pub fn from_settings(settings: &Settings, config: &LoaderConfig) -> Result<Self> {
        let raw = optional_str_list(settings, "urls")?
            .filter(|urls| !urls.is_empty())
            .ok_or_else(|| ConfigError::MissingSettings {
                kind: SourceKind::WebScraper.as_str(),
                fields: vec!["urls".to_string()],
            })?;

        let urls = raw
            .iter()
            .map(|u| normalize_url(u))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let requests_per_second = match settings.get("requests_per_second") {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_f64() {
                Some(rps) if rps > 0.0 && rps.is_finite() => Some(rps),
                _ => {
                    return Err(ConfigError::InvalidSetting {
                        key: "requests_per_second".to_string(),
                        reason: "must be a positive number".to_string(),
                    }
                    .into())
                }
            },
        };

        Ok(Self {
            urls,
            requests_per_second,
            max_body_size: (config.max_file_size > 0).then_some(config.max_file_size),
            client: http_client(config)?,
        })
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    fn request_interval(&self) -> Option<Duration> {
        self.requests_per_second
            .map(|rps| Duration::from_secs_f64(1.0 / rps))
    }

    async fn fetch(&self, url: &Url) -> std::result::Result<String, LoaderError> {
        tracing::info!("Scraping: {}", url);

        let mut response = self
            .client
            .get(url.clone())
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

        let limit = self.max_body_size.unwrap_or(u64::MAX);
        let too_large = || LoaderError::ResponseTooLarge {
            url: url.to_string(),
            limit,
        };
        if response.content_length().is_some_and(|length| length > limit) {
            return Err(too_large());
        }

        // Content-Length가 없거나 틀릴 수 있으므로 읽으면서도 제한
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|source| LoaderError::Http {
            url: url.to_string(),
            source,
        })? {
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[async_trait]
impl SourceLoader for WebScraperLoader {
    async fn load(&self) -> std::result::Result<LoadOutcome, LoaderError> {
        let mut outcome = LoadOutcome::default();
        let interval = self.request_interval();

        for (i, url) in self.urls.iter().enumerate() {
            if i > 0 {
                if let Some(interval) = interval {
                    tokio::time::sleep(interval).await;
                }
            }

            let html = match self.fetch(url).await {
                Ok(html) => html,
                Err(e) => {
                    outcome.skip(url.as_str(), e);
                    continue;
                }
            };
            outcome.total_bytes += html.len() as u64;

            // Html은 Send가 아니므로 await 경계를 넘기지 않음
            let (title, content) = extract_page(&html);
            if content.is_empty() {
                outcome.skip(url.as_str(), "no text content");
                continue;
            }

            let mut metadata = Metadata::new();
            metadata.insert("source".to_string(), Value::String(url.to_string()));
            if let Some(title) = title {
                metadata.insert("title".to_string(), Value::String(title));
            }
            outcome.push(content, metadata);
        }

        tracing::info!(
            "Scraped {} of {} pages",
            outcome.documents.len(),
            self.urls.len()
        );
        Ok(outcome)
    }

    fn kind(&self) -> SourceKind {
        SourceKind::WebScraper
    }
}

// ============================================================================
// HTML Extraction
// ============================================================================

/// HTML에서 (제목, 본문) 추출
pub(crate) fn extract_page(html: &str) -> (Option<String>, String) {
    let document = Html::parse_document(html);
    (extract_title(&document), extract_content(&document))
}

fn first_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let element = document.select(&selector).next()?;
    let text = element.text().collect::<String>().trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// 제목: <title>, 없으면 첫 <h1>
fn extract_title(document: &Html) -> Option<String> {
    first_text(document, "title").or_else(|| first_text(document, "h1"))
}

/// 본문 추출 (HTML 태그 제거)
fn extract_content(document: &Html) -> String {
    // 우선순위: article > main > body
    let selectors = [
        "article",
        "main",
        "[role=main]",
        ".content",
        "#content",
        "body",
    ];

    for selector_str in selectors {
        if let Ok(selector) = Selector::parse(selector_str) {
            if let Some(element) = document.select(&selector).next() {
                let text = element_text(&element);
                if text.len() > 100 {
                    return text;
                }
            }
        }
    }

    // 폴백: 전체 body 텍스트
    if let Ok(selector) = Selector::parse("body") {
        if let Some(element) = document.select(&selector).next() {
            return element_text(&element);
        }
    }

    String::new()
}

/// 요소의 텍스트 노드 (script/style 제외, 공백 정리)
fn element_text(element: &ElementRef) -> String {
    let mut parts = Vec::new();

    for node in element.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let inside_code = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .map(|e| matches!(e.name(), "script" | "style" | "noscript"))
                .unwrap_or(false)
        });
        if !inside_code {
            parts.push(text.trim().to_string());
        }
    }

    parts
        .iter()
        .flat_map(|p| p.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Tests
// ============================================================================
