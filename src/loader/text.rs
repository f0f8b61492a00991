//! 인라인 텍스트 로더
//!
//! 설정: `documents: [string]` 또는 `text: string`

use async_trait::async_trait;
use serde_json::Value;

use super::{optional_str_list, LoadOutcome, Settings, SourceKind, SourceLoader};
use crate::error::{ConfigError, LoaderError, Result};
use crate::knowledge::Metadata;

/// 설정에 직접 들어있는 문서들
#[derive(Debug, Clone)]
pub struct InlineTextLoader {
    documents: Vec<String>,
}

impl InlineTextLoader {
    pub fn new(documents: Vec<String>) -> Self {
        Self { documents }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        if let Some(documents) = optional_str_list(settings, "documents")? {
            return Ok(Self::new(documents));
        }

        match settings.get("text") {
            Some(Value::String(text)) => Ok(Self::new(vec![text.clone()])),
            Some(_) => Err(ConfigError::InvalidSetting {
                key: "text".to_string(),
                reason: "must be a string".to_string(),
            }
            .into()),
            None => Err(ConfigError::MissingSettings {
                kind: SourceKind::Text.as_str(),
                fields: vec!["documents".to_string(), "text".to_string()],
            }
            .into()),
        }
    }
}

#[async_trait]
impl SourceLoader for InlineTextLoader {
    async fn load(&self) -> std::result::Result<LoadOutcome, LoaderError> {
        let mut outcome = LoadOutcome::default();

        for (i, text) in self.documents.iter().enumerate() {
            let mut metadata = Metadata::new();
            metadata.insert("source".to_string(), Value::String("inline".to_string()));
            metadata.insert("position".to_string(), Value::from(i));

            outcome.total_bytes += text.len() as u64;
            outcome.push(text.clone(), metadata);
        }

        Ok(outcome)
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(value: Value) -> Settings {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_documents_array() {
        let loader =
            InlineTextLoader::from_settings(&settings(json!({ "documents": ["one", "two"] })))
                .unwrap();
        let outcome = loader.load().await.unwrap();

        assert_eq!(outcome.documents_total, 2);
        assert_eq!(outcome.documents[1].text, "two");
        assert_eq!(outcome.documents[1].metadata["position"], json!(1));
        assert_eq!(outcome.total_bytes, 6);
    }

    #[tokio::test]
    async fn test_single_text() {
        let loader = InlineTextLoader::from_settings(&settings(json!({ "text": "hello" }))).unwrap();
        let outcome = loader.load().await.unwrap();
        assert_eq!(outcome.documents.len(), 1);
        assert_eq!(outcome.documents[0].metadata["source"], json!("inline"));
    }

    #[test]
    fn test_missing_and_invalid() {
        assert!(InlineTextLoader::from_settings(&settings(json!({}))).is_err());
        assert!(InlineTextLoader::from_settings(&settings(json!({ "text": 5 }))).is_err());
        assert!(InlineTextLoader::from_settings(&settings(json!({ "documents": "x" }))).is_err());
    }
}
