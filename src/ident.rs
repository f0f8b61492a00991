//! 식별자 - 테넌트 ID와 소스 테이블 이름
//!
//! 동적으로 만들어지는 테이블 이름은 모두 이 모듈을 거칩니다.
//! 사용자 입력(표시 이름 등)은 제한된 문자 집합 `[a-z0-9_]`으로 정제된 뒤에만
//! 테이블 이름에 들어갑니다.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 테넌트 ID 최대 길이
const MAX_TENANT_ID_LEN: usize = 64;
/// 테이블 이름 최대 길이
const MAX_TABLE_NAME_LEN: usize = 128;
/// 표시 이름에서 가져오는 세그먼트 최대 길이
const MAX_NAME_SEGMENT_LEN: usize = 40;
/// 소스별 고유 토큰 길이
const TOKEN_LEN: usize = 8;

// ============================================================================
// TenantId
// ============================================================================

/// 테넌트 ID (`[A-Za-z0-9_-]{1,64}`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(value: impl Into<String>) -> Result<Self, ConfigError> {
        let value = value.into();
        let reason = if value.is_empty() {
            Some("must not be empty")
        } else if value.len() > MAX_TENANT_ID_LEN {
            Some("longer than 64 characters")
        } else if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            Some("only ASCII letters, digits, '_' and '-' are allowed")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ConfigError::InvalidTenantId { value, reason }),
            None => Ok(Self(value)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 테이블 이름에 들어가는 형태 (소문자, '-' → '_')
    fn table_segment(&self) -> String {
        self.0
            .chars()
            .map(|c| match c {
                '-' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

// ============================================================================
// TableName
// ============================================================================

/// 소스 테이블 이름 (`[a-z][a-z0-9_]{0,127}`)
///
/// 생성 경로는 [`TableName::derive`] / [`TableName::generate`] 두 가지이며,
/// 외부에서 받은 이름은 [`TableName::parse`]로 검증한 뒤에만 DDL/DML에 사용합니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    pub fn parse(value: impl Into<String>) -> Result<Self, ConfigError> {
        let value = value.into();
        let reason = if value.is_empty() {
            Some("must not be empty")
        } else if value.len() > MAX_TABLE_NAME_LEN {
            Some("longer than 128 characters")
        } else if !value.starts_with(|c: char| c.is_ascii_lowercase()) {
            Some("must start with a lowercase ASCII letter")
        } else if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            Some("only lowercase ASCII letters, digits and '_' are allowed")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ConfigError::InvalidTableName { value, reason }),
            None => Ok(Self(value)),
        }
    }

    /// 테넌트 ID + 토큰 + 정제된 표시 이름으로 테이블 이름 생성 (결정적)
    ///
    /// 형식: `vector_{tenant}_{token}_{name}`
    pub fn derive(tenant: &TenantId, token: &str, display_name: &str) -> Result<Self, ConfigError> {
        let token = sanitize_segment(token, TOKEN_LEN);
        let name = sanitize_segment(display_name, MAX_NAME_SEGMENT_LEN);
        let mut value = format!("vector_{}_{}_{}", tenant.table_segment(), token, name);
        value.truncate(MAX_TABLE_NAME_LEN);
        Self::parse(value.trim_end_matches('_').to_string())
    }

    /// 새 고유 토큰으로 테이블 이름 생성
    pub fn generate(tenant: &TenantId, display_name: &str) -> Result<Self, ConfigError> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        Self::derive(tenant, &token[..TOKEN_LEN], display_name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TableName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TableName {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TableName> for String {
    fn from(name: TableName) -> Self {
        name.0
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 임의 문자열을 `[a-z0-9_]` 세그먼트로 정제
///
/// 허용되지 않는 문자는 '_'로 바꾸고, 연속된 '_'는 하나로 합칩니다.
/// 결과가 비면 "source"를 반환합니다.
fn sanitize_segment(raw: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(raw.len().min(max_len));
    let mut last_underscore = true;

    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
        if out.len() >= max_len {
            break;
        }
    }

    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "source".to_string()
    } else {
        trimmed.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_validation() {
        assert!(TenantId::parse("acme-42").is_ok());
        assert!(TenantId::parse("user_7").is_ok());
        assert!(TenantId::parse("").is_err());
        assert!(TenantId::parse("a/b").is_err());
        assert!(TenantId::parse("x\"; DROP").is_err());
        assert!(TenantId::parse("a".repeat(65)).is_err());
    }

    #[test]
    fn test_table_name_rejects_injection() {
        assert!(TableName::parse("vector_1_abc_docs").is_ok());
        assert!(TableName::parse("docs\"; DROP TABLE x; --").is_err());
        assert!(TableName::parse("Docs").is_err());
        assert!(TableName::parse("1docs").is_err());
        assert!(TableName::parse("../escape").is_err());
        assert!(TableName::parse("").is_err());
    }

    #[test]
    fn test_derive_is_deterministic() {
        let tenant = TenantId::parse("Acme-Corp").unwrap();
        let a = TableName::derive(&tenant, "1a2b3c4d", "Product Docs v2!").unwrap();
        let b = TableName::derive(&tenant, "1a2b3c4d", "Product Docs v2!").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "vector_acme_corp_1a2b3c4d_product_docs_v2");
    }

    #[test]
    fn test_derive_non_ascii_name() {
        let tenant = TenantId::parse("t1").unwrap();
        let name = TableName::derive(&tenant, "deadbeef", "사내 문서").unwrap();
        assert_eq!(name.as_str(), "vector_t1_deadbeef_source");
    }

    #[test]
    fn test_generate_is_unique() {
        let tenant = TenantId::parse("t1").unwrap();
        let a = TableName::generate(&tenant, "docs").unwrap();
        let b = TableName::generate(&tenant, "docs").unwrap();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("vector_t1_"));
        assert!(a.as_str().ends_with("_docs"));
    }

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(sanitize_segment("  Hello,  World  ", 40), "hello_world");
        assert_eq!(sanitize_segment("___", 40), "source");
        assert_eq!(sanitize_segment("abcdefgh", 4), "abcd");
    }
}
