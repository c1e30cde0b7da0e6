//! 認証情報と動的値の解決
//!
//! 認証情報は (プラットフォーム, プリンシパル) 単位で外部ストアから引く。
//! 取り出した値は消費するステップの間だけ保持し、ランの状態やログには残さない。

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::ScraperError;
use crate::platform::DateFormat;
use crate::step::DateBound;

/// URL テンプレートで使えるプレースホルダ
pub const PERIOD_START_PLACEHOLDER: &str = "{{period_start}}";
pub const PERIOD_END_PLACEHOLDER: &str = "{{period_end}}";

/// 秘密値。`Debug` は伏字で、`Display`/`Serialize` は実装しない
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// 見つからない場合は `Ok(None)`
    async fn resolve(
        &self,
        platform_id: &str,
        principal_id: &str,
        field: &str,
    ) -> Result<Option<Secret>, ScraperError>;
}

/// メモリ上の認証情報ストア
#[derive(Default, Clone)]
pub struct InMemoryCredentialStore {
    entries: HashMap<(String, String, String), Secret>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        platform_id: impl Into<String>,
        principal_id: impl Into<String>,
        field: impl Into<String>,
        secret: impl Into<Secret>,
    ) {
        self.entries.insert(
            (platform_id.into(), principal_id.into(), field.into()),
            secret.into(),
        );
    }

    pub fn with(
        mut self,
        platform_id: impl Into<String>,
        principal_id: impl Into<String>,
        field: impl Into<String>,
        secret: impl Into<Secret>,
    ) -> Self {
        self.insert(platform_id, principal_id, field, secret);
        self
    }
}

impl fmt::Debug for InMemoryCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCredentialStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[async_trait]
impl CredentialResolver for InMemoryCredentialStore {
    async fn resolve(
        &self,
        platform_id: &str,
        principal_id: &str,
        field: &str,
    ) -> Result<Option<Secret>, ScraperError> {
        let key = (
            platform_id.to_string(),
            principal_id.to_string(),
            field.to_string(),
        );
        Ok(self.entries.get(&key).cloned())
    }
}

/// ランの対象期間
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ScraperError> {
        if start > end {
            return Err(ScraperError::InvalidPeriod { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn bound(&self, which: DateBound) -> NaiveDate {
        match which {
            DateBound::Start => self.start,
            DateBound::End => self.end,
        }
    }
}

/// 期間の境界をプラットフォームの日付表記で返す
pub fn resolve_date_bound(
    period: &Period,
    which: DateBound,
    format: &DateFormat,
) -> Result<String, ScraperError> {
    format
        .format(period.bound(which))
        .map_err(|reason| ScraperError::Interaction(format!("dateFormat: {}", reason)))
}

/// URL 内のプレースホルダを期間の境界で置き換える
pub fn render_url(template: &str, period: &Period, format: &DateFormat) -> Result<String, ScraperError> {
    if !template.contains(PERIOD_START_PLACEHOLDER) && !template.contains(PERIOD_END_PLACEHOLDER) {
        return Ok(template.to_string());
    }
    let start = resolve_date_bound(period, DateBound::Start, format)?;
    let end = resolve_date_bound(period, DateBound::End, format)?;
    Ok(template
        .replace(PERIOD_START_PLACEHOLDER, &start)
        .replace(PERIOD_END_PLACEHOLDER, &end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn period() -> Period {
        Period::new(
            NaiveDate::from_ymd_opt(2024, 11, 4).unwrap(),
            NaiveDate::from_ymd_opt(2024, 11, 10).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_date_bound_day_first() {
        let format = DateFormat::new("DD/MM/YYYY");
        assert_eq!(
            resolve_date_bound(&period(), DateBound::Start, &format).unwrap(),
            "04/11/2024"
        );
        assert_eq!(
            resolve_date_bound(&period(), DateBound::End, &format).unwrap(),
            "10/11/2024"
        );
    }

    #[test]
    fn test_render_url() {
        let url = render_url(
            "https://tolls.example/statement?from={{period_start}}&to={{period_end}}",
            &period(),
            &DateFormat::default(),
        )
        .unwrap();
        assert_eq!(
            url,
            "https://tolls.example/statement?from=2024-11-04&to=2024-11-10"
        );
        assert_eq!(
            render_url("https://tolls.example/", &period(), &DateFormat::default()).unwrap(),
            "https://tolls.example/"
        );
    }

    #[test]
    fn test_inverted_period_is_rejected() {
        let result = Period::new(
            NaiveDate::from_ymd_opt(2024, 11, 10).unwrap(),
            NaiveDate::from_ymd_opt(2024, 11, 4).unwrap(),
        );
        assert!(matches!(result, Err(ScraperError::InvalidPeriod { .. })));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[tokio::test]
    async fn test_in_memory_store_scopes_by_platform_and_principal() {
        let store = InMemoryCredentialStore::new()
            .with("tolls", "driver-1", "password", "a")
            .with("tolls", "driver-2", "password", "b");

        let found = store.resolve("tolls", "driver-2", "password").await.unwrap();
        assert_eq!(found.unwrap().expose(), "b");
        assert!(store.resolve("rides", "driver-1", "password").await.unwrap().is_none());
        assert!(store.resolve("tolls", "driver-1", "username").await.unwrap().is_none());
    }
}
