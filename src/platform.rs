//! プラットフォーム定義
//!
//! ログイン・抽出の2本のステップ列、認証項目のスキーマ、2段階認証の情報、
//! 取込マッピングをまとめたもの。管理画面から JSON で渡される。

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ScraperError;
use crate::import::ImportMapping;
use crate::step::{self, Selector, StepList};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationMethod {
    Rpa,
    Api,
    ManualUpload,
}

impl fmt::Display for IntegrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrationMethod::Rpa => f.write_str("rpa"),
            IntegrationMethod::Api => f.write_str("api"),
            IntegrationMethod::ManualUpload => f.write_str("manual_upload"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginType {
    Manual,
    Automatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwoFactorKind {
    Sms,
    Email,
    Authenticator,
    Other,
}

/// 2段階認証コードの入力先
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwoFactorInput {
    #[serde(default)]
    pub code_selector: Option<Selector>,
    #[serde(default)]
    pub submit_selector: Option<Selector>,
}

/// プラットフォームごとの日付表記（`YYYY`, `YY`, `MM`, `M`, `DD`, `D` 以外はそのまま出力）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DateFormat(String);

impl Default for DateFormat {
    fn default() -> Self {
        Self("YYYY-MM-DD".to_string())
    }
}

impl DateFormat {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn pattern(&self) -> &str {
        &self.0
    }

    /// chrono の書式文字列へ変換する
    pub fn to_chrono(&self) -> Result<String, String> {
        const TOKENS: [(&str, &str, char); 6] = [
            ("YYYY", "%Y", 'y'),
            ("YY", "%y", 'y'),
            ("MM", "%m", 'm'),
            ("DD", "%d", 'd'),
            ("M", "%-m", 'm'),
            ("D", "%-d", 'd'),
        ];

        let mut out = String::new();
        let mut seen = Vec::new();
        let mut rest = self.0.as_str();

        'outer: while let Some(c) = rest.chars().next() {
            for (token, directive, part) in TOKENS {
                if let Some(tail) = rest.strip_prefix(token) {
                    if seen.contains(&part) {
                        return Err(format!("'{}' repeats a date component", self.0));
                    }
                    seen.push(part);
                    out.push_str(directive);
                    rest = tail;
                    continue 'outer;
                }
            }
            if c == '%' {
                out.push_str("%%");
            } else {
                out.push(c);
            }
            rest = &rest[c.len_utf8()..];
        }

        if seen.len() != 3 {
            return Err(format!("'{}' must contain a year, a month and a day", self.0));
        }
        Ok(out)
    }

    pub fn format(&self, date: NaiveDate) -> Result<String, String> {
        Ok(date.format(&self.to_chrono()?).to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformDescriptor {
    pub id: String,
    pub integration_method: IntegrationMethod,
    pub login_type: LoginType,
    #[serde(rename = "requires2FA", default)]
    pub requires_two_factor: bool,
    #[serde(rename = "twoFAKind", default, skip_serializing_if = "Option::is_none")]
    pub two_factor_kind: Option<TwoFactorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub two_factor_input: Option<TwoFactorInput>,
    #[serde(default)]
    pub date_format: DateFormat,
    #[serde(default)]
    pub credential_fields: Vec<String>,
    #[serde(default)]
    pub login_steps: StepList,
    #[serde(default)]
    pub extraction_steps: StepList,
    pub import_mapping: ImportMapping,
}

impl PlatformDescriptor {
    /// JSON から読み込み、検証を通ったものだけを返す
    pub fn from_json(json: &str) -> Result<Self, ScraperError> {
        let mut descriptor: PlatformDescriptor = serde_json::from_str(json)?;
        step::validate(&descriptor).map_err(ScraperError::Validation)?;
        descriptor.sort_steps();
        Ok(descriptor)
    }

    /// 配列の並びを `order` に揃える（検証済みなら番号は変わらない）
    pub fn sort_steps(&mut self) {
        self.login_steps.resequence();
        self.extraction_steps.resequence();
    }

    pub fn validate(&self) -> step::ValidationResult {
        step::validate(self)
    }

    /// ログイン後に2段階認証のシグナルを待つか
    pub fn awaits_two_factor(&self) -> bool {
        self.requires_two_factor
    }
}
