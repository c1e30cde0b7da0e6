use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::step::ValidationErrors;

#[derive(Error, Debug)]
pub enum ScraperError {
    #[error("ブラウザ初期化エラー: {0}")]
    BrowserInit(String),

    #[error("ナビゲーションエラー: {0}")]
    Navigation(String),

    #[error("要素が見つかりません: {0}")]
    SelectorNotFound(String),

    #[error("要素の出現待ちがタイムアウトしました: {selector} ({timeout_ms}ms)")]
    SelectorTimeout { selector: String, timeout_ms: u64 },

    #[error("ダウンロードが{0}ms以内に完了しませんでした")]
    DownloadTimeout(u64),

    #[error("認証情報が見つかりません: {0}")]
    MissingCredential(String),

    #[error("2段階認証の待機がタイムアウトしました ({0}ms)")]
    TwoFactorTimeout(u64),

    #[error("ブラウザ操作エラー: {0}")]
    Interaction(String),

    #[error("ランがキャンセルされました")]
    Cancelled,

    #[error("ファイル操作エラー: {0}")]
    FileIO(#[from] std::io::Error),

    #[error("JSONエラー: {0}")]
    Json(#[from] serde_json::Error),

    #[error("プラットフォーム定義が不正です: {0}")]
    Validation(ValidationErrors),

    #[error("期間が不正です: {start} > {end}")]
    InvalidPeriod {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("プラットフォームが見つかりません: {0}")]
    PlatformNotFound(String),

    #[error("ランが見つかりません: {0}")]
    RunNotFound(Uuid),

    #[error("RPA以外の連携方式ではエンジンを起動できません: {0}")]
    UnsupportedIntegration(String),

    #[error("取込ファイルを読み込めません: {0}")]
    ArtifactUnreadable(String),

    #[error("シグナルを受け付けられません: {0}")]
    SignalRejected(String),

    #[error("ランの受付を停止しています")]
    Unavailable,
}

/// レポートに載せるエラー種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    MissingCredential,
    SelectorNotFound,
    SelectorTimeout,
    DownloadTimeout,
    NavigationFailure,
    TwoFaTimeout,
    RowCoercionError,
    BrowserInit,
    Interaction,
    Cancelled,
    ArtifactUnreadable,
    Internal,
}

impl ErrorKind {
    /// 新しいランで再実行すれば成功しうる失敗か
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::NavigationFailure | ErrorKind::BrowserInit)
    }
}

impl ScraperError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScraperError::BrowserInit(_) => ErrorKind::BrowserInit,
            ScraperError::Navigation(_) => ErrorKind::NavigationFailure,
            ScraperError::SelectorNotFound(_) => ErrorKind::SelectorNotFound,
            ScraperError::SelectorTimeout { .. } => ErrorKind::SelectorTimeout,
            ScraperError::DownloadTimeout(_) => ErrorKind::DownloadTimeout,
            ScraperError::MissingCredential(_) => ErrorKind::MissingCredential,
            ScraperError::TwoFactorTimeout(_) => ErrorKind::TwoFaTimeout,
            ScraperError::Interaction(_) => ErrorKind::Interaction,
            ScraperError::Cancelled => ErrorKind::Cancelled,
            ScraperError::Validation(_) | ScraperError::InvalidPeriod { .. } => {
                ErrorKind::ValidationError
            }
            ScraperError::ArtifactUnreadable(_) => ErrorKind::ArtifactUnreadable,
            ScraperError::FileIO(_)
            | ScraperError::Json(_)
            | ScraperError::PlatformNotFound(_)
            | ScraperError::RunNotFound(_)
            | ScraperError::UnsupportedIntegration(_)
            | ScraperError::SignalRejected(_)
            | ScraperError::Unavailable => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
