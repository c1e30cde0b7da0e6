use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ScraperError;
use crate::step::Selector;

/// ブラウザから受け取ったファイル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub file_name: String,
    pub content: Vec<u8>,
}

/// 1ランが占有するブラウザセッション
///
/// エンジンはステップを逐次実行するので、実装側で並行呼び出しを考慮する必要はない。
#[async_trait]
pub trait BrowserSession: Send {
    /// ページ遷移（完了待ちまで含む）
    async fn goto(&mut self, url: &str) -> Result<(), ScraperError>;

    /// 要素が現在存在するか
    async fn exists(&mut self, selector: &Selector) -> Result<bool, ScraperError>;

    async fn click(&mut self, selector: &Selector) -> Result<(), ScraperError>;

    /// 既存の値を消してから入力する
    async fn type_text(&mut self, selector: &Selector, text: &str) -> Result<(), ScraperError>;

    async fn select_option(&mut self, selector: &Selector, value: &str) -> Result<(), ScraperError>;

    async fn press_key(&mut self, selector: &Selector, key: &str) -> Result<(), ScraperError>;

    /// 完了済みで未取得のダウンロードがあれば1件返す
    async fn take_download(&mut self) -> Result<Option<DownloadedFile>, ScraperError>;

    /// 表示中のビューポートを PNG で取得
    async fn screenshot(&mut self) -> Result<Vec<u8>, ScraperError>;

    /// リソース解放
    async fn close(&mut self) -> Result<(), ScraperError>;
}

/// ランごとに新しいセッションを開く
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, run_id: Uuid) -> Result<Box<dyn BrowserSession>, ScraperError>;
}
