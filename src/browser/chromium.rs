//! chromiumoxide によるブラウザセッション

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::element::Element;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::ScraperError;
use crate::step::{Selector, SelectorStrategy};
use crate::traits::{BrowserSession, DownloadedFile, SessionFactory};

/// ランごとに Chromium を起動するファクトリ
#[derive(Debug, Clone)]
pub struct ChromiumSessionFactory {
    config: EngineConfig,
}

impl ChromiumSessionFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for ChromiumSessionFactory {
    async fn open(&self, run_id: Uuid) -> Result<Box<dyn BrowserSession>, ScraperError> {
        let session = ChromiumSession::launch(&self.config, run_id).await?;
        Ok(Box::new(session))
    }
}

pub struct ChromiumSession {
    browser: Option<Browser>,
    page: Option<Arc<Page>>,
    handler: Option<JoinHandle<()>>,
    download_dir: PathBuf,
    user_data_dir: PathBuf,
    collected: HashSet<PathBuf>,
}

impl ChromiumSession {
    pub async fn launch(config: &EngineConfig, run_id: Uuid) -> Result<Self, ScraperError> {
        info!(%run_id, "Launching browser session...");

        // ダウンロードディレクトリを作成
        let download_dir = config.download_root.join(run_id.to_string());
        std::fs::create_dir_all(&download_dir)?;
        let download_dir = download_dir.canonicalize().unwrap_or(download_dir);

        // ランごとに独立したユーザーデータディレクトリ
        let user_data_dir = std::env::temp_dir().join(format!("platform-scraper-{}", run_id));

        let mut session = Self {
            browser: None,
            page: None,
            handler: None,
            download_dir,
            user_data_dir,
            collected: HashSet::new(),
        };

        // 起動途中で失敗してもブラウザとディレクトリは片付ける
        if let Err(e) = session.start(config).await {
            warn!(%run_id, "Browser launch failed: {}", e);
            if let Err(close_err) = session.close().await {
                debug!("Cleanup after failed launch: {}", close_err);
            }
            return Err(e);
        }

        info!(%run_id, download_dir = %session.download_dir.display(), "Browser session ready");
        Ok(session)
    }

    async fn start(&mut self, config: &EngineConfig) -> Result<(), ScraperError> {
        let mut builder = BrowserConfig::builder()
            .window_size(1280, 800)
            .user_data_dir(&self.user_data_dir)
            .request_timeout(config.request_timeout)
            .no_sandbox()
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");

        if let Some(path) = &config.chrome_path {
            builder = builder.chrome_executable(path);
        }
        if !config.headless {
            builder = builder.with_head();
        }

        let browser_config = builder
            .build()
            .map_err(|e| ScraperError::BrowserInit(format!("ブラウザ設定エラー: {}", e)))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| ScraperError::BrowserInit(e.to_string()))?;
        let browser = self.browser.insert(browser);

        // ブラウザイベントハンドラをバックグラウンドで実行
        self.handler = Some(tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {:?}", e);
                }
            }
        }));

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScraperError::BrowserInit(e.to_string()))?;

        // ダウンロード先を設定（元のファイル名を保持する）
        let download_params = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(self.download_dir.to_string_lossy().to_string())
            .events_enabled(true)
            .build()
            .map_err(|e| ScraperError::BrowserInit(format!("ダウンロード設定エラー: {}", e)))?;

        page.execute(download_params)
            .await
            .map_err(|e| ScraperError::BrowserInit(format!("ダウンロード設定エラー: {}", e)))?;

        self.page = Some(Arc::new(page));
        Ok(())
    }

    fn page(&self) -> Result<&Arc<Page>, ScraperError> {
        self.page
            .as_ref()
            .ok_or_else(|| ScraperError::BrowserInit("ブラウザが初期化されていません".into()))
    }

    async fn find(&self, selector: &Selector) -> Result<Element, ScraperError> {
        let page = self.page()?;
        let found = match selector.strategy {
            SelectorStrategy::Css => page.find_element(selector.value.as_str()).await,
            SelectorStrategy::Xpath => page.find_xpath(selector.value.as_str()).await,
        };
        found.map_err(|e| ScraperError::SelectorNotFound(format!("{}: {}", selector, e)))
    }

    /// 書き込み中（.crdownload / .tmp）を除いた未取得ファイル
    fn find_completed_file(&self) -> Option<PathBuf> {
        std::fs::read_dir(&self.download_dir)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| !self.collected.contains(path))
            .find(|path| !is_partial_download(path))
    }
}

fn is_partial_download(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    name.ends_with(".crdownload") || name.ends_with(".tmp") || name.starts_with(".com.google")
}

fn interaction(selector: &Selector, action: &str, e: impl std::fmt::Display) -> ScraperError {
    ScraperError::Interaction(format!("{} {}: {}", action, selector, e))
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn goto(&mut self, url: &str) -> Result<(), ScraperError> {
        let page = self.page()?.clone();
        page.goto(url)
            .await
            .map_err(|e| ScraperError::Navigation(format!("{}: {}", url, e)))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| ScraperError::Navigation(format!("{}: {}", url, e)))?;
        debug!(url, "Navigation complete");
        Ok(())
    }

    async fn exists(&mut self, selector: &Selector) -> Result<bool, ScraperError> {
        Ok(self.find(selector).await.is_ok())
    }

    async fn click(&mut self, selector: &Selector) -> Result<(), ScraperError> {
        self.find(selector)
            .await?
            .click()
            .await
            .map_err(|e| interaction(selector, "click", e))?;
        Ok(())
    }

    async fn type_text(&mut self, selector: &Selector, text: &str) -> Result<(), ScraperError> {
        let element = self.find(selector).await?;
        element
            .call_js_fn("function() { this.value = ''; }", false)
            .await
            .map_err(|e| interaction(selector, "clear", e))?;
        element
            .click()
            .await
            .map_err(|e| interaction(selector, "focus", e))?
            .type_str(text)
            .await
            .map_err(|e| interaction(selector, "type", e))?;
        Ok(())
    }

    async fn select_option(&mut self, selector: &Selector, value: &str) -> Result<(), ScraperError> {
        let element = self.find(selector).await?;
        let literal = serde_json::to_string(value)?;
        let script = format!(
            r#"function() {{
                this.value = {};
                this.dispatchEvent(new Event('input', {{ bubbles: true }}));
                this.dispatchEvent(new Event('change', {{ bubbles: true }}));
            }}"#,
            literal
        );
        element
            .call_js_fn(script, false)
            .await
            .map_err(|e| interaction(selector, "select", e))?;
        Ok(())
    }

    async fn press_key(&mut self, selector: &Selector, key: &str) -> Result<(), ScraperError> {
        self.find(selector)
            .await?
            .press_key(key)
            .await
            .map_err(|e| interaction(selector, "press", e))?;
        Ok(())
    }

    async fn take_download(&mut self) -> Result<Option<DownloadedFile>, ScraperError> {
        let Some(path) = self.find_completed_file() else {
            return Ok(None);
        };
        let content = tokio::fs::read(&path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        info!(file = %file_name, size = content.len(), "Download detected");
        self.collected.insert(path);
        Ok(Some(DownloadedFile { file_name, content }))
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, ScraperError> {
        let page = self.page()?.clone();
        page.screenshot(ScreenshotParams::builder().build())
            .await
            .map_err(|e| ScraperError::Interaction(format!("screenshot: {}", e)))
    }

    async fn close(&mut self) -> Result<(), ScraperError> {
        info!("Closing browser session...");

        self.page = None;
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                debug!("Browser close failed: {}", e);
            }
            if let Err(e) = browser.wait().await {
                debug!("Browser wait failed: {}", e);
            }
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }

        for dir in [&self.download_dir, &self.user_data_dir] {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %dir.display(), "Failed to remove session directory: {}", e);
                }
            }
        }

        info!("Browser session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_downloads_are_skipped() {
        assert!(is_partial_download(Path::new("/tmp/x/report.csv.crdownload")));
        assert!(is_partial_download(Path::new("/tmp/x/ABC.TMP")));
        assert!(!is_partial_download(Path::new("/tmp/x/report.xlsx")));
    }

    #[tokio::test]
    async fn test_failed_launch_removes_download_dir() {
        let root = std::env::temp_dir().join(format!("ps-launch-{}", Uuid::new_v4()));
        let config = EngineConfig::new()
            .with_download_root(&root)
            .with_chrome_path("/nonexistent/chromium");
        let run_id = Uuid::new_v4();

        match ChromiumSession::launch(&config, run_id).await {
            Ok(_) => panic!("launch should fail without a browser binary"),
            Err(e) => assert_eq!(e.kind(), crate::error::ErrorKind::BrowserInit),
        }
        assert!(!root.join(run_id.to_string()).exists());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    #[ignore] // 実ブラウザが必要: cargo test chromium_session_smoke -- --ignored --nocapture
    async fn chromium_session_smoke() {
        let config = EngineConfig::new().with_download_root(std::env::temp_dir().join("ps-smoke"));
        let mut session = ChromiumSession::launch(&config, Uuid::new_v4())
            .await
            .expect("Failed to launch browser");

        session
            .goto("data:text/html,<input id='q'><select id='s'><option value='b'>b</option></select>")
            .await
            .unwrap();
        assert!(session.exists(&Selector::css("#q")).await.unwrap());
        assert!(session.exists(&Selector::xpath("//select[@id='s']")).await.unwrap());
        session.type_text(&Selector::css("#q"), "hello").await.unwrap();
        session.select_option(&Selector::css("#s"), "b").await.unwrap();
        assert!(!session.screenshot().await.unwrap().is_empty());
        session.close().await.unwrap();
    }
}
