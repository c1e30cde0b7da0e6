//! テスト用のスクリプト化されたセッション（時間は tokio の仮想時計で進める）

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ScraperError;
use crate::step::Selector;
use crate::traits::{BrowserSession, DownloadedFile, SessionFactory};

#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    /// セレクタ値と、セッション開始から出現までの時間
    pub elements: Vec<(String, Duration)>,
    /// 開始から完了までの時間とファイル
    pub downloads: Vec<(Duration, DownloadedFile)>,
    pub fail_screenshot: bool,
    pub fail_goto: bool,
}

impl FakeScript {
    pub fn with_element(mut self, selector: &str, after: Duration) -> Self {
        self.elements.push((selector.to_string(), after));
        self
    }

    pub fn with_download(mut self, after: Duration, file_name: &str, content: &[u8]) -> Self {
        self.downloads.push((
            after,
            DownloadedFile {
                file_name: file_name.to_string(),
                content: content.to_vec(),
            },
        ));
        self
    }
}

#[derive(Debug, Default)]
pub struct FakeLog {
    pub opened: usize,
    pub closed: usize,
    pub actions: Vec<String>,
}

#[derive(Clone)]
pub struct FakeSessionFactory {
    script: FakeScript,
    log: Arc<Mutex<FakeLog>>,
}

impl FakeSessionFactory {
    pub fn new(script: FakeScript) -> Self {
        Self {
            script,
            log: Arc::default(),
        }
    }

    pub fn log(&self) -> Arc<Mutex<FakeLog>> {
        self.log.clone()
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn open(&self, _run_id: Uuid) -> Result<Box<dyn BrowserSession>, ScraperError> {
        self.log.lock().unwrap().opened += 1;
        Ok(Box::new(FakeSession {
            script: self.script.clone(),
            log: self.log.clone(),
            opened_at: Instant::now(),
            taken: 0,
        }))
    }
}

struct FakeSession {
    script: FakeScript,
    log: Arc<Mutex<FakeLog>>,
    opened_at: Instant,
    taken: usize,
}

impl FakeSession {
    fn record(&self, action: String) {
        self.log.lock().unwrap().actions.push(action);
    }

    fn present(&self, selector: &Selector) -> bool {
        let elapsed = self.opened_at.elapsed();
        self.script
            .elements
            .iter()
            .any(|(value, after)| *value == selector.value && elapsed >= *after)
    }

    fn require(&self, selector: &Selector) -> Result<(), ScraperError> {
        if self.present(selector) {
            Ok(())
        } else {
            Err(ScraperError::SelectorNotFound(selector.to_string()))
        }
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn goto(&mut self, url: &str) -> Result<(), ScraperError> {
        if self.script.fail_goto {
            return Err(ScraperError::Navigation(format!("{}: net::ERR_NAME_NOT_RESOLVED", url)));
        }
        self.record(format!("goto {}", url));
        Ok(())
    }

    async fn exists(&mut self, selector: &Selector) -> Result<bool, ScraperError> {
        Ok(self.present(selector))
    }

    async fn click(&mut self, selector: &Selector) -> Result<(), ScraperError> {
        self.require(selector)?;
        self.record(format!("click {}", selector.value));
        Ok(())
    }

    async fn type_text(&mut self, selector: &Selector, text: &str) -> Result<(), ScraperError> {
        self.require(selector)?;
        self.record(format!("type {}={}", selector.value, text));
        Ok(())
    }

    async fn select_option(&mut self, selector: &Selector, value: &str) -> Result<(), ScraperError> {
        self.require(selector)?;
        self.record(format!("select {}={}", selector.value, value));
        Ok(())
    }

    async fn press_key(&mut self, selector: &Selector, key: &str) -> Result<(), ScraperError> {
        self.require(selector)?;
        self.record(format!("press {}={}", selector.value, key));
        Ok(())
    }

    async fn take_download(&mut self) -> Result<Option<DownloadedFile>, ScraperError> {
        let elapsed = self.opened_at.elapsed();
        match self.script.downloads.get(self.taken) {
            Some((after, file)) if elapsed >= *after => {
                self.taken += 1;
                Ok(Some(file.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, ScraperError> {
        if self.script.fail_screenshot {
            return Err(ScraperError::Interaction("screenshot: target closed".into()));
        }
        Ok(b"\x89PNG fake".to_vec())
    }

    async fn close(&mut self) -> Result<(), ScraperError> {
        self.log.lock().unwrap().closed += 1;
        Ok(())
    }
}
