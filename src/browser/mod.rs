//! ブラウザセッション

mod chromium;
#[cfg(test)]
pub(crate) mod fake;

pub use crate::traits::{BrowserSession, DownloadedFile, SessionFactory};
pub use chromium::{ChromiumSession, ChromiumSessionFactory};
