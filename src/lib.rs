//! プラットフォームスクレイピングエンジン
//!
//! - 管理者が作成した宣言的なステップ定義でブラウザを操作する
//! - ダウンロードした表形式ファイルを取込マッピングで正規化する
//! - プラットフォーム・プリンシパル・期間ごとのランを上限付きで並行実行する
//!
//! # 使用例
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use platform_scraper::{EngineConfig, InMemoryCredentialStore, RunOrchestrator, RunRequest};
//! use chrono::NaiveDate;
//!
//! #[tokio::main]
//! async fn main() {
//!     let credentials = InMemoryCredentialStore::new()
//!         .with("tolls", "driver-1", "username", "driver@example.com")
//!         .with("tolls", "driver-1", "password", "secret");
//!
//!     let orchestrator = RunOrchestrator::chromium(EngineConfig::from_env(), Arc::new(credentials));
//!     orchestrator
//!         .register_platform_json(&std::fs::read_to_string("tolls.json").unwrap())
//!         .unwrap();
//!
//!     let run_id = orchestrator
//!         .submit(RunRequest::new(
//!             "tolls",
//!             "driver-1",
//!             NaiveDate::from_ymd_opt(2024, 11, 4).unwrap(),
//!             NaiveDate::from_ymd_opt(2024, 11, 10).unwrap(),
//!         ))
//!         .unwrap();
//!
//!     let report = orchestrator.wait(run_id).await.unwrap();
//!     println!("{}: {} records", report.state, report.records.len());
//! }
//! ```

pub mod browser;
pub mod config;
pub mod engine;
pub mod error;
pub mod import;
pub mod platform;
pub mod resolver;
pub mod service;
pub mod step;
pub mod traits;

// 主要な型をリエクスポート
pub use config::EngineConfig;
pub use engine::{ExecutionEngine, Run, RunId, RunState, TwoFactorSignal};
pub use error::{ErrorKind, ScraperError};
pub use import::{interpret, ImportMapping, ImportOutcome};
pub use platform::PlatformDescriptor;
pub use resolver::{CredentialResolver, InMemoryCredentialStore, Secret};
pub use service::{RecordSink, RunOrchestrator, RunReport, RunRequest};
pub use step::{validate, Step, StepKind};
pub use traits::{BrowserSession, SessionFactory};
