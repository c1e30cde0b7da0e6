//! ランとその成果物

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::state::RunState;
use crate::error::{ErrorKind, ScraperError};
use crate::resolver::{Period, Secret};
use crate::step::{Phase, Step, StepKind};

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Download,
    Screenshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: Uuid,
    pub kind: ArtifactKind,
    pub phase: Phase,
    pub step_order: u32,
    pub file_name: String,
    #[serde(serialize_with = "as_base64")]
    pub content: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        kind: ArtifactKind,
        phase: Phase,
        step_order: u32,
        file_name: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            phase,
            step_order,
            file_name: file_name.into(),
            content,
            captured_at: Utc::now(),
        }
    }
}

fn as_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

/// レポートに載せる失敗情報（スクリプト修正に必要な情報を持つ）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_kind: Option<StepKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            phase: None,
            order: None,
            step_kind: None,
            selector: None,
            timeout_ms: None,
        }
    }

    pub fn from_error(error: &ScraperError) -> Self {
        Self::new(error.kind(), error.to_string())
    }

    pub fn in_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// 失敗したステップの位置と設定を付け加える
    pub fn at_step(mut self, phase: Phase, step: &Step, timeout_ms: Option<u64>) -> Self {
        self.phase = Some(phase);
        self.order = Some(step.order);
        self.step_kind = Some(step.kind);
        self.selector = step.selector.clone();
        self.timeout_ms = timeout_ms;
        self
    }
}

/// 1回の実行
///
/// 状態はエンジンだけが変更し、変化は watch チャネルで外部に通知する。
#[derive(Debug)]
pub struct Run {
    pub id: RunId,
    pub platform_id: String,
    pub principal_id: String,
    pub period: Period,
    pub artifacts: Vec<Artifact>,
    pub errors: Vec<RunError>,
    pub created_at: DateTime<Utc>,
    state: RunState,
    state_tx: watch::Sender<RunState>,
}

impl Run {
    pub fn new(
        platform_id: impl Into<String>,
        principal_id: impl Into<String>,
        period: Period,
    ) -> (Self, watch::Receiver<RunState>) {
        let (state_tx, state_rx) = watch::channel(RunState::Created);
        let run = Self {
            id: Uuid::new_v4(),
            platform_id: platform_id.into(),
            principal_id: principal_id.into(),
            period,
            artifacts: Vec::new(),
            errors: Vec::new(),
            created_at: Utc::now(),
            state: RunState::Created,
            state_tx,
        };
        (run, state_rx)
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// 不正な遷移は無視して false を返す
    pub fn transition(&mut self, next: RunState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(run_id = %self.id, from = %self.state, to = %next, "Ignoring illegal run transition");
            return false;
        }
        info!(run_id = %self.id, from = %self.state, to = %next, "Run state changed");
        self.state = next;
        self.state_tx.send_replace(next);
        true
    }

    pub fn fail(&mut self, error: RunError) {
        self.errors.push(error);
        self.transition(RunState::Failed);
    }

    /// 途中まで集めた成果物は破棄する
    pub fn cancel(&mut self) {
        self.artifacts.clear();
        self.transition(RunState::Cancelled);
    }

    pub fn downloads(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts
            .iter()
            .filter(|a| a.kind == ArtifactKind::Download)
    }
}

/// 2段階認証の外部シグナル
#[derive(Debug, Clone)]
pub enum TwoFactorSignal {
    /// 画面に入力するコード
    Code(Secret),
    /// 操作者が別経路で完了させた
    Ack,
}

/// 実行中のランに外部から届くもの
#[derive(Debug)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub signals: mpsc::UnboundedReceiver<TwoFactorSignal>,
}

impl RunControl {
    pub fn channel() -> (Self, CancellationToken, mpsc::UnboundedSender<TwoFactorSignal>) {
        let cancel = CancellationToken::new();
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let control = Self {
            cancel: cancel.clone(),
            signals,
        };
        (control, cancel, signal_tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn run() -> (Run, watch::Receiver<RunState>) {
        let day = NaiveDate::from_ymd_opt(2024, 11, 4).unwrap();
        Run::new("tolls", "driver-1", Period::new(day, day).unwrap())
    }

    #[test]
    fn test_transitions_are_published() {
        let (mut run, rx) = run();
        assert!(run.transition(RunState::LoggingIn));
        assert_eq!(*rx.borrow(), RunState::LoggingIn);

        assert!(!run.transition(RunState::Completed));
        assert_eq!(run.state(), RunState::LoggingIn);
    }

    #[test]
    fn test_cancel_discards_artifacts() {
        let (mut run, rx) = run();
        run.transition(RunState::LoggingIn);
        run.artifacts.push(Artifact::new(
            ArtifactKind::Download,
            Phase::Extraction,
            3,
            "report.csv",
            b"a,b".to_vec(),
        ));
        run.cancel();
        assert!(run.artifacts.is_empty());
        assert_eq!(*rx.borrow(), RunState::Cancelled);
    }

    #[test]
    fn test_artifact_content_serializes_as_base64() {
        let artifact = Artifact::new(
            ArtifactKind::Screenshot,
            Phase::Login,
            1,
            "login-1.png",
            b"png".to_vec(),
        );
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["content"], "cG5n");
        assert_eq!(json["stepOrder"], 1);
        assert_eq!(json["kind"], "screenshot");
    }

    #[test]
    fn test_run_error_carries_step_detail() {
        let step = Step::new(StepKind::WaitSelector)
            .with_selector("#report")
            .with_timeout_ms(1500);
        let error = RunError::from_error(&ScraperError::SelectorTimeout {
            selector: "css=#report".into(),
            timeout_ms: 1500,
        })
        .at_step(Phase::Extraction, &step, Some(1500));

        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["kind"], "selector_timeout");
        assert_eq!(json["stepKind"], "wait_selector");
        assert_eq!(json["selector"], "#report");
        assert_eq!(json["timeoutMs"], 1500);
        assert_eq!(json["phase"], "extraction");
    }
}
