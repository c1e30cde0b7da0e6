//! ランオーケストレーター
//!
//! リクエストを受け付けてランを作り、同時セッション数の上限内で FIFO 順に
//! エンジンへ渡す。完了したランのダウンロードは取込マッピングで正規化し、
//! 1つのレポートにまとめる。

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::browser::ChromiumSessionFactory;
use crate::config::EngineConfig;
use crate::engine::{
    Artifact, ExecutionEngine, Run, RunControl, RunError, RunId, RunState, TwoFactorSignal,
};
use crate::error::{ErrorKind, ScraperError};
use crate::import::{interpret, ImportOutcome, NormalizedRow, RejectedRow, RowWarning};
use crate::platform::{IntegrationMethod, PlatformDescriptor};
use crate::resolver::{CredentialResolver, Period};

/// ラン実行リクエスト
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub platform_id: String,
    pub principal_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

impl RunRequest {
    pub fn new(
        platform_id: impl Into<String>,
        principal_id: impl Into<String>,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Self {
        Self {
            platform_id: platform_id.into(),
            principal_id: principal_id.into(),
            period_start,
            period_end,
        }
    }
}

/// ダウンロード1件ごとの取込結果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub artifact_id: Uuid,
    pub file_name: String,
    pub headers: Vec<String>,
    pub records: usize,
    pub rejected: usize,
    pub unresolved_columns: Vec<String>,
}

/// 外部に公開するランの結果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: RunId,
    pub platform_id: String,
    pub principal_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub state: RunState,
    pub records: Vec<NormalizedRow>,
    pub rejected: Vec<RejectedRow>,
    pub warnings: Vec<RowWarning>,
    pub imports: Vec<ImportSummary>,
    pub artifacts: Vec<Artifact>,
    pub errors: Vec<RunError>,
    /// 新しいランで再実行すれば成功しうるか
    pub retryable: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    fn new(run: Run) -> Self {
        let state = run.state();
        let retryable =
            state == RunState::Failed && run.errors.iter().any(|e| e.kind.is_retryable());
        Self {
            run_id: run.id,
            platform_id: run.platform_id,
            principal_id: run.principal_id,
            period_start: run.period.start,
            period_end: run.period.end,
            state,
            records: Vec::new(),
            rejected: Vec::new(),
            warnings: Vec::new(),
            imports: Vec::new(),
            artifacts: run.artifacts,
            errors: run.errors,
            retryable,
            created_at: run.created_at,
            finished_at: Utc::now(),
        }
    }

    fn absorb(&mut self, artifact: &Artifact, outcome: ImportOutcome) {
        self.imports.push(ImportSummary {
            artifact_id: artifact.id,
            file_name: artifact.file_name.clone(),
            headers: outcome.headers,
            records: outcome.records.len(),
            rejected: outcome.rejected.len(),
            unresolved_columns: outcome.unresolved_columns,
        });
        self.records.extend(outcome.records);
        self.rejected.extend(outcome.rejected);
        self.warnings.extend(outcome.warnings);
    }
}

/// 終端に達したレポートの受け取り先（照合台帳など）
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn deliver(&self, report: &RunReport) -> Result<(), ScraperError>;
}

struct RunEntry {
    platform_id: String,
    state: watch::Receiver<RunState>,
    cancel: CancellationToken,
    signals: mpsc::UnboundedSender<TwoFactorSignal>,
    report: watch::Receiver<Option<RunReport>>,
}

struct Job {
    run: Run,
    descriptor: Arc<PlatformDescriptor>,
    control: RunControl,
    report_tx: watch::Sender<Option<RunReport>>,
}

struct Inner {
    engine: ExecutionEngine,
    platforms: DashMap<String, Arc<PlatformDescriptor>>,
    runs: DashMap<RunId, RunEntry>,
    queue: mpsc::UnboundedSender<Job>,
    sink: Option<Arc<dyn RecordSink>>,
}

/// tower::Service を実装したランオーケストレーター
///
/// 生成時にディスパッチャタスクを起動するため、tokio ランタイム内で作ること。
#[derive(Clone)]
pub struct RunOrchestrator {
    inner: Arc<Inner>,
}

impl RunOrchestrator {
    pub fn new(engine: ExecutionEngine) -> Self {
        Self::build(engine, None)
    }

    pub fn with_sink(engine: ExecutionEngine, sink: Arc<dyn RecordSink>) -> Self {
        Self::build(engine, Some(sink))
    }

    /// Chromium セッションを使う標準構成
    pub fn chromium(config: EngineConfig, credentials: Arc<dyn CredentialResolver>) -> Self {
        let sessions = Arc::new(ChromiumSessionFactory::new(config.clone()));
        Self::new(ExecutionEngine::new(config, credentials, sessions))
    }

    fn build(engine: ExecutionEngine, sink: Option<Arc<dyn RecordSink>>) -> Self {
        let slots = Arc::new(Semaphore::new(engine.config().max_concurrent_sessions));
        let (queue, jobs) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            engine,
            platforms: DashMap::new(),
            runs: DashMap::new(),
            queue,
            sink,
        });
        tokio::spawn(dispatch(Arc::downgrade(&inner), jobs, slots));
        Self { inner }
    }

    /// 検証を通過した定義だけを登録する
    pub fn register_platform(&self, mut descriptor: PlatformDescriptor) -> Result<(), ScraperError> {
        descriptor.validate().map_err(ScraperError::Validation)?;
        descriptor.sort_steps();
        info!(platform = %descriptor.id, "プラットフォーム登録");
        self.inner
            .platforms
            .insert(descriptor.id.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn register_platform_json(&self, json: &str) -> Result<String, ScraperError> {
        let descriptor = PlatformDescriptor::from_json(json)?;
        let id = descriptor.id.clone();
        self.register_platform(descriptor)?;
        Ok(id)
    }

    pub fn platform(&self, platform_id: &str) -> Option<Arc<PlatformDescriptor>> {
        self.inner
            .platforms
            .get(platform_id)
            .map(|entry| entry.value().clone())
    }

    /// ランを作成して待ち行列に入れる
    pub fn submit(&self, request: RunRequest) -> Result<RunId, ScraperError> {
        let period = Period::new(request.period_start, request.period_end)?;
        let descriptor = self
            .platform(&request.platform_id)
            .ok_or_else(|| ScraperError::PlatformNotFound(request.platform_id.clone()))?;
        descriptor.validate().map_err(ScraperError::Validation)?;
        if descriptor.integration_method != IntegrationMethod::Rpa {
            return Err(ScraperError::UnsupportedIntegration(
                descriptor.integration_method.to_string(),
            ));
        }

        let (run, state) = Run::new(&request.platform_id, &request.principal_id, period);
        let run_id = run.id;
        let (control, cancel, signals) = RunControl::channel();
        let (report_tx, report) = watch::channel(None);

        self.inner.runs.insert(
            run_id,
            RunEntry {
                platform_id: request.platform_id.clone(),
                state,
                cancel,
                signals,
                report,
            },
        );

        let job = Job {
            run,
            descriptor,
            control,
            report_tx,
        };
        if self.inner.queue.send(job).is_err() {
            self.inner.runs.remove(&run_id);
            return Err(ScraperError::Unavailable);
        }

        info!(
            %run_id,
            platform = %request.platform_id,
            principal = %request.principal_id,
            "ランリクエスト受付"
        );
        Ok(run_id)
    }

    pub fn status(&self, run_id: RunId) -> Result<RunState, ScraperError> {
        let entry = self
            .inner
            .runs
            .get(&run_id)
            .ok_or(ScraperError::RunNotFound(run_id))?;
        let state = *entry.state.borrow();
        Ok(state)
    }

    /// 終端に達していなければ `None`
    pub fn report(&self, run_id: RunId) -> Result<Option<RunReport>, ScraperError> {
        let entry = self
            .inner
            .runs
            .get(&run_id)
            .ok_or(ScraperError::RunNotFound(run_id))?;
        let report = entry.report.borrow().clone();
        Ok(report)
    }

    /// レポートが確定するまで待つ
    pub async fn wait(&self, run_id: RunId) -> Result<RunReport, ScraperError> {
        let mut report = self
            .inner
            .runs
            .get(&run_id)
            .map(|entry| entry.report.clone())
            .ok_or(ScraperError::RunNotFound(run_id))?;

        let ready = report
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ScraperError::Unavailable)?;
        ready.clone().ok_or(ScraperError::Unavailable)
    }

    /// 次のステップ境界でキャンセルする。既に終端なら false
    pub fn cancel(&self, run_id: RunId) -> Result<bool, ScraperError> {
        let entry = self
            .inner
            .runs
            .get(&run_id)
            .ok_or(ScraperError::RunNotFound(run_id))?;
        if entry.state.borrow().is_terminal() {
            return Ok(false);
        }
        info!(%run_id, platform = %entry.platform_id, "キャンセル要求");
        entry.cancel.cancel();
        Ok(true)
    }

    /// `AWAITING_2FA` のランにだけ届ける
    pub fn signal_two_factor(
        &self,
        run_id: RunId,
        signal: TwoFactorSignal,
    ) -> Result<(), ScraperError> {
        let entry = self
            .inner
            .runs
            .get(&run_id)
            .ok_or(ScraperError::RunNotFound(run_id))?;
        let state = *entry.state.borrow();
        if state != RunState::AwaitingTwoFactor {
            return Err(ScraperError::SignalRejected(format!(
                "run {} is {}",
                run_id, state
            )));
        }
        entry
            .signals
            .send(signal)
            .map_err(|_| ScraperError::SignalRejected(format!("run {} is no longer listening", run_id)))?;
        info!(%run_id, "2段階認証シグナル受信");
        Ok(())
    }

    /// まだセッションを割り当てられていないラン数
    pub fn queued_count(&self) -> usize {
        self.count_where(|state| state == RunState::Created)
    }

    pub fn running_count(&self) -> usize {
        self.count_where(|state| state != RunState::Created && !state.is_terminal())
    }

    fn count_where(&self, predicate: impl Fn(RunState) -> bool) -> usize {
        self.inner
            .runs
            .iter()
            .filter(|entry| predicate(*entry.state.borrow()))
            .count()
    }

    /// 終端のランを登録簿から外し、最終レポートを返す
    pub fn archive(&self, run_id: RunId) -> Result<RunReport, ScraperError> {
        let report = self
            .report(run_id)?
            .ok_or_else(|| ScraperError::SignalRejected(format!("run {} has not finished", run_id)))?;
        self.inner.runs.remove(&run_id);
        debug!(%run_id, "ランをアーカイブ");
        Ok(report)
    }
}

/// 待ち行列から取り出し、空き枠ができた順にランを起動する
async fn dispatch(inner: Weak<Inner>, mut jobs: mpsc::UnboundedReceiver<Job>, slots: Arc<Semaphore>) {
    while let Some(job) = jobs.recv().await {
        // キャンセル済みのランは枠を待たずに終わらせる
        let permit = if job.control.cancel.is_cancelled() {
            None
        } else {
            match slots.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => break,
            }
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        tokio::spawn(run_job(inner, job, permit));
    }
    debug!("ディスパッチャ終了");
}

async fn run_job(inner: Arc<Inner>, job: Job, permit: Option<OwnedSemaphorePermit>) {
    let Job {
        mut run,
        descriptor,
        control,
        report_tx,
    } = job;

    inner.engine.execute(&mut run, &descriptor, control).await;
    // セッションは閉じているので枠を返す
    drop(permit);

    let report = build_report(run, &descriptor).await;
    info!(
        run_id = %report.run_id,
        state = %report.state,
        records = report.records.len(),
        rejected = report.rejected.len(),
        "ラン終了"
    );

    if let Some(sink) = &inner.sink {
        if let Err(e) = sink.deliver(&report).await {
            warn!(run_id = %report.run_id, "Failed to deliver run report: {}", e);
        }
    }
    report_tx.send_replace(Some(report));
}

/// 完了したランのダウンロードを取込マッピングで正規化する
async fn build_report(run: Run, descriptor: &PlatformDescriptor) -> RunReport {
    let completed = run.state() == RunState::Completed;
    let downloads: Vec<Artifact> = if completed {
        run.downloads().cloned().collect()
    } else {
        Vec::new()
    };
    let mut report = RunReport::new(run);
    if downloads.is_empty() {
        return report;
    }

    let mapping = descriptor.import_mapping.clone();
    let interpreted = tokio::task::spawn_blocking(move || {
        downloads
            .into_iter()
            .map(|artifact| {
                let outcome = interpret(&artifact.content, &mapping);
                (artifact, outcome)
            })
            .collect::<Vec<_>>()
    })
    .await;

    match interpreted {
        Ok(results) => {
            for (artifact, outcome) in results {
                match outcome {
                    Ok(outcome) => report.absorb(&artifact, outcome),
                    Err(e) => {
                        warn!(run_id = %report.run_id, file = %artifact.file_name, "Import failed: {}", e);
                        let mut failure = RunError::from_error(&e);
                        failure.message = format!("{}: {}", artifact.file_name, failure.message);
                        failure.order = Some(artifact.step_order);
                        report.errors.push(failure);
                    }
                }
            }
        }
        Err(e) => {
            error!(run_id = %report.run_id, "Import task panicked: {}", e);
            report
                .errors
                .push(RunError::new(ErrorKind::Internal, format!("import task: {}", e)));
        }
    }
    report
}

impl Service<RunRequest> for RunOrchestrator {
    type Response = RunId;
    type Error = ScraperError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.inner.queue.is_closed() {
            return Poll::Ready(Err(ScraperError::Unavailable));
        }
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RunRequest) -> Self::Future {
        info!("ランリクエスト受信: platform={}", req.platform_id);

        let this = self.clone();
        Box::pin(async move { this.submit(req) })
    }
}
