//! ステップインタプリタ
//!
//! 1ランにつき1セッションを開き、ログイン手順 → (2段階認証待ち) → 抽出手順の順に
//! 逐次実行する。どの経路で終わってもセッションは必ず閉じる。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::run::{Artifact, ArtifactKind, Run, RunControl, RunError, TwoFactorSignal};
use super::state::RunState;
use crate::config::EngineConfig;
use crate::error::{ErrorKind, ScraperError};
use crate::platform::{IntegrationMethod, PlatformDescriptor};
use crate::resolver::{render_url, resolve_date_bound, CredentialResolver};
use crate::step::{Action, Phase, Selector, Step, StepList};
use crate::traits::{BrowserSession, DownloadedFile, SessionFactory};

/// ランを途中で止める理由
enum Halt {
    Cancelled,
    Failed(RunError),
}

pub struct ExecutionEngine {
    config: EngineConfig,
    credentials: Arc<dyn CredentialResolver>,
    sessions: Arc<dyn SessionFactory>,
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        credentials: Arc<dyn CredentialResolver>,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            config,
            credentials,
            sessions,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// ランを終端状態まで進める
    pub async fn execute(&self, run: &mut Run, descriptor: &PlatformDescriptor, mut control: RunControl) {
        if descriptor.integration_method != IntegrationMethod::Rpa {
            let err = ScraperError::UnsupportedIntegration(descriptor.integration_method.to_string());
            run.fail(RunError::from_error(&err));
            return;
        }
        if control.cancel.is_cancelled() {
            run.cancel();
            return;
        }

        run.transition(RunState::LoggingIn);
        info!(run_id = %run.id, platform = %run.platform_id, "Starting run");

        let mut session = match self.sessions.open(run.id).await {
            Ok(session) => session,
            Err(e) => {
                error!(run_id = %run.id, "Failed to open browser session: {}", e);
                run.fail(RunError::from_error(&e).in_phase(Phase::Login));
                return;
            }
        };

        let outcome = self
            .drive(session.as_mut(), run, descriptor, &mut control)
            .await;

        if let Err(e) = session.close().await {
            warn!(run_id = %run.id, "Failed to close browser session: {}", e);
        }

        match outcome {
            Ok(()) => {
                run.transition(RunState::Completed);
                info!(
                    run_id = %run.id,
                    artifacts = run.artifacts.len(),
                    "Run completed"
                );
            }
            Err(Halt::Cancelled) => {
                info!(run_id = %run.id, "Run cancelled");
                run.cancel();
            }
            Err(Halt::Failed(failure)) => {
                error!(
                    run_id = %run.id,
                    kind = ?failure.kind,
                    order = ?failure.order,
                    "Run failed: {}",
                    failure.message
                );
                run.fail(failure);
            }
        }
    }

    async fn drive(
        &self,
        session: &mut dyn BrowserSession,
        run: &mut Run,
        descriptor: &PlatformDescriptor,
        control: &mut RunControl,
    ) -> Result<(), Halt> {
        self.run_phase(session, run, descriptor, Phase::Login, &descriptor.login_steps, &control.cancel)
            .await?;

        if descriptor.awaits_two_factor() {
            if control.cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            run.transition(RunState::AwaitingTwoFactor);
            self.await_two_factor(session, descriptor, control)
                .await
                .map_err(|e| halt(e, |err| err.in_phase(Phase::Login)))?;
        }

        if control.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        run.transition(RunState::Extracting);
        self.run_phase(
            session,
            run,
            descriptor,
            Phase::Extraction,
            &descriptor.extraction_steps,
            &control.cancel,
        )
        .await
    }

    async fn run_phase(
        &self,
        session: &mut dyn BrowserSession,
        run: &mut Run,
        descriptor: &PlatformDescriptor,
        phase: Phase,
        steps: &StepList,
        cancel: &CancellationToken,
    ) -> Result<(), Halt> {
        for step in steps.in_order() {
            // キャンセルはステップの境界で確認する
            if cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }

            let action = step.action().map_err(|reasons| {
                Halt::Failed(
                    RunError::new(ErrorKind::ValidationError, reasons.join("; ")).at_step(
                        phase,
                        step,
                        step.timeout_ms,
                    ),
                )
            })?;

            debug!(run_id = %run.id, %phase, order = step.order, kind = %step.kind, "Executing step");

            if let Err(e) = self
                .perform(session, run, descriptor, phase, step, &action, cancel)
                .await
            {
                let timeout_ms = self.effective_timeout(&action).map(as_millis);
                return Err(halt(e, |err| err.at_step(phase, step, timeout_ms)));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn perform(
        &self,
        session: &mut dyn BrowserSession,
        run: &mut Run,
        descriptor: &PlatformDescriptor,
        phase: Phase,
        step: &Step,
        action: &Action,
        cancel: &CancellationToken,
    ) -> Result<(), ScraperError> {
        match action {
            Action::Goto { url, timeout_ms } => {
                let target = render_url(url, &run.period, &descriptor.date_format)?;
                let limit = self.config.step_timeout(*timeout_ms);
                info!(run_id = %run.id, url = %url, "Navigating");
                timeout(limit, session.goto(&target))
                    .await
                    .map_err(|_| {
                        ScraperError::Navigation(format!("{} did not load within {}ms", url, as_millis(limit)))
                    })?
            }
            Action::Click { selector } => {
                self.locate(session, selector, cancel).await?;
                session.click(selector).await
            }
            Action::Type { selector, text } => {
                self.locate(session, selector, cancel).await?;
                session.type_text(selector, text).await
            }
            Action::FillCredential { selector, field } => {
                // ブラウザに触れる前に解決する
                let secret = self
                    .credentials
                    .resolve(&run.platform_id, &run.principal_id, field)
                    .await?
                    .ok_or_else(|| ScraperError::MissingCredential(field.clone()))?;
                self.locate(session, selector, cancel).await?;
                debug!(run_id = %run.id, field = %field, "Injecting credential");
                session.type_text(selector, secret.expose()).await
            }
            Action::FillDate { selector, bound } => {
                let value = resolve_date_bound(&run.period, *bound, &descriptor.date_format)?;
                self.locate(session, selector, cancel).await?;
                session.type_text(selector, &value).await
            }
            Action::Select { selector, value } => {
                self.locate(session, selector, cancel).await?;
                match value {
                    Some(value) => session.select_option(selector, value).await,
                    None => session.click(selector).await,
                }
            }
            Action::Wait { duration_ms } => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ScraperError::Cancelled),
                    _ = sleep(Duration::from_millis(*duration_ms)) => Ok(()),
                }
            }
            Action::WaitSelector { selector, timeout_ms } => {
                let limit = self.config.step_timeout(*timeout_ms);
                let appeared = self.poll_selector(session, selector, limit, cancel).await?;
                if appeared {
                    Ok(())
                } else {
                    Err(ScraperError::SelectorTimeout {
                        selector: selector.to_string(),
                        timeout_ms: as_millis(limit),
                    })
                }
            }
            Action::Press { selector, key } => {
                self.locate(session, selector, cancel).await?;
                session.press_key(selector, key).await
            }
            Action::Download { timeout_ms } => {
                let limit = self.config.step_timeout(*timeout_ms);
                let file = self.await_download(session, limit, cancel).await?;
                info!(
                    run_id = %run.id,
                    order = step.order,
                    file = %file.file_name,
                    size = file.content.len(),
                    "Download captured"
                );
                run.artifacts.push(Artifact::new(
                    ArtifactKind::Download,
                    phase,
                    step.order,
                    file.file_name,
                    file.content,
                ));
                Ok(())
            }
            Action::Screenshot => {
                match session.screenshot().await {
                    Ok(png) => run.artifacts.push(Artifact::new(
                        ArtifactKind::Screenshot,
                        phase,
                        step.order,
                        format!("{}-{}.png", phase_slug(phase), step.order),
                        png,
                    )),
                    Err(e) => warn!(run_id = %run.id, order = step.order, "Screenshot failed: {}", e),
                }
                Ok(())
            }
        }
    }

    /// 2段階認証の完了シグナルを待ち、コードがあれば入力する
    async fn await_two_factor(
        &self,
        session: &mut dyn BrowserSession,
        descriptor: &PlatformDescriptor,
        control: &mut RunControl,
    ) -> Result<(), ScraperError> {
        let limit = self.config.two_factor_timeout;
        info!(platform = %descriptor.id, timeout_ms = as_millis(limit), "Waiting for two-factor signal");

        let signal = tokio::select! {
            _ = control.cancel.cancelled() => return Err(ScraperError::Cancelled),
            received = timeout(limit, control.signals.recv()) => match received {
                Ok(Some(signal)) => signal,
                Ok(None) | Err(_) => return Err(ScraperError::TwoFactorTimeout(as_millis(limit))),
            },
        };

        let TwoFactorSignal::Code(code) = signal else {
            debug!("Two-factor acknowledged");
            return Ok(());
        };
        let Some(input) = &descriptor.two_factor_input else {
            debug!("Two-factor code received but no input is configured");
            return Ok(());
        };
        if let Some(selector) = &input.code_selector {
            self.locate(session, selector, &control.cancel).await?;
            session.type_text(selector, code.expose()).await?;
        }
        if let Some(selector) = &input.submit_selector {
            self.locate(session, selector, &control.cancel).await?;
            session.click(selector).await?;
        }
        Ok(())
    }

    /// 短い暗黙ポーリングで要素を探す
    async fn locate(
        &self,
        session: &mut dyn BrowserSession,
        selector: &Selector,
        cancel: &CancellationToken,
    ) -> Result<(), ScraperError> {
        if self
            .poll_selector(session, selector, self.config.selector_poll, cancel)
            .await?
        {
            Ok(())
        } else {
            Err(ScraperError::SelectorNotFound(selector.to_string()))
        }
    }

    /// `limit` 以内に要素が現れれば true
    async fn poll_selector(
        &self,
        session: &mut dyn BrowserSession,
        selector: &Selector,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, ScraperError> {
        let deadline = Instant::now() + limit;
        let polled = timeout_at(deadline, async {
            loop {
                if session.exists(selector).await? {
                    return Ok::<_, ScraperError>(());
                }
                self.idle(cancel).await?;
            }
        })
        .await;

        match polled {
            Ok(result) => result.map(|_| true),
            Err(_) => Ok(false),
        }
    }

    async fn await_download(
        &self,
        session: &mut dyn BrowserSession,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<DownloadedFile, ScraperError> {
        let deadline = Instant::now() + limit;
        let polled = timeout_at(deadline, async {
            loop {
                if let Some(file) = session.take_download().await? {
                    return Ok::<_, ScraperError>(file);
                }
                self.idle(cancel).await?;
            }
        })
        .await;

        polled.unwrap_or(Err(ScraperError::DownloadTimeout(as_millis(limit))))
    }

    async fn idle(&self, cancel: &CancellationToken) -> Result<(), ScraperError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ScraperError::Cancelled),
            _ = sleep(self.config.poll_interval) => Ok(()),
        }
    }

    /// レポートに載せる実効タイムアウト
    fn effective_timeout(&self, action: &Action) -> Option<Duration> {
        match action {
            Action::Goto { timeout_ms, .. }
            | Action::WaitSelector { timeout_ms, .. }
            | Action::Download { timeout_ms } => Some(self.config.step_timeout(*timeout_ms)),
            Action::Wait { duration_ms } => Some(Duration::from_millis(*duration_ms)),
            Action::Click { .. }
            | Action::Type { .. }
            | Action::FillCredential { .. }
            | Action::FillDate { .. }
            | Action::Select { .. }
            | Action::Press { .. } => Some(self.config.selector_poll),
            Action::Screenshot => None,
        }
    }
}

fn halt(error: ScraperError, locate: impl FnOnce(RunError) -> RunError) -> Halt {
    match error {
        ScraperError::Cancelled => Halt::Cancelled,
        other => Halt::Failed(locate(RunError::from_error(&other))),
    }
}

fn phase_slug(phase: Phase) -> &'static str {
    match phase {
        Phase::Login => "login",
        Phase::Extraction => "extraction",
    }
}

fn as_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
