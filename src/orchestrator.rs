use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::helper::{HelperClient, PrepareResult};
use crate::history::{HistoryEntry, HistoryKind, RunHistory};
use crate::identifier::{self, InstanceId};
use crate::lint;
use crate::metrics::{Improvement, MetricsView, RunResult};
use crate::session::{BenchSession, SessionState};

/// Where the most recent benchmark invocation stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunPhase {
    #[default]
    Idle,
    Preparing,
    PrepareFailed,
    Prepared,
    Running,
    RunFailed,
    RunComplete,
    Cancelled,
}

/// How one `run_benchmark` call ended, as seen by its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Nothing was sent to the helper.
    InputRejected(String),
    PrepareFailed(String),
    RunFailed(String),
    Complete {
        before: MetricsView,
        after: MetricsView,
        improvement: Improvement,
    },
    /// Aborted through [`RunOrchestrator::cancel`].
    Cancelled,
    /// Replaced by a newer run; nothing from this call reached the session.
    Superseded,
}

/// Result of a bare cancellable `/api/bench/run` call.
#[derive(Debug)]
pub enum RunCall {
    Finished(RunResult),
    Failed(anyhow::Error),
    Cancelled,
    Superseded,
}

struct InFlight {
    generation: u64,
    token: CancellationToken,
}

enum Raced<T> {
    Done(T),
    Interrupted(RunOutcome),
}

/// Drives prepare → run against the helper for one session.
///
/// At most one invocation is live: starting another cancels the previous one,
/// and a late response from a replaced invocation is dropped.
pub struct RunOrchestrator {
    helper: HelperClient,
    session: BenchSession,
    history: Option<RunHistory>,
    session_id: Uuid,
    generation: AtomicU64,
    inflight: Mutex<Option<InFlight>>,
}

impl RunOrchestrator {
    pub fn new(helper: HelperClient, session: BenchSession) -> Self {
        Self {
            helper,
            session,
            history: None,
            session_id: Uuid::new_v4(),
            generation: AtomicU64::new(0),
            inflight: Mutex::new(None),
        }
    }

    pub fn with_history(mut self, history: RunHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn session(&self) -> &BenchSession {
        &self.session
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub async fn prepare(
        &self,
        instance: &InstanceId,
        image: &str,
        code: &str,
    ) -> Result<PrepareResult> {
        self.helper.prepare(instance, image, code).await
    }

    /// Issue `/api/bench/run` for an already prepared job, replacing any live invocation.
    pub async fn run(&self, job_id: &str) -> RunCall {
        let (generation, token) = self.begin();
        let call = race(&token, self.helper.run(job_id)).await;
        let still_current = self.with_current(generation, |_| ()).is_some();
        self.finish(generation);
        match call {
            None => RunCall::Cancelled,
            Some(_) if !still_current => RunCall::Superseded,
            Some(Ok(result)) => RunCall::Finished(result),
            Some(Err(err)) => RunCall::Failed(err),
        }
    }

    /// Abort the live invocation, if any. Its response will be ignored.
    pub fn cancel(&self) {
        let mut inflight = self.lock_inflight();
        if let Some(current) = inflight.take() {
            current.token.cancel();
            self.session.update(|state| state.phase = RunPhase::Cancelled);
            info!(generation = current.generation, "benchmark run cancelled");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_inflight().is_some()
    }

    /// Lint, resolve, prepare and run the workload currently in the session,
    /// writing every visible change back to it.
    pub async fn run_benchmark(&self) -> RunOutcome {
        let inputs = self.session.snapshot();
        let (generation, token) = self.begin();
        let span = info_span!("bench.run", generation, session = %self.session_id);

        let outcome = self
            .drive(generation, &token, inputs)
            .instrument(span)
            .await;
        self.finish(generation);
        if let RunOutcome::Complete { .. } = &outcome {
            self.record_history(&outcome);
        }
        outcome
    }

    async fn drive(
        &self,
        generation: u64,
        token: &CancellationToken,
        inputs: SessionState,
    ) -> RunOutcome {
        let hints = lint::lint(&inputs.code);
        if self
            .with_current(generation, |state| {
                state.reset_run_view();
                state.hints = hints.clone();
                state.phase = RunPhase::Idle;
            })
            .is_none()
        {
            return self.interrupted(generation);
        }

        let instance = match check_input(&inputs.input) {
            Ok(instance) => instance,
            Err(message) => {
                warn!(input = %inputs.input, "{message}");
                return self.conclude(generation, RunOutcome::InputRejected(message.clone()), |state| {
                    state.run_log = Some(message);
                    state.phase = RunPhase::Idle;
                });
            }
        };
        let image = instance.image();
        info!(instance = %instance, image = %image, hints = hints.len(), "preparing benchmark");
        if self
            .with_current(generation, |state| {
                state.instance = Some(instance.clone());
                state.image = Some(image.clone());
                state.phase = RunPhase::Preparing;
            })
            .is_none()
        {
            return self.interrupted(generation);
        }

        let prepared = match self
            .interruptible(generation, token, self.prepare(&instance, &image, &inputs.code))
            .await
        {
            Raced::Interrupted(outcome) => return outcome,
            Raced::Done(Ok(prepared)) => prepared,
            Raced::Done(Err(err)) => {
                let message = format!("{err:#}");
                warn!(error = %message, "prepare failed");
                return self.conclude(generation, RunOutcome::PrepareFailed(message.clone()), |state| {
                    state.run_log = Some(message);
                    state.phase = RunPhase::PrepareFailed;
                });
            }
        };

        let command = identifier::docker_command(prepared.host_workload_path.as_deref(), &image);
        if self
            .with_current(generation, |state| {
                state.docker_command = Some(command);
                state.phase = RunPhase::Prepared;
            })
            .is_none()
        {
            return self.interrupted(generation);
        }
        info!(job = %prepared.job_id, "running benchmark");
        if self
            .with_current(generation, |state| state.phase = RunPhase::Running)
            .is_none()
        {
            return self.interrupted(generation);
        }

        let result = match self
            .interruptible(generation, token, self.helper.run(&prepared.job_id))
            .await
        {
            Raced::Interrupted(outcome) => return outcome,
            Raced::Done(Ok(result)) => result,
            Raced::Done(Err(err)) => {
                let message = format!("{err:#}");
                warn!(error = %message, "run failed");
                return self.conclude(generation, RunOutcome::RunFailed(message.clone()), |state| {
                    state.run_log = Some(message);
                    state.phase = RunPhase::RunFailed;
                });
            }
        };

        let before = MetricsView::from(&result.before);
        let after = MetricsView::from(&result.after);
        let improvement = Improvement::compute(before.mean, after.mean);
        let pull_log = result.pull_lines();
        info!(
            before_ok = before.succeeded(),
            after_ok = after.succeeded(),
            %improvement,
            "benchmark finished"
        );
        let outcome = RunOutcome::Complete {
            before: before.clone(),
            after: after.clone(),
            improvement,
        };
        self.conclude(generation, outcome, |state| {
            state.before = before;
            state.after = after;
            state.improvement = improvement;
            state.pull_log = pull_log;
            state.phase = RunPhase::RunComplete;
        })
    }

    async fn interruptible<T>(
        &self,
        generation: u64,
        token: &CancellationToken,
        work: impl Future<Output = T>,
    ) -> Raced<T> {
        match race(token, work).await {
            None => Raced::Interrupted(self.interrupted(generation)),
            Some(_) if self.with_current(generation, |_| ()).is_none() => {
                Raced::Interrupted(self.interrupted(generation))
            }
            Some(value) => Raced::Done(value),
        }
    }

    /// Distinguish an explicit cancel from replacement by a newer invocation.
    fn interrupted(&self, generation: u64) -> RunOutcome {
        if self.generation.load(Ordering::SeqCst) == generation {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Superseded
        }
    }

    fn conclude(
        &self,
        generation: u64,
        outcome: RunOutcome,
        apply: impl FnOnce(&mut SessionState),
    ) -> RunOutcome {
        match self.with_current(generation, apply) {
            Some(()) => outcome,
            None => self.interrupted(generation),
        }
    }

    fn begin(&self) -> (u64, CancellationToken) {
        let mut inflight = self.lock_inflight();
        if let Some(previous) = inflight.take() {
            previous.token.cancel();
            info!(generation = previous.generation, "replacing in-flight benchmark run");
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        *inflight = Some(InFlight {
            generation,
            token: token.clone(),
        });
        (generation, token)
    }

    fn finish(&self, generation: u64) {
        let mut inflight = self.lock_inflight();
        if inflight
            .as_ref()
            .is_some_and(|current| current.generation == generation)
        {
            *inflight = None;
        }
    }

    /// Apply `update` to the session only while `generation` is the live,
    /// uncancelled invocation. The in-flight lock is held across the check and
    /// the write so a replacement cannot slip in between.
    fn with_current<R>(
        &self,
        generation: u64,
        update: impl FnOnce(&mut SessionState) -> R,
    ) -> Option<R> {
        let inflight = self.lock_inflight();
        let live = inflight.as_ref().is_some_and(|current| {
            current.generation == generation && !current.token.is_cancelled()
        });
        live.then(|| self.session.update(update))
    }

    fn lock_inflight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_history(&self, outcome: &RunOutcome) {
        let Some(history) = &self.history else {
            return;
        };
        let RunOutcome::Complete {
            before,
            after,
            improvement,
        } = outcome
        else {
            return;
        };
        let state = self.session.snapshot();
        let mut entry = HistoryEntry::new(self.session_id, HistoryKind::Run, improvement.to_string());
        entry.instance = state.instance.map(String::from);
        entry.image = state.image;
        entry.before_mean = before.mean;
        entry.after_mean = after.mean;
        entry.improvement = improvement.signed_percent();
        history.record(&entry);
    }
}

fn check_input(input: &str) -> Result<InstanceId, String> {
    if input.trim().is_empty() {
        return Err("Please input Link/Image/Instance ID".to_string());
    }
    identifier::resolve(input).ok_or_else(|| "Cannot infer instance id from input".to_string())
}

/// `None` when the token fired first.
async fn race<T>(token: &CancellationToken, work: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        value = work => Some(value),
    }
}
