use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::identifier::InstanceId;
use crate::metrics::{Improvement, MetricsView};
use crate::orchestrator::RunPhase;

/// Everything the user can see or has typed for one benchmark session.
///
/// The orchestrator writes run results here and the upload controller reads
/// its upload body from here at the moment of each attempt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionState {
    pub input: String,
    pub code: String,
    pub notes: String,
    pub consent: bool,
    pub instance: Option<InstanceId>,
    pub image: Option<String>,
    pub hints: Vec<String>,
    pub docker_command: Option<String>,
    pub pull_log: Vec<String>,
    pub before: MetricsView,
    pub after: MetricsView,
    pub improvement: Improvement,
    pub phase: RunPhase,
    /// Input, prepare and run errors.
    pub run_log: Option<String>,
    pub upload_log: Option<String>,
    pub submit_log: Option<String>,
}

impl SessionState {
    /// Clear everything a new run will repopulate.
    pub fn reset_run_view(&mut self) {
        self.docker_command = None;
        self.pull_log.clear();
        self.before = MetricsView::placeholder();
        self.after = MetricsView::placeholder();
        self.improvement = Improvement::Unavailable;
        self.run_log = None;
    }
}

/// Shared handle to a [`SessionState`]. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct BenchSession {
    state: Arc<Mutex<SessionState>>,
}

impl BenchSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inputs(input: impl Into<String>, code: impl Into<String>) -> Self {
        let session = Self::new();
        session.update(|state| {
            state.input = input.into();
            state.code = code.into();
        });
        session
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mutate the state under the lock. Never call across an `.await`.
    pub fn update<R>(&self, apply: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut guard = self.lock();
        apply(&mut guard)
    }

    pub fn snapshot(&self) -> SessionState {
        self.lock().clone()
    }

    pub fn set_input(&self, input: impl Into<String>) {
        let input = input.into();
        self.update(|state| {
            state.instance = crate::identifier::resolve(&input);
            state.image = state.instance.as_ref().map(InstanceId::image);
            state.input = input;
        });
    }

    pub fn set_code(&self, code: impl Into<String>) {
        let code = code.into();
        self.update(|state| state.code = code);
    }

    pub fn set_notes(&self, notes: impl Into<String>) {
        let notes = notes.into();
        self.update(|state| state.notes = notes);
    }

    pub fn set_consent(&self, consent: bool) {
        self.update(|state| state.consent = consent);
    }

    pub fn consent(&self) -> bool {
        self.lock().consent
    }

    pub fn phase(&self) -> RunPhase {
        self.lock().phase
    }
}
