use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::config::UploadSettings;
use crate::helper::{HelperClient, UPLOAD_TOKEN_PATH};
use crate::history::{HistoryEntry, HistoryKind, RunHistory};
use crate::identifier::{self, InstanceId};
use crate::metrics::{Improvement, MetricsView};
use crate::session::{BenchSession, SessionState};

pub const CONSENT_PROMPT: &str = "Please check “I agree to upload to SWEf‑data” first.";
const DEFAULT_RECORDED_MESSAGE: &str = "Thanks! Recorded locally.";
const DEFAULT_FAILED_MESSAGE: &str = "Upload failed";
const UNEXPECTED_AUTH_MESSAGE: &str = "Unexpected response while starting authentication";
const IDEMPOTENT_MARKERS: [&str; 2] = ["recorded locally", "identical submission exists"];

/// Mean and spread of one side, as sent with an upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingSummary {
    pub mean: Option<f64>,
    pub std: Option<f64>,
}

impl From<&MetricsView> for TimingSummary {
    fn from(view: &MetricsView) -> Self {
        Self {
            mean: view.mean,
            std: view.std,
        }
    }
}

/// Payload for `/api/upload_run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadBody {
    pub image: String,
    #[serde(rename = "instanceId", default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(rename = "githubUrl", default, skip_serializing_if = "Option::is_none")]
    pub github_url: Option<String>,
    pub workload_b64: String,
    pub before: TimingSummary,
    pub after: TimingSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub improvement: Option<f64>,
    pub notes: String,
    /// Unix milliseconds.
    pub ts: i64,
}

impl UploadBody {
    /// Build the body from whatever the session shows right now.
    pub fn collect(state: &SessionState, ts: i64) -> Self {
        let input = state.input.trim();
        let instance_id = state
            .instance
            .as_ref()
            .map(|id| id.as_str().to_string())
            .or_else(|| identifier::find_embedded_instance(input).map(str::to_string));
        let image = state
            .image
            .clone()
            .or_else(|| state.instance.as_ref().map(InstanceId::image))
            .unwrap_or_default();
        let before = TimingSummary::from(&state.before);
        let after = TimingSummary::from(&state.after);

        Self {
            image,
            instance_id,
            github_url: identifier::is_github_url(input).then(|| input.to_string()),
            workload_b64: encode_workload(&state.code),
            before,
            after,
            improvement: Improvement::compute(before.mean, after.mean).signed_percent(),
            notes: state.notes.trim().to_string(),
            ts,
        }
    }

    /// Key for the once-per-day upload lock.
    fn lock_key(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| self.image.clone())
    }
}

/// Base64 of the UTF-8 bytes, so non-ASCII workloads survive intact.
pub fn encode_workload(code: &str) -> String {
    STANDARD.encode(code.as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCode {
    pub verify_uri: String,
    pub user_code: String,
}

impl DeviceCode {
    fn from_payload(payload: &Value) -> Option<Self> {
        let verify_uri = non_empty(payload.get("verifyUri"))?;
        let user_code = non_empty(payload.get("userCode"))?;
        Some(Self {
            verify_uri,
            user_code,
        })
    }
}

/// What the helper said about one upload attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Uploaded { pr_url: String },
    NeedDevice(DeviceCode),
    NeedToken { message: Option<String> },
    Message { accepted: bool, message: String },
}

impl UploadOutcome {
    pub fn from_payload(payload: &Value) -> Self {
        let message = non_empty(payload.get("message"));
        if !flag(payload, "ok") {
            return UploadOutcome::Message {
                accepted: false,
                message: message
                    .or_else(|| non_empty(payload.get("raw")))
                    .unwrap_or_else(|| DEFAULT_FAILED_MESSAGE.to_string()),
            };
        }
        if flag(payload, "needDevice") {
            if let Some(device) = DeviceCode::from_payload(payload) {
                return UploadOutcome::NeedDevice(device);
            }
        }
        if flag(payload, "uploaded") {
            if let Some(pr_url) = non_empty(payload.get("prUrl")) {
                return UploadOutcome::Uploaded { pr_url };
            }
        }
        if flag(payload, "needToken") {
            return UploadOutcome::NeedToken { message };
        }
        UploadOutcome::Message {
            accepted: true,
            message: message.unwrap_or_else(|| DEFAULT_RECORDED_MESSAGE.to_string()),
        }
    }

    /// The helper already holds this result; resubmitting changes nothing.
    pub fn is_idempotent(&self) -> bool {
        match self {
            UploadOutcome::Message { message, .. } => {
                let lowered = message.to_lowercase();
                IDEMPOTENT_MARKERS
                    .iter()
                    .any(|marker| lowered.contains(marker))
            }
            _ => false,
        }
    }

    /// Text shown to the user for this outcome.
    pub fn guidance(&self, endpoint: &str) -> String {
        match self {
            UploadOutcome::Uploaded { pr_url } => format!("Thanks! Uploaded. PR: {pr_url}"),
            UploadOutcome::NeedDevice(device) => format!(
                "Open {} and enter code: {}. Then click “Submit & Upload” again.",
                device.verify_uri, device.user_code
            ),
            UploadOutcome::NeedToken { .. } => format!(
                "GitHub token required. Create a PAT with repo scope and POST to {endpoint}{UPLOAD_TOKEN_PATH}"
            ),
            UploadOutcome::Message { message, .. } => message.clone(),
        }
    }
}

/// Where the auto-upload cycle ended up after one step.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadStep {
    /// Consent not given; nothing was sent.
    ConsentMissing,
    /// Same instance already uploaded by hand today.
    Suppressed,
    /// Another attempt is still waiting on the helper; nothing was sent.
    InProgress,
    LimitReached { attempts: u32 },
    Uploaded { pr_url: String },
    /// Waiting on the user to finish device authorization.
    AwaitingDevice(DeviceCode),
    NeedsToken,
    Recorded(String),
    Rejected(String),
    RetryScheduled {
        attempts: u32,
        error: String,
        retry_in: Duration,
    },
    Exhausted { attempts: u32, error: String },
}

impl UploadStep {
    pub fn is_retrying(&self) -> bool {
        matches!(self, UploadStep::RetryScheduled { .. })
    }
}

impl fmt::Display for UploadStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStep::ConsentMissing => write!(f, "consent missing"),
            UploadStep::Suppressed => write!(f, "suppressed (already uploaded today)"),
            UploadStep::InProgress => write!(f, "another attempt is in progress"),
            UploadStep::LimitReached { attempts } => {
                write!(f, "retry limit reached after {attempts} attempts")
            }
            UploadStep::Uploaded { pr_url } => write!(f, "uploaded ({pr_url})"),
            UploadStep::AwaitingDevice(_) => write!(f, "awaiting device authorization"),
            UploadStep::NeedsToken => write!(f, "token required"),
            UploadStep::Recorded(message) => write!(f, "recorded: {message}"),
            UploadStep::Rejected(message) => write!(f, "rejected: {message}"),
            UploadStep::RetryScheduled {
                attempts, retry_in, ..
            } => write!(
                f,
                "attempt {attempts} failed; retrying in {}s",
                retry_in.as_secs()
            ),
            UploadStep::Exhausted { attempts, error } => {
                write!(f, "gave up after {attempts} attempts: {error}")
            }
        }
    }
}

/// Result of the one-click submit flow.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitReport {
    /// Helper reply to the metadata submit, or the error text.
    pub submit_log: String,
    pub upload: UploadStep,
}

struct PendingTimer {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct RetryState {
    timer: Option<PendingTimer>,
    next_timer_id: u64,
    attempts: u32,
    firing: bool,
    attempt_in_flight: bool,
    daily_locks: HashSet<(String, NaiveDate)>,
    last_step: Option<UploadStep>,
}

struct Inner {
    helper: HelperClient,
    session: BenchSession,
    policy: UploadSettings,
    history: Option<RunHistory>,
    session_id: Uuid,
    state: Mutex<RetryState>,
    idle: Notify,
}

/// The single attempt slot. Released on drop, including when the attempt
/// future is cancelled mid-request.
struct AttemptSlot {
    inner: Arc<Inner>,
}

impl Drop for AttemptSlot {
    fn drop(&mut self) {
        self.inner.lock().attempt_in_flight = false;
        self.inner.idle.notify_waiters();
    }
}

/// Consent-gated uploads with a bounded, fixed-backoff retry loop.
///
/// Holds at most one pending retry timer. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct UploadController {
    inner: Arc<Inner>,
}

impl UploadController {
    pub fn new(helper: HelperClient, session: BenchSession, policy: UploadSettings) -> Self {
        Self::build(helper, session, policy, None, Uuid::new_v4())
    }

    /// Like [`UploadController::new`], recording every attempt under `session_id`.
    pub fn with_history(
        helper: HelperClient,
        session: BenchSession,
        policy: UploadSettings,
        history: RunHistory,
        session_id: Uuid,
    ) -> Self {
        Self::build(helper, session, policy, Some(history), session_id)
    }

    fn build(
        helper: HelperClient,
        session: BenchSession,
        policy: UploadSettings,
        history: Option<RunHistory>,
        session_id: Uuid,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                helper,
                session,
                policy,
                history,
                session_id,
                state: Mutex::new(RetryState::default()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn session(&self) -> &BenchSession {
        &self.inner.session
    }

    /// One upload of the current session, without touching the retry cycle.
    /// `None` when consent is missing; nothing is sent then.
    pub async fn upload(&self) -> Result<Option<UploadOutcome>> {
        if !self.inner.session.consent() {
            self.inner.show(CONSENT_PROMPT.to_string());
            info!("upload skipped: consent not given");
            return Ok(None);
        }
        let body = UploadBody::collect(
            &self.inner.session.snapshot(),
            Utc::now().timestamp_millis(),
        );
        self.inner.helper.upload_run(&body).await.map(Some)
    }

    /// Arm the auto-upload cycle and make an attempt right away.
    pub async fn start(&self) -> UploadStep {
        Arc::clone(&self.inner).step().await
    }

    /// Drop any pending retry.
    pub fn stop(&self) {
        self.inner.lock().clear_timer();
        self.inner.idle.notify_waiters();
    }

    /// Stop and forget previous attempts.
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        state.clear_timer();
        state.attempts = 0;
        drop(state);
        self.inner.idle.notify_waiters();
    }

    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub fn has_pending_retry(&self) -> bool {
        self.inner.lock().timer.is_some()
    }

    pub fn last_step(&self) -> Option<UploadStep> {
        self.inner.lock().last_step.clone()
    }

    /// Wait until no retry is pending and no attempt is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Begin device authorization and re-arm the cycle with a fresh budget.
    pub async fn start_auth(&self) -> Result<DeviceCode> {
        let payload = match self.inner.helper.upload_start().await {
            Ok(payload) => payload,
            Err(err) => {
                self.inner.show(format!("{err:#}"));
                return Err(err);
            }
        };

        let device = (flag(&payload, "ok") && flag(&payload, "needDevice"))
            .then(|| DeviceCode::from_payload(&payload))
            .flatten();
        let Some(device) = device else {
            let message = non_empty(payload.get("message"))
                .unwrap_or_else(|| UNEXPECTED_AUTH_MESSAGE.to_string());
            self.inner.show(message.clone());
            bail!(message);
        };

        self.reset();
        self.inner.show(format!(
            "Open {} and enter code: {}. After authorization, click “Submit & Upload”.",
            device.verify_uri, device.user_code
        ));
        info!(verify_uri = %device.verify_uri, "device authorization started");
        if self.inner.session.consent() {
            let mut state = self.inner.lock();
            Inner::schedule(&self.inner, &mut state);
        }
        Ok(device)
    }

    pub async fn one_click_submit(&self) -> SubmitReport {
        self.one_click_submit_at(Utc::now()).await
    }

    /// Submit metadata, then, with consent, upload once per instance per UTC day.
    pub async fn one_click_submit_at(&self, now: DateTime<Utc>) -> SubmitReport {
        let snapshot = self.inner.session.snapshot();
        let meta = json!({
            "instance": snapshot.instance.as_ref().map(InstanceId::as_str),
            "image": snapshot.image,
        });
        let submit_log = match self
            .inner
            .helper
            .submit(&snapshot.notes, now.timestamp_millis(), meta)
            .await
        {
            Ok(payload) => render_reply(&payload),
            Err(err) => format!("{err:#}"),
        };
        self.inner
            .session
            .update(|state| state.submit_log = Some(submit_log.clone()));

        if !snapshot.consent {
            self.inner.show(CONSENT_PROMPT.to_string());
            return SubmitReport {
                submit_log,
                upload: UploadStep::ConsentMissing,
            };
        }

        let key = UploadBody::collect(&snapshot, now.timestamp_millis()).lock_key();
        let first_today = self
            .inner
            .lock()
            .daily_locks
            .insert((key.clone(), now.date_naive()));
        if !first_today {
            info!(instance = %key, "upload already attempted today; skipping immediate upload");
            return SubmitReport {
                submit_log,
                upload: UploadStep::Suppressed,
            };
        }

        self.reset();
        let upload = self.start().await;
        SubmitReport { submit_log, upload }
    }
}

impl RetryState {
    fn is_idle(&self) -> bool {
        self.timer.is_none() && !self.firing && !self.attempt_in_flight
    }

    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, RetryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn show(&self, message: String) {
        self.session
            .update(|state| state.upload_log = Some(message));
    }

    /// One pass of the auto-upload loop.
    fn step(self: Arc<Self>) -> Pin<Box<dyn Future<Output = UploadStep> + Send>> {
        Box::pin(async move {
            // Budget check and slot claim share one lock acquisition.
            let gate = {
                let mut state = self.lock();
                if !self.session.consent() {
                    state.clear_timer();
                    Gate::NoConsent
                } else if state.attempt_in_flight {
                    Gate::Busy
                } else if state.attempts >= self.policy.max_attempts {
                    state.clear_timer();
                    Gate::Exhausted(state.attempts)
                } else {
                    state.attempt_in_flight = true;
                    Gate::Open(state.attempts)
                }
            };
            let step = match gate {
                Gate::NoConsent => {
                    self.show(CONSENT_PROMPT.to_string());
                    UploadStep::ConsentMissing
                }
                Gate::Busy => return UploadStep::InProgress,
                Gate::Exhausted(attempts) => UploadStep::LimitReached { attempts },
                Gate::Open(previous) => {
                    let _slot = AttemptSlot {
                        inner: Arc::clone(&self),
                    };
                    let span = info_span!("upload.attempt", attempt = previous + 1);
                    Arc::clone(&self).attempt().instrument(span).await
                }
            };
            self.lock().last_step = Some(step.clone());
            self.idle.notify_waiters();
            step
        })
    }

    async fn attempt(self: Arc<Self>) -> UploadStep {
        let body = UploadBody::collect(&self.session.snapshot(), Utc::now().timestamp_millis());
        let response = self.helper.upload_run(&body).await;

        let step = match response {
            Ok(outcome) => {
                self.show(outcome.guidance(self.helper.endpoint()));
                let step = classify(&outcome);
                info!(step = %step, "upload attempt classified");
                self.lock().clear_timer();
                step
            }
            Err(err) => {
                let error = format!("{err:#}");
                self.show(error.clone());
                let mut state = self.lock();
                state.attempts += 1;
                let attempts = state.attempts;
                if attempts < self.policy.max_attempts {
                    Inner::schedule(&self, &mut state);
                    warn!(attempts, error = %error, "upload failed; retry scheduled");
                    UploadStep::RetryScheduled {
                        attempts,
                        error,
                        retry_in: self.policy.backoff(),
                    }
                } else {
                    state.clear_timer();
                    warn!(attempts, error = %error, "upload failed; giving up");
                    UploadStep::Exhausted { attempts, error }
                }
            }
        };
        self.record(&body, &step);
        step
    }

    /// Replace any pending timer with one that fires after the backoff.
    fn schedule(inner: &Arc<Self>, state: &mut RetryState) {
        state.clear_timer();
        state.next_timer_id += 1;
        let id = state.next_timer_id;
        let backoff = inner.policy.backoff();
        let task_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            {
                let mut state = task_inner.lock();
                if state.timer.as_ref().map(|timer| timer.id) != Some(id) {
                    return;
                }
                state.timer = None;
                state.firing = true;
            }
            Arc::clone(&task_inner).step().await;
            task_inner.lock().firing = false;
            task_inner.idle.notify_waiters();
        });
        state.timer = Some(PendingTimer { id, handle });
    }

    fn record(&self, body: &UploadBody, step: &UploadStep) {
        let Some(history) = &self.history else {
            return;
        };
        let mut entry = HistoryEntry::new(self.session_id, HistoryKind::Upload, step.to_string());
        entry.instance = body.instance_id.clone();
        entry.image = Some(body.image.clone());
        entry.before_mean = body.before.mean;
        entry.after_mean = body.after.mean;
        entry.improvement = body.improvement;
        history.record(&entry);
    }
}

enum Gate {
    NoConsent,
    Busy,
    Exhausted(u32),
    Open(u32),
}

fn classify(outcome: &UploadOutcome) -> UploadStep {
    match outcome {
        UploadOutcome::Uploaded { pr_url } => UploadStep::Uploaded {
            pr_url: pr_url.clone(),
        },
        UploadOutcome::NeedDevice(device) => UploadStep::AwaitingDevice(device.clone()),
        UploadOutcome::NeedToken { .. } => UploadStep::NeedsToken,
        UploadOutcome::Message { message, .. } if outcome.is_idempotent() => {
            UploadStep::Recorded(message.clone())
        }
        UploadOutcome::Message { message, .. } => UploadStep::Rejected(message.clone()),
    }
}

fn flag(payload: &Value, key: &str) -> bool {
    payload.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
        .map(str::to_string)
}

fn render_reply(payload: &Value) -> String {
    match payload.get("raw").and_then(Value::as_str) {
        Some(raw) => raw.to_string(),
        None => payload.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::testing::{StubHelperHttp, StubReply, client};
    use crate::helper::{SUBMIT_PATH, UPLOAD_RUN_PATH, UPLOAD_START_PATH};
    use chrono::TimeZone;
    use tempfile::tempdir;

    const BACKOFF: Duration = Duration::from_secs(600);

    fn session_with_results(consent: bool) -> BenchSession {
        let session = BenchSession::new();
        session.set_input("https://github.com/acme/widgets/pull/42");
        session.set_code("import timeit\nprint('Mean: 1')\n# héllo");
        session.set_notes("  faster hashing  ");
        session.set_consent(consent);
        session.update(|state| {
            state.before.mean = Some(10.0);
            state.before.std = Some(1.0);
            state.after.mean = Some(5.0);
            state.after.std = Some(0.5);
        });
        session
    }

    fn controller(stub: &Arc<StubHelperHttp>, consent: bool) -> UploadController {
        UploadController::new(
            client(stub),
            session_with_results(consent),
            UploadSettings::default(),
        )
    }

    fn transport_failure() -> StubReply {
        StubReply::Fail("Helper /api/upload_run returned status 502 Bad Gateway".into())
    }

    #[test]
    fn body_is_collected_from_session_state() {
        let session = session_with_results(true);
        let body = UploadBody::collect(&session.snapshot(), 1_700_000_000_000);

        assert_eq!(body.instance_id.as_deref(), Some("acme__widgets-42"));
        assert_eq!(
            body.github_url.as_deref(),
            Some("https://github.com/acme/widgets/pull/42")
        );
        assert_eq!(
            body.image,
            "docker.io/sweperf/sweperf_annotate:acme__widgets-42"
        );
        assert_eq!(body.improvement, Some(50.0));
        assert_eq!(body.notes, "faster hashing");
        let decoded = STANDARD.decode(&body.workload_b64).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), session.snapshot().code);

        let wire = serde_json::to_value(&body).unwrap();
        assert_eq!(wire["instanceId"], "acme__widgets-42");
        assert_eq!(wire["before"]["mean"], 10.0);
        assert_eq!(wire["ts"], 1_700_000_000_000_i64);
    }

    #[test]
    fn body_without_results_omits_improvement() {
        let session = BenchSession::with_inputs("acme__widgets-42", "code");
        let body = UploadBody::collect(&session.snapshot(), 0);
        assert!(body.github_url.is_none());
        assert!(body.improvement.is_none());
        let wire = serde_json::to_value(&body).unwrap();
        assert!(wire.get("improvement").is_none());
        assert!(wire["before"]["mean"].is_null());
    }

    #[test]
    fn outcomes_are_classified_exhaustively() {
        let device = UploadOutcome::from_payload(&json!({
            "ok": true, "uploaded": false, "needDevice": true,
            "verifyUri": "https://github.com/login/device", "userCode": "ABCD-1234"
        }));
        assert_eq!(
            device,
            UploadOutcome::NeedDevice(DeviceCode {
                verify_uri: "https://github.com/login/device".into(),
                user_code: "ABCD-1234".into(),
            })
        );

        let uploaded = UploadOutcome::from_payload(&json!({
            "ok": true, "uploaded": true, "prUrl": "https://github.com/sweperf/data/pull/7"
        }));
        assert!(matches!(uploaded, UploadOutcome::Uploaded { .. }));

        let token = UploadOutcome::from_payload(&json!({"ok": true, "needToken": true}));
        assert!(matches!(token, UploadOutcome::NeedToken { .. }));
        assert!(token.guidance("https://127.0.0.1:5050").ends_with("/api/upload/token"));

        let recorded = UploadOutcome::from_payload(&json!({
            "ok": true, "uploaded": false,
            "message": "Thanks! Recorded locally (improvement ≤ 15%, not uploaded)."
        }));
        assert!(recorded.is_idempotent());
        assert!(matches!(classify(&recorded), UploadStep::Recorded(_)));

        let identical = UploadOutcome::from_payload(&json!({
            "ok": true, "message": "Identical submission exists"
        }));
        assert!(identical.is_idempotent());

        let failed = UploadOutcome::from_payload(&json!({"ok": false}));
        assert_eq!(
            failed,
            UploadOutcome::Message {
                accepted: false,
                message: "Upload failed".into()
            }
        );
        assert!(matches!(classify(&failed), UploadStep::Rejected(_)));

        let bare = UploadOutcome::from_payload(&json!({"ok": true}));
        assert!(bare.is_idempotent());

        let incomplete_device =
            UploadOutcome::from_payload(&json!({"ok": true, "needDevice": true}));
        assert!(matches!(incomplete_device, UploadOutcome::Message { .. }));
    }

    #[tokio::test]
    async fn upload_without_consent_sends_nothing() {
        let stub = StubHelperHttp::new();
        let controller = controller(&stub, false);

        assert!(controller.upload().await.unwrap().is_none());
        assert_eq!(controller.start().await, UploadStep::ConsentMissing);
        assert!(stub.calls().is_empty());
        assert_eq!(
            controller.session().snapshot().upload_log.as_deref(),
            Some(CONSENT_PROMPT)
        );
    }

    #[tokio::test]
    async fn successful_upload_is_terminal() {
        let stub = StubHelperHttp::new();
        stub.push_json(
            UPLOAD_RUN_PATH,
            json!({"ok": true, "uploaded": true, "prUrl": "https://github.com/x/y/pull/1"}),
        );
        let controller = controller(&stub, true);

        let step = controller.start().await;
        assert_eq!(
            step,
            UploadStep::Uploaded {
                pr_url: "https://github.com/x/y/pull/1".into()
            }
        );
        assert!(!controller.has_pending_retry());
        assert_eq!(
            controller.session().snapshot().upload_log.as_deref(),
            Some("Thanks! Uploaded. PR: https://github.com/x/y/pull/1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_stop_after_three_attempts() {
        let stub = StubHelperHttp::new();
        for _ in 0..5 {
            stub.push(UPLOAD_RUN_PATH, transport_failure());
        }
        let controller = controller(&stub, true);

        let step = controller.start().await;
        assert!(step.is_retrying());
        assert_eq!(controller.attempts(), 1);
        assert!(controller.has_pending_retry());

        tokio::time::sleep(BACKOFF + Duration::from_secs(1)).await;
        assert_eq!(stub.calls_to(UPLOAD_RUN_PATH).len(), 2);
        assert_eq!(controller.attempts(), 2);
        assert!(controller.has_pending_retry());

        tokio::time::sleep(BACKOFF + Duration::from_secs(1)).await;
        assert_eq!(stub.calls_to(UPLOAD_RUN_PATH).len(), 3);
        assert_eq!(controller.attempts(), 3);
        assert!(!controller.has_pending_retry());
        assert!(matches!(
            controller.last_step(),
            Some(UploadStep::Exhausted { attempts: 3, .. })
        ));

        tokio::time::sleep(BACKOFF * 3).await;
        assert_eq!(stub.calls_to(UPLOAD_RUN_PATH).len(), 3);

        assert_eq!(
            controller.start().await,
            UploadStep::LimitReached { attempts: 3 }
        );
        assert_eq!(stub.calls_to(UPLOAD_RUN_PATH).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_starts_share_one_attempt_budget() {
        let stub = StubHelperHttp::new();
        stub.push(UPLOAD_RUN_PATH, transport_failure());
        stub.push(UPLOAD_RUN_PATH, transport_failure());
        for _ in 0..2 {
            stub.push(
                UPLOAD_RUN_PATH,
                StubReply::DelayedFail(Duration::from_secs(5), "connection reset".into()),
            );
        }
        let controller = controller(&stub, true);
        controller.start().await;
        controller.start().await;
        assert_eq!(controller.attempts(), 2);

        let (first, second) = tokio::join!(controller.start(), controller.start());
        let steps = [first, second];
        assert!(steps.contains(&UploadStep::InProgress));
        assert!(
            steps
                .iter()
                .any(|step| matches!(step, UploadStep::Exhausted { attempts: 3, .. }))
        );
        assert_eq!(controller.attempts(), 3);
        assert_eq!(stub.calls_to(UPLOAD_RUN_PATH).len(), 3);

        tokio::time::sleep(BACKOFF * 3).await;
        assert_eq!(stub.calls_to(UPLOAD_RUN_PATH).len(), 3);
        assert!(!controller.has_pending_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_attempt_frees_its_slot() {
        let stub = StubHelperHttp::new();
        stub.push(
            UPLOAD_RUN_PATH,
            StubReply::DelayedFail(Duration::from_secs(30), "helper stalled".into()),
        );
        stub.push_json(UPLOAD_RUN_PATH, json!({"ok": true, "needToken": true}));
        let controller = controller(&stub, true);

        let abandoned = tokio::time::timeout(Duration::from_secs(1), controller.start()).await;
        assert!(abandoned.is_err());
        assert_eq!(controller.attempts(), 0);

        assert_eq!(controller.start().await, UploadStep::NeedsToken);
        controller.wait_idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_returns_once_retries_settle() {
        let stub = StubHelperHttp::new();
        stub.push(UPLOAD_RUN_PATH, transport_failure());
        stub.push_json(
            UPLOAD_RUN_PATH,
            json!({"ok": true, "uploaded": true, "prUrl": "https://github.com/x/y/pull/5"}),
        );
        let controller = controller(&stub, true);

        assert!(controller.start().await.is_retrying());
        controller.wait_idle().await;

        assert_eq!(stub.calls_to(UPLOAD_RUN_PATH).len(), 2);
        assert!(!controller.has_pending_retry());
        assert!(matches!(
            controller.last_step(),
            Some(UploadStep::Uploaded { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_never_stacks_timers() {
        let stub = StubHelperHttp::new();
        for _ in 0..2 {
            stub.push(UPLOAD_RUN_PATH, transport_failure());
        }
        stub.push_json(
            UPLOAD_RUN_PATH,
            json!({"ok": true, "uploaded": true, "prUrl": "https://github.com/x/y/pull/2"}),
        );
        let controller = controller(&stub, true);

        controller.start().await;
        controller.start().await;
        assert_eq!(controller.attempts(), 2);
        assert!(controller.has_pending_retry());

        tokio::time::sleep(BACKOFF + Duration::from_secs(1)).await;
        assert_eq!(stub.calls_to(UPLOAD_RUN_PATH).len(), 3);
        assert!(matches!(
            controller.last_step(),
            Some(UploadStep::Uploaded { .. })
        ));

        tokio::time::sleep(BACKOFF * 2).await;
        assert_eq!(stub.calls_to(UPLOAD_RUN_PATH).len(), 3);
        assert!(!controller.has_pending_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn withdrawn_consent_stops_the_loop() {
        let stub = StubHelperHttp::new();
        stub.push(UPLOAD_RUN_PATH, transport_failure());
        let controller = controller(&stub, true);

        controller.start().await;
        assert!(controller.has_pending_retry());
        controller.session().set_consent(false);

        tokio::time::sleep(BACKOFF + Duration::from_secs(1)).await;
        assert_eq!(stub.calls_to(UPLOAD_RUN_PATH).len(), 1);
        assert_eq!(controller.last_step(), Some(UploadStep::ConsentMissing));
        assert!(!controller.has_pending_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_resend_the_current_session_values() {
        let stub = StubHelperHttp::new();
        stub.push(UPLOAD_RUN_PATH, transport_failure());
        stub.push_json(UPLOAD_RUN_PATH, json!({"ok": true, "message": "Identical submission exists"}));
        let controller = controller(&stub, true);

        controller.start().await;
        controller.session().set_notes("updated notes");
        tokio::time::sleep(BACKOFF + Duration::from_secs(1)).await;

        let calls = stub.calls_to(UPLOAD_RUN_PATH);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].body.as_ref().unwrap()["notes"], "updated notes");
        assert!(matches!(controller.last_step(), Some(UploadStep::Recorded(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn device_authorization_pauses_without_counting() {
        let stub = StubHelperHttp::new();
        stub.push_json(
            UPLOAD_RUN_PATH,
            json!({"ok": true, "needDevice": true, "verifyUri": "https://github.com/login/device", "userCode": "WXYZ-0000"}),
        );
        let controller = controller(&stub, true);

        let step = controller.start().await;
        assert!(matches!(step, UploadStep::AwaitingDevice(_)));
        assert_eq!(controller.attempts(), 0);
        assert!(!controller.has_pending_retry());
        assert_eq!(
            controller.session().snapshot().upload_log.as_deref(),
            Some("Open https://github.com/login/device and enter code: WXYZ-0000. Then click “Submit & Upload” again.")
        );
    }

    #[tokio::test]
    async fn missing_token_is_terminal() {
        let stub = StubHelperHttp::new();
        stub.push_json(UPLOAD_RUN_PATH, json!({"ok": true, "needToken": true}));
        let controller = controller(&stub, true);

        assert_eq!(controller.start().await, UploadStep::NeedsToken);
        assert!(!controller.has_pending_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn start_auth_resets_and_rearms_the_cycle() {
        let stub = StubHelperHttp::new();
        stub.push(UPLOAD_RUN_PATH, transport_failure());
        stub.push(UPLOAD_RUN_PATH, transport_failure());
        stub.push_json(
            UPLOAD_START_PATH,
            json!({"ok": true, "needDevice": true, "verifyUri": "https://github.com/login/device", "userCode": "CODE-1"}),
        );
        stub.push_json(
            UPLOAD_RUN_PATH,
            json!({"ok": true, "uploaded": true, "prUrl": "https://github.com/x/y/pull/3"}),
        );
        let controller = controller(&stub, true);

        controller.start().await;
        controller.start().await;
        assert_eq!(controller.attempts(), 2);

        let device = controller.start_auth().await.unwrap();
        assert_eq!(device.user_code, "CODE-1");
        assert_eq!(controller.attempts(), 0);
        assert!(controller.has_pending_retry());
        assert!(
            controller
                .session()
                .snapshot()
                .upload_log
                .unwrap()
                .contains("CODE-1")
        );

        tokio::time::sleep(BACKOFF + Duration::from_secs(1)).await;
        assert!(matches!(
            controller.last_step(),
            Some(UploadStep::Uploaded { .. })
        ));
        controller.wait_idle().await;
    }

    #[tokio::test]
    async fn start_auth_surfaces_unexpected_replies() {
        let stub = StubHelperHttp::new();
        stub.push_json(UPLOAD_START_PATH, json!({"ok": false}));
        stub.push(
            UPLOAD_START_PATH,
            StubReply::Fail("Helper /api/upload/start returned status 429".into()),
        );
        let controller = controller(&stub, true);

        let error = controller.start_auth().await.unwrap_err();
        assert_eq!(error.to_string(), UNEXPECTED_AUTH_MESSAGE);
        let error = controller.start_auth().await.unwrap_err();
        assert!(error.to_string().contains("429"));
        assert!(!controller.has_pending_retry());
    }

    #[tokio::test]
    async fn one_click_submit_uploads_once_per_day() {
        let stub = StubHelperHttp::new();
        for _ in 0..3 {
            stub.push_json(SUBMIT_PATH, json!({"ok": true}));
        }
        stub.push_json(UPLOAD_RUN_PATH, json!({"ok": true, "message": "Thanks! Recorded locally."}));
        stub.push_json(UPLOAD_RUN_PATH, json!({"ok": true, "message": "Thanks! Recorded locally."}));
        let controller = controller(&stub, true);
        let morning = Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2026, 10, 19, 23, 59, 0).unwrap();
        let next_day = Utc.with_ymd_and_hms(2026, 10, 20, 0, 1, 0).unwrap();

        let first = controller.one_click_submit_at(morning).await;
        assert!(matches!(first.upload, UploadStep::Recorded(_)));
        let second = controller.one_click_submit_at(evening).await;
        assert_eq!(second.upload, UploadStep::Suppressed);
        assert_eq!(stub.calls_to(SUBMIT_PATH).len(), 2);
        assert_eq!(stub.calls_to(UPLOAD_RUN_PATH).len(), 1);

        let third = controller.one_click_submit_at(next_day).await;
        assert!(matches!(third.upload, UploadStep::Recorded(_)));
        assert_eq!(stub.calls_to(UPLOAD_RUN_PATH).len(), 2);

        let submit = &stub.calls_to(SUBMIT_PATH)[0];
        let body = submit.body.as_ref().unwrap();
        assert_eq!(body["notes"], "  faster hashing  ");
        assert_eq!(body["meta"]["instance"], "acme__widgets-42");
        assert_eq!(first.submit_log, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn one_click_submit_without_consent_only_submits_metadata() {
        let stub = StubHelperHttp::new();
        stub.push_json(SUBMIT_PATH, json!({"raw": "stored"}));
        let controller = controller(&stub, false);

        let report = controller.one_click_submit().await;
        assert_eq!(report.upload, UploadStep::ConsentMissing);
        assert_eq!(report.submit_log, "stored");
        assert!(stub.calls_to(UPLOAD_RUN_PATH).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn background_retries_ignore_the_daily_lock() {
        let stub = StubHelperHttp::new();
        stub.push_json(SUBMIT_PATH, json!({"ok": true}));
        stub.push_json(SUBMIT_PATH, json!({"ok": true}));
        stub.push(UPLOAD_RUN_PATH, transport_failure());
        stub.push_json(UPLOAD_RUN_PATH, json!({"ok": true, "uploaded": true, "prUrl": "https://github.com/x/y/pull/9"}));
        let controller = controller(&stub, true);
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();

        let report = controller.one_click_submit_at(now).await;
        assert!(report.upload.is_retrying());
        let again = controller.one_click_submit_at(now).await;
        assert_eq!(again.upload, UploadStep::Suppressed);
        assert!(controller.has_pending_retry());

        tokio::time::sleep(BACKOFF + Duration::from_secs(1)).await;
        assert_eq!(stub.calls_to(UPLOAD_RUN_PATH).len(), 2);
        assert!(matches!(
            controller.last_step(),
            Some(UploadStep::Uploaded { .. })
        ));
    }

    #[tokio::test]
    async fn upload_attempts_are_recorded_in_history() {
        let dir = tempdir().unwrap();
        let history = RunHistory::new(dir.path().join("runs.jsonl"));
        let stub = StubHelperHttp::new();
        stub.push_json(UPLOAD_RUN_PATH, json!({"ok": true, "needToken": true}));
        let session_id = Uuid::new_v4();
        let controller = UploadController::with_history(
            client(&stub),
            session_with_results(true),
            UploadSettings::default(),
            history.clone(),
            session_id,
        );

        controller.clone().start().await;
        let entries = history.read_recent(5).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, HistoryKind::Upload);
        assert_eq!(entries[0].outcome, "token required");
        assert_eq!(entries[0].session_id, session_id);
        assert_eq!(entries[0].improvement, Some(50.0));
    }
}
