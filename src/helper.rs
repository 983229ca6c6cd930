use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use crate::config::HelperSettings;
use crate::identifier::InstanceId;
use crate::metrics::RunResult;
use crate::upload::{UploadBody, UploadOutcome};

pub const HEALTH_PATH: &str = "/api/health";
pub const DOCKER_CHECK_PATH: &str = "/api/docker/check";
pub const PREPARE_PATH: &str = "/api/bench/prepare";
pub const RUN_PATH: &str = "/api/bench/run";
pub const UPLOAD_RUN_PATH: &str = "/api/upload_run";
pub const UPLOAD_START_PATH: &str = "/api/upload/start";
pub const UPLOAD_TOKEN_PATH: &str = "/api/upload/token";
pub const SUBMIT_PATH: &str = "/api/submit";

/// Transport seam for the helper API.
///
/// Implementations return `Err` for transport failures and non-2xx statuses,
/// and hand back `{"raw": text}` when a body is not JSON.
#[async_trait]
pub trait HelperHttp: Send + Sync {
    async fn get_json(&self, path: &str) -> Result<Value>;
    async fn post_json(&self, path: &str, body: Option<&Value>) -> Result<Value>;
}

pub struct ReqwestHelperHttp {
    client: Client,
    base: Url,
}

impl ReqwestHelperHttp {
    pub fn from_settings(settings: &HelperSettings) -> Result<Self> {
        let base = settings.endpoint_url()?;
        let mut builder = Client::builder()
            .user_agent(settings.user_agent.clone())
            .danger_accept_invalid_certs(settings.accept_invalid_certs);
        if let Some(timeout) = settings.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to build helper HTTP client")?;
        Ok(Self { client, base })
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("Invalid helper path {path}"))
    }

    async fn finish(path: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read helper response from {path}"))?;
        classify_response(path, status, &text)
    }
}

/// Non-2xx statuses become errors carrying the body; anything else is parsed.
pub fn classify_response(path: &str, status: StatusCode, text: &str) -> Result<Value> {
    if !status.is_success() {
        bail!("Helper {path} returned status {status}: {}", text.trim());
    }
    Ok(parse_payload(text))
}

#[async_trait]
impl HelperHttp for ReqwestHelperHttp {
    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = self.url_for(path)?;
        debug!(%url, "GET helper");
        let response = self
            .client
            .get(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .send()
            .await
            .with_context(|| format!("Failed to reach helper at {path}"))?;
        Self::finish(path, response).await
    }

    async fn post_json(&self, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = self.url_for(path)?;
        debug!(%url, "POST helper");
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to post to helper at {path}"))?;
        Self::finish(path, response).await
    }
}

/// JSON when possible, otherwise the text wrapped as `{"raw": text}`.
pub fn parse_payload(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| json!({ "raw": text }))
}

/// Accepted workload handle returned by `/api/bench/prepare`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareResult {
    pub job_id: String,
    pub host_workload_path: Option<String>,
}

impl PrepareResult {
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let Some(job_id) = payload
            .get("jobId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
        else {
            let detail = payload
                .get("raw")
                .or_else(|| payload.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| payload.to_string());
            bail!("Helper did not return a jobId: {detail}");
        };
        Ok(Self {
            job_id: job_id.to_string(),
            host_workload_path: payload
                .get("hostWorkloadPath")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HelperStatus {
    Connected(Value),
    Offline(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DockerStatus {
    Available(Value),
    Unavailable(Value),
    Error(String),
}

/// Typed calls against the helper API.
#[derive(Clone)]
pub struct HelperClient {
    http: Arc<dyn HelperHttp>,
    endpoint: String,
}

impl HelperClient {
    pub fn new(http: Arc<dyn HelperHttp>, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_settings(settings: &HelperSettings) -> Result<Self> {
        let http = ReqwestHelperHttp::from_settings(settings)?;
        Ok(Self::new(Arc::new(http), settings.endpoint.clone()))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn health(&self) -> HelperStatus {
        match self.http.get_json(HEALTH_PATH).await {
            Ok(payload) => HelperStatus::Connected(payload),
            Err(err) => HelperStatus::Offline(format!("{err:#}")),
        }
    }

    pub async fn docker_check(&self) -> DockerStatus {
        match self.http.get_json(DOCKER_CHECK_PATH).await {
            Ok(payload) => {
                let available = ["ok", "available"]
                    .iter()
                    .any(|key| payload.get(*key).is_some_and(is_truthy));
                if available {
                    DockerStatus::Available(payload)
                } else {
                    DockerStatus::Unavailable(payload)
                }
            }
            Err(err) => DockerStatus::Error(format!("{err:#}")),
        }
    }

    pub async fn prepare(
        &self,
        instance: &InstanceId,
        image: &str,
        code: &str,
    ) -> Result<PrepareResult> {
        let body = json!({
            "instance": instance.as_str(),
            "image": image,
            "code": code,
        });
        let payload = self.http.post_json(PREPARE_PATH, Some(&body)).await?;
        PrepareResult::from_payload(&payload)
    }

    pub async fn run(&self, job_id: &str) -> Result<RunResult> {
        let body = json!({ "jobId": job_id });
        let payload = self.http.post_json(RUN_PATH, Some(&body)).await?;
        RunResult::from_payload(&payload)
    }

    pub async fn upload_run(&self, body: &UploadBody) -> Result<UploadOutcome> {
        let body = serde_json::to_value(body).context("Failed to encode upload body")?;
        let payload = self.http.post_json(UPLOAD_RUN_PATH, Some(&body)).await?;
        Ok(UploadOutcome::from_payload(&payload))
    }

    pub async fn upload_start(&self) -> Result<Value> {
        self.http.post_json(UPLOAD_START_PATH, None).await
    }

    pub async fn submit(&self, notes: &str, ts: i64, meta: Value) -> Result<Value> {
        let body = json!({ "notes": notes, "ts": ts, "meta": meta });
        self.http.post_json(SUBMIT_PATH, Some(&body)).await
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn non_json_bodies_are_wrapped_as_raw() {
        assert_eq!(parse_payload("{\"ok\": true}"), json!({"ok": true}));
        assert_eq!(
            parse_payload("Internal error"),
            json!({"raw": "Internal error"})
        );
    }

    #[test]
    fn responses_are_classified_by_status_then_body() {
        assert_eq!(
            classify_response(RUN_PATH, StatusCode::OK, r#"{"jobId": "job-1"}"#).unwrap(),
            json!({"jobId": "job-1"})
        );
        assert_eq!(
            classify_response(SUBMIT_PATH, StatusCode::OK, "stored\n").unwrap(),
            json!({"raw": "stored\n"})
        );

        let missing = classify_response(PREPARE_PATH, StatusCode::NOT_FOUND, "no such route\n")
            .unwrap_err()
            .to_string();
        assert!(missing.contains("/api/bench/prepare"));
        assert!(missing.contains("404"));
        assert!(missing.ends_with("no such route"));

        let crashed = classify_response(
            UPLOAD_RUN_PATH,
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"ok": false}"#,
        )
        .unwrap_err()
        .to_string();
        assert!(crashed.contains("500"));
        assert!(crashed.contains(r#"{"ok": false}"#));
    }

    #[test]
    fn prepare_payload_requires_job_id() {
        let prepared = PrepareResult::from_payload(&json!({
            "ok": true,
            "jobId": "job-1-abcd",
            "hostWorkloadPath": "/srv/jobs/job-1-abcd/workload.py"
        }))
        .unwrap();
        assert_eq!(prepared.job_id, "job-1-abcd");
        assert_eq!(
            prepared.host_workload_path.as_deref(),
            Some("/srv/jobs/job-1-abcd/workload.py")
        );

        let error = PrepareResult::from_payload(&json!({"raw": "oops"})).unwrap_err();
        assert!(error.to_string().contains("oops"));
    }

    #[tokio::test]
    async fn health_reports_offline_on_transport_failure() {
        let stub = StubHelperHttp::new();
        stub.push_json(HEALTH_PATH, json!({"status": "ok"}));
        stub.push(HEALTH_PATH, StubReply::Fail("connection refused".into()));
        let helper = client(&stub);

        assert_eq!(
            helper.health().await,
            HelperStatus::Connected(json!({"status": "ok"}))
        );
        match helper.health().await {
            HelperStatus::Offline(message) => assert!(message.contains("connection refused")),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(helper.endpoint(), "https://127.0.0.1:5050");
    }

    #[tokio::test]
    async fn docker_check_accepts_ok_or_available() {
        let stub = StubHelperHttp::new();
        stub.push_json(DOCKER_CHECK_PATH, json!({"available": true}));
        stub.push_json(DOCKER_CHECK_PATH, json!({"ok": false, "available": false}));
        stub.push(DOCKER_CHECK_PATH, StubReply::Fail("timeout".into()));
        let helper = client(&stub);

        assert!(matches!(helper.docker_check().await, DockerStatus::Available(_)));
        assert!(matches!(helper.docker_check().await, DockerStatus::Unavailable(_)));
        assert!(matches!(helper.docker_check().await, DockerStatus::Error(_)));
    }

    #[tokio::test]
    async fn prepare_sends_instance_image_and_code() {
        let stub = StubHelperHttp::new();
        stub.push_json(
            PREPARE_PATH,
            json!({"ok": true, "jobId": "job-9", "hostWorkloadPath": "/w.py"}),
        );
        let helper = client(&stub);
        let instance = InstanceId::parse("acme__widgets-42").unwrap();

        let prepared = helper
            .prepare(&instance, &instance.image(), "print(1)")
            .await
            .unwrap();
        assert_eq!(prepared.job_id, "job-9");

        let calls = stub.calls_to(PREPARE_PATH);
        assert_eq!(calls.len(), 1);
        let body = calls[0].body.as_ref().unwrap();
        assert_eq!(body["instance"], "acme__widgets-42");
        assert_eq!(
            body["image"],
            "docker.io/sweperf/sweperf_annotate:acme__widgets-42"
        );
        assert_eq!(body["code"], "print(1)");
    }
}
