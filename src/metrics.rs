use std::fmt;

use anyhow::{Result, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Rendered in place of any metric that is not available.
pub const PLACEHOLDER: &str = "—";

static PULL_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)pull|download|extract").expect("static regex"));

/// One side (before or after) of a timed run as reported by the helper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    /// Workload output between the perf markers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core: Option<String>,
}

impl Metrics {
    /// Lenient decode: numbers may arrive as JSON numbers or numeric strings,
    /// and non-finite values count as missing.
    pub fn from_value(value: &Value) -> Self {
        Self {
            mean: value.get("mean").and_then(finite_number),
            std: value.get("std").and_then(finite_number),
            error: non_empty_string(value.get("error")),
            raw: non_empty_string(value.get("raw")),
            core: non_empty_string(value.get("core")),
        }
    }

    pub fn is_successful(&self) -> bool {
        self.mean.is_some() && self.std.is_some()
    }

    pub fn is_errored(&self) -> bool {
        self.error.is_some() || (!self.is_successful() && self.raw.is_some())
    }

    /// Text shown beneath the numbers: the error if any, otherwise the workload output.
    pub fn diagnostic(&self) -> Option<&str> {
        self.error.as_deref().or(self.core.as_deref())
    }
}

/// Decoded `/api/bench/run` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub before: Metrics,
    pub after: Metrics,
}

impl RunResult {
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let before = payload.get("before").filter(|value| value.is_object());
        let after = payload.get("after").filter(|value| value.is_object());
        if before.is_none() && after.is_none() {
            let detail = payload
                .get("error")
                .or_else(|| payload.get("message"))
                .or_else(|| payload.get("raw"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| payload.to_string());
            bail!("Helper run returned no before/after metrics: {detail}");
        }
        Ok(Self {
            before: before.map(Metrics::from_value).unwrap_or_default(),
            after: after.map(Metrics::from_value).unwrap_or_default(),
        })
    }

    /// Image pull progress lines found in the raw container output.
    pub fn pull_lines(&self) -> Vec<String> {
        let mut sources = Vec::new();
        if let Some(raw) = self.before.raw.as_deref() {
            sources.push(raw);
        }
        if let Some(raw) = self.after.raw.as_deref() {
            // the helper reports the same combined log for both sides
            if sources.first() != Some(&raw) {
                sources.push(raw);
            }
        }
        sources
            .into_iter()
            .flat_map(str::lines)
            .filter(|line| PULL_LINE.is_match(line))
            .map(str::to_string)
            .collect()
    }
}

/// Rendered state of one side after a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsView {
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub log: Option<String>,
    pub errored: bool,
}

impl MetricsView {
    pub fn placeholder() -> Self {
        Self::default()
    }

    pub fn succeeded(&self) -> bool {
        self.mean.is_some() && self.std.is_some()
    }

    pub fn mean_text(&self) -> String {
        format_metric(self.mean)
    }

    pub fn std_text(&self) -> String {
        format_metric(self.std)
    }

    /// `Mean: <m> | Std: <s>` line, as copied from the result cards.
    pub fn summary(&self) -> String {
        format!("Mean: {} | Std: {}", self.mean_text(), self.std_text())
    }
}

impl From<&Metrics> for MetricsView {
    fn from(metrics: &Metrics) -> Self {
        Self {
            mean: metrics.mean,
            std: metrics.std,
            log: metrics.diagnostic().map(str::to_string),
            errored: metrics.is_errored(),
        }
    }
}

/// Relative change of the mean runtime. Positive means the change made the
/// workload faster: `(before - after) / before`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", content = "percent", rename_all = "snake_case")]
pub enum Improvement {
    Faster(f64),
    Slower(f64),
    Unavailable,
}

impl Improvement {
    pub fn compute(before_mean: Option<f64>, after_mean: Option<f64>) -> Self {
        let (Some(before), Some(after)) = (before_mean, after_mean) else {
            return Improvement::Unavailable;
        };
        let percent = (before - after) / before * 100.0;
        if !percent.is_finite() {
            return Improvement::Unavailable;
        }
        if percent >= 0.0 {
            Improvement::Faster(percent)
        } else {
            Improvement::Slower(-percent)
        }
    }

    /// Signed percentage, positive when faster.
    pub fn signed_percent(&self) -> Option<f64> {
        match *self {
            Improvement::Faster(percent) => Some(percent),
            Improvement::Slower(percent) => Some(-percent),
            Improvement::Unavailable => None,
        }
    }
}

impl Default for Improvement {
    fn default() -> Self {
        Improvement::Unavailable
    }
}

impl fmt::Display for Improvement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Improvement::Faster(percent) => write!(f, "Improvement: faster {percent:.2}%"),
            Improvement::Slower(percent) => write!(f, "Improvement: slower {percent:.2}%"),
            Improvement::Unavailable => write!(f, "Improvement: {PLACEHOLDER}"),
        }
    }
}

/// Multiplicative speedup `before / after`; greater than 1 means faster,
/// matching the sign of [`Improvement`].
pub fn speedup(before_mean: Option<f64>, after_mean: Option<f64>) -> Option<f64> {
    let ratio = before_mean? / after_mean?;
    (ratio.is_finite() && ratio > 0.0).then_some(ratio)
}

pub fn format_metric(value: Option<f64>) -> String {
    value
        .map(|number| number.to_string())
        .unwrap_or_else(|| PLACEHOLDER.to_string())
}

fn finite_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
