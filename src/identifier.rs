use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Registry path every benchmark image is published under.
pub const IMAGE_REPOSITORY: &str = "docker.io/sweperf/sweperf_annotate";

/// Resource limits baked into the manual `docker run` command. Not user configurable.
pub const CONTAINER_HARDENING_FLAGS: &str = "--cpus=1 --memory=1g --pids-limit=256 --network=none --cap-drop=ALL --security-opt no-new-privileges";

const WORKLOAD_MOUNT_TARGET: &str = "/tmp/workload.py";
const MISSING_PATH_PLACEHOLDER: &str = "<REPLACE_ME>";

// Word and digit classes are ASCII-only; image tags cannot carry other scripts.
static GITHUB_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^https?://github\.com/").expect("static regex"));
static GITHUB_PULL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)github\.com/([^/]+)/([^/]+)/pull/([0-9]+)").expect("static regex")
});
static CONTAINER_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(docker\.|ghcr\.|quay\.|[0-9A-Za-z_.-]+/)\S+:").expect("static regex")
});
static CANONICAL_INSTANCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-Za-z_][0-9A-Za-z_.-]*__[^\s:]+-[0-9]+$").expect("static regex")
});
static EMBEDDED_INSTANCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9A-Za-z_.-]+__[^\s:]+-[0-9]+").expect("static regex"));

/// Canonical benchmark instance identifier (`<org>__<repo>-<pr>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId(String);

impl InstanceId {
    /// Accepts only strings already in canonical shape.
    pub fn parse(candidate: &str) -> Option<Self> {
        let trimmed = candidate.trim();
        CANONICAL_INSTANCE
            .is_match(trimmed)
            .then(|| Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Container image holding the before/after checkouts for this instance.
    pub fn image(&self) -> String {
        image_from_instance(self)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for InstanceId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("'{value}' is not a benchmark instance id"))
    }
}

impl From<InstanceId> for String {
    fn from(value: InstanceId) -> Self {
        value.0
    }
}

/// Which input shape a resolved identifier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputShape {
    GithubPull,
    ContainerTag,
    Bare,
}

pub fn is_github_url(input: &str) -> bool {
    GITHUB_PREFIX.is_match(input.trim())
}

pub fn is_container_reference(input: &str) -> bool {
    CONTAINER_REFERENCE.is_match(input.trim())
}

/// Resolve free-form user input into a canonical instance id.
///
/// Exactly one rule is tried, picked by the input's prefix: a GitHub URL, a
/// container reference with a tag, or a bare id. Returns `None` for anything
/// that does not produce a canonical id.
pub fn resolve(input: &str) -> Option<InstanceId> {
    resolve_with_shape(input).map(|(id, _)| id)
}

pub fn resolve_with_shape(input: &str) -> Option<(InstanceId, InputShape)> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if is_github_url(trimmed) {
        let captures = GITHUB_PULL.captures(trimmed)?;
        let candidate = format!("{}__{}-{}", &captures[1], &captures[2], &captures[3]);
        return InstanceId::parse(&candidate).map(|id| (id, InputShape::GithubPull));
    }

    if is_container_reference(trimmed) {
        let tag = trimmed.split(':').nth(1).unwrap_or_default();
        return InstanceId::parse(tag).map(|id| (id, InputShape::ContainerTag));
    }

    InstanceId::parse(trimmed).map(|id| (id, InputShape::Bare))
}

pub fn image_from_instance(instance: &InstanceId) -> String {
    format!("{IMAGE_REPOSITORY}:{instance}")
}

/// First instance-shaped substring of arbitrary text.
pub fn find_embedded_instance(text: &str) -> Option<&str> {
    EMBEDDED_INSTANCE.find(text).map(|found| found.as_str())
}

/// Render the command a user can run to open a shell in the benchmark container
/// with their workload mounted.
pub fn docker_command(host_workload_path: Option<&str>, image: &str) -> String {
    let source = match host_workload_path.filter(|path| !path.is_empty()) {
        Some(path) => serde_json::to_string(path).unwrap_or_else(|_| format!("\"{path}\"")),
        None => MISSING_PATH_PLACEHOLDER.to_string(),
    };
    format!(
        "docker run -it --rm {CONTAINER_HARDENING_FLAGS} --mount type=bind,src={source},dst={WORKLOAD_MOUNT_TARGET} {image} /bin/bash"
    )
}
