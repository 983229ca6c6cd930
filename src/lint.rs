use once_cell::sync::Lazy;
use regex::Regex;

/// Workloads shorter than this (after trimming) are flagged.
pub const MIN_WORKLOAD_CHARS: usize = 20;

static REQUIRED_IMPORTS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"\bimport\s+timeit\b").expect("static regex"),
            r"import\s+timeit",
        ),
        (
            Regex::new(r"\bimport\s+statistics\b").expect("static regex"),
            r"import\s+statistics",
        ),
    ]
});
static MEAN_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Mean\s*:").expect("static regex"));
static STD_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(Std\s*Dev|Std)\s*:").expect("static regex"));

/// Textual checks over a workload script. Hints are advisory and never block a run.
///
/// Every check runs; the returned order is fixed (imports, mean, std, length).
pub fn lint(code: &str) -> Vec<String> {
    let mut hints = Vec::new();

    for (pattern, label) in REQUIRED_IMPORTS.iter() {
        if !pattern.is_match(code) {
            hints.push(format!("Missing required import: {label}"));
        }
    }
    if !MEAN_LINE.is_match(code) {
        hints.push("Expected print(\"Mean:\", value)".to_string());
    }
    if !STD_LINE.is_match(code) {
        hints.push("Expected print(\"Std Dev:\", value)".to_string());
    }
    if code.trim().chars().count() < MIN_WORKLOAD_CHARS {
        hints.push("Code seems too short".to_string());
    }

    hints
}

/// Single-line rendering used by the CLI.
pub fn summarize(hints: &[String]) -> String {
    if hints.is_empty() {
        "No issues found".to_string()
    } else {
        format!("Hints: {}", hints.join(" · "))
    }
}
