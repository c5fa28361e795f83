//! Remote task ids embedded in execution logs.
//!
//! Scripts print the ids of the remote tasks they start ("Started GEE task
//! ABCD..."). One token rule applies to every recognised phrase, so the
//! phrases can never disagree about where an id begins or ends.

use once_cell::sync::Lazy;
use regex::Regex;

/// Length of a remote task id.
pub const EXTERNAL_TASK_ID_LEN: usize = 24;

/// Phrases that introduce a task id, case-insensitive, most specific first.
const PHRASES: &[&str] = &[
    r"gee\s+task",
    r"earth\s+engine\s+task",
    r"task[\s_-]*id",
    r"task",
    r"operations/",
];

static TASK_ID_IN_LOG: Lazy<Regex> = Lazy::new(|| {
    let pattern = format!(
        r#"(?i:\b(?:{}))[\s:=#'"]*\b([A-Z0-9]{{{}}})\b"#,
        PHRASES.join("|"),
        EXTERNAL_TASK_ID_LEN
    );
    Regex::new(&pattern).expect("remote task id pattern compiles")
});

/// Whether `token` has the exact shape of a remote task id.
pub fn is_valid_external_task_id(token: &str) -> bool {
    token.len() == EXTERNAL_TASK_ID_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Distinct task ids mentioned in `lines`, in order of first appearance.
pub fn external_task_ids<S: AsRef<str>>(lines: &[S]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for line in lines {
        for caps in TASK_ID_IN_LOG.captures_iter(line.as_ref()) {
            let Some(m) = caps.get(1) else { continue };
            let token = m.as_str();
            if is_valid_external_task_id(token) && !ids.iter().any(|t| t == token) {
                ids.push(token.to_string());
            }
        }
    }
    ids
}
