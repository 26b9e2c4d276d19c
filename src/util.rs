//! Small helpers shared across modules.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current timestamp in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Current wall-clock time as an ISO-8601 / RFC 3339 string (UTC).
pub fn iso_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Slug a project path the way the assistant tool names its vault
/// directories: every path separator becomes a hyphen.
///
/// `/tmp/proj1` → `-tmp-proj1`
pub fn project_slug(path: &str) -> String {
    path.replace(['/', '\\'], "-")
}
