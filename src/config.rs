//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `ABRIDGE_LISTEN`, `ABRIDGE_SESSIONS_ROOT`,
//!    `ABRIDGE_ASSISTANT_BIN`
//! 2. **Config file** — path via `--config <path>`, or `abridge.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8787"
//! sessions_root = "~/.abridge/sessions"
//! max_connections = 64
//!
//! [assistant]
//! binary = "claude"
//! default_model = "sonnet"
//! vault_root = "~/.claude/projects"
//!
//! [engine]
//! noise_patterns = []          # substrings or regexes dropped from text frames
//! noise_match_mode = "any"     # "any" or "all"
//! wake_timeout_secs = 10
//! reap_idle_secs = 600
//! reap_interval_secs = 60
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::sessions::transform::MatchMode;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and storage settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8787`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Root directory for per-session state (default `~/.abridge/sessions`).
    #[serde(default = "default_sessions_root")]
    pub sessions_root: String,
    /// Maximum concurrent TCP connections (default 64).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl ServerConfig {
    /// Sessions root as a usable path, `~` resolved against the home dir.
    pub fn sessions_root_path(&self) -> PathBuf {
        resolve_home(&self.sessions_root)
    }
}

/// Assistant CLI settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantConfig {
    /// Assistant binary invoked by the supervisor loop (default `claude`).
    #[serde(default = "default_assistant_binary")]
    pub binary: String,
    /// Model selector when a session has none persisted (default `sonnet`).
    #[serde(default = "default_model")]
    pub default_model: String,
    /// The assistant tool's own vault of per-project session logs
    /// (default `~/.claude/projects`).
    #[serde(default = "default_vault_root")]
    pub vault_root: String,
}

impl AssistantConfig {
    /// Vault root as a usable path, `~` resolved against the home dir.
    pub fn vault_root_path(&self) -> PathBuf {
        resolve_home(&self.vault_root)
    }
}

/// Engine tuning: noise rules and background task cadences.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Substrings or regular expressions; matching text frames are dropped.
    #[serde(default)]
    pub noise_patterns: Vec<String>,
    /// `"any"` (default) or `"all"`.
    #[serde(default = "default_noise_match_mode")]
    pub noise_match_mode: String,
    /// Deadline for the FIFO open during wake, in seconds (default 10).
    #[serde(default = "default_wake_timeout_secs")]
    pub wake_timeout_secs: u64,
    /// Idle seconds before the reaper hibernates a session (default 600).
    #[serde(default = "default_reap_idle_secs")]
    pub reap_idle_secs: u64,
    /// Reaper cadence in seconds (default 60).
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

impl EngineSettings {
    pub fn match_mode(&self) -> MatchMode {
        if self.noise_match_mode.eq_ignore_ascii_case("all") {
            MatchMode::All
        } else {
            MatchMode::Any
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8787".to_string()
}
fn default_sessions_root() -> String {
    dirs::home_dir().map_or_else(
        || "~/.abridge/sessions".to_string(),
        |home| home.join(".abridge/sessions").to_string_lossy().into_owned(),
    )
}
fn default_max_connections() -> usize {
    64
}
fn default_assistant_binary() -> String {
    "claude".to_string()
}
fn default_model() -> String {
    "sonnet".to_string()
}
fn default_vault_root() -> String {
    dirs::home_dir().map_or_else(
        || "~/.claude/projects".to_string(),
        |home| home.join(".claude/projects").to_string_lossy().into_owned(),
    )
}
fn default_noise_match_mode() -> String {
    "any".to_string()
}
fn default_wake_timeout_secs() -> u64 {
    10
}
fn default_reap_idle_secs() -> u64 {
    600
}
fn default_reap_interval_secs() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Resolve a configured path: `~` alone or a `~/` prefix maps onto the
/// user's home directory, everything else passes through. Without a home
/// directory the literal value is kept.
fn resolve_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            sessions_root: default_sessions_root(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            binary: default_assistant_binary(),
            default_model: default_model(),
            vault_root: default_vault_root(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            noise_patterns: Vec::new(),
            noise_match_mode: default_noise_match_mode(),
            wake_timeout_secs: default_wake_timeout_secs(),
            reap_idle_secs: default_reap_idle_secs(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `abridge.toml` in the current directory, falling back to
    /// compiled defaults.
    #[allow(clippy::missing_panics_doc)] // startup-only, panic is the contract
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("abridge.toml").exists() {
            let content =
                std::fs::read_to_string("abridge.toml").expect("Failed to read abridge.toml");
            toml::from_str(&content).expect("Failed to parse abridge.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                assistant: AssistantConfig::default(),
                engine: EngineSettings::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("ABRIDGE_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(root) = std::env::var("ABRIDGE_SESSIONS_ROOT") {
            config.server.sessions_root = root;
        }
        if let Ok(bin) = std::env::var("ABRIDGE_ASSISTANT_BIN") {
            config.assistant.binary = bin;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::load(None);
        assert_eq!(config.assistant.binary, "claude");
        assert_eq!(config.assistant.default_model, "sonnet");
        assert_eq!(config.engine.wake_timeout_secs, 10);
        assert_eq!(config.engine.reap_idle_secs, 600);
        assert!(config.engine.noise_patterns.is_empty());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [assistant]
            default_model = "opus"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.assistant.default_model, "opus");
        assert_eq!(parsed.assistant.binary, "claude");
        assert_eq!(parsed.server.listen, "0.0.0.0:8787");
    }

    #[test]
    fn test_resolve_home_prefix() {
        let resolved = resolve_home("~/state/sessions");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(resolved, home.join("state/sessions"));
        } else {
            assert_eq!(resolved, PathBuf::from("~/state/sessions"));
        }
    }

    #[test]
    fn test_resolve_home_passthrough() {
        assert_eq!(resolve_home("/var/lib/abridge"), PathBuf::from("/var/lib/abridge"));
        assert_eq!(resolve_home("relative/dir"), PathBuf::from("relative/dir"));
        // A `~` that is not the home shorthand stays literal.
        assert_eq!(resolve_home("/tmp/~cache"), PathBuf::from("/tmp/~cache"));
    }

    #[test]
    fn test_match_mode_parsing() {
        let mut settings = EngineSettings::default();
        assert_eq!(settings.match_mode(), MatchMode::Any);
        settings.noise_match_mode = "ALL".to_string();
        assert_eq!(settings.match_mode(), MatchMode::All);
        settings.noise_match_mode = "bogus".to_string();
        assert_eq!(settings.match_mode(), MatchMode::Any);
    }
}
