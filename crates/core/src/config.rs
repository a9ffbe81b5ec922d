//! TOML-based service configuration for the automerger.
//!
//! Secrets (the review system password, the event endpoint secret) are never
//! written into the file. They are stored as `_env` fields naming an
//! environment variable and resolved at runtime via
//! [`ServiceConfig::resolve_env_vars`].
//!
//! This is the configuration of the service itself. Which branches propagate
//! where lives in the automerger document fetched from the review system, see
//! [`crate::merge_config`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level service configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Daemon / listener settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Review system connection settings.
    pub review: ReviewConfig,

    /// Identity used for machine-authored commits.
    #[serde(default)]
    pub git: GitConfig,

    /// Propagation tuning.
    #[serde(default)]
    pub propagation: PropagationConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Address the event listener binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Environment variable holding the shared secret used to sign events.
    #[serde(default)]
    pub event_secret_env: Option<String>,

    /// Directory holding one mirror repository per project.
    #[serde(default = "default_mirror_dir")]
    pub mirror_dir: PathBuf,

    /// Maximum number of events buffered before the listener pushes back.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Deliveries of an event that keeps failing transiently, the first
    /// included, before it is dropped.
    #[serde(default = "default_redelivery_attempts")]
    pub redelivery_attempts: u32,

    /// Delay before the first redelivery; doubles with every further one.
    #[serde(default = "default_redelivery_backoff_ms")]
    pub redelivery_backoff_ms: u64,

    /// Resolved event secret (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub event_secret: Option<String>,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_listen() -> String {
    "127.0.0.1:8090".into()
}
fn default_mirror_dir() -> PathBuf {
    PathBuf::from("/var/lib/automerger/git")
}
fn default_queue_depth() -> usize {
    256
}
fn default_redelivery_attempts() -> u32 {
    5
}
fn default_redelivery_backoff_ms() -> u64 {
    2000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            listen: default_listen(),
            event_secret_env: None,
            mirror_dir: default_mirror_dir(),
            queue_depth: default_queue_depth(),
            redelivery_attempts: default_redelivery_attempts(),
            redelivery_backoff_ms: default_redelivery_backoff_ms(),
            event_secret: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Review system
// ---------------------------------------------------------------------------

/// Connection settings for the review system REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Base URL of the review server (e.g. `https://review.example.com`).
    pub url: String,

    /// Account the automerger acts as.
    pub username: String,

    /// Environment variable holding the HTTP password for `username`.
    pub password_env: String,

    /// Project whose config ref holds the automerger document.
    #[serde(default = "default_config_project")]
    pub config_project: String,

    /// Ref the automerger document is read from.
    #[serde(default = "default_config_ref")]
    pub config_ref: String,

    /// File name of the automerger document inside `config_ref`.
    #[serde(default = "default_config_file")]
    pub config_file: String,

    /// Fetch heads and change refs from the review server into the local
    /// mirrors before each propagation.
    #[serde(default = "default_true")]
    pub fetch_before_merge: bool,

    /// Resolved password (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub password: Option<String>,
}

fn default_config_project() -> String {
    "All-Projects".into()
}
fn default_config_ref() -> String {
    "refs/meta/config".into()
}
fn default_config_file() -> String {
    "automerger.config".into()
}
fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Git identity
// ---------------------------------------------------------------------------

/// Author/committer identity for merge commits written by the automerger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_author_name")]
    pub author_name: String,

    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_author_name() -> String {
    "Automerger".into()
}
fn default_author_email() -> String {
    "automerger@localhost".into()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

// ---------------------------------------------------------------------------
// Propagation
// ---------------------------------------------------------------------------

/// Tuning knobs for downstream propagation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// How many times a ref update is retried when it loses a race.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base backoff between retries, multiplied by the attempt number.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Labels whose values are mirrored from a source onto its downstreams.
    #[serde(default = "default_mirror_labels")]
    pub mirror_labels: Vec<String>,

    /// Label used to block a source change when a merge conflict is found.
    #[serde(default = "default_conflict_label")]
    pub conflict_label: String,
}

fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    100
}
fn default_mirror_labels() -> Vec<String> {
    vec!["Code-Review".into()]
}
fn default_conflict_label() -> String {
    "Code-Review".into()
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            mirror_labels: default_mirror_labels(),
            conflict_label: default_conflict_label(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl ServiceConfig {
    /// Load a [`ServiceConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: ServiceConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// A missing review password is an error: every operation needs it. A
    /// missing event secret only logs a warning and leaves events unsigned.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        self.review.password =
            resolve_optional_env(&self.review.password_env, "review.password_env");
        if self.review.password.is_none() {
            return Err(ConfigError::EnvVarMissing {
                var: self.review.password_env.clone(),
                field: "review.password_env".into(),
            });
        }

        if let Some(ref env_name) = self.daemon.event_secret_env {
            self.daemon.event_secret = resolve_optional_env(env_name, "daemon.event_secret_env");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.review.url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "review.url".into(),
                detail: "review URL must not be empty".into(),
            });
        }
        if !self.review.url.starts_with("http://") && !self.review.url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: "review.url".into(),
                detail: "review URL must start with http:// or https://".into(),
            });
        }
        if self.review.username.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "review.username".into(),
                detail: "review username must not be empty".into(),
            });
        }
        if self.propagation.retry_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "propagation.retry_attempts".into(),
                detail: "at least one attempt is required".into(),
            });
        }
        if self.propagation.conflict_label.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "propagation.conflict_label".into(),
                detail: "conflict label must not be empty".into(),
            });
        }
        if self.daemon.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidValue {
                field: "daemon.listen".into(),
                detail: format!("'{}' is not a socket address", self.daemon.listen),
            });
        }
        if self.daemon.queue_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.queue_depth".into(),
                detail: "queue depth must be > 0".into(),
            });
        }
        if self.daemon.redelivery_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.redelivery_attempts".into(),
                detail: "events must be delivered at least once".into(),
            });
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[daemon]
log_level = "debug"
listen = "0.0.0.0:9000"
event_secret_env = "AUTOMERGER_EVENT_SECRET"
mirror_dir = "/tmp/automerger"
redelivery_attempts = 3

[review]
url = "https://review.example.com"
username = "automerger"
password_env = "GERRIT_HTTP_PASSWORD"
config_project = "platform/config"

[git]
author_name = "Merge Bot"
author_email = "merge-bot@example.com"

[propagation]
retry_attempts = 5
retry_backoff_ms = 20
mirror_labels = ["Code-Review", "Verified"]
conflict_label = "Code-Review"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: ServiceConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.daemon.listen, "0.0.0.0:9000");
        assert_eq!(config.review.config_project, "platform/config");
        assert_eq!(config.review.config_ref, "refs/meta/config");
        assert_eq!(config.git.author_name, "Merge Bot");
        assert_eq!(config.propagation.retry_attempts, 5);
        assert_eq!(config.daemon.redelivery_attempts, 3);
        assert_eq!(config.propagation.mirror_labels, vec!["Code-Review", "Verified"]);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("automerger.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = ServiceConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = ServiceConfig::load_from_file("/nonexistent/automerger.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let mut config: ServiceConfig = toml::from_str(sample_toml()).unwrap();
        config.review.url = "review.example.com".into();
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "review.url"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_listen_address() {
        let mut config: ServiceConfig = toml::from_str(sample_toml()).unwrap();
        config.daemon.listen = "localhost".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "daemon.listen"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config: ServiceConfig = toml::from_str(sample_toml()).unwrap();
        config.propagation.retry_attempts = 0;
        assert!(config.validate().is_err());

        let mut config: ServiceConfig = toml::from_str(sample_toml()).unwrap();
        config.daemon.redelivery_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "daemon.redelivery_attempts"
        ));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("TEST_AM_REVIEW_PW", "s3cret");
        std::env::set_var("TEST_AM_EVENT_SECRET", "hmac-key");

        let toml_str = r#"
[daemon]
event_secret_env = "TEST_AM_EVENT_SECRET"
[review]
url = "https://review.example.com"
username = "automerger"
password_env = "TEST_AM_REVIEW_PW"
"#;
        let mut config: ServiceConfig = toml::from_str(toml_str).unwrap();
        config.resolve_env_vars().unwrap();

        assert_eq!(config.review.password.as_deref(), Some("s3cret"));
        assert_eq!(config.daemon.event_secret.as_deref(), Some("hmac-key"));

        std::env::remove_var("TEST_AM_REVIEW_PW");
        std::env::remove_var("TEST_AM_EVENT_SECRET");
    }

    #[test]
    fn test_missing_password_is_an_error() {
        let toml_str = r#"
[review]
url = "https://review.example.com"
username = "automerger"
password_env = "TEST_AM_DEFINITELY_UNSET"
"#;
        let mut config: ServiceConfig = toml::from_str(toml_str).unwrap();
        let result = config.resolve_env_vars();
        assert!(matches!(result, Err(ConfigError::EnvVarMissing { .. })));
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[review]
url = "https://review.example.com"
username = "automerger"
password_env = "PW"
"#;
        let config: ServiceConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.listen, "127.0.0.1:8090");
        assert_eq!(config.daemon.redelivery_attempts, 5);
        assert_eq!(config.daemon.redelivery_backoff_ms, 2000);
        assert_eq!(config.review.config_project, "All-Projects");
        assert_eq!(config.review.config_file, "automerger.config");
        assert!(config.review.fetch_before_merge);
        assert_eq!(config.propagation.retry_attempts, 3);
        assert_eq!(config.propagation.mirror_labels, vec!["Code-Review"]);
        assert_eq!(config.propagation.conflict_label, "Code-Review");
    }
}
