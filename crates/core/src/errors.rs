//! Error types for the automerger core library.
//!
//! Each subsystem has its own error type derived with `thiserror`;
//! [`PropagationError`] wraps the others for the engine. Merge conflicts are
//! not errors: they are reported as
//! [`MergeOutcome::Conflict`](crate::merge::MergeOutcome::Conflict) values.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from service configuration loading and automerger config parsing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// A line of the automerger document could not be parsed.
    #[error("malformed automerger config at line {line}: {detail}")]
    MalformedLine { line: usize, detail: String },

    /// An edge key is not of the form `source:destination`.
    #[error("invalid edge key '{key}': {detail}")]
    InvalidEdgeKey { key: String, detail: String },

    /// A skip-marker pattern is not a valid regular expression.
    #[error("invalid marker pattern '{pattern}': {detail}")]
    InvalidPattern { pattern: String, detail: String },

    /// Generic I/O error reading a config file.
    #[error("configuration I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Object store errors
// ---------------------------------------------------------------------------

/// Errors from the git2-backed object store.
#[derive(Debug, Error)]
pub enum VcsError {
    /// The repository for a project does not exist.
    #[error("git repository not found for project '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, change ref, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// A compare-and-swap ref update lost a race with another writer.
    #[error("ref '{refname}' was modified concurrently")]
    ConcurrentModification { refname: String },

    /// An object had an unexpected type or shape.
    #[error("invalid git object {oid}: {detail}")]
    InvalidObject { oid: String, detail: String },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Review system errors
// ---------------------------------------------------------------------------

/// Errors from the review system API.
#[derive(Debug, Error)]
pub enum ReviewError {
    /// HTTP-level transport error (network, TLS, etc.).
    #[error("review HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The API returned a non-success status code.
    #[error("review API error (HTTP {status}): {body}")]
    ApiError { status: u16, body: String },

    /// Credentials are missing or were rejected.
    #[error("review authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The requested change or resource does not exist.
    #[error("review resource not found: {0}")]
    NotFound(String),

    /// The request conflicts with the current state of the resource.
    #[error("review request conflict: {0}")]
    Conflict(String),

    /// The review system cannot be reached or is overloaded.
    #[error("review system unavailable: {0}")]
    Unavailable(String),

    /// JSON deserialization failure.
    #[error("review response parse error: {0}")]
    ParseError(String),
}

impl ReviewError {
    /// `true` when the failure says nothing about the request itself and the
    /// whole event should be retried later.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::HttpError(e) => e.is_connect() || e.is_timeout(),
            Self::ApiError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Propagation errors
// ---------------------------------------------------------------------------

/// Errors from the downstream propagation engine.
#[derive(Debug, Error)]
pub enum PropagationError {
    /// Ref updates kept racing with concurrent writers until retries ran out.
    #[error("branch '{branch}' kept moving, gave up after {attempts} attempts")]
    ConcurrentModification { branch: String, attempts: u32 },

    /// The review or version-control store could not be reached.
    #[error("collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    /// A review API call failed for a request-specific reason.
    #[error("propagation review error: {0}")]
    Review(ReviewError),

    /// An object store operation failed.
    #[error("propagation git error: {0}")]
    Vcs(#[from] VcsError),

    /// The automerger configuration could not be used at all.
    #[error("propagation config error: {0}")]
    Config(#[from] ConfigError),
}

impl From<ReviewError> for PropagationError {
    fn from(err: ReviewError) -> Self {
        if err.is_unavailable() {
            PropagationError::CollaboratorUnavailable(err.to_string())
        } else {
            PropagationError::Review(err)
        }
    }
}

impl PropagationError {
    /// `true` if redelivering the triggering event may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. } | Self::CollaboratorUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = VcsError::RefNotFound("refs/heads/ds_one".into());
        assert_eq!(err.to_string(), "git ref not found: refs/heads/ds_one");

        let err = ConfigError::InvalidEdgeKey {
            key: "master".into(),
            detail: "missing ':'".into(),
        };
        assert!(err.to_string().contains("master"));

        let err = PropagationError::ConcurrentModification {
            branch: "ds_one".into(),
            attempts: 3,
        };
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_unavailable_review_errors_become_collaborator_unavailable() {
        let err: PropagationError = ReviewError::Unavailable("connection refused".into()).into();
        assert!(matches!(err, PropagationError::CollaboratorUnavailable(_)));
        assert!(err.is_transient());

        let err: PropagationError = ReviewError::ApiError {
            status: 503,
            body: "busy".into(),
        }
        .into();
        assert!(matches!(err, PropagationError::CollaboratorUnavailable(_)));

        let err: PropagationError = ReviewError::NotFound("change 7".into()).into();
        assert!(matches!(err, PropagationError::Review(_)));
        assert!(!err.is_transient());
    }
}
