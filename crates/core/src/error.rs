// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// How an operator (or cron wrapper) should react to a failure.
///
/// Every error surfaced by the engine maps onto exactly one class, and the
/// CLI turns the class into its exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Ambiguous or unsafe state; a human has to look before re-running.
    ManualIntervention,
    /// Rate limits, timeouts, lost lease races. Re-running later is safe.
    Transient,
    /// Everything else (I/O, SQL, malformed input).
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualIntervention => "manual_intervention_required",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

/// Errors that can occur when loading or validating a plan file
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Plan file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("IO error reading plan {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed plan {path}: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Duplicate migration version {version} in plan")]
    DuplicateVersion { version: i64 },

    #[error("Migration versions must strictly increase: {previous} is followed by {version}")]
    VersionOrder { previous: i64, version: i64 },

    #[error("Migration {version} has no steps")]
    EmptyMigration { version: i64 },

    #[error("Invalid identifier {ident:?}")]
    InvalidIdentifier { ident: String },

    #[error("Invalid plan entry: {0}")]
    Invalid(String),
}

impl PlanError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            // Two definitions for one version is the ledger-drift situation
            // the operator must reconcile by hand.
            Self::DuplicateVersion { .. } | Self::VersionOrder { .. } => {
                ErrorClass::ManualIntervention
            }
            _ => ErrorClass::Fatal,
        }
    }
}

/// Errors that can occur while assembling configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config {path}: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("Failed to determine cache directory")]
    NoCacheDir,
}
