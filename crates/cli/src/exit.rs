// crates/cli/src/exit.rs
//! Process exit statuses. Cron wrappers branch on these, so they are stable.
//! Usage errors exit with 2 from inside clap.

use std::process::ExitCode;

use darkhorses_core::upstream::UpstreamError;
use darkhorses_core::{ConfigError, ErrorClass, PlanError};
use darkhorses_db::DbError;

pub const SUCCESS: u8 = 0;
pub const FATAL: u8 = 1;
pub const MANUAL_INTERVENTION: u8 = 3;
pub const TRANSIENT: u8 = 4;
pub const ATTENTION_NEEDED: u8 = 5;

/// How a command that did not error ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// A job stopped at a batch boundary; running it again continues it.
    Paused,
    /// Verification reported findings.
    AttentionNeeded,
}

impl Outcome {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => SUCCESS,
            Self::Paused => TRANSIENT,
            Self::AttentionNeeded => ATTENTION_NEEDED,
        }
    }
}

/// Classify an error by the first engine error found in its chain.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<DbError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<PlanError>() {
            return e.class();
        }
        if let Some(e) = cause.downcast_ref::<UpstreamError>() {
            return if e.is_transient() {
                ErrorClass::Transient
            } else {
                ErrorClass::Fatal
            };
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return ErrorClass::Fatal;
        }
    }
    ErrorClass::Fatal
}

pub fn class_code(class: ErrorClass) -> u8 {
    match class {
        ErrorClass::ManualIntervention => MANUAL_INTERVENTION,
        ErrorClass::Transient => TRANSIENT,
        ErrorClass::Fatal => FATAL,
    }
}

pub fn exit_code(result: &anyhow::Result<Outcome>) -> ExitCode {
    let code = match result {
        Ok(outcome) => outcome.code(),
        Err(e) => class_code(classify(e)),
    };
    ExitCode::from(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_db_errors_map_to_their_class() {
        let err = anyhow::Error::new(DbError::UnsafeDrop {
            object: "horses".into(),
            count: 5,
        });
        assert_eq!(class_code(classify(&err)), MANUAL_INTERVENTION);

        let err = anyhow::Error::new(DbError::RateLimited {
            job_id: "colours".into(),
            attempts: 9,
        });
        assert_eq!(class_code(classify(&err)), TRANSIENT);

        let err = anyhow::Error::new(DbError::JobNotFound("nope".into()));
        assert_eq!(class_code(classify(&err)), FATAL);
    }

    #[test]
    fn test_context_does_not_hide_the_class() {
        let result: Result<(), DbError> = Err(DbError::OutOfOrderVersion {
            version: 3,
            latest: 5,
        });
        let err = result.context("applying plan").unwrap_err();
        assert_eq!(classify(&err), ErrorClass::ManualIntervention);
    }

    #[test]
    fn test_plan_and_upstream_errors() {
        let err = anyhow::Error::new(PlanError::DuplicateVersion { version: 18 });
        assert_eq!(class_code(classify(&err)), MANUAL_INTERVENTION);

        let err = anyhow::Error::new(UpstreamError::NotConfigured("base_url".into()));
        assert_eq!(class_code(classify(&err)), FATAL);

        let err = anyhow::Error::new(UpstreamError::RateLimited { retry_after: None });
        assert_eq!(class_code(classify(&err)), TRANSIENT);
    }

    #[test]
    fn test_unknown_errors_are_fatal() {
        assert_eq!(classify(&anyhow::anyhow!("boom")), ErrorClass::Fatal);
    }

    #[test]
    fn test_outcome_codes() {
        assert_eq!(Outcome::Success.code(), 0);
        assert_eq!(Outcome::Paused.code(), 4);
        assert_eq!(Outcome::AttentionNeeded.code(), 5);
    }
}
