//! Crate-wide error taxonomy.
//!
//! Component errors fold into four kinds: the environment is broken, a build
//! failed, a collaborator broke protocol, or plain I/O. Ambiguous bisections
//! and contradicting merge parents are outcomes, not errors, and never show
//! up here.

use crate::bisect::BisectError;
use crate::build_cache::BuildCacheError;
use crate::classifier::ClassifierError;
use crate::compare::CompareError;
use crate::executor::ExecutorError;
use crate::interesting::InterestingError;
use crate::lock::LockError;
use crate::pipeline::PipelineError;
use crate::pool::PoolError;
use crate::reduce::ReduceError;
use crate::signature::SignatureDbError;
use crate::vcs::VcsError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TriageError {
    /// Fatal: the run is aborted.
    #[error("environment error: {0}")]
    Environment(String),
    #[error("build error: {0}")]
    Build(String),
    /// Fatal to the current operation only.
    #[error("protocol error: {message}")]
    Protocol { message: String, raw_output: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TriageError {
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            TriageError::Protocol { raw_output, .. } => Some(raw_output),
            _ => None,
        }
    }
}

impl From<ExecutorError> for TriageError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::Io(io) => TriageError::Io(io),
            other => TriageError::Environment(other.to_string()),
        }
    }
}

impl From<VcsError> for TriageError {
    fn from(e: VcsError) -> Self {
        match e {
            VcsError::Unparsed { raw_output } => TriageError::Protocol {
                message: "unrecognized bisect output".to_string(),
                raw_output,
            },
            VcsError::CommandFailed { command, stderr } => TriageError::Protocol {
                message: format!("`{command}` failed"),
                raw_output: stderr,
            },
            VcsError::UnknownRevision(rev) => TriageError::Environment(format!("unknown revision '{rev}'")),
            VcsError::Io(io) => TriageError::Io(io),
        }
    }
}

impl From<ReduceError> for TriageError {
    fn from(e: ReduceError) -> Self {
        match e {
            ReduceError::Protocol { message, raw_output } => TriageError::Protocol { message, raw_output },
            ReduceError::Io(io) => TriageError::Io(io),
            other => TriageError::Environment(other.to_string()),
        }
    }
}

impl From<BuildCacheError> for TriageError {
    fn from(e: BuildCacheError) -> Self {
        match e {
            BuildCacheError::BuildFailed { .. } => TriageError::Build(e.to_string()),
            BuildCacheError::Io(io) => TriageError::Io(io),
            other => TriageError::Environment(other.to_string()),
        }
    }
}

impl From<LockError> for TriageError {
    fn from(e: LockError) -> Self {
        TriageError::Environment(e.to_string())
    }
}

impl From<SignatureDbError> for TriageError {
    fn from(e: SignatureDbError) -> Self {
        match e {
            SignatureDbError::Io(io) => TriageError::Io(io),
            other => TriageError::Environment(other.to_string()),
        }
    }
}

impl From<ClassifierError> for TriageError {
    fn from(e: ClassifierError) -> Self {
        match e {
            ClassifierError::SignatureDb(db) => db.into(),
        }
    }
}

impl From<CompareError> for TriageError {
    fn from(e: CompareError) -> Self {
        match e {
            CompareError::Executor(e) => e.into(),
            CompareError::Classifier(e) => e.into(),
            CompareError::Pattern(e) => TriageError::Environment(format!("invalid noise pattern: {e}")),
            CompareError::Io(io) => TriageError::Io(io),
        }
    }
}

impl From<InterestingError> for TriageError {
    fn from(e: InterestingError) -> Self {
        match e {
            InterestingError::Executor(e) => e.into(),
            InterestingError::Classifier(e) => e.into(),
            InterestingError::Compare(e) => e.into(),
            other => TriageError::Environment(other.to_string()),
        }
    }
}

impl From<BisectError> for TriageError {
    fn from(e: BisectError) -> Self {
        match e {
            BisectError::Vcs(e) => e.into(),
            BisectError::Lock(e) => e.into(),
            BisectError::Test(e) => e.into(),
            BisectError::Build(e) => e.into(),
            BisectError::Executor(e) => e.into(),
            BisectError::Io(io) => TriageError::Io(io),
            BisectError::Json(e) => TriageError::Environment(e.to_string()),
        }
    }
}

impl From<PoolError> for TriageError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Io(io) => TriageError::Io(io),
            other => TriageError::Environment(other.to_string()),
        }
    }
}

impl From<PipelineError> for TriageError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Executor(e) => e.into(),
            PipelineError::Classifier(e) => e.into(),
            PipelineError::Compare(e) => e.into(),
            PipelineError::Reduce(e) => e.into(),
            PipelineError::Generator { message, raw_output } => TriageError::Protocol { message, raw_output },
            PipelineError::Io(io) => TriageError::Io(io),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_binary_is_environmental() {
        let err: TriageError = ExecutorError::MissingBinary(PathBuf::from("js")).into();
        assert!(matches!(err, TriageError::Environment(_)));
    }

    #[test]
    fn unparsed_bisect_output_keeps_raw_text() {
        let err: TriageError = BisectError::Vcs(VcsError::Unparsed {
            raw_output: "fatal: bad object".to_string(),
        })
        .into();
        assert_eq!(err.raw_output(), Some("fatal: bad object"));
    }

    #[test]
    fn build_failures_are_their_own_kind() {
        let err: TriageError = BuildCacheError::BuildFailed {
            configuration: "debug".to_string(),
            revision: "abc".to_string(),
            reason: "link error".to_string(),
            cached: true,
        }
        .into();
        assert!(matches!(err, TriageError::Build(ref msg) if msg.contains("link error")));
    }
}
