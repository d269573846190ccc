use std::path::PathBuf;

use thiserror::Error;

pub type PrunResult<T> = Result<T, PrunError>;

/// Everything that can stop a launch.
#[derive(Debug, Error)]
pub enum PrunError {
    /// Wrong arity, a missing directive argument or a malformed octree label.
    #[error("usage error: {0}")]
    Usage(String),

    /// The resolution slot was not a positive base-10 integer.
    #[error("invalid resolution {value:?}: {reason}")]
    Parse { value: String, reason: String },

    /// A collaborator executable could not be resolved before launch.
    #[error("{tool} not found: {}", path.display())]
    ToolNotFound { tool: &'static str, path: PathBuf },

    /// At least one sub-job exited non-zero, failed to spawn or left no output.
    #[error("sub-jobs {indices:?} failed")]
    SubJobFailed {
        indices: Vec<usize>,
        /// Exit code of the lowest failing index, when it exited with one.
        code: Option<i32>,
    },

    #[error("mesh merge failed: {message}")]
    Aggregation { message: String, code: Option<i32> },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PrunError {
    pub fn aggregation(message: impl Into<String>) -> Self {
        Self::Aggregation {
            message: message.into(),
            code: None,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Usage and parse errors are usage failures (1); a missing tool follows
    /// the shell's 127; subprocess failures propagate their own status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) | Self::Parse { .. } | Self::Io { .. } => 1,
            Self::ToolNotFound { .. } => 127,
            Self::SubJobFailed { code, .. } | Self::Aggregation { code, .. } => {
                code.filter(|c| *c != 0).unwrap_or(1)
            }
        }
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_) | Self::Parse { .. })
    }
}
