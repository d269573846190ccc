use std::time::Duration;

use crate::job::SubJob;

pub enum SubJobTask {
    Terminate,
    Task(SubJob),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubJobOutcome {
    Succeeded,
    /// Non-zero exit, or `None` when killed by a signal.
    Exited(Option<i32>),
    SpawnFailed(String),
    /// Exited cleanly but its output file is not there.
    MissingOutput,
}

#[derive(Debug, Clone)]
pub struct SubJobReport {
    pub index: usize,
    pub outcome: SubJobOutcome,
    pub elapsed: Duration,
}

impl SubJobReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == SubJobOutcome::Succeeded
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            SubJobOutcome::Exited(code) => code,
            _ => None,
        }
    }
}

pub enum SubJobResponse {
    Terminated,
    Report(SubJobReport),
}
