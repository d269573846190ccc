use std::{
    env,
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use tracing::debug;

use crate::error::{PrunError, PrunResult};
use crate::job::SubJob;

/// Runs one sub-job to completion.
///
/// `Ok(Some(code))` is a normal exit, `Ok(None)` a process killed by a
/// signal, `Err` a process that could not be started at all.
pub trait ComputeInvoker: Send + Sync {
    fn run(&self, sub: &SubJob) -> io::Result<Option<i32>>;
}

/// The external geometry engine, `./bin/run` by default.
#[derive(Debug, Clone)]
pub struct ExternalCompute {
    program: PathBuf,
}

impl ExternalCompute {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Fails with [`PrunError::ToolNotFound`] before anything is launched.
    pub fn resolve(program: &Path) -> PrunResult<Self> {
        resolve_executable(program)
            .map(Self::new)
            .ok_or_else(|| PrunError::ToolNotFound {
                tool: "compute binary",
                path: program.to_path_buf(),
            })
    }

    pub fn command_line(&self, sub: &SubJob) -> String {
        command_line(self.program.as_os_str(), sub.argv().iter().map(|a| a.as_os_str()))
    }
}

impl ComputeInvoker for ExternalCompute {
    fn run(&self, sub: &SubJob) -> io::Result<Option<i32>> {
        debug!(index = sub.index, "{}", self.command_line(sub));
        let status = Command::new(&self.program)
            .args(sub.argv())
            .stdin(Stdio::null())
            .status()?;
        Ok(status.code())
    }
}

/// Finds `name` the way a shell would: names with a separator are taken as
/// paths, bare names are looked up on `PATH`.
pub fn resolve_executable(name: &Path) -> Option<PathBuf> {
    if name.components().count() > 1 || name.is_absolute() {
        return is_executable(name).then(|| name.to_path_buf());
    }

    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Human-readable rendering of an argument vector, quoting where a shell would need it.
pub fn command_line<'a>(program: &'a OsStr, args: impl Iterator<Item = &'a OsStr>) -> String {
    std::iter::once(program)
        .chain(args)
        .map(|arg| {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || "'\"$`\\".contains(c))
            {
                format!("'{}'", arg.replace('\'', r"'\''"))
            } else {
                arg.into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
