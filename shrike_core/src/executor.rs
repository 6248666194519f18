use crate::config::ExecutorSettings;
use crate::logs::{self, LogPaths};
use log::{debug, warn};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("binary {0:?} does not exist")]
    MissingBinary(PathBuf),
    #[error("log directory {0:?} does not exist")]
    MissingLogDir(PathBuf),
    #[error("failed to spawn {binary:?}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("error waiting for child {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("executor I/O error: {0}")]
    Io(#[from] io::Error),
}

/// OS resource caps applied to the child before `exec`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub address_space_bytes: Option<u64>,
    pub core_file_bytes: Option<u64>,
}

impl From<&ExecutorSettings> for ResourceLimits {
    fn from(settings: &ExecutorSettings) -> Self {
        Self {
            address_space_bytes: settings.address_space_bytes,
            core_file_bytes: settings.core_file_bytes,
        }
    }
}

/// The transcript of one process run.
///
/// A crash is a normal, observed result: `exit_status` is negative when the
/// child was terminated by a signal (`-signal`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_status: i32,
    pub elapsed: Duration,
    /// Wall-clock time just before the spawn.
    pub started: SystemTime,
    pub pid: u32,
    pub timed_out: bool,
}

impl ExecutionResult {
    /// Terminating signal, if the child did not exit on its own.
    pub fn signal(&self) -> Option<i32> {
        (self.exit_status < 0).then_some(-self.exit_status)
    }

    pub fn crashed(&self) -> bool {
        self.exit_status < 0 && !self.timed_out
    }
}

/// Runs one binary with arguments under a timeout.
///
/// Implementations must write stdout and stderr to the `-out`/`-err` files of
/// `log` and must not return an error for a crashing child.
pub trait Executor: Send + Sync {
    fn run(
        &self,
        binary: &Path,
        args: &[String],
        timeout: Duration,
        log: &LogPaths,
    ) -> Result<ExecutionResult, ExecutorError>;
}

/// Runs the target as a real OS process.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    limits: ResourceLimits,
    working_dir: Option<PathBuf>,
}

impl ProcessExecutor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn wait_with_timeout(
        &self,
        child: &mut Child,
        timeout: Duration,
    ) -> Result<(ExitStatus, bool), ExecutorError> {
        let start_time = Instant::now();
        let pid = child.id();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok((status, false)),
                Ok(None) => {
                    if start_time.elapsed() > timeout {
                        debug!("pid {pid} timed out after {timeout:?}, killing");
                        if let Err(e) = child.kill() {
                            // The child may have exited between try_wait and kill.
                            warn!("failed to kill timed-out pid {pid}: {e}");
                        }
                        let status = child
                            .wait()
                            .map_err(|source| ExecutorError::Wait { pid, source })?;
                        return Ok((status, true));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(source) => return Err(ExecutorError::Wait { pid, source }),
            }
        }
    }
}

impl Executor for ProcessExecutor {
    fn run(
        &self,
        binary: &Path,
        args: &[String],
        timeout: Duration,
        log: &LogPaths,
    ) -> Result<ExecutionResult, ExecutorError> {
        if let Some(parent) = log.prefix().parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(ExecutorError::MissingLogDir(parent.to_path_buf()));
            }
        }

        let stdout_file = File::create(log.out())?;
        let stderr_file = File::create(log.err())?;

        let mut cmd = Command::new(binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file));
        if let Some(cwd) = &self.working_dir {
            cmd.current_dir(cwd);
        }
        apply_resource_limits(&mut cmd, self.limits);

        let started = SystemTime::now();
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ExecutorError::MissingBinary(binary.to_path_buf())
            } else {
                ExecutorError::Spawn {
                    binary: binary.to_path_buf(),
                    source,
                }
            }
        })?;
        let pid = child.id();

        let (status, timed_out) = self.wait_with_timeout(&mut child, timeout)?;
        let elapsed = start.elapsed();

        Ok(ExecutionResult {
            stdout: logs::read_lines(&log.out())?,
            stderr: logs::read_lines(&log.err())?,
            exit_status: encode_exit_status(status),
            elapsed,
            started,
            pid,
            timed_out,
        })
    }
}

/// Exit code as-is; termination by signal `s` becomes `-s`.
pub fn encode_exit_status(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

#[cfg(unix)]
fn apply_resource_limits(cmd: &mut Command, limits: ResourceLimits) {
    use std::os::unix::process::CommandExt;

    if limits == ResourceLimits::default() {
        return;
    }
    // SAFETY: the hook only calls the async-signal-safe `setrlimit`.
    unsafe {
        cmd.pre_exec(move || {
            if let Some(bytes) = limits.address_space_bytes {
                check_rlimit(libc::setrlimit(libc::RLIMIT_AS, &rlimit(bytes)))?;
            }
            if let Some(bytes) = limits.core_file_bytes {
                check_rlimit(libc::setrlimit(libc::RLIMIT_CORE, &rlimit(bytes)))?;
            }
            Ok(())
        });
    }
}

#[cfg(unix)]
fn rlimit(bytes: u64) -> libc::rlimit {
    libc::rlimit {
        rlim_cur: bytes as libc::rlim_t,
        rlim_max: bytes as libc::rlim_t,
    }
}

#[cfg(unix)]
fn check_rlimit(rc: libc::c_int) -> io::Result<()> {
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_resource_limits(_cmd: &mut Command, _limits: ResourceLimits) {}
