use crate::executor::ExecutionResult;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

/// File timestamps come from a coarser clock than `SystemTime::now`.
const MTIME_SLACK: Duration = Duration::from_secs(1);

static FRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*#\d+\s+(0x[0-9a-fA-F]+\s+)?(in\s+)?\S").expect("static frame regex")
});

/// Obtains a backtrace for a crashed (or trace-printing) run.
///
/// One implementation exists per platform mechanism; the pipeline selects
/// one at startup with [`platform_locator`] and never branches on platform
/// afterwards.
pub trait CrashLogLocator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the backtrace lines, or `None` when nothing could be found.
    fn locate(&self, result: &ExecutionResult) -> Option<Vec<String>>;
}

/// Finds nothing. Used when crash logs are not wanted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLocator;

impl CrashLogLocator for NullLocator {
    fn name(&self) -> &'static str {
        "null"
    }

    fn locate(&self, _result: &ExecutionResult) -> Option<Vec<String>> {
        None
    }
}

/// Harvests `#N` frames that sanitizers and the engine's own debug stack
/// printer emit on stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrBacktraceLocator;

impl CrashLogLocator for StderrBacktraceLocator {
    fn name(&self) -> &'static str {
        "stderr"
    }

    fn locate(&self, result: &ExecutionResult) -> Option<Vec<String>> {
        let frames = stack_frames(&result.stderr);
        (!frames.is_empty()).then_some(frames)
    }
}

/// Looks for a core file left behind by the crashed pid.
///
/// Only reports the core's location; symbolizing it is a debugger's job.
#[derive(Debug, Clone)]
pub struct CoreDumpLocator {
    core_dir: PathBuf,
    fallback: StderrBacktraceLocator,
}

impl CoreDumpLocator {
    pub fn new(core_dir: impl Into<PathBuf>) -> Self {
        Self {
            core_dir: core_dir.into(),
            fallback: StderrBacktraceLocator,
        }
    }

    /// A core written by this run; older dumps belong to someone else.
    fn core_path(&self, pid: u32, started: SystemTime) -> Option<PathBuf> {
        let not_before = started.checked_sub(MTIME_SLACK).unwrap_or(started);
        [format!("core.{pid}"), "core".to_string()]
            .into_iter()
            .map(|name| self.core_dir.join(name))
            .find(|p| {
                fs::metadata(p)
                    .and_then(|meta| meta.modified())
                    .is_ok_and(|modified| modified >= not_before)
            })
    }
}

impl CrashLogLocator for CoreDumpLocator {
    fn name(&self) -> &'static str {
        "core"
    }

    fn locate(&self, result: &ExecutionResult) -> Option<Vec<String>> {
        if let Some(frames) = self.fallback.locate(result) {
            return Some(frames);
        }
        if result.signal().is_none() {
            return None;
        }
        self.core_path(result.pid, result.started)
            .map(|core| vec![format!("core dump at {}", core.display())])
    }
}

/// True when any stderr line looks like a stack frame.
pub fn has_stack_markers(stderr: &[String]) -> bool {
    stderr.iter().any(|line| FRAME_RE.is_match(line))
}

pub fn stack_frames(stderr: &[String]) -> Vec<String> {
    stderr
        .iter()
        .filter(|line| FRAME_RE.is_match(line))
        .map(|line| line.trim().to_string())
        .collect()
}

/// Picks the locator for the running platform.
pub fn platform_locator(working_dir: &Path) -> Box<dyn CrashLogLocator> {
    if cfg!(target_os = "linux") {
        Box::new(CoreDumpLocator::new(working_dir))
    } else {
        Box::new(StderrBacktraceLocator)
    }
}
