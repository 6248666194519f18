use crate::config::ClassifierSettings;
use crate::executor::ExecutionResult;
use crate::severity::Severity;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// A short finding, tagged with the detector that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub detector: String,
    pub message: String,
}

impl Issue {
    pub fn new(detector: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            detector: detector.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.detector, self.message)
    }
}

/// One detector firing: the issue it records and the minimum severity it implies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub issue: Issue,
    pub severity: Severity,
}

/// A static pattern check over a run's transcript.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, result: &ExecutionResult) -> Option<Finding>;
}

static MALLOC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"malloc: \*\*\* error|double free or corruption|free\(\): invalid|malloc\(\): (memory )?corruption")
        .expect("static malloc regex")
});
static OOM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)out of memory|\[unhandlable oom\]|ReportOverRecursed|failed to allocate|Assertion failure: \[unhandlable oom\]")
        .expect("static oom regex")
});
static ASSERTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Assertion failure: |###!!! ASSERTION|Hit MOZ_CRASH\(|MOZ_CRASH\(|\bassertion .* failed")
        .expect("static assertion regex")
});

/// Allocator complaints printed by libc or the system malloc.
#[derive(Debug, Default, Clone, Copy)]
pub struct MallocErrorDetector;

impl Detector for MallocErrorDetector {
    fn name(&self) -> &'static str {
        "malloc"
    }

    fn detect(&self, result: &ExecutionResult) -> Option<Finding> {
        let line = result.stderr.iter().find(|l| MALLOC_RE.is_match(l))?;
        Some(Finding {
            issue: Issue::new(self.name(), format!("malloc error: {}", line.trim())),
            severity: Severity::NewAssertOrCrash,
        })
    }
}

/// Valgrind complaints, recognized by the child's `==PID==` line prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct ValgrindDetector;

impl ValgrindDetector {
    fn complaint<'a>(pid: u32, line: &'a str) -> Option<&'a str> {
        let prefix = format!("=={pid}==");
        let rest = line.strip_prefix(&prefix)?.trim();
        let noisy = rest.starts_with("Invalid ")
            || rest.starts_with("Conditional jump")
            || rest.starts_with("Use of uninitialised")
            || rest.starts_with("Syscall param")
            || rest.starts_with("Mismatched free")
            || (rest.starts_with("ERROR SUMMARY:") && !rest.starts_with("ERROR SUMMARY: 0 errors"));
        noisy.then_some(rest)
    }
}

impl Detector for ValgrindDetector {
    fn name(&self) -> &'static str {
        "valgrind"
    }

    fn detect(&self, result: &ExecutionResult) -> Option<Finding> {
        let complaint = result
            .stderr
            .iter()
            .find_map(|l| Self::complaint(result.pid, l))?;
        Some(Finding {
            issue: Issue::new(self.name(), format!("valgrind reported: {complaint}")),
            severity: Severity::ValgrindAmiss,
        })
    }
}

/// Out-of-memory phrases. OOM is not a bug, so the finding stays at `Fine`,
/// but it taints the rest of the run's output.
#[derive(Debug, Default, Clone, Copy)]
pub struct OomDetector;

impl OomDetector {
    pub fn is_oom(result: &ExecutionResult) -> bool {
        result.stderr.iter().any(|l| OOM_RE.is_match(l))
    }
}

impl Detector for OomDetector {
    fn name(&self) -> &'static str {
        "oom"
    }

    fn detect(&self, result: &ExecutionResult) -> Option<Finding> {
        Self::is_oom(result).then(|| Finding {
            issue: Issue::new(self.name(), "out of memory"),
            severity: Severity::Fine,
        })
    }
}

/// Assertion failures that are not on the known-assertion allowlist.
#[derive(Debug, Default, Clone)]
pub struct AssertionDetector {
    known: Vec<String>,
}

impl AssertionDetector {
    pub fn new(known: Vec<String>) -> Self {
        Self { known }
    }

    fn is_known(&self, line: &str) -> bool {
        self.known.iter().any(|k| line.contains(k.as_str()))
    }

    /// Number of assertion lines (known or not) on stderr.
    pub fn count(result: &ExecutionResult) -> usize {
        result
            .stderr
            .iter()
            .filter(|l| ASSERTION_RE.is_match(l))
            .count()
    }
}

impl Detector for AssertionDetector {
    fn name(&self) -> &'static str {
        "assertion"
    }

    fn detect(&self, result: &ExecutionResult) -> Option<Finding> {
        let line = result
            .stderr
            .iter()
            .find(|l| ASSERTION_RE.is_match(l) && !self.is_known(l))?;
        Some(Finding {
            issue: Issue::new(self.name(), format!("new assertion: {}", line.trim())),
            severity: Severity::NewAssertOrCrash,
        })
    }
}

/// The standard detector set, in reporting order.
pub fn standard_detectors(settings: &ClassifierSettings) -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(MallocErrorDetector),
        Box::new(ValgrindDetector),
        Box::new(OomDetector),
        Box::new(AssertionDetector::new(settings.known_assertions.clone())),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn with_stderr(pid: u32, lines: &[&str]) -> ExecutionResult {
        ExecutionResult {
            stdout: Vec::new(),
            stderr: lines.iter().map(|s| s.to_string()).collect(),
            exit_status: 0,
            elapsed: Duration::from_millis(1),
            started: std::time::SystemTime::UNIX_EPOCH,
            pid,
            timed_out: false,
        }
    }

    #[test]
    fn malloc_detector_fires_on_double_free() {
        let result = with_stderr(1, &["*** Error in `js': double free or corruption (fasttop)"]);
        let finding = MallocErrorDetector.detect(&result).unwrap();
        assert_eq!(finding.severity, Severity::NewAssertOrCrash);
        assert_eq!(finding.issue.detector, "malloc");
    }

    #[test]
    fn valgrind_detector_only_trusts_own_pid() {
        let ours = with_stderr(123, &["==123== Invalid read of size 4"]);
        let finding = ValgrindDetector.detect(&ours).unwrap();
        assert_eq!(finding.severity, Severity::ValgrindAmiss);

        let foreign = with_stderr(123, &["==999== Invalid read of size 4"]);
        assert!(ValgrindDetector.detect(&foreign).is_none());

        let clean = with_stderr(123, &["==123== ERROR SUMMARY: 0 errors from 0 contexts"]);
        assert!(ValgrindDetector.detect(&clean).is_none());
    }

    #[test]
    fn oom_detector_is_fine_but_flags() {
        let result = with_stderr(1, &["js: out of memory"]);
        let finding = OomDetector.detect(&result).unwrap();
        assert_eq!(finding.severity, Severity::Fine);
        assert!(OomDetector::is_oom(&result));
    }

    #[test]
    fn assertion_detector_skips_known_assertions() {
        let detector = AssertionDetector::new(vec!["!cx->isExceptionPending()".to_string()]);
        let known = with_stderr(1, &["Assertion failure: !cx->isExceptionPending(), at vm/Foo.cpp:1"]);
        assert!(detector.detect(&known).is_none());

        let fresh = with_stderr(1, &["Assertion failure: ptr != nullptr, at jit/Bar.cpp:9"]);
        let finding = detector.detect(&fresh).unwrap();
        assert!(finding.issue.message.contains("ptr != nullptr"));
        assert_eq!(AssertionDetector::count(&fresh), 1);
    }
}
