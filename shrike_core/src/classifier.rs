use crate::config::ClassifierSettings;
use crate::crash_log::{self, CrashLogLocator};
use crate::detectors::{self, AssertionDetector, Detector, Issue, OomDetector};
use crate::executor::ExecutionResult;
use crate::severity::Severity;
use crate::signature::{CrashInfo, SignatureDb, SignatureDbError, SignatureMatch};
use crate::vcs::RevisionLabel;
use log::debug;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("signature lookup failed: {0}")]
    SignatureDb(#[from] SignatureDbError),
}

/// How the process exit should be read, per the engine's exit-code conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitVerdict {
    Clean,
    /// Exit 1 or 2 with a usage message: the binary rejected a flag.
    UnsupportedFlag(i32),
    /// An engine-internal controlled error.
    ControlledError(i32),
    Signalled(i32),
    TimedOut,
    /// The caller-specified watch exit code.
    Watched(i32),
    /// A nonzero code while a different watch code was requested.
    Unwatched(i32),
    Bad(i32),
}

impl ExitVerdict {
    /// The bisection label this exit implies on its own.
    pub fn label(self) -> RevisionLabel {
        match self {
            ExitVerdict::Clean
            | ExitVerdict::UnsupportedFlag(_)
            | ExitVerdict::ControlledError(_)
            | ExitVerdict::Unwatched(_) => RevisionLabel::Good,
            ExitVerdict::Signalled(_) | ExitVerdict::Watched(_) | ExitVerdict::Bad(_) => {
                RevisionLabel::Bad
            }
            ExitVerdict::TimedOut => RevisionLabel::Skip,
        }
    }

    pub fn is_abnormal(self) -> bool {
        !matches!(self, ExitVerdict::Clean)
    }
}

pub fn interpret_exit(result: &ExecutionResult, settings: &ClassifierSettings) -> ExitVerdict {
    let code = result.exit_status;
    if result.timed_out {
        return ExitVerdict::TimedOut;
    }
    if code == 0 {
        return ExitVerdict::Clean;
    }
    if code < 0 {
        return ExitVerdict::Signalled(-code);
    }
    if settings.watch_exit_code == Some(code) {
        return ExitVerdict::Watched(code);
    }
    if (1..=2).contains(&code)
        && result.stderr.iter().any(|line| {
            settings
                .usage_substrings
                .iter()
                .any(|needle| line.contains(needle.as_str()))
        })
    {
        return ExitVerdict::UnsupportedFlag(code);
    }
    if (settings.controlled_error_min..=settings.controlled_error_max).contains(&code) {
        return ExitVerdict::ControlledError(code);
    }
    if settings.watch_exit_code.is_some() {
        return ExitVerdict::Unwatched(code);
    }
    ExitVerdict::Bad(code)
}

/// Whether the run came straight from the fuzz driver or from a wrapper
/// (differential comparison, minimization) that judges completion itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyMode {
    Driver,
    Wrapped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub severity: Severity,
    pub issues: Vec<Issue>,
    pub crash: CrashInfo,
    pub exit: ExitVerdict,
    pub oom: bool,
    pub assertion_count: usize,
    pub known_bug: Option<SignatureMatch>,
}

impl Classification {
    /// Human-readable issue list plus the reproduction command.
    pub fn summary_lines(&self, repro_command: &str) -> Vec<String> {
        let mut lines = vec![format!("severity: {}", self.severity)];
        lines.extend(self.issues.iter().map(|issue| format!("  {issue}")));
        if let Some(known) = &self.known_bug {
            lines.push(format!("known bug: {} ({})", known.bug_id, known.signature));
        }
        lines.push(format!("reproduce: {repro_command}"));
        lines
    }
}

/// Turns an execution transcript into an ordered severity verdict.
pub struct Classifier {
    settings: ClassifierSettings,
    detectors: Vec<Box<dyn Detector>>,
    locator: Box<dyn CrashLogLocator>,
    db: Arc<dyn SignatureDb>,
}

impl Classifier {
    pub fn new(
        settings: ClassifierSettings,
        locator: Box<dyn CrashLogLocator>,
        db: Arc<dyn SignatureDb>,
    ) -> Self {
        let detectors = detectors::standard_detectors(&settings);
        Self {
            settings,
            detectors,
            locator,
            db,
        }
    }

    pub fn with_detectors(mut self, detectors: Vec<Box<dyn Detector>>) -> Self {
        self.detectors = detectors;
        self
    }

    pub fn settings(&self) -> &ClassifierSettings {
        &self.settings
    }

    /// Searches the signature database for a crash built outside `classify`.
    pub fn lookup(&self, crash: &CrashInfo) -> Result<Option<SignatureMatch>, ClassifierError> {
        if crash.is_empty() {
            return Ok(None);
        }
        Ok(self.db.search(crash)?)
    }

    pub fn classify(
        &self,
        result: &ExecutionResult,
        mode: ClassifyMode,
    ) -> Result<Classification, ClassifierError> {
        let mut severity = Severity::Fine;
        let mut issues = Vec::new();

        for detector in &self.detectors {
            if let Some(finding) = detector.detect(result) {
                debug!("detector {} fired: {}", detector.name(), finding.issue.message);
                severity = severity.combine(finding.severity);
                issues.push(finding.issue);
            }
        }
        let oom = OomDetector::is_oom(result);
        let assertion_count = AssertionDetector::count(result);

        let exit = interpret_exit(result, &self.settings);
        match exit {
            ExitVerdict::TimedOut => {
                if assertion_count >= self.settings.assertion_hang_threshold {
                    issues.push(Issue::new(
                        "exit",
                        format!("timed out after {assertion_count} assertions (expected)"),
                    ));
                } else {
                    severity = severity.combine(Severity::DidNotFinish);
                    issues.push(Issue::new("exit", "unexpected hang"));
                }
            }
            ExitVerdict::Bad(code) | ExitVerdict::Watched(code) => {
                severity = severity.combine(Severity::DecidedToExit);
                issues.push(Issue::new("exit", format!("exited with code {code}")));
            }
            _ => {}
        }

        let crash = self.crash_info(result);
        match &crash {
            CrashInfo::None => {}
            CrashInfo::NoInformation { .. } => {
                severity = severity.combine(Severity::NewAssertOrCrash);
                issues.push(Issue::new("crash", "browser crashed, no information"));
            }
            CrashInfo::Backtrace { frames, signal } => {
                severity = severity.combine(Severity::NewAssertOrCrash);
                let top = frames.first().map(String::as_str).unwrap_or("?");
                let message = match signal {
                    Some(sig) => format!("crashed with signal {sig} at {top}"),
                    None => format!("stack trace printed at {top}"),
                };
                issues.push(Issue::new("crash", message));
            }
            CrashInfo::Synthesized { .. } => {
                severity = severity.combine(Severity::NewAssertOrCrash);
            }
        }

        if mode == ClassifyMode::Driver
            && result.exit_status == 0
            && !result.timed_out
            && !oom
            && self.settings.deterministic_build
            && !self.driver_finished(result)
        {
            severity = severity.combine(Severity::DidNotFinish);
            issues.push(Issue::new("driver", "fuzz driver did not finish"));
        }

        let known_bug = self.lookup(&crash)?;
        if let Some(known) = &known_bug {
            debug!("crash matches known bug {}", known.bug_id);
            severity = Severity::Fine;
        }

        Ok(Classification {
            severity,
            issues,
            crash,
            exit,
            oom,
            assertion_count,
            known_bug,
        })
    }

    fn driver_finished(&self, result: &ExecutionResult) -> bool {
        result.stdout.iter().any(|line| {
            line.contains(self.settings.looking_good_sentinel.as_str())
                || line.contains(self.settings.decided_to_exit_sentinel.as_str())
        })
    }

    fn crash_info(&self, result: &ExecutionResult) -> CrashInfo {
        let crashed = result.crashed();
        if !crashed && !crash_log::has_stack_markers(&result.stderr) {
            return CrashInfo::None;
        }
        match self.locator.locate(result) {
            Some(frames) if !frames.is_empty() => CrashInfo::Backtrace {
                frames,
                signal: result.signal(),
            },
            _ if crashed => CrashInfo::NoInformation {
                signal: result.signal(),
            },
            _ => CrashInfo::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_log::{NullLocator, StderrBacktraceLocator};
    use crate::signature::{JsonSignatureDb, NoSignatureDb};
    use std::time::Duration;
    use tempfile::tempdir;

    fn transcript(stdout: &[&str], stderr: &[&str], exit_status: i32) -> ExecutionResult {
        ExecutionResult {
            stdout: stdout.iter().map(|s| s.to_string()).collect(),
            stderr: stderr.iter().map(|s| s.to_string()).collect(),
            exit_status,
            elapsed: Duration::from_millis(3),
            started: std::time::SystemTime::UNIX_EPOCH,
            pid: 4242,
            timed_out: false,
        }
    }

    fn classifier(settings: ClassifierSettings) -> Classifier {
        Classifier::new(settings, Box::new(StderrBacktraceLocator), Arc::new(NoSignatureDb))
    }

    #[test]
    fn clean_run_is_fine() {
        let c = classifier(ClassifierSettings::default());
        let out = c
            .classify(&transcript(&["It's looking good!"], &[], 0), ClassifyMode::Driver)
            .unwrap();
        assert_eq!(out.severity, Severity::Fine);
        assert!(out.issues.is_empty());
        assert_eq!(out.crash, CrashInfo::None);
    }

    #[test]
    fn signal_without_dump_is_crash_with_no_information() {
        let c = Classifier::new(
            ClassifierSettings::default(),
            Box::new(NullLocator),
            Arc::new(NoSignatureDb),
        );
        let out = c
            .classify(&transcript(&[], &[], -11), ClassifyMode::Driver)
            .unwrap();
        assert_eq!(out.severity, Severity::NewAssertOrCrash);
        assert_eq!(out.crash, CrashInfo::NoInformation { signal: Some(11) });
        assert!(out
            .issues
            .iter()
            .any(|i| i.message == "browser crashed, no information"));
    }

    #[test]
    fn known_signature_overrides_everything() {
        let dir = tempdir().unwrap();
        let db = JsonSignatureDb::open(dir.path(), 8).unwrap();
        let frames = ["#0 0x10 in js::jit::Crashy jit/X.cpp:3"];
        db.mark_known(
            &CrashInfo::Backtrace {
                frames: frames.iter().map(|s| s.to_string()).collect(),
                signal: Some(11),
            },
            "bug-77",
        )
        .unwrap();

        let mut settings = ClassifierSettings::default();
        settings.deterministic_build = true;
        let c = Classifier::new(settings, Box::new(StderrBacktraceLocator), Arc::new(db));
        let stderr = [
            "Assertion failure: brand new, at jit/X.cpp:3",
            "==4242== Invalid read of size 8",
            frames[0],
        ];
        let out = c
            .classify(&transcript(&[], &stderr, -11), ClassifyMode::Driver)
            .unwrap();
        assert_eq!(out.severity, Severity::Fine);
        assert_eq!(out.known_bug.unwrap().bug_id, "bug-77");
        assert!(!out.issues.is_empty());
    }

    #[test]
    fn missing_sentinel_on_deterministic_build_did_not_finish() {
        let mut settings = ClassifierSettings::default();
        settings.deterministic_build = true;
        let c = classifier(settings);

        let out = c
            .classify(&transcript(&["partial"], &[], 0), ClassifyMode::Driver)
            .unwrap();
        assert_eq!(out.severity, Severity::DidNotFinish);

        let wrapped = c
            .classify(&transcript(&["partial"], &[], 0), ClassifyMode::Wrapped)
            .unwrap();
        assert_eq!(wrapped.severity, Severity::Fine);

        let oom = c
            .classify(&transcript(&["partial"], &["out of memory"], 0), ClassifyMode::Driver)
            .unwrap();
        assert_eq!(oom.severity, Severity::Fine);
        assert!(oom.oom);
    }

    #[test]
    fn timeout_is_hang_unless_assertions_flooded() {
        let mut settings = ClassifierSettings::default();
        settings.assertion_hang_threshold = 3;
        let c = classifier(settings);

        let mut hung = transcript(&[], &[], -9);
        hung.timed_out = true;
        assert_eq!(
            c.classify(&hung, ClassifyMode::Driver).unwrap().severity,
            Severity::DidNotFinish
        );

        let mut flooded = transcript(&[], &["###!!! ASSERTION: a", "###!!! ASSERTION: b", "###!!! ASSERTION: c"], -9);
        flooded.timed_out = true;
        let mut settings = ClassifierSettings::default();
        settings.assertion_hang_threshold = 3;
        settings.known_assertions = vec!["###!!! ASSERTION".to_string()];
        let c = classifier(settings);
        let out = c.classify(&flooded, ClassifyMode::Driver).unwrap();
        assert_eq!(out.severity, Severity::Fine);
        assert_eq!(out.assertion_count, 3);
    }

    #[test]
    fn exit_code_conventions() {
        let settings = ClassifierSettings::default();
        let usage = transcript(&[], &["usage: js [options]"], 2);
        assert_eq!(interpret_exit(&usage, &settings), ExitVerdict::UnsupportedFlag(2));
        assert_eq!(interpret_exit(&usage, &settings).label(), RevisionLabel::Good);

        let controlled = transcript(&[], &[], 4);
        assert_eq!(interpret_exit(&controlled, &settings), ExitVerdict::ControlledError(4));

        let bad = transcript(&[], &[], 17);
        assert_eq!(interpret_exit(&bad, &settings), ExitVerdict::Bad(17));
        assert_eq!(interpret_exit(&bad, &settings).label(), RevisionLabel::Bad);

        let mut watching = ClassifierSettings::default();
        watching.watch_exit_code = Some(17);
        assert_eq!(interpret_exit(&bad, &watching), ExitVerdict::Watched(17));
        let other = transcript(&[], &[], 9);
        assert_eq!(interpret_exit(&other, &watching).label(), RevisionLabel::Good);
    }

    #[test]
    fn nonzero_exit_decided_to_exit() {
        let c = classifier(ClassifierSettings::default());
        let out = c
            .classify(&transcript(&[], &[], 17), ClassifyMode::Wrapped)
            .unwrap();
        assert_eq!(out.severity, Severity::DecidedToExit);
        let summary = out.summary_lines("js --fuzzing-safe t.js");
        assert_eq!(summary[0], "severity: decided-to-exit");
        assert!(summary.last().unwrap().contains("t.js"));
    }
}
