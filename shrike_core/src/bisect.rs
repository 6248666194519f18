use crate::build_cache::{BuildCache, BuildCacheError};
use crate::classifier::interpret_exit;
use crate::config::{BisectSettings, ClassifierSettings};
use crate::executor::{Executor, ExecutorError};
use crate::interesting::{InterestingError, InterestingnessTest, TargetArgs};
use crate::lock::{DirLock, LockError};
use crate::logs::LogPaths;
use crate::vcs::{BisectStep, RevisionLabel, VcsBisect, VcsError};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const WORKING_COPY_LOCK: &str = ".shrike-bisect.lock";

#[derive(Error, Debug)]
pub enum BisectError {
    #[error("version control error: {0}")]
    Vcs(#[from] VcsError),
    #[error("bisection lock error: {0}")]
    Lock(#[from] LockError),
    #[error("revision test failed: {0}")]
    Test(#[from] InterestingError),
    #[error("build cache error: {0}")]
    Build(#[from] BuildCacheError),
    #[error("revision run failed: {0}")]
    Executor(#[from] ExecutorError),
    #[error("bisection I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("report serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Labels one revision. Implementations decide how a revision is built and
/// what counts as bad.
pub trait RevisionTester {
    fn test_revision(&mut self, rev: &str) -> Result<RevisionLabel, BisectError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum BisectOutcome {
    Found { revision: String },
    /// Skipped revisions left more than one candidate.
    Ambiguous { candidates: Vec<String> },
    Exhausted { reason: String },
}

/// Result of testing the blamed revision's parents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum ParentCheck {
    Confirmed,
    /// A parent is as bad as the blamed revision. For a two-parent merge the
    /// common ancestor is tested and offered as a refined starting point.
    Contradiction {
        parents: Vec<(String, RevisionLabel)>,
        common_ancestor: Option<(String, RevisionLabel)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BisectReport {
    pub outcome: BisectOutcome,
    pub tests_run: usize,
    pub labels: BTreeMap<String, RevisionLabel>,
    pub parent_check: Option<ParentCheck>,
}

impl BisectReport {
    pub fn write_json(&self, path: &Path) -> Result<(), BisectError> {
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// The one-line `key=value` summary.
    pub fn summary(&self) -> String {
        match &self.outcome {
            BisectOutcome::Found { revision } => {
                format!("outcome=found rev={revision} tests={}", self.tests_run)
            }
            BisectOutcome::Ambiguous { candidates } => format!(
                "outcome=ambiguous candidates={} tests={}",
                candidates.join(","),
                self.tests_run
            ),
            BisectOutcome::Exhausted { reason } => {
                format!("outcome=exhausted reason=\"{reason}\" tests={}", self.tests_run)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Initializing,
    TestingInitialBounds { good: String, bad: String },
    Bisecting,
    Found(String),
    Ambiguous(Vec<String>),
    Exhausted(String),
}

/// Narrows a regression window to the first bad revision.
pub struct Bisector<'a> {
    vcs: &'a mut dyn VcsBisect,
    tester: &'a mut dyn RevisionTester,
    settings: &'a BisectSettings,
    lock_path: Option<PathBuf>,
    labels: BTreeMap<String, RevisionLabel>,
    tests_run: usize,
    skips: usize,
}

impl<'a> Bisector<'a> {
    pub fn new(
        vcs: &'a mut dyn VcsBisect,
        tester: &'a mut dyn RevisionTester,
        settings: &'a BisectSettings,
    ) -> Self {
        Self {
            vcs,
            tester,
            settings,
            lock_path: None,
            labels: BTreeMap::new(),
            tests_run: 0,
            skips: 0,
        }
    }

    /// Holds `<working_copy>/.shrike-bisect.lock` for the whole run.
    pub fn with_working_copy_lock(mut self, working_copy: &Path) -> Self {
        self.lock_path = Some(working_copy.join(WORKING_COPY_LOCK));
        self
    }

    /// Cached label, or a fresh test. No revision is tested twice.
    fn label(&mut self, rev: &str) -> Result<RevisionLabel, BisectError> {
        if let Some(label) = self.labels.get(rev) {
            return Ok(*label);
        }
        let label = self.tester.test_revision(rev)?;
        self.tests_run += 1;
        info!("rev={rev} label={label}");
        self.labels.insert(rev.to_string(), label);
        Ok(label)
    }

    pub fn run(mut self, start: &str, end: &str) -> Result<BisectReport, BisectError> {
        let _lock = match &self.lock_path {
            Some(path) => Some(DirLock::acquire(
                path.clone(),
                Duration::from_millis(self.settings.lock_poll_ms),
            )?),
            None => None,
        };

        let result = self.drive(start, end);
        if let Err(e) = self.vcs.reset() {
            warn!("failed to reset bisect session: {e}");
        }
        let (outcome, parent_check) = result?;

        let report = BisectReport {
            outcome,
            tests_run: self.tests_run,
            labels: self.labels,
            parent_check,
        };
        info!("{}", report.summary());
        Ok(report)
    }

    fn drive(&mut self, start: &str, end: &str) -> Result<(BisectOutcome, Option<ParentCheck>), BisectError> {
        let mut state = State::Initializing;
        loop {
            state = match state {
                State::Initializing => {
                    let good = self.vcs.resolve(start)?;
                    let bad = self.vcs.resolve(end)?;
                    self.vcs.reset()?;
                    if self.settings.test_initial_revs {
                        State::TestingInitialBounds { good, bad }
                    } else {
                        debug!("assuming {good} good and {bad} bad");
                        self.labels.insert(good.clone(), RevisionLabel::Good);
                        self.labels.insert(bad.clone(), RevisionLabel::Bad);
                        self.vcs.start(&good, &bad)?;
                        State::Bisecting
                    }
                }
                State::TestingInitialBounds { good, bad } => {
                    let end_label = self.label(&bad)?;
                    if end_label != RevisionLabel::Bad {
                        State::Exhausted(format!("end revision {bad} is {end_label}, not bad"))
                    } else {
                        let start_label = self.label(&good)?;
                        if start_label != RevisionLabel::Good {
                            State::Exhausted(format!("start revision {good} is {start_label}, not good"))
                        } else {
                            self.vcs.start(&good, &bad)?;
                            State::Bisecting
                        }
                    }
                }
                State::Bisecting => match self.vcs.next_candidate()? {
                    BisectStep::Candidate(rev) => {
                        let label = self.label(&rev)?;
                        if label == RevisionLabel::Skip {
                            self.skips += 1;
                        }
                        if self.skips >= self.settings.skip_cap {
                            warn!(
                                "{} revisions skipped, giving up on binary search",
                                self.skips
                            );
                            State::Exhausted(format!("skip cap of {} reached", self.settings.skip_cap))
                        } else {
                            self.vcs.mark(&rev, label)?;
                            State::Bisecting
                        }
                    }
                    BisectStep::FirstBad(rev) => State::Found(rev),
                    BisectStep::Ambiguous(revs) => State::Ambiguous(revs),
                },
                State::Found(revision) => {
                    let check = self.check_parents(&revision)?;
                    return Ok((BisectOutcome::Found { revision }, Some(check)));
                }
                State::Ambiguous(candidates) => {
                    return Ok((BisectOutcome::Ambiguous { candidates }, None));
                }
                State::Exhausted(reason) => {
                    return Ok((BisectOutcome::Exhausted { reason }, None));
                }
            };
        }
    }

    fn check_parents(&mut self, blamed: &str) -> Result<ParentCheck, BisectError> {
        let blamed_label = self.label(blamed)?;
        let parents = self.vcs.parents(blamed)?;
        let mut labelled = Vec::with_capacity(parents.len());
        for parent in &parents {
            let label = self.label(parent)?;
            labelled.push((parent.clone(), label));
        }
        if !labelled.iter().any(|(_, label)| *label == blamed_label) {
            return Ok(ParentCheck::Confirmed);
        }

        warn!("bisect lied: a parent of {blamed} is also {blamed_label}");
        let common_ancestor = match parents.as_slice() {
            [a, b] => {
                let ancestor = self.vcs.common_ancestor(a, b)?;
                let label = self.label(&ancestor)?;
                info!("refined starting point rev={ancestor} label={label}");
                Some((ancestor, label))
            }
            _ => None,
        };
        Ok(ParentCheck::Contradiction {
            parents: labelled,
            common_ancestor,
        })
    }
}

/// Labels a revision by building it through the cache and asking an
/// interestingness test whether the testcase still misbehaves.
pub struct InterestingnessOracle<'a> {
    cache: &'a BuildCache,
    configuration: String,
    test: Box<dyn InterestingnessTest>,
    /// The test arguments; the binary is swapped per revision.
    args: TargetArgs,
    build_failure_label: RevisionLabel,
    temp_dir: PathBuf,
}

impl<'a> InterestingnessOracle<'a> {
    pub fn new(
        cache: &'a BuildCache,
        configuration: impl Into<String>,
        test: Box<dyn InterestingnessTest>,
        args: TargetArgs,
        settings: &BisectSettings,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            configuration: configuration.into(),
            test,
            args,
            build_failure_label: settings.build_failure_label,
            temp_dir: temp_dir.into(),
        }
    }
}

/// Builds `rev` through the cache. A revision that does not build comes
/// back as the configured label instead of a binary.
fn build_revision(
    cache: &BuildCache,
    configuration: &str,
    rev: &str,
    build_failure_label: RevisionLabel,
) -> Result<Result<PathBuf, RevisionLabel>, BisectError> {
    match cache.obtain(configuration, rev) {
        Ok(binary) => Ok(Ok(binary)),
        Err(BuildCacheError::BuildFailed { reason, .. }) => {
            info!("rev={rev} did not build ({reason}), labelling {build_failure_label}");
            Ok(Err(build_failure_label))
        }
        Err(e) => Err(e.into()),
    }
}

/// A fresh per-revision log directory under `temp_dir`.
fn revision_dir(temp_dir: &Path, rev: &str) -> Result<PathBuf, BisectError> {
    let dir = temp_dir.join(format!("bisect-{rev}"));
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Logs of a bad revision are kept for diagnosis, the rest are dropped.
fn finish_revision(dir: &Path, label: RevisionLabel) -> Result<RevisionLabel, BisectError> {
    if label != RevisionLabel::Bad {
        fs::remove_dir_all(dir)?;
    }
    Ok(label)
}

impl RevisionTester for InterestingnessOracle<'_> {
    fn test_revision(&mut self, rev: &str) -> Result<RevisionLabel, BisectError> {
        let binary = match build_revision(self.cache, &self.configuration, rev, self.build_failure_label)? {
            Ok(binary) => binary,
            Err(label) => return Ok(label),
        };
        let mut args = self.args.clone();
        args.binary = binary;
        let dir = revision_dir(&self.temp_dir, rev)?;
        let interesting = self.test.interesting(&args.to_args(), &dir.join("run"))?;
        let label = if interesting {
            RevisionLabel::Bad
        } else {
            RevisionLabel::Good
        };
        finish_revision(&dir, label)
    }
}

/// Labels a revision from the engine's exit status alone, for bisections
/// run without an interestingness test.
pub struct ExitCodeOracle<'a> {
    cache: &'a BuildCache,
    configuration: String,
    executor: &'a dyn Executor,
    classifier: ClassifierSettings,
    flags: Vec<String>,
    testcase: PathBuf,
    timeout: Duration,
    build_failure_label: RevisionLabel,
    temp_dir: PathBuf,
}

impl<'a> ExitCodeOracle<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: &'a BuildCache,
        configuration: impl Into<String>,
        executor: &'a dyn Executor,
        classifier: &ClassifierSettings,
        flags: Vec<String>,
        testcase: impl Into<PathBuf>,
        timeout: Duration,
        settings: &BisectSettings,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            configuration: configuration.into(),
            executor,
            classifier: classifier.clone(),
            flags,
            testcase: testcase.into(),
            timeout,
            build_failure_label: settings.build_failure_label,
            temp_dir: temp_dir.into(),
        }
    }
}

impl RevisionTester for ExitCodeOracle<'_> {
    fn test_revision(&mut self, rev: &str) -> Result<RevisionLabel, BisectError> {
        let binary = match build_revision(self.cache, &self.configuration, rev, self.build_failure_label)? {
            Ok(binary) => binary,
            Err(label) => return Ok(label),
        };
        let dir = revision_dir(&self.temp_dir, rev)?;
        let mut args = self.flags.clone();
        args.push(self.testcase.to_string_lossy().into_owned());
        let result = self
            .executor
            .run(&binary, &args, self.timeout, &LogPaths::new(dir.join("run")))?;
        let verdict = interpret_exit(&result, &self.classifier);
        debug!("rev={rev} exit={} verdict={verdict:?}", result.exit_status);
        finish_revision(&dir, verdict.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_cache::{BuildFailed, BuildProvider, ProviderError};
    use crate::config::BuildCacheSettings;
    use crate::vcs::LinearHistory;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn revs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("r{i:03}")).collect()
    }

    /// Good below `boundary`, bad from it on, with optional always-skip revisions.
    struct ThresholdTester {
        boundary: usize,
        skipped: HashSet<usize>,
        calls: Vec<String>,
    }

    impl ThresholdTester {
        fn new(boundary: usize) -> Self {
            Self {
                boundary,
                skipped: HashSet::new(),
                calls: Vec::new(),
            }
        }
    }

    impl RevisionTester for ThresholdTester {
        fn test_revision(&mut self, rev: &str) -> Result<RevisionLabel, BisectError> {
            self.calls.push(rev.to_string());
            let idx: usize = rev[1..].parse().unwrap();
            Ok(if self.skipped.contains(&idx) {
                RevisionLabel::Skip
            } else if idx < self.boundary {
                RevisionLabel::Good
            } else {
                RevisionLabel::Bad
            })
        }
    }

    #[test]
    fn finds_boundary_within_log2_tests_without_repeats() {
        let n = 100;
        let bound = (n as f64).log2().ceil() as usize + 1;
        let settings = BisectSettings::default();
        for boundary in 1..n {
            let mut vcs = LinearHistory::new(revs(n));
            let mut tester = ThresholdTester::new(boundary);
            let report = Bisector::new(&mut vcs, &mut tester, &settings)
                .run("r000", &format!("r{:03}", n - 1))
                .unwrap();

            assert_eq!(
                report.outcome,
                BisectOutcome::Found {
                    revision: format!("r{boundary:03}")
                }
            );
            assert_eq!(report.parent_check, Some(ParentCheck::Confirmed));
            assert!(tester.calls.len() <= bound, "boundary {boundary}: {} tests", tester.calls.len());
            let unique: HashSet<_> = tester.calls.iter().collect();
            assert_eq!(unique.len(), tester.calls.len());
            assert_eq!(report.tests_run, tester.calls.len());
        }
    }

    #[test]
    fn skip_at_boundary_is_ambiguous() {
        let settings = BisectSettings::default();
        let mut vcs = LinearHistory::new(revs(32));
        let mut tester = ThresholdTester::new(17);
        tester.skipped.insert(17);
        let report = Bisector::new(&mut vcs, &mut tester, &settings)
            .run("r000", "r031")
            .unwrap();
        match report.outcome {
            BisectOutcome::Ambiguous { candidates } => {
                assert!(candidates.contains(&"r017".to_string()));
                assert!(candidates.contains(&"r018".to_string()));
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn too_many_skips_exhaust_the_search() {
        let settings = BisectSettings {
            skip_cap: 3,
            ..BisectSettings::default()
        };
        let mut vcs = LinearHistory::new(revs(64));
        let mut tester = ThresholdTester::new(40);
        tester.skipped = (1..63).collect();
        let report = Bisector::new(&mut vcs, &mut tester, &settings)
            .run("r000", "r063")
            .unwrap();
        assert!(matches!(report.outcome, BisectOutcome::Exhausted { .. }));
        assert_eq!(tester.calls.len(), 3);
    }

    #[test]
    fn initial_revisions_are_tested_end_first() {
        let settings = BisectSettings {
            test_initial_revs: true,
            ..BisectSettings::default()
        };
        let mut vcs = LinearHistory::new(revs(16));
        let mut tester = ThresholdTester::new(5);
        let report = Bisector::new(&mut vcs, &mut tester, &settings)
            .run("r000", "r015")
            .unwrap();
        assert_eq!(&tester.calls[..2], &["r015".to_string(), "r000".to_string()]);
        assert_eq!(
            report.outcome,
            BisectOutcome::Found {
                revision: "r005".to_string()
            }
        );

        let mut vcs = LinearHistory::new(revs(16));
        let mut tester = ThresholdTester::new(99);
        let report = Bisector::new(&mut vcs, &mut tester, &settings)
            .run("r000", "r015")
            .unwrap();
        assert!(matches!(report.outcome, BisectOutcome::Exhausted { .. }));
        assert_eq!(tester.calls, vec!["r015".to_string()]);
    }

    /// A primitive that immediately blames a two-parent merge.
    struct MergeVcs;

    impl VcsBisect for MergeVcs {
        fn reset(&mut self) -> Result<(), VcsError> {
            Ok(())
        }
        fn start(&mut self, _good: &str, _bad: &str) -> Result<(), VcsError> {
            Ok(())
        }
        fn mark(&mut self, _rev: &str, _label: RevisionLabel) -> Result<(), VcsError> {
            Ok(())
        }
        fn next_candidate(&mut self) -> Result<BisectStep, VcsError> {
            Ok(BisectStep::FirstBad("merge".to_string()))
        }
        fn resolve(&self, rev: &str) -> Result<String, VcsError> {
            Ok(rev.to_string())
        }
        fn parents(&self, _rev: &str) -> Result<Vec<String>, VcsError> {
            Ok(vec!["left".to_string(), "right".to_string()])
        }
        fn common_ancestor(&self, _a: &str, _b: &str) -> Result<String, VcsError> {
            Ok("base".to_string())
        }
    }

    struct TableTester(BTreeMap<&'static str, RevisionLabel>);

    impl RevisionTester for TableTester {
        fn test_revision(&mut self, rev: &str) -> Result<RevisionLabel, BisectError> {
            Ok(self.0[rev])
        }
    }

    #[test]
    fn merge_contradiction_tests_common_ancestor() {
        let settings = BisectSettings::default();
        let mut vcs = MergeVcs;
        let mut tester = TableTester(BTreeMap::from([
            ("merge", RevisionLabel::Bad),
            ("left", RevisionLabel::Bad),
            ("right", RevisionLabel::Good),
            ("base", RevisionLabel::Good),
        ]));
        let report = Bisector::new(&mut vcs, &mut tester, &settings)
            .run("start", "end")
            .unwrap();
        assert_eq!(
            report.outcome,
            BisectOutcome::Found {
                revision: "merge".to_string()
            }
        );
        assert_eq!(
            report.parent_check,
            Some(ParentCheck::Contradiction {
                parents: vec![
                    ("left".to_string(), RevisionLabel::Bad),
                    ("right".to_string(), RevisionLabel::Good),
                ],
                common_ancestor: Some(("base".to_string(), RevisionLabel::Good)),
            })
        );
    }

    #[test]
    fn working_copy_lock_is_released_and_report_serializes() {
        let dir = tempdir().unwrap();
        let settings = BisectSettings::default();
        let mut vcs = LinearHistory::new(revs(8));
        let mut tester = ThresholdTester::new(3);
        let report = Bisector::new(&mut vcs, &mut tester, &settings)
            .with_working_copy_lock(dir.path())
            .run("r000", "r007")
            .unwrap();
        assert!(!dir.path().join(WORKING_COPY_LOCK).exists());
        assert_eq!(report.summary(), format!("outcome=found rev=r003 tests={}", report.tests_run));

        let json_path = dir.path().join("report.json");
        report.write_json(&json_path).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&fs::read(json_path).unwrap()).unwrap();
        assert_eq!(json["outcome"]["outcome"], "found");
        assert_eq!(json["labels"]["r003"], "bad");
    }

    /// Writes the revision name as the artifact; revisions in `broken` fail.
    struct NamedBuilds {
        broken: Vec<&'static str>,
    }

    impl BuildProvider for NamedBuilds {
        fn build(&self, _c: &str, revision: &str, dest: &Path) -> Result<PathBuf, ProviderError> {
            if self.broken.contains(&revision) {
                return Err(BuildFailed {
                    reason: "link error".to_string(),
                }
                .into());
            }
            let artifact = dest.join("js");
            fs::write(&artifact, revision).unwrap();
            Ok(artifact)
        }
    }

    /// Interesting when the binary was built from revision `r004` or later.
    struct ArtifactTest;

    impl InterestingnessTest for ArtifactTest {
        fn name(&self) -> &str {
            "artifact"
        }
        fn interesting(&mut self, args: &[String], _prefix: &Path) -> Result<bool, InterestingError> {
            let parsed = TargetArgs::parse("artifact", args)?;
            let rev = fs::read_to_string(&parsed.binary).unwrap();
            Ok(rev.as_str() >= "r004")
        }
    }

    #[test]
    fn oracle_builds_tests_and_applies_build_failure_policy() {
        let dir = tempdir().unwrap();
        let cache = BuildCache::new(
            &BuildCacheSettings {
                cache_dir: dir.path().join("cache"),
                ..BuildCacheSettings::default()
            },
            Box::new(NamedBuilds {
                broken: vec!["r002"],
            }),
        );
        let settings = BisectSettings::default();
        let mut oracle = InterestingnessOracle::new(
            &cache,
            "debug",
            Box::new(ArtifactTest),
            TargetArgs::new("placeholder", vec!["--fuzzing-safe".to_string()], "t.js"),
            &settings,
            dir.path(),
        );
        assert_eq!(oracle.test_revision("r001").unwrap(), RevisionLabel::Good);
        assert_eq!(oracle.test_revision("r002").unwrap(), RevisionLabel::Skip);
        assert_eq!(oracle.test_revision("r005").unwrap(), RevisionLabel::Bad);
        assert!(!dir.path().join("bisect-r001").exists());
        assert!(dir.path().join("bisect-r005").is_dir());

        let mut vcs = LinearHistory::new(revs(8));
        let report = Bisector::new(&mut vcs, &mut oracle, &settings)
            .run("r000", "r007")
            .unwrap();
        assert_eq!(
            report.outcome,
            BisectOutcome::Found {
                revision: "r004".to_string()
            }
        );
    }

    /// Engines that exit cleanly before `r004` and segfault from it on;
    /// `r002` exits with a controlled error.
    #[cfg(unix)]
    struct ScriptBuilds;

    #[cfg(unix)]
    impl BuildProvider for ScriptBuilds {
        fn build(&self, _c: &str, revision: &str, dest: &Path) -> Result<PathBuf, ProviderError> {
            let body = match revision {
                "r002" => "exit 4",
                rev if rev >= "r004" => "kill -SEGV $$",
                _ => "exit 0",
            };
            Ok(crate::executor::test_support::write_script(dest, "js", body))
        }
    }

    #[cfg(unix)]
    #[test]
    fn exit_code_oracle_labels_from_exit_status() {
        use crate::executor::{ProcessExecutor, ResourceLimits};

        let dir = tempdir().unwrap();
        let cache = BuildCache::new(
            &BuildCacheSettings {
                cache_dir: dir.path().join("cache"),
                ..BuildCacheSettings::default()
            },
            Box::new(ScriptBuilds),
        );
        let testcase = dir.path().join("t.js");
        fs::write(&testcase, "crash();\n").unwrap();
        let executor = ProcessExecutor::new(ResourceLimits::default());
        let settings = BisectSettings::default();
        let scratch = dir.path().join("scratch");
        let mut oracle = ExitCodeOracle::new(
            &cache,
            "debug",
            &executor,
            &ClassifierSettings::default(),
            vec!["--fuzzing-safe".to_string()],
            &testcase,
            Duration::from_secs(10),
            &settings,
            &scratch,
        );
        assert_eq!(oracle.test_revision("r001").unwrap(), RevisionLabel::Good);
        assert_eq!(oracle.test_revision("r002").unwrap(), RevisionLabel::Good);
        assert_eq!(oracle.test_revision("r006").unwrap(), RevisionLabel::Bad);
        assert!(!scratch.join("bisect-r001").exists());
        assert!(scratch.join("bisect-r006").join("run-err.txt").exists());

        let mut vcs = LinearHistory::new(revs(8));
        let report = Bisector::new(&mut vcs, &mut oracle, &settings)
            .run("r000", "r007")
            .unwrap();
        assert_eq!(
            report.outcome,
            BisectOutcome::Found {
                revision: "r004".to_string()
            }
        );
    }
}
