#![cfg(unix)]

use shrike_core::build_cache::{BuildCacheError, BuildFailed, BuildProvider, ProviderError};
use shrike_core::config::{BuildCacheSettings, ClassifierSettings, CompareSettings};
use shrike_core::crash_log::NullLocator;
use shrike_core::signature::NoSignatureDb;
use shrike_core::{
    BuildCache, CacheEntry, Classifier, ClassifyMode, Comparator, CrashInfo, Executor, LogPaths,
    ProcessExecutor, ResourceLimits, Severity,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::tempdir;

const TIMEOUT: Duration = Duration::from_secs(10);

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn classifier() -> Classifier {
    Classifier::new(
        ClassifierSettings::default(),
        Box::new(NullLocator),
        Arc::new(NoSignatureDb),
    )
}

fn run_and_classify(body: &str) -> shrike_core::Classification {
    let dir = tempdir().unwrap();
    let js = write_script(dir.path(), "js", body);
    let input = dir.path().join("t.js");
    fs::write(&input, "print(1);\n").unwrap();

    let executor = ProcessExecutor::new(ResourceLimits::default());
    let result = executor
        .run(
            &js,
            &[input.to_string_lossy().into_owned()],
            TIMEOUT,
            &LogPaths::new(dir.path().join("run")),
        )
        .unwrap();
    classifier().classify(&result, ClassifyMode::Driver).unwrap()
}

#[test]
fn clean_driver_run_is_fine() {
    let out = run_and_classify("echo \"It's looking good!\"\nexit 0");
    assert_eq!(out.severity, Severity::Fine);
    assert!(out.issues.is_empty());
}

#[test]
fn segfault_without_a_dump_is_an_uninformative_crash() {
    let out = run_and_classify("kill -SEGV $$");
    assert_eq!(out.severity, Severity::NewAssertOrCrash);
    assert_eq!(out.crash, CrashInfo::NoInformation { signal: Some(11) });
    assert!(
        out.issues
            .iter()
            .any(|issue| issue.message == "browser crashed, no information")
    );
}

fn compare_engine(candidate_output: &str) -> shrike_core::Comparison {
    let dir = tempdir().unwrap();
    let js = write_script(
        dir.path(),
        "js",
        &format!("case \" $* \" in\n  *\" --no-threads \"*) echo {candidate_output} ;;\n  *) echo 42 ;;\nesac"),
    );
    let input = dir.path().join("t.js");
    fs::write(&input, "print(42);\n").unwrap();

    let executor = ProcessExecutor::new(ResourceLimits::default());
    let classifier = classifier();
    let settings = CompareSettings::default();
    let comparator = Comparator::new(&executor, &classifier, &settings, TIMEOUT).unwrap();
    comparator
        .compare(
            &js,
            &[],
            &[vec!["--no-threads".to_string()]],
            &input,
            &dir.path().join("cmp"),
        )
        .unwrap()
}

#[test]
fn agreeing_flag_sets_are_fine() {
    let out = compare_engine("42");
    assert_eq!(out.severity, Severity::Fine);
    assert!(out.diff.is_empty());
    assert_eq!(out.compared, 1);
}

#[test]
fn disagreeing_flag_sets_are_a_mismatch_with_a_two_line_diff() {
    let out = compare_engine("43");
    assert_eq!(out.severity, Severity::OverallMismatch);
    assert_eq!(out.diff, vec!["-42".to_string(), "+43".to_string()]);
}

struct AlwaysBroken {
    builds: Arc<AtomicUsize>,
}

impl BuildProvider for AlwaysBroken {
    fn build(&self, _configuration: &str, _revision: &str, _dest: &Path) -> Result<PathBuf, ProviderError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Err(BuildFailed {
            reason: "ld: undefined reference".to_string(),
        }
        .into())
    }
}

#[test]
fn failed_build_is_remembered_and_never_retried() {
    let dir = tempdir().unwrap();
    let builds = Arc::new(AtomicUsize::new(0));
    let settings = BuildCacheSettings {
        cache_dir: dir.path().to_path_buf(),
        lock_poll_ms: 5,
        ..BuildCacheSettings::default()
    };
    let cache = BuildCache::new(
        &settings,
        Box::new(AlwaysBroken {
            builds: builds.clone(),
        }),
    );

    let first = cache.obtain("debug", "abc123").unwrap_err();
    assert!(matches!(first, BuildCacheError::BuildFailed { cached: false, .. }));

    let second = cache.obtain("debug", "abc123").unwrap_err();
    match second {
        BuildCacheError::BuildFailed { cached, reason, .. } => {
            assert!(cached);
            assert!(reason.contains("undefined reference"));
        }
        other => panic!("expected a cached build failure, got {other:?}"),
    }
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert!(matches!(
        cache.entry("debug", "abc123").unwrap(),
        CacheEntry::Busted(_)
    ));
}
