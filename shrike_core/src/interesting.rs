//! Interestingness tests: the predicate shared by the minimizer and the
//! bisector's revision oracle.
//!
//! A test is addressed by name through a [`TestRegistry`] and receives a
//! Lithium-style argument vector:
//!
//! ```text
//! [--option=value ...] <binary> [engine flags ...] <testcase>
//! ```
//!
//! Options come first and end at the first argument that does not start
//! with `--`.

use crate::classifier::{Classifier, ClassifierError, ClassifyMode};
use crate::compare::{CompareError, Comparator};
use crate::config::CompareSettings;
use crate::executor::{Executor, ExecutorError};
use crate::logs::LogPaths;
use crate::severity::Severity;
use log::debug;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InterestingError {
    #[error("bad arguments for test '{test}': {message}")]
    Usage { test: String, message: String },
    #[error("unknown interestingness test '{0}'")]
    UnknownTest(String),
    #[error("run failed: {0}")]
    Executor(#[from] ExecutorError),
    #[error("classification failed: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("comparison failed: {0}")]
    Compare(#[from] CompareError),
}

/// A parsed argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetArgs {
    pub options: Vec<(String, String)>,
    pub binary: PathBuf,
    pub flags: Vec<String>,
    pub testcase: PathBuf,
}

impl TargetArgs {
    pub fn new(binary: impl Into<PathBuf>, flags: Vec<String>, testcase: impl Into<PathBuf>) -> Self {
        Self {
            options: Vec::new(),
            binary: binary.into(),
            flags,
            testcase: testcase.into(),
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<String>) -> Self {
        self.options.push((key.to_string(), value.into()));
        self
    }

    pub fn parse(test: &str, args: &[String]) -> Result<Self, InterestingError> {
        let usage = |message: &str| InterestingError::Usage {
            test: test.to_string(),
            message: message.to_string(),
        };
        let split = args
            .iter()
            .position(|a| !a.starts_with("--"))
            .ok_or_else(|| usage("missing binary"))?;
        let options = args[..split]
            .iter()
            .map(|opt| {
                let opt = &opt[2..];
                match opt.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (opt.to_string(), String::new()),
                }
            })
            .collect();
        let rest = &args[split..];
        if rest.len() < 2 {
            return Err(usage("expected <binary> [flags...] <testcase>"));
        }
        Ok(Self {
            options,
            binary: PathBuf::from(&rest[0]),
            flags: rest[1..rest.len() - 1].to_vec(),
            testcase: PathBuf::from(&rest[rest.len() - 1]),
        })
    }

    /// The last value given for `key`.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn options_named<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.options
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Everything up to (not including) the testcase.
    pub fn to_args_without_testcase(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .options
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    format!("--{k}")
                } else {
                    format!("--{k}={v}")
                }
            })
            .collect();
        out.push(self.binary.to_string_lossy().into_owned());
        out.extend(self.flags.iter().cloned());
        out
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut out = self.to_args_without_testcase();
        out.push(self.testcase.to_string_lossy().into_owned());
        out
    }

    fn min_severity(&self, test: &str, default: Severity) -> Result<Severity, InterestingError> {
        match self.option("min-severity") {
            None => Ok(default),
            Some(name) => name.parse().map_err(|_| InterestingError::Usage {
                test: test.to_string(),
                message: format!("unknown severity '{name}'"),
            }),
        }
    }

    fn timeout(&self, test: &str, default: Duration) -> Result<Duration, InterestingError> {
        match self.option("timeout") {
            None => Ok(default),
            Some(secs) => secs
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| InterestingError::Usage {
                    test: test.to_string(),
                    message: format!("bad timeout '{secs}'"),
                }),
        }
    }
}

/// Shared collaborators handed to every test the registry builds.
#[derive(Clone)]
pub struct TestContext {
    pub executor: Arc<dyn Executor>,
    pub classifier: Arc<Classifier>,
    pub compare: CompareSettings,
    pub timeout: Duration,
}

pub trait InterestingnessTest: Send {
    fn name(&self) -> &str;

    /// Validates the arguments once before the first call. Optional.
    fn init(&mut self, _args: &[String]) -> Result<(), InterestingError> {
        Ok(())
    }

    /// Whether the testcase named in `args` is still interesting. Any log
    /// files go under `temp_prefix`.
    fn interesting(&mut self, args: &[String], temp_prefix: &Path) -> Result<bool, InterestingError>;
}

/// Interesting when the classified severity reaches `--min-severity`
/// (default `new-assert-or-crash`).
pub struct OutcomeTest {
    ctx: TestContext,
}

impl InterestingnessTest for OutcomeTest {
    fn name(&self) -> &str {
        "outcome"
    }

    fn init(&mut self, args: &[String]) -> Result<(), InterestingError> {
        let parsed = TargetArgs::parse(self.name(), args)?;
        parsed.min_severity(self.name(), Severity::NewAssertOrCrash)?;
        parsed.timeout(self.name(), self.ctx.timeout)?;
        Ok(())
    }

    fn interesting(&mut self, args: &[String], temp_prefix: &Path) -> Result<bool, InterestingError> {
        let parsed = TargetArgs::parse(self.name(), args)?;
        let min = parsed.min_severity(self.name(), Severity::NewAssertOrCrash)?;
        let timeout = parsed.timeout(self.name(), self.ctx.timeout)?;
        let mode = match parsed.option("mode") {
            Some("driver") => ClassifyMode::Driver,
            _ => ClassifyMode::Wrapped,
        };

        let mut run_args = parsed.flags.clone();
        run_args.push(parsed.testcase.to_string_lossy().into_owned());
        let result = self.ctx.executor.run(
            &parsed.binary,
            &run_args,
            timeout,
            &LogPaths::new(temp_prefix),
        )?;
        let class = self.ctx.classifier.classify(&result, mode)?;
        debug!("outcome test: severity={} wanted>={}", class.severity, min);
        Ok(class.severity >= min)
    }
}

/// Interesting when a differential comparison reports at least
/// `--min-severity` (default `overall-mismatch`). Candidates come from
/// repeated `--candidate="<flags>"` options, else the configured pool.
pub struct DiffTest {
    ctx: TestContext,
}

impl InterestingnessTest for DiffTest {
    fn name(&self) -> &str {
        "diff"
    }

    fn interesting(&mut self, args: &[String], temp_prefix: &Path) -> Result<bool, InterestingError> {
        let parsed = TargetArgs::parse(self.name(), args)?;
        let min = parsed.min_severity(self.name(), Severity::OverallMismatch)?;
        let timeout = parsed.timeout(self.name(), self.ctx.timeout)?;

        let mut candidates: Vec<Vec<String>> = parsed
            .options_named("candidate")
            .map(|c| c.split_whitespace().map(String::from).collect())
            .collect();
        if candidates.is_empty() {
            candidates = self.ctx.compare.flag_sets.clone();
        }

        let comparator = Comparator::new(
            self.ctx.executor.as_ref(),
            self.ctx.classifier.as_ref(),
            &self.ctx.compare,
            timeout,
        )?;
        let outcome = comparator.compare(
            &parsed.binary,
            &parsed.flags,
            &candidates,
            &parsed.testcase,
            temp_prefix,
        )?;
        Ok(outcome.severity >= min)
    }
}

/// Interesting when the process dies by a signal.
pub struct CrashesTest {
    ctx: TestContext,
}

impl InterestingnessTest for CrashesTest {
    fn name(&self) -> &str {
        "crashes"
    }

    fn interesting(&mut self, args: &[String], temp_prefix: &Path) -> Result<bool, InterestingError> {
        let parsed = TargetArgs::parse(self.name(), args)?;
        let timeout = parsed.timeout(self.name(), self.ctx.timeout)?;
        let mut run_args = parsed.flags.clone();
        run_args.push(parsed.testcase.to_string_lossy().into_owned());
        let result = self.ctx.executor.run(
            &parsed.binary,
            &run_args,
            timeout,
            &LogPaths::new(temp_prefix),
        )?;
        Ok(result.crashed())
    }
}

pub type TestFactory = Box<dyn Fn(&TestContext) -> Box<dyn InterestingnessTest> + Send + Sync>;

/// Wraps a constructor as a registry factory.
pub fn factory<T: InterestingnessTest + 'static>(make: fn(TestContext) -> T) -> TestFactory {
    Box::new(move |ctx: &TestContext| -> Box<dyn InterestingnessTest> { Box::new(make(ctx.clone())) })
}

/// Name-keyed table of interestingness tests.
pub struct TestRegistry {
    factories: BTreeMap<String, TestFactory>,
}

impl TestRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// `outcome`, `diff` and `crashes`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("outcome", factory(|ctx| OutcomeTest { ctx }));
        registry.register("diff", factory(|ctx| DiffTest { ctx }));
        registry.register("crashes", factory(|ctx| CrashesTest { ctx }));
        registry
    }

    /// Adds or replaces a test. Returns `true` if `name` was already taken.
    pub fn register(&mut self, name: &str, factory: TestFactory) -> bool {
        self.factories.insert(name.to_string(), factory).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(
        &self,
        name: &str,
        ctx: &TestContext,
    ) -> Result<Box<dyn InterestingnessTest>, InterestingError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| InterestingError::UnknownTest(name.to_string()))?;
        Ok(factory(ctx))
    }
}

impl Default for TestRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
