use crate::classifier::{Classifier, ClassifierError, ClassifyMode};
use crate::compare::{self, CompareError, Comparator};
use crate::config::ShrikeConfig;
use crate::executor::{Executor, ExecutorError};
use crate::interesting::TargetArgs;
use crate::logs::LogPaths;
use crate::reduce::{LithiumMinimizer, Minimizer, ReduceError, ReductionOrchestrator};
use crate::severity::Severity;
use crate::signature::{CrashInfo, SignatureDb};
use log::{debug, error, info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("run failed: {0}")]
    Executor(#[from] ExecutorError),
    #[error("classification failed: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("comparison failed: {0}")]
    Compare(#[from] CompareError),
    #[error("reduction failed: {0}")]
    Reduce(#[from] ReduceError),
    #[error("input generator failed: {message}")]
    Generator { message: String, raw_output: String },
    #[error("pipeline I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Produces one fuzz input per call.
pub trait InputGenerator {
    fn generate(&mut self, dest: &Path) -> Result<(), PipelineError>;
}

/// Runs an external generator. A `{}` argument is replaced by the output
/// path; without one, the generator's stdout becomes the input.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: Vec<String>,
}

impl CommandGenerator {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl InputGenerator for CommandGenerator {
    fn generate(&mut self, dest: &Path) -> Result<(), PipelineError> {
        let dest_str = dest.to_string_lossy();
        let Some((program, args)) = self.command.split_first() else {
            return Err(PipelineError::Generator {
                message: "no generator command configured".to_string(),
                raw_output: String::new(),
            });
        };
        let writes_file = args.iter().any(|a| a.contains("{}"));
        let args: Vec<String> = args.iter().map(|a| a.replace("{}", &dest_str)).collect();
        let output = Command::new(program).args(&args).output()?;
        if !output.status.success() {
            return Err(PipelineError::Generator {
                message: format!("{program} exited with {}", output.status),
                raw_output: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        if !writes_file {
            fs::write(dest, &output.stdout)?;
        }
        Ok(())
    }
}

/// Builds a minimizer for one finding, given the interestingness test name
/// and its arguments.
pub trait MinimizerFactory {
    fn minimizer(&self, test: &str, args: &TargetArgs) -> Result<Box<dyn Minimizer>, ReduceError>;
}

/// Hands the finding to the configured Lithium-compatible command, which
/// calls back into `oracle_command` to judge each candidate.
#[derive(Debug, Clone)]
pub struct LithiumFactory {
    command: Vec<String>,
    oracle_command: Vec<String>,
}

impl LithiumFactory {
    pub fn new(command: Vec<String>, oracle_command: Vec<String>) -> Self {
        Self {
            command,
            oracle_command,
        }
    }

    pub fn lithium(&self, test: &str, args: &TargetArgs) -> Result<LithiumMinimizer, ReduceError> {
        let mut oracle = self.oracle_command.clone();
        oracle.push(test.to_string());
        oracle.extend(args.to_args_without_testcase());
        LithiumMinimizer::new(self.command.clone(), oracle)
    }
}

impl MinimizerFactory for LithiumFactory {
    fn minimizer(&self, test: &str, args: &TargetArgs) -> Result<Box<dyn Minimizer>, ReduceError> {
        Ok(Box::new(self.lithium(test, args)?))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuzzStats {
    pub iterations: u64,
    pub interesting: u64,
    pub submitted: u64,
    pub submit_failures: u64,
    pub reduced: u64,
}

/// What one iteration found.
struct Verdict {
    severity: Severity,
    crash: CrashInfo,
    summary: Vec<String>,
    run_logs: Vec<LogPaths>,
}

/// One worker's fuzzing loop.
///
/// The deadline is only checked between iterations, so a run that is
/// already classifying or reducing finishes first.
pub struct FuzzLoop<'a> {
    config: &'a ShrikeConfig,
    binary: PathBuf,
    executor: &'a dyn Executor,
    classifier: &'a Classifier,
    submitter: &'a dyn SignatureDb,
    generator: Box<dyn InputGenerator + 'a>,
    minimizers: Option<Box<dyn MinimizerFactory + 'a>>,
    log_dir: PathBuf,
    rng: ChaCha8Rng,
}

impl<'a> FuzzLoop<'a> {
    pub fn new(
        config: &'a ShrikeConfig,
        binary: impl Into<PathBuf>,
        executor: &'a dyn Executor,
        classifier: &'a Classifier,
        submitter: &'a dyn SignatureDb,
        generator: Box<dyn InputGenerator + 'a>,
    ) -> Self {
        Self {
            config,
            binary: binary.into(),
            executor,
            classifier,
            submitter,
            generator,
            minimizers: None,
            log_dir: config.pipeline.log_dir.clone(),
            rng: ChaCha8Rng::seed_from_u64(config.pipeline.seed),
        }
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Seeds flag-set sampling; workers pass distinct seeds.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    pub fn with_minimizers(mut self, factory: Box<dyn MinimizerFactory + 'a>) -> Self {
        self.minimizers = Some(factory);
        self
    }

    /// Fuzzes until the time budget is spent or `max_iterations` ran.
    pub fn run(&mut self, max_iterations: Option<u64>) -> Result<FuzzStats, PipelineError> {
        fs::create_dir_all(&self.log_dir)?;
        let started = Instant::now();
        let budget = self.config.pipeline.time_budget();
        let mut stats = FuzzStats::default();

        loop {
            if budget.is_some_and(|b| started.elapsed() >= b) {
                info!("time budget spent after {} iterations", stats.iterations);
                break;
            }
            if max_iterations.is_some_and(|max| stats.iterations >= max) {
                break;
            }
            let iteration = stats.iterations;
            stats.iterations += 1;
            self.iterate(iteration, &mut stats)?;
        }

        info!(
            "outcome=fuzz-finished iterations={} interesting={} submitted={} reduced={}",
            stats.iterations, stats.interesting, stats.submitted, stats.reduced
        );
        Ok(stats)
    }

    fn iterate(&mut self, iteration: u64, stats: &mut FuzzStats) -> Result<(), PipelineError> {
        let prefix = self.log_dir.join(format!("i{iteration}"));
        let input = self.log_dir.join(format!("i{iteration}.js"));
        self.generator.generate(&input)?;

        let verdict = if self.config.pipeline.use_compare {
            self.compare(&input, &prefix)?
        } else {
            self.run_once(&input, &prefix)?
        };

        if !verdict.severity.is_interesting() {
            debug!("iteration {iteration} is {}, discarding", verdict.severity);
            for log in &verdict.run_logs {
                log.remove_all()?;
            }
            fs::remove_file(&input)?;
            return Ok(());
        }

        stats.interesting += 1;
        let logs = LogPaths::new(&prefix);
        logs.write_summary(&verdict.summary)?;
        if !verdict.crash.is_empty() {
            logs.write_crash(&verdict.crash.report_lines())?;
        }
        for log in verdict.run_logs.iter().chain(std::iter::once(&logs)) {
            log.cap_sizes(self.config.pipeline.max_log_bytes)?;
        }
        info!(
            "outcome=interesting iter={iteration} severity={} input={}",
            verdict.severity,
            input.display()
        );

        self.submit(&verdict, &input, stats);
        self.reduce(&input, verdict.severity, stats)?;
        Ok(())
    }

    fn run_once(&mut self, input: &Path, prefix: &Path) -> Result<Verdict, PipelineError> {
        let log = LogPaths::new(prefix);
        let mut args = self.config.pipeline.base_flags.clone();
        args.push(input.to_string_lossy().into_owned());
        let result = self
            .executor
            .run(&self.binary, &args, self.config.executor.timeout(), &log)?;
        let class = self.classifier.classify(&result, ClassifyMode::Driver)?;
        let repro = format!("{} {}", self.binary.display(), args.join(" "));
        Ok(Verdict {
            severity: class.severity,
            summary: class.summary_lines(&repro),
            crash: class.crash,
            run_logs: vec![log],
        })
    }

    fn compare(&mut self, input: &Path, prefix: &Path) -> Result<Verdict, PipelineError> {
        let settings = &self.config.compare;
        let candidates =
            compare::sample_flag_sets(&mut self.rng, &settings.flag_sets, settings.flag_sets_per_input);
        let comparator = Comparator::new(
            self.executor,
            self.classifier,
            settings,
            self.config.executor.timeout(),
        )?;
        let base = &self.config.pipeline.base_flags;
        let outcome = comparator.compare(&self.binary, base, &candidates, input, prefix)?;

        let mut summary = vec![format!("severity: {}", outcome.severity)];
        summary.extend(outcome.diff.iter().map(|line| format!("  {line}")));
        summary.push(format!(
            "reproduce: {} {} {}",
            self.binary.display(),
            base.join(" "),
            input.display()
        ));
        Ok(Verdict {
            severity: outcome.severity,
            crash: outcome.crash.unwrap_or_default(),
            summary,
            run_logs: (0..=candidates.len()).map(|i| compare::run_log(prefix, i)).collect(),
        })
    }

    fn submit(&self, verdict: &Verdict, input: &Path, stats: &mut FuzzStats) {
        if verdict.crash.is_empty() {
            return;
        }
        let mut metadata = BTreeMap::new();
        metadata.insert("severity".to_string(), verdict.severity.to_string());
        metadata.insert("binary".to_string(), self.binary.display().to_string());
        metadata.insert("flags".to_string(), self.config.pipeline.base_flags.join(" "));
        let quality = quality_score(input);
        match self.submitter.submit(&verdict.crash, input, quality, &metadata) {
            Ok(id) => {
                stats.submitted += 1;
                debug!("report {id} filed for {}", input.display());
            }
            Err(e) => {
                stats.submit_failures += 1;
                error!("outcome=submit-failed input={} error={}", input.display(), e);
            }
        }
    }

    fn reduce(&mut self, input: &Path, severity: Severity, stats: &mut FuzzStats) -> Result<(), PipelineError> {
        let Some(factory) = &self.minimizers else {
            return Ok(());
        };
        let test = if self.config.pipeline.use_compare {
            "diff"
        } else {
            "outcome"
        };
        let args = TargetArgs::new(&self.binary, self.config.pipeline.base_flags.clone(), input)
            .with_option("min-severity", severity.name());
        let mut minimizer = factory.minimizer(test, &args)?;
        let reduce_budget = self
            .config
            .reduce
            .time_budget_secs
            .map(std::time::Duration::from_secs);
        match ReductionOrchestrator::new(&self.config.reduce).reduce(input, minimizer.as_mut(), severity, reduce_budget) {
            Ok(report) => {
                stats.reduced += 1;
                debug!("reduction of {} ended {:?}", input.display(), report.outcome);
            }
            Err(e) => warn!("reduction of {} failed: {}", input.display(), e),
        }
        Ok(())
    }
}

/// Smaller testcases score higher.
fn quality_score(input: &Path) -> u32 {
    match fs::metadata(input) {
        Ok(meta) if meta.len() <= 1024 => 0,
        Ok(meta) if meta.len() <= 16 * 1024 => 5,
        _ => 10,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::crash_log::NullLocator;
    use crate::executor::ProcessExecutor;
    use crate::executor::test_support::write_script;
    use crate::reduce::{MinimizerStatus, Strategy};
    use crate::signature::{JsonSignatureDb, NoSignatureDb};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn lithium_factory_calls_back_through_oracle_command() {
        let factory = LithiumFactory::new(
            vec!["python3".to_string(), "-m".to_string(), "lithium".to_string()],
            vec!["/opt/bin/shrike".to_string(), "interesting".to_string()],
        );
        let args = TargetArgs::new("./js", vec!["--fuzzing-safe".to_string()], "t.js")
            .with_option("min-severity", "overall-mismatch");
        let argv = factory.lithium("diff", &args).unwrap().argv(Strategy::Lines, Path::new("t.js"));
        assert_eq!(
            argv,
            [
                "python3",
                "-m",
                "lithium",
                "--strategy=minimize",
                "/opt/bin/shrike",
                "interesting",
                "diff",
                "--min-severity=overall-mismatch",
                "./js",
                "--fuzzing-safe",
                "t.js",
            ]
        );
    }

    /// Cycles through fixed inputs.
    struct CannedInputs {
        inputs: Vec<&'static str>,
        next: usize,
    }

    impl InputGenerator for CannedInputs {
        fn generate(&mut self, dest: &Path) -> Result<(), PipelineError> {
            fs::write(dest, self.inputs[self.next % self.inputs.len()])?;
            self.next += 1;
            Ok(())
        }
    }

    struct RecordingFactory {
        calls: Rc<RefCell<Vec<Vec<String>>>>,
    }

    struct FinishingMinimizer;

    impl Minimizer for FinishingMinimizer {
        fn minimize(&mut self, _s: Strategy, _f: &Path) -> Result<MinimizerStatus, ReduceError> {
            Ok(MinimizerStatus::Finished)
        }
    }

    impl MinimizerFactory for RecordingFactory {
        fn minimizer(&self, test: &str, args: &TargetArgs) -> Result<Box<dyn Minimizer>, ReduceError> {
            let mut call = vec![test.to_string()];
            call.extend(args.to_args());
            self.calls.borrow_mut().push(call);
            Ok(Box::new(FinishingMinimizer))
        }
    }

    #[test]
    fn uninteresting_runs_are_cleaned_and_crashes_are_archived() {
        let dir = tempdir().unwrap();
        let engine = write_script(
            dir.path(),
            "js.sh",
            "if grep -q boom \"$1\"; then kill -SEGV $$; fi\necho \"It's looking good!\"",
        );
        let db_dir = dir.path().join("db");
        let db = JsonSignatureDb::open(&db_dir, 8).unwrap();
        let classifier = Classifier::new(
            Default::default(),
            Box::new(NullLocator),
            Arc::new(NoSignatureDb),
        );
        let executor = ProcessExecutor::default();
        let mut config = ShrikeConfig::default();
        config.pipeline.log_dir = dir.path().join("logs");
        let calls = Rc::new(RefCell::new(Vec::new()));

        let mut fuzz = FuzzLoop::new(
            &config,
            &engine,
            &executor,
            &classifier,
            &db,
            Box::new(CannedInputs {
                inputs: vec!["print(1)\n", "boom()\n"],
                next: 0,
            }),
        )
        .with_minimizers(Box::new(RecordingFactory {
            calls: calls.clone(),
        }));
        let stats = fuzz.run(Some(2)).unwrap();

        assert_eq!(
            stats,
            FuzzStats {
                iterations: 2,
                interesting: 1,
                submitted: 1,
                submit_failures: 0,
                reduced: 1,
            }
        );
        let logs = dir.path().join("logs");
        assert!(!logs.join("i0.js").exists());
        assert!(!logs.join("i0-out.txt").exists());
        assert!(logs.join("i1.js").exists());
        let summary = fs::read_to_string(logs.join("i1-summary.txt")).unwrap();
        assert!(summary.starts_with("severity: new-assert-or-crash"));
        assert!(summary.contains("browser crashed, no information"));
        assert!(logs.join("i1-crash.txt").exists());
        assert_eq!(fs::read_dir(db_dir.join("reports")).unwrap().count(), 1);

        let calls = calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], "outcome");
        assert_eq!(calls[0][1], "--min-severity=new-assert-or-crash");
    }

    #[test]
    fn compare_mode_reports_mismatches() {
        let dir = tempdir().unwrap();
        let engine = write_script(
            dir.path(),
            "js.sh",
            "for a in \"$@\"; do if [ \"$a\" = --no-threads ]; then echo 43; exit 0; fi; done\necho 42",
        );
        let classifier = Classifier::new(
            Default::default(),
            Box::new(NullLocator),
            Arc::new(NoSignatureDb),
        );
        let executor = ProcessExecutor::default();
        let mut config = ShrikeConfig::default();
        config.pipeline.log_dir = dir.path().join("logs");
        config.pipeline.use_compare = true;
        config.compare.flag_sets = vec![vec!["--no-threads".to_string()]];
        config.compare.flag_sets_per_input = 1;

        let mut fuzz = FuzzLoop::new(
            &config,
            &engine,
            &executor,
            &classifier,
            &NoSignatureDb,
            Box::new(CannedInputs {
                inputs: vec!["print(42)\n"],
                next: 0,
            }),
        );
        let stats = fuzz.run(Some(1)).unwrap();
        assert_eq!(stats.interesting, 1);
        assert_eq!(stats.submit_failures, 1);

        let summary = fs::read_to_string(dir.path().join("logs").join("i0-summary.txt")).unwrap();
        assert!(summary.starts_with("severity: overall-mismatch"));
        assert!(summary.contains("  -42\n  +43\n"));
    }

    #[test]
    fn spent_budget_stops_before_the_first_iteration() {
        let dir = tempdir().unwrap();
        let classifier = Classifier::new(
            Default::default(),
            Box::new(NullLocator),
            Arc::new(NoSignatureDb),
        );
        let executor = ProcessExecutor::default();
        let mut config = ShrikeConfig::default();
        config.pipeline.log_dir = dir.path().join("logs");
        config.pipeline.time_budget_secs = Some(0);
        let mut fuzz = FuzzLoop::new(
            &config,
            "/bin/true",
            &executor,
            &classifier,
            &NoSignatureDb,
            Box::new(CannedInputs {
                inputs: vec!["x"],
                next: 0,
            }),
        );
        assert_eq!(fuzz.run(None).unwrap().iterations, 0);
    }

    #[test]
    fn command_generator_uses_placeholder_or_stdout() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("in.js");
        let mut generator = CommandGenerator::new(vec!["sh".into(), "-c".into(), "echo 'a()' > \"$0\"".into(), "{}".into()]);
        generator.generate(&dest).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "a()\n");

        let mut generator = CommandGenerator::new(vec!["echo".into(), "b()".into()]);
        generator.generate(&dest).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "b()\n");

        assert!(matches!(
            CommandGenerator::new(vec![]).generate(&dest),
            Err(PipelineError::Generator { .. })
        ));
    }
}
