use shrike_core::bisect::{Bisector, ExitCodeOracle, InterestingnessOracle, RevisionTester};
use shrike_core::build_cache::{BuildCache, CommandBuildProvider};
use shrike_core::classifier::{Classifier, ClassifyMode};
use shrike_core::compare::Comparator;
use shrike_core::config::{ShrikeConfig, days};
use shrike_core::crash_log;
use shrike_core::executor::{Executor, ProcessExecutor, ResourceLimits};
use shrike_core::interesting::{TargetArgs, TestContext, TestRegistry};
use shrike_core::logs::LogPaths;
use shrike_core::pipeline::{CommandGenerator, FuzzLoop, LithiumFactory, MinimizerFactory};
use shrike_core::pool::{self, WorkerPool};
use shrike_core::reduce::ReductionOrchestrator;
use shrike_core::severity::Severity;
use shrike_core::signature::{JsonSignatureDb, NoSignatureDb, RetryingSubmitter, SignatureDb};
use shrike_core::vcs::GitBisect;

use clap::{Parser, Subcommand};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG: &str = "shrike.toml";
const SUBMIT_ATTEMPTS: u32 = 5;
const SUBMIT_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser, global = true)]
    config_file: Option<PathBuf>,
    /// Debug-level logging unless RUST_LOG says otherwise.
    #[clap(short, long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one testcase and print its severity and issues.
    Classify {
        /// Skip the fuzz-driver completion heuristic.
        #[clap(long)]
        wrapped: bool,
        /// <binary> [flags...] <testcase>
        #[clap(required = true, num_args = 2.., trailing_var_arg = true, allow_hyphen_values = true)]
        target: Vec<String>,
    },
    /// Diff a testcase's output across engine flag-sets.
    Compare {
        /// Candidate flag-set, space separated. Repeatable; defaults to the configured pool.
        #[clap(long = "candidate")]
        candidates: Vec<String>,
        #[clap(required = true, num_args = 2.., trailing_var_arg = true, allow_hyphen_values = true)]
        target: Vec<String>,
    },
    /// Shrink a testcase while it keeps at least the given severity.
    Reduce {
        #[clap(long, default_value = "new-assert-or-crash")]
        min_severity: Severity,
        /// Interestingness test handed to the minimizer.
        #[clap(long, default_value = "outcome")]
        test: String,
        #[clap(required = true, num_args = 2.., trailing_var_arg = true, allow_hyphen_values = true)]
        target: Vec<String>,
    },
    /// Find the first revision on which a testcase is interesting.
    Bisect {
        #[clap(long)]
        repo: PathBuf,
        #[clap(long)]
        start: String,
        #[clap(long)]
        end: String,
        #[clap(long, default_value = "default")]
        configuration: String,
        /// Interestingness test; without one, revisions are labelled by exit status.
        #[clap(long)]
        test: Option<String>,
        #[clap(long)]
        min_severity: Option<Severity>,
        /// Write the JSON report here.
        #[clap(long)]
        report: Option<PathBuf>,
        /// [flags...] <testcase>; the binary comes from the build cache.
        #[clap(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        target: Vec<String>,
    },
    /// Start a pool of fuzzing workers.
    Fuzz {
        binary: PathBuf,
        #[clap(short, long)]
        iterations: Option<u64>,
    },
    /// One fuzzing worker. Normally spawned by `fuzz`.
    Worker {
        binary: PathBuf,
        #[clap(long)]
        log_dir: Option<PathBuf>,
        #[clap(long, default_value_t = 0)]
        worker_index: u64,
        #[clap(short, long)]
        iterations: Option<u64>,
    },
    /// Run an interestingness test; exits 0 when interesting, 1 when not.
    Interesting {
        name: String,
        #[clap(long)]
        temp_prefix: Option<PathBuf>,
        #[clap(num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Remove build cache entries older than the configured age.
    Evict {
        #[clap(long)]
        max_age_days: Option<u64>,
    },
}

fn load_config(path: Option<&Path>) -> Result<ShrikeConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            ShrikeConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG);
            if default_config_path.exists() {
                info!("No config file specified, loading default: {default_config_path:?}");
                ShrikeConfig::load_from_file(&default_config_path)
            } else {
                info!("No config file specified and '{DEFAULT_CONFIG}' not found, using built-in defaults.");
                Ok(ShrikeConfig::default())
            }
        }
    }
}

/// The signature database shared by classification and submission.
fn signature_db(config: &ShrikeConfig) -> Result<Arc<dyn SignatureDb>, anyhow::Error> {
    Ok(match &config.pipeline.signature_db_dir {
        Some(dir) => {
            let db = JsonSignatureDb::open(dir, config.classifier.signature_frames)?;
            Arc::new(RetryingSubmitter::new(db, SUBMIT_ATTEMPTS, SUBMIT_BASE_DELAY))
        }
        None => Arc::new(NoSignatureDb),
    })
}

struct Services {
    executor: Arc<dyn Executor>,
    classifier: Arc<Classifier>,
    db: Arc<dyn SignatureDb>,
}

impl Services {
    fn new(config: &ShrikeConfig) -> Result<Self, anyhow::Error> {
        let cwd = std::env::current_dir()?;
        let db = signature_db(config)?;
        let classifier = Classifier::new(
            config.classifier.clone(),
            crash_log::platform_locator(&cwd),
            db.clone(),
        );
        Ok(Self {
            executor: Arc::new(ProcessExecutor::new(ResourceLimits::from(&config.executor))),
            classifier: Arc::new(classifier),
            db,
        })
    }

    fn test_context(&self, config: &ShrikeConfig) -> TestContext {
        TestContext {
            executor: self.executor.clone(),
            classifier: self.classifier.clone(),
            compare: config.compare.clone(),
            timeout: config.executor.timeout(),
        }
    }
}

fn parse_target(command: &str, target: &[String]) -> Result<TargetArgs, anyhow::Error> {
    Ok(TargetArgs::parse(command, target)?)
}

/// How the minimizer calls back into the test registry.
fn oracle_command(config: &ShrikeConfig, config_file: Option<&Path>) -> Result<Vec<String>, anyhow::Error> {
    if !config.reduce.oracle_command.is_empty() {
        return Ok(config.reduce.oracle_command.clone());
    }
    let mut command = vec![std::env::current_exe()?.to_string_lossy().into_owned()];
    if let Some(path) = config_file {
        command.push("--config-file".to_string());
        command.push(path.to_string_lossy().into_owned());
    }
    command.push("interesting".to_string());
    Ok(command)
}

fn scratch_prefix(config: &ShrikeConfig, name: &str) -> Result<PathBuf, anyhow::Error> {
    fs::create_dir_all(&config.pipeline.log_dir)?;
    Ok(config.pipeline.log_dir.join(name))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, anyhow::Error> {
    let config = load_config(cli.config_file.as_deref())?;
    let services = Services::new(&config)?;

    match cli.command {
        Commands::Classify { wrapped, target } => {
            let target = parse_target("classify", &target)?;
            let log = LogPaths::new(scratch_prefix(&config, "classify")?);
            let mut args = target.flags.clone();
            args.push(target.testcase.to_string_lossy().into_owned());
            let result = services
                .executor
                .run(&target.binary, &args, config.executor.timeout(), &log)?;
            let mode = if wrapped {
                ClassifyMode::Wrapped
            } else {
                ClassifyMode::Driver
            };
            let class = services.classifier.classify(&result, mode)?;
            let repro = format!("{} {}", target.binary.display(), args.join(" "));
            for line in class.summary_lines(&repro) {
                println!("{line}");
            }
            info!("outcome=classified severity={} exit={:?}", class.severity, class.exit);
            Ok(severity_exit(class.severity))
        }
        Commands::Compare { candidates, target } => {
            let target = parse_target("compare", &target)?;
            let candidates: Vec<Vec<String>> = if candidates.is_empty() {
                config.compare.flag_sets.clone()
            } else {
                candidates
                    .iter()
                    .map(|c| c.split_whitespace().map(String::from).collect())
                    .collect()
            };
            let comparator = Comparator::new(
                services.executor.as_ref(),
                services.classifier.as_ref(),
                &config.compare,
                config.executor.timeout(),
            )?;
            let outcome = comparator.compare(
                &target.binary,
                &target.flags,
                &candidates,
                &target.testcase,
                &scratch_prefix(&config, "compare")?,
            )?;
            println!("severity: {}", outcome.severity);
            for line in &outcome.diff {
                println!("  {line}");
            }
            info!(
                "outcome=compared severity={} compared={} discarded={}",
                outcome.severity, outcome.compared, outcome.discarded
            );
            Ok(severity_exit(outcome.severity))
        }
        Commands::Reduce {
            min_severity,
            test,
            target,
        } => {
            let target = parse_target("reduce", &target)?.with_option("min-severity", min_severity.name());
            let factory = LithiumFactory::new(
                config.reduce.minimizer_command.clone(),
                oracle_command(&config, cli.config_file.as_deref())?,
            );
            let mut minimizer = factory.minimizer(&test, &target)?;
            let budget = config.reduce.time_budget_secs.map(Duration::from_secs);
            let report = ReductionOrchestrator::new(&config.reduce).reduce(
                &target.testcase,
                minimizer.as_mut(),
                min_severity,
                budget,
            )?;
            println!(
                "{}: {} -> {} bytes",
                report.outcome.as_str(),
                report.original_size,
                report.final_size
            );
            if let Some(details) = &report.details {
                warn!("minimizer output:\n{details}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Bisect {
            repo,
            start,
            end,
            configuration,
            test,
            min_severity,
            report,
            target,
        } => {
            let (testcase, flags) = target
                .split_last()
                .ok_or_else(|| anyhow::anyhow!("bisect needs a testcase"))?;
            let cache = BuildCache::new(
                &config.build_cache,
                Box::new(CommandBuildProvider::new(config.build_cache.build_command.clone())),
            );
            let scratch = scratch_prefix(&config, "bisect")?;
            let mut oracle: Box<dyn RevisionTester + '_> = match test {
                Some(test) => {
                    let mut args = TargetArgs::new(PathBuf::new(), flags.to_vec(), testcase);
                    if let Some(min) = min_severity {
                        args = args.with_option("min-severity", min.name());
                    }
                    let registry = TestRegistry::with_builtins();
                    let mut test = registry.create(&test, &services.test_context(&config))?;
                    test.init(&TargetArgs { binary: PathBuf::from("js"), ..args.clone() }.to_args())?;
                    Box::new(InterestingnessOracle::new(
                        &cache,
                        configuration,
                        test,
                        args,
                        &config.bisect,
                        scratch,
                    ))
                }
                None => Box::new(ExitCodeOracle::new(
                    &cache,
                    configuration,
                    services.executor.as_ref(),
                    &config.classifier,
                    flags.to_vec(),
                    testcase,
                    config.executor.timeout(),
                    &config.bisect,
                    scratch,
                )),
            };
            let mut vcs = GitBisect::new(&repo);
            let outcome = Bisector::new(&mut vcs, oracle.as_mut(), &config.bisect)
                .with_working_copy_lock(&repo)
                .run(&start, &end)?;
            println!("{}", outcome.summary());
            if let Some(path) = report {
                outcome.write_json(&path)?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Fuzz { binary, iterations } => {
            let exe = std::env::current_exe()?;
            let mut base_args = Vec::new();
            if let Some(path) = &cli.config_file {
                base_args.push("--config-file".to_string());
                base_args.push(path.to_string_lossy().into_owned());
            }
            base_args.push("worker".to_string());
            base_args.push(binary.to_string_lossy().into_owned());
            if let Some(n) = iterations {
                base_args.push(format!("--iterations={n}"));
            }
            let size = pool::pool_size(&config.pool);
            let exits = WorkerPool::new(exe, base_args, &config.pipeline.log_dir, size).run()?;
            for exit in &exits {
                println!("worker {} exited with {} (logs in {})", exit.index, exit.status, exit.log_dir.display());
            }
            Ok(if exits.iter().all(|e| e.status == 0) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Worker {
            binary,
            log_dir,
            worker_index,
            iterations,
        } => {
            let generator = CommandGenerator::new(config.pipeline.generator_command.clone());
            let mut fuzz = FuzzLoop::new(
                &config,
                binary,
                services.executor.as_ref(),
                services.classifier.as_ref(),
                services.db.as_ref(),
                Box::new(generator),
            )
            .with_seed(config.pipeline.seed.wrapping_add(worker_index))
            .with_minimizers(Box::new(LithiumFactory::new(
                config.reduce.minimizer_command.clone(),
                oracle_command(&config, cli.config_file.as_deref())?,
            )));
            if let Some(dir) = log_dir {
                fuzz = fuzz.with_log_dir(dir);
            }
            let stats = fuzz.run(iterations)?;
            println!(
                "iterations={} interesting={} submitted={} reduced={}",
                stats.iterations, stats.interesting, stats.submitted, stats.reduced
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Interesting {
            name,
            temp_prefix,
            args,
        } => {
            let registry = TestRegistry::with_builtins();
            let mut test = registry.create(&name, &services.test_context(&config))?;
            test.init(&args)?;
            let prefix = match temp_prefix {
                Some(prefix) => prefix,
                None => scratch_prefix(&config, &format!("interesting-{name}"))?,
            };
            let interesting = test.interesting(&args, &prefix)?;
            println!("{}", if interesting { "interesting" } else { "not interesting" });
            Ok(if interesting {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Evict { max_age_days } => {
            let max_age = max_age_days
                .map(days)
                .unwrap_or_else(|| config.build_cache.max_age());
            let cache = BuildCache::new(
                &config.build_cache,
                Box::new(CommandBuildProvider::new(config.build_cache.build_command.clone())),
            );
            let evicted = cache.evict_all(max_age)?;
            for path in &evicted {
                println!("evicted {}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// 0 for uninteresting, 1 for interesting.
fn severity_exit(severity: Severity) -> ExitCode {
    if severity.is_interesting() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
