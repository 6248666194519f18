pub mod bisect;
pub mod build_cache;
pub mod classifier;
pub mod compare;
pub mod config;
pub mod crash_log;
pub mod detectors;
pub mod error;
pub mod executor;
pub mod interesting;
pub mod lock;
pub mod logs;
pub mod pipeline;
pub mod pool;
pub mod reduce;
pub mod severity;
pub mod signature;
pub mod vcs;

pub use bisect::{BisectOutcome, BisectReport, Bisector, ExitCodeOracle, InterestingnessOracle, ParentCheck, RevisionTester};
pub use build_cache::{BuildCache, BuildCacheError, BuildProvider, CacheEntry, CommandBuildProvider, ProviderError, RemoteTier};
pub use classifier::{Classification, Classifier, ClassifyMode, ExitVerdict};
pub use compare::{Comparator, Comparison};
pub use config::ShrikeConfig;
pub use crash_log::CrashLogLocator;
pub use error::TriageError;
pub use executor::{ExecutionResult, Executor, ProcessExecutor, ResourceLimits};
pub use interesting::{InterestingnessTest, TargetArgs, TestContext, TestRegistry};
pub use lock::DirLock;
pub use logs::LogPaths;
pub use pipeline::{FuzzLoop, FuzzStats};
pub use pool::WorkerPool;
pub use reduce::{LithiumMinimizer, Minimizer, ReduceOutcome, ReductionOrchestrator};
pub use severity::Severity;
pub use signature::{CrashInfo, JsonSignatureDb, RetryingSubmitter, SignatureDb};
pub use vcs::{GitBisect, LinearHistory, RevisionLabel, VcsBisect};
