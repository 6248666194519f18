use crate::vcs::RevisionLabel;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Address-space cap applied to the child, in bytes.
    #[serde(default)]
    pub address_space_bytes: Option<u64>,
    /// Core-file size cap applied to the child, in bytes.
    #[serde(default)]
    pub core_file_bytes: Option<u64>,
}

fn default_timeout_secs() -> u64 {
    10
}

impl ExecutorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            address_space_bytes: None,
            core_file_bytes: None,
        }
    }
}

/// Engine-specific thresholds and strings consumed by the classifier.
///
/// The defaults are the values the SpiderMonkey shell has historically
/// needed; none of them is derived from a documented invariant.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ClassifierSettings {
    /// Past this many assertion firings a timeout is expected, not a hang.
    #[serde(default = "default_assertion_hang_threshold")]
    pub assertion_hang_threshold: usize,
    /// Substrings that turn exit code 1 or 2 into "unsupported flag".
    #[serde(default = "default_usage_substrings")]
    pub usage_substrings: Vec<String>,
    #[serde(default = "default_controlled_error_min")]
    pub controlled_error_min: i32,
    #[serde(default = "default_controlled_error_max")]
    pub controlled_error_max: i32,
    #[serde(default)]
    pub watch_exit_code: Option<i32>,
    /// Assertion messages that are known and must not be reported again.
    #[serde(default)]
    pub known_assertions: Vec<String>,
    #[serde(default)]
    pub deterministic_build: bool,
    #[serde(default = "default_looking_good_sentinel")]
    pub looking_good_sentinel: String,
    #[serde(default = "default_decided_to_exit_sentinel")]
    pub decided_to_exit_sentinel: String,
    #[serde(default = "default_signature_frames")]
    pub signature_frames: usize,
}

fn default_assertion_hang_threshold() -> usize {
    100
}
fn default_usage_substrings() -> Vec<String> {
    vec![
        "usage:".to_string(),
        "Unrecognized".to_string(),
        "Invalid".to_string(),
    ]
}
fn default_controlled_error_min() -> i32 {
    3
}
fn default_controlled_error_max() -> i32 {
    6
}
fn default_looking_good_sentinel() -> String {
    "It's looking good!".to_string()
}
fn default_decided_to_exit_sentinel() -> String {
    "decided to exit".to_string()
}
fn default_signature_frames() -> usize {
    8
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            assertion_hang_threshold: default_assertion_hang_threshold(),
            usage_substrings: default_usage_substrings(),
            controlled_error_min: default_controlled_error_min(),
            controlled_error_max: default_controlled_error_max(),
            watch_exit_code: None,
            known_assertions: Vec::new(),
            deterministic_build: false,
            looking_good_sentinel: default_looking_good_sentinel(),
            decided_to_exit_sentinel: default_decided_to_exit_sentinel(),
            signature_frames: default_signature_frames(),
        }
    }
}

/// A divergence that is expected when `flag` is on only one side.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LegitimateDivergence {
    pub flag: String,
    pub message: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CompareSettings {
    /// Pool of candidate flag-sets sampled for each input.
    #[serde(default = "default_flag_sets")]
    pub flag_sets: Vec<Vec<String>>,
    #[serde(default = "default_flag_sets_per_input")]
    pub flag_sets_per_input: usize,
    /// Lines matching any of these regexes are per-run noise.
    #[serde(default = "default_noise_patterns")]
    pub noise_patterns: Vec<String>,
    #[serde(default = "default_legitimate_divergences")]
    pub legitimate_divergences: Vec<LegitimateDivergence>,
}

fn default_flag_sets() -> Vec<Vec<String>> {
    vec![
        vec!["--fuzzing-safe".to_string(), "--no-threads".to_string()],
        vec!["--fuzzing-safe".to_string(), "--no-ion".to_string()],
        vec!["--fuzzing-safe".to_string(), "--no-baseline".to_string(), "--no-ion".to_string()],
        vec!["--fuzzing-safe".to_string(), "--ion-eager".to_string()],
    ]
}
fn default_flag_sets_per_input() -> usize {
    3
}
fn default_noise_patterns() -> Vec<String> {
    vec![r"^==\d+==".to_string(), r"\bpid \d+\b".to_string()]
}
fn default_legitimate_divergences() -> Vec<LegitimateDivergence> {
    vec![LegitimateDivergence {
        flag: "--no-wasm".to_string(),
        message: "WebAssembly is not supported".to_string(),
    }]
}

impl Default for CompareSettings {
    fn default() -> Self {
        Self {
            flag_sets: default_flag_sets(),
            flag_sets_per_input: default_flag_sets_per_input(),
            noise_patterns: default_noise_patterns(),
            legitimate_divergences: default_legitimate_divergences(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReduceSettings {
    #[serde(default = "default_minimizer_command")]
    pub minimizer_command: Vec<String>,
    /// Command the minimizer calls back with the test name and arguments.
    /// Empty means this executable's `interesting` subcommand.
    #[serde(default)]
    pub oracle_command: Vec<String>,
    #[serde(default = "default_short_file_lines")]
    pub short_file_lines: usize,
    #[serde(default = "default_driver_call_marker")]
    pub driver_call_marker: String,
    /// Feature-detection calls that make character-level reduction unsafe.
    #[serde(default = "default_char_unsafe_markers")]
    pub char_unsafe_markers: Vec<String>,
    #[serde(default)]
    pub time_budget_secs: Option<u64>,
}

fn default_minimizer_command() -> Vec<String> {
    vec!["python3".to_string(), "-m".to_string(), "lithium".to_string()]
}
fn default_short_file_lines() -> usize {
    50
}
fn default_driver_call_marker() -> String {
    "tryItOut(".to_string()
}
fn default_char_unsafe_markers() -> Vec<String> {
    vec!["isAsmJSCompilationAvailable".to_string()]
}

impl Default for ReduceSettings {
    fn default() -> Self {
        Self {
            minimizer_command: default_minimizer_command(),
            oracle_command: Vec::new(),
            short_file_lines: default_short_file_lines(),
            driver_call_marker: default_driver_call_marker(),
            char_unsafe_markers: default_char_unsafe_markers(),
            time_budget_secs: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BisectSettings {
    #[serde(default)]
    pub test_initial_revs: bool,
    /// Label given to a revision whose artifact cannot be produced.
    #[serde(default = "default_build_failure_label")]
    pub build_failure_label: RevisionLabel,
    #[serde(default = "default_skip_cap")]
    pub skip_cap: usize,
    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,
}

fn default_build_failure_label() -> RevisionLabel {
    RevisionLabel::Skip
}
fn default_skip_cap() -> usize {
    20
}

impl Default for BisectSettings {
    fn default() -> Self {
        Self {
            test_initial_revs: false,
            build_failure_label: default_build_failure_label(),
            skip_cap: default_skip_cap(),
            lock_poll_ms: default_lock_poll_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BuildCacheSettings {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,
    /// Build command template; `{configuration}`, `{revision}` and `{dest}`
    /// are substituted. The last stdout line names the artifact.
    #[serde(default)]
    pub build_command: Vec<String>,
}

pub fn default_cache_dir() -> PathBuf {
    PathBuf::from("./.shrike_builds")
}
fn default_max_age_days() -> u64 {
    30
}
fn default_lock_poll_ms() -> u64 {
    500
}

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// `days` as a duration, saturating for absurdly large values.
pub fn days(days: u64) -> Duration {
    Duration::from_secs(days.saturating_mul(SECS_PER_DAY))
}

impl BuildCacheSettings {
    pub fn max_age(&self) -> Duration {
        days(self.max_age_days)
    }
}

impl Default for BuildCacheSettings {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_age_days: default_max_age_days(),
            lock_poll_ms: default_lock_poll_ms(),
            build_command: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    /// Overrides the CPU-derived pool size.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub memory_hungry: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PipelineSettings {
    #[serde(default)]
    pub time_budget_secs: Option<u64>,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: u64,
    /// Produces one input file per call; `{}` is replaced by the output path.
    #[serde(default)]
    pub generator_command: Vec<String>,
    #[serde(default)]
    pub base_flags: Vec<String>,
    #[serde(default)]
    pub use_compare: bool,
    #[serde(default)]
    pub signature_db_dir: Option<PathBuf>,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

pub fn default_log_dir() -> PathBuf {
    PathBuf::from("./.shrike_logs")
}
fn default_max_log_bytes() -> u64 {
    1024 * 1024
}
fn default_seed() -> u64 {
    0
}

impl PipelineSettings {
    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget_secs.map(Duration::from_secs)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            time_budget_secs: None,
            log_dir: default_log_dir(),
            max_log_bytes: default_max_log_bytes(),
            generator_command: Vec::new(),
            base_flags: Vec::new(),
            use_compare: false,
            signature_db_dir: None,
            seed: default_seed(),
        }
    }
}

/// The immutable configuration threaded through every component.
///
/// Built once per pipeline invocation. Changing the engine under test means
/// building a new value, never mutating this one.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ShrikeConfig {
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub classifier: ClassifierSettings,
    #[serde(default)]
    pub compare: CompareSettings,
    #[serde(default)]
    pub reduce: ReduceSettings,
    #[serde(default)]
    pub bisect: BisectSettings,
    #[serde(default)]
    pub build_cache: BuildCacheSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

impl ShrikeConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        Self::from_toml_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
