use crate::config::ReduceSettings;
use crate::severity::Severity;
use log::{debug, info, warn};
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use thiserror::Error;

const RESULT_SENTINEL: &str = "Lithium result:";
const REGION_BEGIN: &str = "DDBEGIN";
const REGION_END: &str = "DDEND";
const SECOND_REGION_BEGIN: &str = "DDBEGIN2";
const SECOND_REGION_END: &str = "DDEND2";
const SPENT_REGION_SUFFIX: &str = "-DONE";

static COMPANION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([ \t]*)(count=\d+;)[ \t]*(\S)").expect("static companion regex")
});

#[derive(Error, Debug)]
pub enum ReduceError {
    #[error("minimizer protocol error: {message}")]
    Protocol { message: String, raw_output: String },
    #[error("minimizer command is empty")]
    EmptyCommand,
    #[error("failed to run minimizer {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("reduction I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The minimizer's closing verdict for one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinimizerStatus {
    Finished,
    NoRepro,
    PleaseContinue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOutcome {
    Finished,
    NoRepro,
    PleaseContinue,
    /// The minimizer broke protocol; the file was restored.
    Busted,
}

impl ReduceOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ReduceOutcome::Finished => "finished",
            ReduceOutcome::NoRepro => "no-repro",
            ReduceOutcome::PleaseContinue => "please-continue",
            ReduceOutcome::Busted => "busted",
        }
    }
}

impl From<MinimizerStatus> for ReduceOutcome {
    fn from(status: MinimizerStatus) -> Self {
        match status {
            MinimizerStatus::Finished => ReduceOutcome::Finished,
            MinimizerStatus::NoRepro => ReduceOutcome::NoRepro,
            MinimizerStatus::PleaseContinue => ReduceOutcome::PleaseContinue,
        }
    }
}

/// One pass of the reduction pipeline, in the order they are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Whole-file line reduction.
    Lines,
    /// Single lines, after splitting glued driver calls apart.
    SplitGlued,
    /// Line pairs, after moving companion statements onto their own line.
    CompanionPairs,
    CompanionPairsRepeat,
    Chars,
    /// Single lines inside the second marked region.
    SecondRegion,
    ClosingLines,
}

impl Strategy {
    pub const PIPELINE: [Strategy; 7] = [
        Strategy::Lines,
        Strategy::SplitGlued,
        Strategy::CompanionPairs,
        Strategy::CompanionPairsRepeat,
        Strategy::Chars,
        Strategy::SecondRegion,
        Strategy::ClosingLines,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Strategy::Lines => "lines",
            Strategy::SplitGlued => "split-glued",
            Strategy::CompanionPairs => "companion-pairs",
            Strategy::CompanionPairsRepeat => "companion-pairs-repeat",
            Strategy::Chars => "chars",
            Strategy::SecondRegion => "second-region",
            Strategy::ClosingLines => "closing-lines",
        }
    }

    /// Arguments handed to the minimizer for this pass.
    pub fn minimizer_args(self) -> Vec<String> {
        let args: &[&str] = match self {
            Strategy::Lines | Strategy::ClosingLines => &["--strategy=minimize"],
            Strategy::SplitGlued => &["--strategy=minimize", "--chunksize=1"],
            Strategy::CompanionPairs => &["--strategy=minimize", "--chunksize=2"],
            Strategy::CompanionPairsRepeat => {
                &["--strategy=minimize", "--chunksize=2", "--repeat=last"]
            }
            Strategy::Chars => &["--char", "--strategy=minimize"],
            Strategy::SecondRegion => &["--strategy=minimize", "--chunksize=1", "--repeat=last"],
        };
        args.iter().map(|a| a.to_string()).collect()
    }

    fn rewrite(self, text: &str, settings: &ReduceSettings) -> Option<String> {
        match self {
            Strategy::SplitGlued => Some(split_glued_statements(text, &settings.driver_call_marker)),
            Strategy::CompanionPairs => Some(isolate_companion_statement(text)),
            Strategy::SecondRegion => activate_second_region(text),
            _ => None,
        }
    }
}

/// Puts every driver call after a `;` on its own line so the minimizer can
/// remove each independently.
pub fn split_glued_statements(text: &str, marker: &str) -> String {
    if marker.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let indent_len = line.len() - line.trim_start().len();
        let indent = &line[..indent_len];
        let mut rest = line;
        let mut emitted = 0;
        while let Some(pos) = rest[emitted..].find(marker).map(|p| p + emitted) {
            let before = rest[..pos].trim_end();
            if before.ends_with(';') && !before.trim().is_empty() {
                out.push_str(before);
                out.push('\n');
                out.push_str(indent);
                rest = &rest[pos..];
                emitted = marker.len();
            } else {
                emitted = pos + marker.len();
            }
        }
        out.push_str(rest);
    }
    out
}

/// Moves a leading `count=N;` companion onto its own line.
pub fn isolate_companion_statement(text: &str) -> String {
    COMPANION_RE.replace_all(text, "$1$2\n$1$3").into_owned()
}

/// Retires the first `DDBEGIN`/`DDEND` region and promotes the
/// `DDBEGIN2`/`DDEND2` pair in its place. `None` if there is no second region.
pub fn activate_second_region(text: &str) -> Option<String> {
    if !text.contains(SECOND_REGION_BEGIN) || !text.contains(SECOND_REGION_END) {
        return None;
    }
    let rewritten = text
        .split_inclusive('\n')
        .map(|line| {
            if line.contains(SECOND_REGION_BEGIN) {
                line.replacen(SECOND_REGION_BEGIN, REGION_BEGIN, 1)
            } else if line.contains(SECOND_REGION_END) {
                line.replacen(SECOND_REGION_END, REGION_END, 1)
            } else if line.contains(REGION_BEGIN) && !line.contains(SPENT_REGION_SUFFIX) {
                line.replacen(REGION_BEGIN, &format!("{REGION_BEGIN}{SPENT_REGION_SUFFIX}"), 1)
            } else if line.contains(REGION_END) && !line.contains(SPENT_REGION_SUFFIX) {
                line.replacen(REGION_END, &format!("{REGION_END}{SPENT_REGION_SUFFIX}"), 1)
            } else {
                line.to_string()
            }
        })
        .collect();
    Some(rewritten)
}

/// Reads the closing `Lithium result:` line of a minimizer transcript.
pub fn parse_minimizer_output(raw: &str) -> Result<MinimizerStatus, ReduceError> {
    let verdict = raw
        .lines()
        .rev()
        .find_map(|line| line.split_once(RESULT_SENTINEL).map(|(_, v)| v.trim().to_lowercase()));
    match verdict {
        Some(v) if v.starts_with("succeeded") => Ok(MinimizerStatus::Finished),
        Some(v) if v.contains("please continue") => Ok(MinimizerStatus::PleaseContinue),
        Some(v) if v.contains("not interesting") || v.contains("not 'interesting'") => {
            Ok(MinimizerStatus::NoRepro)
        }
        Some(v) => Err(ReduceError::Protocol {
            message: format!("unknown minimizer result '{v}'"),
            raw_output: raw.to_string(),
        }),
        None => Err(ReduceError::Protocol {
            message: "minimizer printed no result line".to_string(),
            raw_output: raw.to_string(),
        }),
    }
}

/// The external minimizer, invoked once per strategy on the file in place.
pub trait Minimizer {
    fn minimize(&mut self, strategy: Strategy, file: &Path) -> Result<MinimizerStatus, ReduceError>;
}

/// Runs a Lithium-compatible minimizer as a subprocess:
/// `<command...> <strategy args...> <oracle...> <file>`.
#[derive(Debug, Clone)]
pub struct LithiumMinimizer {
    command: Vec<String>,
    oracle: Vec<String>,
}

impl LithiumMinimizer {
    /// `oracle` is the interestingness test name and its arguments, minus
    /// the testcase path.
    pub fn new(command: Vec<String>, oracle: Vec<String>) -> Result<Self, ReduceError> {
        if command.is_empty() {
            return Err(ReduceError::EmptyCommand);
        }
        Ok(Self { command, oracle })
    }

    pub fn argv(&self, strategy: Strategy, file: &Path) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.extend(strategy.minimizer_args());
        argv.extend(self.oracle.iter().cloned());
        argv.push(file.to_string_lossy().into_owned());
        argv
    }
}

impl Minimizer for LithiumMinimizer {
    fn minimize(&mut self, strategy: Strategy, file: &Path) -> Result<MinimizerStatus, ReduceError> {
        let argv = self.argv(strategy, file);
        debug!("running minimizer: {}", argv.join(" "));
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .map_err(|source| ReduceError::Spawn {
                command: argv[0].clone(),
                source,
            })?;
        let mut raw = String::from_utf8_lossy(&output.stdout).into_owned();
        raw.push_str(&String::from_utf8_lossy(&output.stderr));
        parse_minimizer_output(&raw)
    }
}

/// Working state of one reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReductionState {
    pub current: PathBuf,
    pub backup: PathBuf,
    pub strategy_index: usize,
    pub last_good_size: u64,
}

impl ReductionState {
    fn new(current: &Path) -> Result<Self, ReduceError> {
        let mut backup = current.as_os_str().to_owned();
        backup.push(".shrike-backup");
        let state = Self {
            current: current.to_path_buf(),
            backup: PathBuf::from(backup),
            strategy_index: 0,
            last_good_size: fs::metadata(current)?.len(),
        };
        state.snapshot()?;
        Ok(state)
    }

    fn snapshot(&self) -> io::Result<()> {
        fs::copy(&self.current, &self.backup).map(|_| ())
    }

    fn restore(&self) -> io::Result<()> {
        fs::copy(&self.backup, &self.current).map(|_| ())
    }

    fn discard_backup(&self) {
        if let Err(e) = fs::remove_file(&self.backup) {
            warn!("failed to remove reduction backup {:?}: {}", self.backup, e);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub strategy: Strategy,
    pub outcome: ReduceOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReductionReport {
    pub outcome: ReduceOutcome,
    pub steps: Vec<StepRecord>,
    pub original_size: u64,
    pub final_size: u64,
    /// Protocol diagnostics when the outcome is `Busted`.
    pub details: Option<String>,
}

/// Drives the strategy pipeline against a [`Minimizer`].
pub struct ReductionOrchestrator<'a> {
    settings: &'a ReduceSettings,
}

impl<'a> ReductionOrchestrator<'a> {
    pub fn new(settings: &'a ReduceSettings) -> Self {
        Self { settings }
    }

    /// Shrinks `input` in place.
    ///
    /// # Arguments
    /// * `input`: The testcase; rewritten by the minimizer.
    /// * `minimizer`: Runs one strategy and reports its closing status.
    /// * `target`: The severity the testcase must keep; gates the
    ///   driver-specific and character-level passes.
    /// * `time_budget`: When set, disables the character pass and stops the
    ///   pipeline with `PleaseContinue` once exceeded.
    ///
    /// # Returns
    /// A report whose outcome is the status of the last pass that ran. On
    /// anything but `Finished` or `PleaseContinue` the file is restored to
    /// the last snapshot taken after a finished pass.
    pub fn reduce(
        &self,
        input: &Path,
        minimizer: &mut dyn Minimizer,
        target: Severity,
        time_budget: Option<Duration>,
    ) -> Result<ReductionReport, ReduceError> {
        let started = Instant::now();
        let mut state = ReductionState::new(input)?;
        let original_size = state.last_good_size;
        let mut steps = Vec::new();
        let mut outcome = ReduceOutcome::Finished;
        let mut details = None;

        for (index, strategy) in Strategy::PIPELINE.iter().copied().enumerate() {
            state.strategy_index = index;
            if index > 0 {
                if time_budget.is_some_and(|budget| started.elapsed() >= budget) {
                    debug!("time budget spent before {}", strategy.name());
                    outcome = ReduceOutcome::PleaseContinue;
                    break;
                }
                let text = fs::read_to_string(&state.current)?;
                if let Some(reason) = self.skip_reason(strategy, &text, target, time_budget) {
                    debug!("skipping {}: {}", strategy.name(), reason);
                    continue;
                }
            }

            match self.run_step(strategy, &state, minimizer) {
                Ok(status) => outcome = status.into(),
                Err(ReduceError::Protocol {
                    message,
                    raw_output,
                }) => {
                    warn!("strategy {} broke protocol: {}", strategy.name(), message);
                    outcome = ReduceOutcome::Busted;
                    details = Some(format!("{message}\n{raw_output}"));
                }
                Err(e) => {
                    if let Err(restore_err) = state.restore() {
                        warn!("failed to restore {:?}: {}", state.current, restore_err);
                    }
                    return Err(e);
                }
            }
            steps.push(StepRecord { strategy, outcome });

            match outcome {
                ReduceOutcome::Finished => {
                    state.snapshot()?;
                    state.last_good_size = fs::metadata(&state.current)?.len();
                }
                ReduceOutcome::PleaseContinue => break,
                ReduceOutcome::NoRepro | ReduceOutcome::Busted => {
                    state.restore()?;
                    break;
                }
            }
        }

        state.discard_backup();
        let final_size = fs::metadata(&state.current)?.len();
        info!(
            "outcome=reduce-{} file={} bytes={}->{} steps={}",
            outcome.as_str(),
            input.display(),
            original_size,
            final_size,
            steps.len()
        );
        Ok(ReductionReport {
            outcome,
            steps,
            original_size,
            final_size,
            details,
        })
    }

    fn run_step(
        &self,
        strategy: Strategy,
        state: &ReductionState,
        minimizer: &mut dyn Minimizer,
    ) -> Result<MinimizerStatus, ReduceError> {
        if let Some(rewritten) = strategy.rewrite(&fs::read_to_string(&state.current)?, self.settings) {
            fs::write(&state.current, rewritten)?;
        }
        debug!("reducing {:?} with strategy {}", state.current, strategy.name());
        minimizer.minimize(strategy, &state.current)
    }

    fn skip_reason(
        &self,
        strategy: Strategy,
        text: &str,
        target: Severity,
        time_budget: Option<Duration>,
    ) -> Option<&'static str> {
        if text.lines().count() > self.settings.short_file_lines {
            return Some("file is not short");
        }
        let from_driver = text.contains(self.settings.driver_call_marker.as_str());
        match strategy {
            Strategy::SplitGlued | Strategy::CompanionPairs | Strategy::CompanionPairsRepeat => {
                if !from_driver {
                    Some("not a fuzz driver testcase")
                } else if target < Severity::ValgrindAmiss {
                    Some("target severity too low")
                } else {
                    None
                }
            }
            Strategy::Chars => {
                if time_budget.is_some() {
                    Some("time budget set")
                } else if target < Severity::OverallMismatch {
                    Some("target severity too low")
                } else if self
                    .settings
                    .char_unsafe_markers
                    .iter()
                    .any(|m| text.contains(m.as_str()))
                {
                    Some("feature detection makes char reduction unsafe")
                } else {
                    None
                }
            }
            Strategy::SecondRegion => (!text.contains(SECOND_REGION_BEGIN)).then_some("no second region"),
            Strategy::Lines | Strategy::ClosingLines => None,
        }
    }
}
