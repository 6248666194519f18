use crate::classifier::{Classification, Classifier, ClassifierError, ClassifyMode};
use crate::config::{CompareSettings, LegitimateDivergence};
use crate::executor::{ExecutionResult, Executor, ExecutorError};
use crate::logs::LogPaths;
use crate::severity::Severity;
use crate::signature::CrashInfo;
use log::{debug, info};
use rand::Rng;
use rand::seq::IndexedRandom;
use regex::Regex;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Above this many cells the diff falls back to a block replacement.
const MAX_LCS_CELLS: usize = 4_000_000;

#[derive(Error, Debug)]
pub enum CompareError {
    #[error("run failed: {0}")]
    Executor(#[from] ExecutorError),
    #[error("classification failed: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("invalid noise pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("failed to read run output: {0}")]
    Io(#[from] io::Error),
}

/// One output stream after noise filtering, kept as raw bytes so that
/// invalid UTF-8 and a missing final newline still count.
#[derive(Debug, PartialEq, Eq)]
struct CleanStream {
    lines: Vec<Vec<u8>>,
    terminated: bool,
}

impl CleanStream {
    fn rendered(&self, render: impl Fn(&[u8]) -> String) -> Vec<String> {
        self.lines.iter().map(|line| render(line)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub severity: Severity,
    pub crash: Option<CrashInfo>,
    /// Changed lines only (`-` baseline, `+` candidate).
    pub diff: Vec<String>,
    pub compared: usize,
    pub discarded: usize,
}

impl Comparison {
    fn fine(compared: usize, discarded: usize) -> Self {
        Self {
            severity: Severity::Fine,
            crash: None,
            diff: Vec::new(),
            compared,
            discarded,
        }
    }

    fn serious(classification: Classification, compared: usize, discarded: usize) -> Self {
        Self {
            severity: classification.severity,
            crash: Some(classification.crash),
            diff: Vec::new(),
            compared,
            discarded,
        }
    }
}

/// Finds correctness bugs by diffing output across engine configurations.
pub struct Comparator<'a> {
    executor: &'a dyn Executor,
    classifier: &'a Classifier,
    noise: Vec<Regex>,
    divergences: Vec<LegitimateDivergence>,
    timeout: Duration,
}

impl<'a> Comparator<'a> {
    pub fn new(
        executor: &'a dyn Executor,
        classifier: &'a Classifier,
        settings: &CompareSettings,
        timeout: Duration,
    ) -> Result<Self, CompareError> {
        let noise = settings
            .noise_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            executor,
            classifier,
            noise,
            divergences: settings.legitimate_divergences.clone(),
            timeout,
        })
    }

    /// Runs `input` under `base_flags` (the baseline) and then under
    /// `base_flags` + each candidate flag-set, comparing every candidate
    /// against the baseline.
    pub fn compare(
        &self,
        binary: &Path,
        base_flags: &[String],
        candidates: &[Vec<String>],
        input: &Path,
        log_prefix: &Path,
    ) -> Result<Comparison, CompareError> {
        let baseline_log = run_log(log_prefix, 0);
        let baseline = self.run(binary, base_flags, input, &baseline_log)?;
        let baseline_class = self.classifier.classify(&baseline, ClassifyMode::Wrapped)?;
        if baseline_class.severity > Severity::OverallMismatch {
            return Ok(Comparison::serious(baseline_class, 0, 0));
        }
        if baseline_class.oom || baseline_class.exit.is_abnormal() || baseline_class.severity.is_interesting() {
            debug!("baseline run is not comparable ({:?}), skipping comparison", baseline_class.exit);
            return Ok(Comparison::fine(0, candidates.len()));
        }

        let mut compared = 0;
        let mut discarded = 0;
        for (idx, extra) in candidates.iter().enumerate() {
            let flags: Vec<String> = base_flags.iter().chain(extra.iter()).cloned().collect();
            let log = run_log(log_prefix, idx + 1);
            let run = self.run(binary, &flags, input, &log)?;
            let class = self.classifier.classify(&run, ClassifyMode::Wrapped)?;

            if class.severity > Severity::OverallMismatch {
                info!("outcome=crash-during-compare flags={:?} severity={}", extra, class.severity);
                return Ok(Comparison::serious(class, compared, discarded));
            }
            if class.oom {
                debug!("flags {extra:?} ran out of memory, discarding comparison point");
                discarded += 1;
                continue;
            }
            if class.exit.is_abnormal() || class.severity.is_interesting() {
                debug!("flags {extra:?} exited abnormally ({:?}), discarding", class.exit);
                discarded += 1;
                continue;
            }

            compared += 1;
            let diff = self.diff_runs(&baseline_log, base_flags, &log, &flags)?;
            if !diff.is_empty() {
                let mut stderr = vec![
                    format!("--- {}", render_flags(base_flags)),
                    format!("+++ {}", render_flags(&flags)),
                ];
                stderr.extend(diff.iter().cloned());
                let crash = CrashInfo::Synthesized {
                    stdout: Vec::new(),
                    stderr,
                };
                if let Some(known) = self.classifier.lookup(&crash)? {
                    debug!("mismatch matches known bug {}", known.bug_id);
                    continue;
                }
                info!("outcome=mismatch flags={:?} diff_lines={}", extra, diff.len());
                return Ok(Comparison {
                    severity: Severity::OverallMismatch,
                    crash: Some(crash),
                    diff,
                    compared,
                    discarded,
                });
            }
        }
        Ok(Comparison::fine(compared, discarded))
    }

    fn run(
        &self,
        binary: &Path,
        flags: &[String],
        input: &Path,
        log: &LogPaths,
    ) -> Result<ExecutionResult, ExecutorError> {
        let mut args = flags.to_vec();
        args.push(input.to_string_lossy().into_owned());
        self.executor.run(binary, &args, self.timeout, log)
    }

    /// Compares the runs' log files byte for byte after filtering; the line
    /// diff only renders a mismatch that was already found.
    fn diff_runs(
        &self,
        baseline: &LogPaths,
        baseline_flags: &[String],
        candidate: &LogPaths,
        candidate_flags: &[String],
    ) -> Result<Vec<String>, CompareError> {
        let allowed = self.allowed_divergences(baseline_flags, candidate_flags);
        let mut diff = self.diff_stream(&fs::read(baseline.out())?, &fs::read(candidate.out())?, &allowed);
        let stderr_diff = self.diff_stream(&fs::read(baseline.err())?, &fs::read(candidate.err())?, &allowed);
        diff.extend(
            stderr_diff
                .into_iter()
                .map(|line| format!("{}[stderr] {}", &line[..1], &line[1..])),
        );
        Ok(diff)
    }

    fn diff_stream(&self, a: &[u8], b: &[u8], allowed: &[&str]) -> Vec<String> {
        let a = self.clean(a, allowed);
        let b = self.clean(b, allowed);
        if a == b {
            return Vec::new();
        }
        let lossy = |line: &[u8]| String::from_utf8_lossy(line).into_owned();
        let mut diff = line_diff(&a.rendered(lossy), &b.rendered(lossy));
        if diff.is_empty() {
            let escaped = |line: &[u8]| line.escape_ascii().to_string();
            diff = line_diff(&a.rendered(escaped), &b.rendered(escaped));
        }
        if a.terminated != b.terminated {
            let side = if a.terminated { '+' } else { '-' };
            diff.push(format!("{side}\\ No newline at end of output"));
        }
        diff
    }

    /// Messages that may differ because their flag is on only one side.
    fn allowed_divergences(&self, a: &[String], b: &[String]) -> Vec<&str> {
        self.divergences
            .iter()
            .filter(|d| a.contains(&d.flag) != b.contains(&d.flag))
            .map(|d| d.message.as_str())
            .collect()
    }

    fn clean(&self, raw: &[u8], allowed: &[&str]) -> CleanStream {
        let terminated = raw.is_empty() || raw.ends_with(b"\n");
        let lines = if raw.is_empty() {
            Vec::new()
        } else {
            raw.strip_suffix(b"\n")
                .unwrap_or(raw)
                .split(|&b| b == b'\n')
                .filter(|line| {
                    let text = String::from_utf8_lossy(line);
                    !self.noise.iter().any(|re| re.is_match(&text))
                        && !allowed.iter().any(|msg| text.contains(msg))
                })
                .map(<[u8]>::to_vec)
                .collect()
        };
        CleanStream { lines, terminated }
    }
}

/// Logs of run `index` under `prefix`; run 0 is the baseline.
pub fn run_log(prefix: &Path, index: usize) -> LogPaths {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!("-r{index}"));
    LogPaths::new(std::path::PathBuf::from(name))
}

fn render_flags(flags: &[String]) -> String {
    if flags.is_empty() {
        "(no flags)".to_string()
    } else {
        flags.join(" ")
    }
}

/// Picks up to `n` distinct flag-sets from `pool`.
pub fn sample_flag_sets<R: Rng + ?Sized>(
    rng: &mut R,
    pool: &[Vec<String>],
    n: usize,
) -> Vec<Vec<String>> {
    pool.choose_multiple(rng, n).cloned().collect()
}

/// Line-oriented diff listing only changed lines, `-` for `a` and `+` for `b`.
pub fn line_diff(a: &[String], b: &[String]) -> Vec<String> {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let a_mid = &a[prefix..a.len() - suffix];
    let b_mid = &b[prefix..b.len() - suffix];

    let (n, m) = (a_mid.len(), b_mid.len());
    if n == 0 && m == 0 {
        return Vec::new();
    }
    if n.saturating_mul(m) > MAX_LCS_CELLS {
        return a_mid
            .iter()
            .map(|l| format!("-{l}"))
            .chain(b_mid.iter().map(|l| format!("+{l}")))
            .collect();
    }

    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if a_mid[i] == b_mid[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a_mid[i] == b_mid[j] {
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            out.push(format!("-{}", a_mid[i]));
            i += 1;
        } else {
            out.push(format!("+{}", b_mid[j]));
            j += 1;
        }
    }
    out.extend(a_mid[i..].iter().map(|l| format!("-{l}")));
    out.extend(b_mid[j..].iter().map(|l| format!("+{l}")));
    out
}
