//! The thin slice of version control that bisection consumes.
//!
//! Label strings only exist at this boundary: [`parse_bisect_output`] turns
//! the collaborator's text into a [`BisectStep`], and everything above it
//! works with [`RevisionLabel`].

use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use thiserror::Error;

/// Verdict assigned to one tested revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevisionLabel {
    Good,
    Bad,
    Skip,
}

impl RevisionLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            RevisionLabel::Good => "good",
            RevisionLabel::Bad => "bad",
            RevisionLabel::Skip => "skip",
        }
    }
}

impl fmt::Display for RevisionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the bisect primitive wants next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BisectStep {
    Candidate(String),
    FirstBad(String),
    Ambiguous(Vec<String>),
}

#[derive(Error, Debug)]
pub enum VcsError {
    #[error("unrecognized bisect output")]
    Unparsed { raw_output: String },
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("unknown revision '{0}'")]
    UnknownRevision(String),
    #[error("VCS I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The bisect primitive plus the handful of history queries the bisector needs.
pub trait VcsBisect {
    fn reset(&mut self) -> Result<(), VcsError>;
    /// Opens a session over `good..bad`.
    fn start(&mut self, good: &str, bad: &str) -> Result<(), VcsError>;
    fn mark(&mut self, rev: &str, label: RevisionLabel) -> Result<(), VcsError>;
    fn next_candidate(&mut self) -> Result<BisectStep, VcsError>;

    /// Turns a symbolic name into a concrete revision id.
    fn resolve(&self, rev: &str) -> Result<String, VcsError>;
    fn parents(&self, rev: &str) -> Result<Vec<String>, VcsError>;
    fn common_ancestor(&self, a: &str, b: &str) -> Result<String, VcsError>;
}

static FIRST_BAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([0-9a-f]{7,40}) is the first (?:bad|good) commit")
        .expect("static first-bad regex")
});
static CANDIDATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Bisecting: .*\n\[([0-9a-f]{7,40})\]").expect("static candidate regex")
});
static AMBIGUOUS_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^The first (?:bad|good) commit could be any of:").expect("static ambiguous regex")
});
static HASH_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-f]{7,40})\b").expect("static hash regex"));

/// Recognizes the three message shapes of `git bisect`.
///
/// Anything else is returned as [`VcsError::Unparsed`] with the raw text.
pub fn parse_bisect_output(raw: &str) -> Result<BisectStep, VcsError> {
    if let Some(caps) = FIRST_BAD_RE.captures(raw) {
        return Ok(BisectStep::FirstBad(caps[1].to_string()));
    }
    if let Some(header) = AMBIGUOUS_HEADER_RE.find(raw) {
        let revs: Vec<String> = raw[header.end()..]
            .lines()
            .filter_map(|line| HASH_LINE_RE.captures(line.trim()))
            .map(|caps| caps[1].to_string())
            .collect();
        if !revs.is_empty() {
            return Ok(BisectStep::Ambiguous(revs));
        }
    }
    if let Some(caps) = CANDIDATE_RE.captures(raw) {
        return Ok(BisectStep::Candidate(caps[1].to_string()));
    }
    Err(VcsError::Unparsed {
        raw_output: raw.to_string(),
    })
}

/// `git bisect` driven through the command line.
#[derive(Debug, Clone)]
pub struct GitBisect {
    repo: PathBuf,
    last_output: String,
}

impl GitBisect {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            last_output: String::new(),
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    fn git(&self, args: &[&str]) -> Result<String, VcsError> {
        debug!("git {}", args.join(" "));
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(args)
            .output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

impl VcsBisect for GitBisect {
    fn reset(&mut self) -> Result<(), VcsError> {
        self.git(&["bisect", "reset"])?;
        self.last_output.clear();
        Ok(())
    }

    fn start(&mut self, good: &str, bad: &str) -> Result<(), VcsError> {
        self.last_output = self.git(&["bisect", "start", bad, good])?;
        Ok(())
    }

    fn mark(&mut self, rev: &str, label: RevisionLabel) -> Result<(), VcsError> {
        self.last_output = self.git(&["bisect", label.as_str(), rev])?;
        Ok(())
    }

    fn next_candidate(&mut self) -> Result<BisectStep, VcsError> {
        parse_bisect_output(&self.last_output)
    }

    fn resolve(&self, rev: &str) -> Result<String, VcsError> {
        let out = self
            .git(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")])
            .map_err(|_| VcsError::UnknownRevision(rev.to_string()))?;
        Ok(out.trim().to_string())
    }

    fn parents(&self, rev: &str) -> Result<Vec<String>, VcsError> {
        let out = self.git(&["rev-list", "--parents", "-n", "1", rev])?;
        Ok(out.split_whitespace().skip(1).map(str::to_string).collect())
    }

    fn common_ancestor(&self, a: &str, b: &str) -> Result<String, VcsError> {
        Ok(self.git(&["merge-base", a, b])?.trim().to_string())
    }
}

/// A bisect primitive over an ordered, linear list of revisions.
///
/// Candidates are chosen at the midpoint of the untested window; a skipped
/// midpoint moves the choice to the nearest untested neighbour, the way
/// `git bisect` steps around skipped commits.
#[derive(Debug, Clone)]
pub struct LinearHistory {
    revisions: Vec<String>,
    labels: Vec<Option<RevisionLabel>>,
    window: Option<(usize, usize)>,
}

impl LinearHistory {
    pub fn new(revisions: Vec<String>) -> Self {
        let labels = vec![None; revisions.len()];
        Self {
            revisions,
            labels,
            window: None,
        }
    }

    fn index_of(&self, rev: &str) -> Result<usize, VcsError> {
        self.revisions
            .iter()
            .position(|r| r == rev)
            .ok_or_else(|| VcsError::UnknownRevision(rev.to_string()))
    }

    /// Largest good index and smallest bad index inside the session window.
    fn bounds(&self) -> Result<(usize, usize), VcsError> {
        let (start, end) = self.window.ok_or_else(|| VcsError::CommandFailed {
            command: "bisect next".to_string(),
            stderr: "no bisect session in progress".to_string(),
        })?;
        let mut good = start;
        let mut bad = end;
        for idx in start..=end {
            match self.labels[idx] {
                Some(RevisionLabel::Good) => good = good.max(idx),
                Some(RevisionLabel::Bad) => bad = bad.min(idx),
                _ => {}
            }
        }
        Ok((good, bad))
    }
}

impl VcsBisect for LinearHistory {
    fn reset(&mut self) -> Result<(), VcsError> {
        self.labels.iter_mut().for_each(|l| *l = None);
        self.window = None;
        Ok(())
    }

    fn start(&mut self, good: &str, bad: &str) -> Result<(), VcsError> {
        let good_idx = self.index_of(good)?;
        let bad_idx = self.index_of(bad)?;
        if good_idx >= bad_idx {
            return Err(VcsError::CommandFailed {
                command: format!("bisect start {bad} {good}"),
                stderr: "good revision is not an ancestor of bad".to_string(),
            });
        }
        self.window = Some((good_idx, bad_idx));
        self.labels[good_idx] = Some(RevisionLabel::Good);
        self.labels[bad_idx] = Some(RevisionLabel::Bad);
        Ok(())
    }

    fn mark(&mut self, rev: &str, label: RevisionLabel) -> Result<(), VcsError> {
        let idx = self.index_of(rev)?;
        self.labels[idx] = Some(label);
        Ok(())
    }

    fn next_candidate(&mut self) -> Result<BisectStep, VcsError> {
        let (good, bad) = self.bounds()?;
        if bad <= good + 1 {
            return Ok(BisectStep::FirstBad(self.revisions[bad].clone()));
        }
        let untested: Vec<usize> = (good + 1..bad)
            .filter(|&idx| self.labels[idx].is_none())
            .collect();
        if untested.is_empty() {
            return Ok(BisectStep::Ambiguous(
                (good + 1..=bad).map(|idx| self.revisions[idx].clone()).collect(),
            ));
        }
        let mid = good + (bad - good) / 2;
        let pick = untested
            .iter()
            .copied()
            .min_by_key(|&idx| (idx.abs_diff(mid), idx))
            .unwrap_or(untested[0]);
        Ok(BisectStep::Candidate(self.revisions[pick].clone()))
    }

    fn resolve(&self, rev: &str) -> Result<String, VcsError> {
        self.index_of(rev).map(|idx| self.revisions[idx].clone())
    }

    fn parents(&self, rev: &str) -> Result<Vec<String>, VcsError> {
        let idx = self.index_of(rev)?;
        Ok(idx
            .checked_sub(1)
            .map(|p| vec![self.revisions[p].clone()])
            .unwrap_or_default())
    }

    fn common_ancestor(&self, a: &str, b: &str) -> Result<String, VcsError> {
        let idx = self.index_of(a)?.min(self.index_of(b)?);
        Ok(self.revisions[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_bad_commit() {
        let raw = "3f4c2a1b9d is the first bad commit\ncommit 3f4c2a1b9d\nAuthor: a\n";
        assert_eq!(
            parse_bisect_output(raw).unwrap(),
            BisectStep::FirstBad("3f4c2a1b9d".to_string())
        );
    }

    #[test]
    fn parses_candidate() {
        let raw = "Bisecting: 12 revisions left to test after this (roughly 4 steps)\n\
                   [abcdef0123456789] Bug 123 - tweak the JIT\n";
        assert_eq!(
            parse_bisect_output(raw).unwrap(),
            BisectStep::Candidate("abcdef0123456789".to_string())
        );
    }

    #[test]
    fn parses_ambiguous_skip_list() {
        let raw = "There are only 'skip'ped commits left to test.\n\
                   The first bad commit could be any of:\n\
                   aaaaaaa1\n\
                   bbbbbbb2\n\
                   We cannot bisect more!\n";
        assert_eq!(
            parse_bisect_output(raw).unwrap(),
            BisectStep::Ambiguous(vec!["aaaaaaa1".to_string(), "bbbbbbb2".to_string()])
        );
    }

    #[test]
    fn unknown_output_keeps_raw_text() {
        match parse_bisect_output("fatal: something odd\n") {
            Err(VcsError::Unparsed { raw_output }) => assert!(raw_output.contains("odd")),
            other => panic!("expected Unparsed, got {other:?}"),
        }
    }

    #[test]
    fn linear_history_narrows_to_first_bad() {
        let revs: Vec<String> = (0..8).map(|i| format!("r{i}")).collect();
        let mut history = LinearHistory::new(revs);
        history.start("r0", "r7").unwrap();

        let mut steps = 0;
        loop {
            match history.next_candidate().unwrap() {
                BisectStep::Candidate(rev) => {
                    let idx: usize = rev[1..].parse().unwrap();
                    let label = if idx >= 5 {
                        RevisionLabel::Bad
                    } else {
                        RevisionLabel::Good
                    };
                    history.mark(&rev, label).unwrap();
                    steps += 1;
                }
                BisectStep::FirstBad(rev) => {
                    assert_eq!(rev, "r5");
                    break;
                }
                BisectStep::Ambiguous(revs) => panic!("unexpected ambiguity {revs:?}"),
            }
        }
        assert!(steps <= 3);
    }

    #[test]
    fn linear_history_reports_ambiguity_around_skips() {
        let revs: Vec<String> = (0..4).map(|i| format!("r{i}")).collect();
        let mut history = LinearHistory::new(revs);
        history.start("r0", "r3").unwrap();
        history.mark("r1", RevisionLabel::Good).unwrap();
        history.mark("r2", RevisionLabel::Skip).unwrap();
        assert_eq!(
            history.next_candidate().unwrap(),
            BisectStep::Ambiguous(vec!["r2".to_string(), "r3".to_string()])
        );
    }

    #[test]
    fn start_rejects_inverted_range() {
        let mut history = LinearHistory::new(vec!["a".into(), "b".into()]);
        assert!(history.start("b", "a").is_err());
    }
}
