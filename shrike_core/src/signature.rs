use log::{info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+").expect("static address regex"));
static FRAME_INDEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\d+\s+").expect("static frame index regex"));
static LINE_COL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\d+(:\d+)?").expect("static line number regex"));

/// What is known about a crash after classification.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CrashInfo {
    /// Nothing crashed.
    #[default]
    None,
    /// The process died but no backtrace could be found.
    NoInformation { signal: Option<i32> },
    Backtrace {
        frames: Vec<String>,
        signal: Option<i32>,
    },
    /// Built from a differential mismatch: empty stdout and the diff as stderr.
    Synthesized {
        stdout: Vec<String>,
        stderr: Vec<String>,
    },
}

impl CrashInfo {
    pub fn is_empty(&self) -> bool {
        matches!(self, CrashInfo::None)
    }

    /// Stable identity of the crash: the first `max_frames` normalized lines,
    /// md5-hashed. `None` for an empty value.
    pub fn signature(&self, max_frames: usize) -> Option<String> {
        let lines: Vec<String> = match self {
            CrashInfo::None => return None,
            CrashInfo::NoInformation { signal } => {
                vec![format!("no-information signal={}", signal.unwrap_or(0))]
            }
            CrashInfo::Backtrace { frames, .. } => frames
                .iter()
                .take(max_frames)
                .map(|f| normalize_frame(f))
                .collect(),
            CrashInfo::Synthesized { stderr, .. } => stderr
                .iter()
                .filter(|l| l.starts_with('-') || l.starts_with('+'))
                .take(max_frames)
                .cloned()
                .collect(),
        };
        let digest = md5::compute(lines.join("\n").as_bytes());
        Some(format!("{:x}", digest))
    }

    /// Lines written to `P-crash.txt`.
    pub fn report_lines(&self) -> Vec<String> {
        match self {
            CrashInfo::None => Vec::new(),
            CrashInfo::NoInformation { signal } => vec![format!(
                "crashed with signal {}, no information",
                signal.unwrap_or(0)
            )],
            CrashInfo::Backtrace { frames, .. } => frames.clone(),
            CrashInfo::Synthesized { stderr, .. } => stderr.clone(),
        }
    }
}

fn normalize_frame(frame: &str) -> String {
    let no_index = FRAME_INDEX_RE.replace(frame.trim(), "");
    let no_addr = ADDRESS_RE.replace_all(&no_index, "");
    let no_lines = LINE_COL_RE.replace_all(&no_addr, "");
    no_lines
        .trim_start_matches(|c: char| c.is_whitespace())
        .trim_start_matches("in ")
        .trim()
        .to_string()
}

/// A known bug matched by signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureMatch {
    pub signature: String,
    pub bug_id: String,
}

#[derive(Error, Debug)]
pub enum SignatureDbError {
    /// Server-side hiccup; the call may be retried.
    #[error("transient signature database error: {0}")]
    Transient(String),
    #[error("signature database rejected the request: {0}")]
    Permanent(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("signature database I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("signature database record error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The crash-signature database collaborator.
pub trait SignatureDb: Send + Sync {
    fn search(&self, crash: &CrashInfo) -> Result<Option<SignatureMatch>, SignatureDbError>;

    /// Files a new report and returns its id.
    fn submit(
        &self,
        crash: &CrashInfo,
        testcase: &Path,
        quality: u32,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, SignatureDbError>;
}

/// A database that knows no bugs and accepts no reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSignatureDb;

impl SignatureDb for NoSignatureDb {
    fn search(&self, _crash: &CrashInfo) -> Result<Option<SignatureMatch>, SignatureDbError> {
        Ok(None)
    }

    fn submit(
        &self,
        _crash: &CrashInfo,
        _testcase: &Path,
        _quality: u32,
        _metadata: &BTreeMap<String, String>,
    ) -> Result<String, SignatureDbError> {
        Err(SignatureDbError::Permanent(
            "no signature database configured".to_string(),
        ))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct SignatureRecord {
    signature: String,
    known_bug_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct ReportRecord {
    signature: String,
    crash: CrashInfo,
    testcase: PathBuf,
    testcase_md5: String,
    quality: u32,
    metadata: BTreeMap<String, String>,
}

/// A directory-backed database: `<dir>/<signature>.json` for known bugs and
/// `<dir>/reports/<signature>-<testcase md5>.json` for submissions.
#[derive(Debug, Clone)]
pub struct JsonSignatureDb {
    dir: PathBuf,
    max_frames: usize,
}

impl JsonSignatureDb {
    pub fn open(dir: impl Into<PathBuf>, max_frames: usize) -> Result<Self, SignatureDbError> {
        let dir = dir.into();
        fs::create_dir_all(dir.join("reports"))?;
        Ok(Self { dir, max_frames })
    }

    fn signature_of(&self, crash: &CrashInfo) -> Result<String, SignatureDbError> {
        crash
            .signature(self.max_frames)
            .ok_or_else(|| SignatureDbError::Permanent("empty crash has no signature".to_string()))
    }

    /// Records that `crash` is a known bug.
    pub fn mark_known(&self, crash: &CrashInfo, bug_id: &str) -> Result<String, SignatureDbError> {
        let signature = self.signature_of(crash)?;
        let record = SignatureRecord {
            signature: signature.clone(),
            known_bug_id: Some(bug_id.to_string()),
        };
        fs::write(
            self.dir.join(format!("{signature}.json")),
            serde_json::to_vec_pretty(&record)?,
        )?;
        Ok(signature)
    }
}

impl SignatureDb for JsonSignatureDb {
    fn search(&self, crash: &CrashInfo) -> Result<Option<SignatureMatch>, SignatureDbError> {
        let Some(signature) = crash.signature(self.max_frames) else {
            return Ok(None);
        };
        let path = self.dir.join(format!("{signature}.json"));
        if !path.is_file() {
            return Ok(None);
        }
        let record: SignatureRecord = serde_json::from_slice(&fs::read(&path)?)?;
        Ok(record.known_bug_id.map(|bug_id| SignatureMatch { signature, bug_id }))
    }

    fn submit(
        &self,
        crash: &CrashInfo,
        testcase: &Path,
        quality: u32,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, SignatureDbError> {
        let signature = self.signature_of(crash)?;
        let testcase_md5 = format!("{:x}", md5::compute(fs::read(testcase)?));
        let id = format!("{signature}-{testcase_md5}");
        let record = ReportRecord {
            signature,
            crash: crash.clone(),
            testcase: testcase.to_path_buf(),
            testcase_md5,
            quality,
            metadata: metadata.clone(),
        };
        fs::write(
            self.dir.join("reports").join(format!("{id}.json")),
            serde_json::to_vec_pretty(&record)?,
        )?;
        Ok(id)
    }
}

/// Retries `submit` with exponential backoff on transient errors.
///
/// Permanent errors and exhausted retries are returned to the caller; a
/// report is never dropped silently.
#[derive(Debug, Clone)]
pub struct RetryingSubmitter<D: SignatureDb> {
    inner: D,
    max_attempts: u32,
    base_delay: Duration,
}

impl<D: SignatureDb> RetryingSubmitter<D> {
    pub fn new(inner: D, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: SignatureDb> SignatureDb for RetryingSubmitter<D> {
    fn search(&self, crash: &CrashInfo) -> Result<Option<SignatureMatch>, SignatureDbError> {
        self.inner.search(crash)
    }

    fn submit(
        &self,
        crash: &CrashInfo,
        testcase: &Path,
        quality: u32,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, SignatureDbError> {
        let mut delay = self.base_delay;
        let mut last = String::new();
        for attempt in 1..=self.max_attempts {
            match self.inner.submit(crash, testcase, quality, metadata) {
                Ok(id) => {
                    info!("outcome=submitted id={id} attempts={attempt}");
                    return Ok(id);
                }
                Err(SignatureDbError::Transient(msg)) => {
                    warn!("submit attempt {attempt}/{} failed: {msg}", self.max_attempts);
                    last = msg;
                    if attempt < self.max_attempts {
                        std::thread::sleep(delay);
                        delay = delay.saturating_mul(2);
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(SignatureDbError::RetriesExhausted {
            attempts: self.max_attempts,
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn backtrace(frames: &[&str]) -> CrashInfo {
        CrashInfo::Backtrace {
            frames: frames.iter().map(|s| s.to_string()).collect(),
            signal: Some(11),
        }
    }

    #[test]
    fn signature_ignores_addresses_and_line_numbers() {
        let a = backtrace(&["#0 0x1234 in js::Foo jit/A.cpp:10", "#1 0x99 in main"]);
        let b = backtrace(&["#0 0xbeef in js::Foo jit/A.cpp:12", "#1 0x11 in main"]);
        let c = backtrace(&["#0 0x1234 in js::Bar jit/A.cpp:10"]);
        assert_eq!(a.signature(8), b.signature(8));
        assert_ne!(a.signature(8), c.signature(8));
        assert_eq!(CrashInfo::None.signature(8), None);
    }

    #[test]
    fn json_db_matches_marked_signatures() {
        let dir = tempdir().unwrap();
        let db = JsonSignatureDb::open(dir.path(), 8).unwrap();
        let crash = backtrace(&["#0 0x1 in js::Foo"]);

        assert!(db.search(&crash).unwrap().is_none());
        db.mark_known(&crash, "bug-1234").unwrap();
        let hit = db.search(&crash).unwrap().unwrap();
        assert_eq!(hit.bug_id, "bug-1234");
        assert!(db.search(&CrashInfo::None).unwrap().is_none());
    }

    #[test]
    fn json_db_persists_reports() {
        let dir = tempdir().unwrap();
        let db = JsonSignatureDb::open(dir.path(), 8).unwrap();
        let testcase = dir.path().join("t.js");
        fs::write(&testcase, "crash();\n").unwrap();

        let id = db
            .submit(&backtrace(&["#0 f"]), &testcase, 10, &BTreeMap::new())
            .unwrap();
        assert!(dir.path().join("reports").join(format!("{id}.json")).is_file());
    }

    struct FlakyDb {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    impl SignatureDb for FlakyDb {
        fn search(&self, _crash: &CrashInfo) -> Result<Option<SignatureMatch>, SignatureDbError> {
            Ok(None)
        }

        fn submit(
            &self,
            _crash: &CrashInfo,
            _testcase: &Path,
            _quality: u32,
            _metadata: &BTreeMap<String, String>,
        ) -> Result<String, SignatureDbError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures_before_success {
                Err(SignatureDbError::Transient(format!("503 on call {call}")))
            } else {
                Ok(format!("report-{call}"))
            }
        }
    }

    #[test]
    fn retrying_submitter_retries_transient_errors() {
        let flaky = FlakyDb {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
        };
        let submitter = RetryingSubmitter::new(flaky, 5, Duration::from_millis(1));
        let id = submitter
            .submit(&CrashInfo::None, Path::new("t.js"), 0, &BTreeMap::new())
            .unwrap();
        assert_eq!(id, "report-3");
        assert_eq!(submitter.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retrying_submitter_reports_exhaustion() {
        let flaky = FlakyDb {
            failures_before_success: 10,
            calls: AtomicU32::new(0),
        };
        let submitter = RetryingSubmitter::new(flaky, 3, Duration::from_millis(1));
        let err = submitter
            .submit(&CrashInfo::None, Path::new("t.js"), 0, &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, SignatureDbError::RetriesExhausted { attempts: 3, .. }));
    }
}
