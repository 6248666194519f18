use std::ffi::OsString;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// The family of log files derived from one log prefix `P`.
///
/// `P-out.txt` and `P-err.txt` are written by the executor for every run;
/// `P-summary.txt` and `P-crash.txt` only exist for interesting results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    prefix: PathBuf,
}

impl LogPaths {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name: OsString = self.prefix.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    pub fn out(&self) -> PathBuf {
        self.with_suffix("-out.txt")
    }

    pub fn err(&self) -> PathBuf {
        self.with_suffix("-err.txt")
    }

    pub fn summary(&self) -> PathBuf {
        self.with_suffix("-summary.txt")
    }

    pub fn crash(&self) -> PathBuf {
        self.with_suffix("-crash.txt")
    }

    fn all(&self) -> [PathBuf; 4] {
        [self.out(), self.err(), self.summary(), self.crash()]
    }

    /// Deletes every file of the family. Missing files are not an error.
    pub fn remove_all(&self) -> io::Result<()> {
        for path in self.all() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Truncates every existing file of the family to `max_bytes`.
    pub fn cap_sizes(&self, max_bytes: u64) -> io::Result<()> {
        for path in self.all() {
            if path.exists() {
                truncate_log(&path, max_bytes)?;
            }
        }
        Ok(())
    }

    pub fn write_summary(&self, lines: &[String]) -> io::Result<()> {
        write_lines(&self.summary(), lines)
    }

    pub fn write_crash(&self, lines: &[String]) -> io::Result<()> {
        write_lines(&self.crash(), lines)
    }
}

fn write_lines(path: &Path, lines: &[String]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    Ok(())
}

/// Truncates a text log to at most `max_bytes`, cutting at a line boundary
/// when one exists and always leaving valid, newline-terminated UTF-8. A
/// zero cap empties the file.
///
/// Only the kept head is read. Returns whether the file was shortened.
pub fn truncate_log(path: &Path, max_bytes: u64) -> io::Result<bool> {
    let mut file = fs::OpenOptions::new().read(true).write(true).open(path)?;
    if file.metadata()?.len() <= max_bytes {
        return Ok(false);
    }
    if max_bytes == 0 {
        file.set_len(0)?;
        return Ok(true);
    }
    let mut head = Vec::new();
    std::io::Read::by_ref(&mut file).take(max_bytes).read_to_end(&mut head)?;
    if let Some(idx) = head.iter().rposition(|&b| b == b'\n') {
        file.set_len(idx as u64 + 1)?;
        return Ok(true);
    }
    // No whole line fits: keep valid UTF-8 and leave room for the newline.
    let room = &head[..head.len() - 1];
    let end = match std::str::from_utf8(room) {
        Ok(_) => room.len(),
        Err(e) => e.valid_up_to(),
    };
    file.set_len(end as u64)?;
    file.seek(SeekFrom::Start(end as u64))?;
    file.write_all(b"\n")?;
    Ok(true)
}

/// Reads a log file as lines, tolerating invalid UTF-8.
pub fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes)
        .lines()
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn suffixes_derive_from_prefix() {
        let paths = LogPaths::new("/tmp/w3/run-17");
        assert_eq!(paths.out(), PathBuf::from("/tmp/w3/run-17-out.txt"));
        assert_eq!(paths.err(), PathBuf::from("/tmp/w3/run-17-err.txt"));
        assert_eq!(paths.summary(), PathBuf::from("/tmp/w3/run-17-summary.txt"));
        assert_eq!(paths.crash(), PathBuf::from("/tmp/w3/run-17-crash.txt"));
    }

    #[test]
    fn truncation_cuts_at_line_boundary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log-err.txt");
        fs::write(&path, "first line\nsecond line\nthird line\n").unwrap();

        assert!(truncate_log(&path, 15).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "first line\n");
        assert!(!truncate_log(&path, 15).unwrap());
    }

    #[test]
    fn truncation_without_newline_stays_terminated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log-out.txt");
        fs::write(&path, "ééééééééé").unwrap();

        assert!(truncate_log(&path, 6).unwrap());
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.len() <= 6);
    }

    #[test]
    fn zero_cap_empties_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log-out.txt");
        fs::write(&path, "x\n").unwrap();

        assert!(truncate_log(&path, 0).unwrap());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert!(!truncate_log(&path, 0).unwrap());
    }

    #[test]
    fn truncation_keeps_only_the_head_of_a_large_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log-err.txt");
        let line = "Assertion failure: x\n";
        fs::write(&path, line.repeat(50_000)).unwrap();

        assert!(truncate_log(&path, 1000).unwrap());
        let kept = fs::read_to_string(&path).unwrap();
        assert_eq!(kept.len(), 1000 / line.len() * line.len());
        assert!(kept.ends_with('\n'));
    }

    #[test]
    fn remove_all_ignores_missing_files() {
        let dir = tempdir().unwrap();
        let paths = LogPaths::new(dir.path().join("p"));
        fs::write(paths.out(), "x\n").unwrap();
        paths.remove_all().unwrap();
        assert!(!paths.out().exists());
    }
}
