use crate::config::PoolSettings;
use crate::executor::encode_exit_status;
use crate::logs::LogPaths;
use log::{info, warn};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to spawn worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed waiting for worker {index}: {source}")]
    Wait {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("pool I/O error: {0}")]
    Io(#[from] io::Error),
}

/// CPUs minus one reserved for the system, halved for memory-hungry
/// configurations, quartered on low-power boards. Never below one.
pub fn default_pool_size(cpus: usize, memory_hungry: bool, low_power: bool) -> usize {
    let mut size = cpus.saturating_sub(1).max(1);
    if memory_hungry {
        size /= 2;
    }
    if low_power {
        size /= 4;
    }
    size.max(1)
}

pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Small ARM boards.
pub fn is_low_power(cpus: usize) -> bool {
    cfg!(any(target_arch = "arm", target_arch = "aarch64")) && cpus <= 4
}

/// Pool size from configuration, falling back to the CPU-derived default.
pub fn pool_size(settings: &PoolSettings) -> usize {
    let cpus = available_cpus();
    settings
        .workers
        .unwrap_or_else(|| default_pool_size(cpus, settings.memory_hungry, is_low_power(cpus)))
        .max(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub index: usize,
    pub log_dir: PathBuf,
    /// Encoded like the executor's: negative for a signal.
    pub status: i32,
}

/// Runs N copies of a worker command as separate OS processes.
///
/// Worker `N` gets `--log-dir <root>/wN --worker-index N` appended to the
/// base arguments and its own stdout/stderr files in that directory.
/// Workers that die are not respawned.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    program: PathBuf,
    base_args: Vec<String>,
    log_root: PathBuf,
    size: usize,
}

impl WorkerPool {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<String>, log_root: impl Into<PathBuf>, size: usize) -> Self {
        Self {
            program: program.into(),
            base_args,
            log_root: log_root.into(),
            size: size.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn worker_dir(&self, index: usize) -> PathBuf {
        self.log_root.join(format!("w{index}"))
    }

    fn spawn(&self, index: usize) -> Result<Child, PoolError> {
        let dir = self.worker_dir(index);
        fs::create_dir_all(&dir)?;
        let logs = LogPaths::new(dir.join("worker"));
        Command::new(&self.program)
            .args(&self.base_args)
            .arg("--log-dir")
            .arg(&dir)
            .arg("--worker-index")
            .arg(index.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(File::create(logs.out())?))
            .stderr(Stdio::from(File::create(logs.err())?))
            .spawn()
            .map_err(|source| PoolError::Spawn { index, source })
    }

    /// Spawns every worker and waits for all of them.
    pub fn run(&self) -> Result<Vec<WorkerExit>, PoolError> {
        fs::create_dir_all(&self.log_root)?;
        let mut children = Vec::with_capacity(self.size);
        for index in 0..self.size {
            match self.spawn(index) {
                Ok(child) => children.push((index, child)),
                Err(e) => {
                    for (_, mut child) in children {
                        let _ = child.kill();
                        let _ = child.wait();
                    }
                    return Err(e);
                }
            }
        }
        info!("started {} workers under {:?}", self.size, self.log_root);

        let mut exits = Vec::with_capacity(children.len());
        for (index, mut child) in children {
            let status = child
                .wait()
                .map_err(|source| PoolError::Wait { index, source })?;
            let status = encode_exit_status(status);
            if status != 0 {
                warn!("worker {index} exited with status {status}");
            }
            exits.push(WorkerExit {
                index,
                log_dir: self.worker_dir(index),
                status,
            });
        }
        info!(
            "outcome=pool-finished workers={} failed={}",
            exits.len(),
            exits.iter().filter(|e| e.status != 0).count()
        );
        Ok(exits)
    }

    pub fn log_root(&self) -> &Path {
        &self.log_root
    }
}
