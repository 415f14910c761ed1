//! Cross-process ledger backed by a lock file.
//!
//! Every participating process opens the same file. An exclusive advisory
//! lock on it is the inter-process mutex, and its contents are the shared
//! timestamp list: one decimal count of nanoseconds since the UNIX epoch per
//! line, oldest first.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::trace;

use super::ledger::{is_expired, Ledger, LedgerGuard};
use crate::error::{KronosError, Result};

/// Ledger shared by every process that opens the same path.
#[derive(Debug, Clone)]
pub struct SharedLedger {
    path: PathBuf,
}

impl SharedLedger {
    /// Open (creating if needed) the ledger file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        open_file(&path)?;
        Ok(Self { path })
    }

    /// Location of the ledger file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Ledger for SharedLedger {
    fn lock(&self) -> Result<Box<dyn LedgerGuard + '_>> {
        // A fresh handle per acquisition: advisory locks are owned by the
        // open file description, so threads of one process contend too.
        let mut file = open_file(&self.path)?;
        file.lock_exclusive()?;
        trace!(path = %self.path.display(), "Ledger file locked");

        let timestamps = read_entries(&mut file)?;
        Ok(Box::new(SharedGuard { file, timestamps }))
    }
}

struct SharedGuard {
    file: File,
    timestamps: Vec<Duration>,
}

impl SharedGuard {
    fn rewrite(&mut self) -> Result<()> {
        let mut contents = String::with_capacity(self.timestamps.len() * 20);
        for &at in &self.timestamps {
            contents.push_str(&encode(at)?);
        }

        // Overwrite first, then cut the tail.
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(contents.as_bytes())?;
        self.file.set_len(contents.len() as u64)?;
        Ok(())
    }
}

impl LedgerGuard for SharedGuard {
    fn entries(&self) -> &[Duration] {
        &self.timestamps
    }

    fn prune_expired(&mut self, now: Duration, period: Duration) -> Result<()> {
        let before = self.timestamps.len();
        self.timestamps.retain(|&at| !is_expired(at, now, period));

        if self.timestamps.len() != before {
            self.rewrite()?;
        }
        Ok(())
    }

    fn append(&mut self, at: Duration) -> Result<()> {
        let line = encode(at)?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(line.as_bytes())?;
        self.timestamps.push(at);
        Ok(())
    }
}

impl Drop for SharedGuard {
    fn drop(&mut self) {
        // Closing the handle releases the lock even if this fails.
        let _ = FileExt::unlock(&self.file);
    }
}

fn open_file(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    Ok(file)
}

fn encode(at: Duration) -> Result<String> {
    let nanos = u64::try_from(at.as_nanos())
        .map_err(|_| KronosError::Ledger(format!("timestamp {:?} does not fit the ledger", at)))?;
    Ok(format!("{}\n", nanos))
}

fn read_entries(file: &mut File) -> Result<Vec<Duration>> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut contents)?;

    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            line.trim()
                .parse::<u64>()
                .map(Duration::from_nanos)
                .map_err(|e| {
                    KronosError::Ledger(format!("line {}: {:?} is not a timestamp: {}", index + 1, line, e))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_shared_ledger_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("api.ledger");

        let ledger = SharedLedger::open(&path).unwrap();

        assert!(path.exists());
        assert_eq!(ledger.path(), path.as_path());
        assert!(ledger.lock().unwrap().is_empty());
    }

    #[test]
    fn test_entries_visible_through_other_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.ledger");
        let writer = SharedLedger::open(&path).unwrap();
        let reader = SharedLedger::open(&path).unwrap();

        {
            let mut guard = writer.lock().unwrap();
            guard.append(secs(1)).unwrap();
            guard.append(Duration::from_nanos(1_500_000_001)).unwrap();
        }

        let guard = reader.lock().unwrap();
        assert_eq!(guard.entries(), &[secs(1), Duration::from_nanos(1_500_000_001)]);
    }

    #[test]
    fn test_prune_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.ledger");
        let ledger = SharedLedger::open(&path).unwrap();

        {
            let mut guard = ledger.lock().unwrap();
            for at in [1, 2, 3, 4] {
                guard.append(secs(at)).unwrap();
            }
            guard.prune_expired(secs(5), secs(2)).unwrap();
            assert_eq!(guard.entries(), &[secs(4)]);
            guard.append(secs(5)).unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "4000000000\n5000000000\n");
    }

    #[test]
    fn test_rewrite_overwrites_before_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.ledger");
        std::fs::write(&path, "1000000000\n2000000000\n12000000000\n").unwrap();
        let ledger = SharedLedger::open(&path).unwrap();

        {
            let mut guard = ledger.lock().unwrap();
            guard.prune_expired(secs(13), secs(5)).unwrap();
            assert_eq!(guard.entries(), &[secs(12)]);

            // Already rewritten while the lock is still held.
            assert_eq!(std::fs::read_to_string(&path).unwrap(), "12000000000\n");
            assert_eq!(std::fs::metadata(&path).unwrap().len(), 12);
        }

        let guard = ledger.lock().unwrap();
        assert_eq!(guard.entries(), &[secs(12)]);
    }

    #[test]
    fn test_corrupt_ledger_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.ledger");
        std::fs::write(&path, "1000\n\nnot-a-number\n").unwrap();
        let ledger = SharedLedger::open(&path).unwrap();

        let err = ledger.lock().err().unwrap();

        assert!(matches!(err, KronosError::Ledger(_)));
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn test_lock_excludes_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.ledger");
        let holder = SharedLedger::open(&path).unwrap();
        let waiter = SharedLedger::open(&path).unwrap();
        let (locked_tx, locked_rx) = mpsc::channel();

        let handle = std::thread::spawn(move || {
            let _guard = holder.lock().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(200));
        });

        locked_rx.recv().unwrap();
        let started = Instant::now();
        let _guard = waiter.lock().unwrap();

        assert!(started.elapsed() >= Duration::from_millis(150));
        handle.join().unwrap();
    }
}
