//! # cohort-storage
//!
//! why: provide a durable ledger so term, vote and log survive a restart
//! relations: implements cohort-core's Ledger trait, used by cohort-sim when given a data dir
//! what: FileLedger (json files, atomic temp+rename writes, in-memory read cache)

use cohort_core::{HardState, Index, Ledger, LedgerError, LogEntry, VecLedger};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// file-based ledger using std::fs
///
/// stores state in a directory with:
/// - meta.json: current term and vote
/// - log.json: array of log entries
///
/// every mutation rewrites the affected file before returning, reads are
/// served from memory.
#[derive(Debug)]
pub struct FileLedger {
    /// directory holding the state files
    dir: PathBuf,
    cache: VecLedger,
}

impl FileLedger {
    /// open the ledger in `dir`, creating the directory if needed and
    /// loading whatever a previous run left there
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let entries: Vec<LogEntry> = read_json(&dir.join(LOG_FILE))?.unwrap_or_default();
        let hard_state: HardState = read_json(&dir.join(META_FILE))?.unwrap_or_default();
        let mut cache = VecLedger::from_entries(entries)?;
        cache.save_hard_state(&hard_state)?;

        tracing::debug!(
            dir = %dir.display(),
            entries = cache.len(),
            term = hard_state.current_term,
            "opened file ledger"
        );
        Ok(Self { dir, cache })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// remove the persisted files and forget everything in memory
    pub fn clear(&mut self) -> Result<(), LedgerError> {
        for name in [META_FILE, LOG_FILE] {
            match fs::remove_file(self.dir.join(name)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.cache = VecLedger::new();
        Ok(())
    }

    /// Write `next` to disk, then make it the log reads are served from.
    /// A failed write leaves the previous log in place.
    fn install(&mut self, next: VecLedger) -> Result<(), LedgerError> {
        let json = serde_json::to_string_pretty(next.entries())?;
        write_atomic(&self.dir, LOG_FILE, json.as_bytes())?;
        self.cache = next;
        Ok(())
    }
}

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.json";

/// atomic write: write to a temp file, sync, then rename over the target
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), LedgerError> {
    let temp_path = dir.join(format!("{}.tmp", name));
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))?;
    Ok(())
}

/// `None` when the file does not exist yet
fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, LedgerError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

impl Ledger for FileLedger {
    fn len(&self) -> Index {
        self.cache.len()
    }

    fn get(&self, index: Index) -> Option<&LogEntry> {
        self.cache.get(index)
    }

    fn append(&mut self, entry: LogEntry) -> Result<(), LedgerError> {
        let mut next = self.cache.clone();
        next.append(entry)?;
        self.install(next)
    }

    fn replace(&mut self, start: Index, entries: Vec<LogEntry>) -> Result<(), LedgerError> {
        let mut next = self.cache.clone();
        next.replace(start, entries)?;
        self.install(next)
    }

    fn entries_from(&self, start: Index) -> Vec<LogEntry> {
        self.cache.entries_from(start)
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<(), LedgerError> {
        let json = serde_json::to_string_pretty(state)?;
        write_atomic(&self.dir, META_FILE, json.as_bytes())?;
        self.cache.save_hard_state(state)
    }

    fn load_hard_state(&self) -> Result<HardState, LedgerError> {
        self.cache.load_hard_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_core::Command;
    use tempfile::tempdir;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry::new(term, index, Command::App(vec![index as u8]))
    }

    #[test]
    fn file_ledger_persists_term_and_vote() {
        let dir = tempdir().unwrap();
        let mut ledger = FileLedger::open(dir.path()).unwrap();

        let state = HardState {
            current_term: 7,
            voted_for: Some("c".into()),
        };
        ledger.save_hard_state(&state).unwrap();

        assert_eq!(ledger.load_hard_state().unwrap(), state);
        assert!(dir.path().join("meta.json").exists());
    }

    #[test]
    fn file_ledger_survives_restart() {
        let dir = tempdir().unwrap();

        // first "session"
        {
            let mut ledger = FileLedger::open(dir.path()).unwrap();
            ledger
                .save_hard_state(&HardState {
                    current_term: 10,
                    voted_for: Some("a".into()),
                })
                .unwrap();
            ledger.append(entry(10, 1)).unwrap();
        }

        // "restart" - new ledger instance
        {
            let ledger = FileLedger::open(dir.path()).unwrap();
            let state = ledger.load_hard_state().unwrap();

            assert_eq!(state.current_term, 10);
            assert_eq!(state.voted_for.as_deref(), Some("a"));
            assert_eq!(ledger.len(), 1);
        }
    }

    #[test]
    fn replace_rewrites_the_log_file() {
        let dir = tempdir().unwrap();
        let mut ledger = FileLedger::open(dir.path()).unwrap();
        for index in 1..=3 {
            ledger.append(entry(1, index)).unwrap();
        }

        ledger.replace(2, vec![entry(2, 2)]).unwrap();

        let reopened = FileLedger::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.term_at(2), 2);
    }

    #[test]
    fn failed_write_keeps_the_entry_out_of_the_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger");
        let mut ledger = FileLedger::open(&path).unwrap();
        ledger.append(entry(1, 1)).unwrap();

        fs::remove_dir_all(&path).unwrap();

        assert!(matches!(ledger.append(entry(1, 2)), Err(LedgerError::Io(_))));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.replace(1, vec![entry(2, 1)]).is_err());
        assert_eq!(ledger.term_at(1), 1);
    }

    #[test]
    fn rejected_append_leaves_the_file_alone() {
        let dir = tempdir().unwrap();
        let mut ledger = FileLedger::open(dir.path()).unwrap();
        ledger.append(entry(1, 1)).unwrap();

        assert!(ledger.append(entry(1, 5)).is_err());

        let reopened = FileLedger::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 1);
    }
}
