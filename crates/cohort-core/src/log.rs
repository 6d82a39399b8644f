//! # log
//!
//! why: manage the append-only ledger of commands that the cohort replicates
//! relations: written by role/ handlers, persisted via cohort-storage, read by node.rs on commit
//! what: LogEntry, Command, LogPosition, HardState, the Ledger trait and VecLedger

use crate::error::LedgerError;
use crate::{Index, PeerId, Term};
use serde::{Deserialize, Serialize};

/// What a log entry asks the node to do once committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Opaque application operation, handed to the lodge.
    App(Vec<u8>),
    /// Upsert a membership record.
    QuorumChange {
        peer: PeerId,
        provisional: bool,
        vote_weight: u64,
    },
    /// Drop a membership record.
    QuorumLeave { peer: PeerId },
    /// Leader barrier for a fresh term; applies to nothing.
    Noop,
}

impl Command {
    /// Membership commands are applied by the peer table, not the lodge.
    pub fn is_quorum(&self) -> bool {
        matches!(self, Command::QuorumChange { .. } | Command::QuorumLeave { .. })
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: Index,
    /// The command to be applied once committed
    pub command: Command,
    /// Swallow apply failures instead of surfacing them
    #[serde(default)]
    pub ignore_exc: bool,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, index: Index, command: Command) -> Self {
        Self {
            term,
            index,
            command,
            ignore_exc: false,
        }
    }

    /// Create an entry issued by the node itself, whose apply errors are ignored
    pub fn internal(term: Term, index: Index, command: Command) -> Self {
        Self {
            ignore_exc: true,
            ..Self::new(term, index, command)
        }
    }

    pub fn position(&self) -> LogPosition {
        LogPosition {
            term: self.term,
            index: self.index,
        }
    }
}

/// `(term, index)` of an entry; the default `(0, 0)` is the empty prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogPosition {
    pub term: Term,
    pub index: Index,
}

impl LogPosition {
    pub fn new(term: Term, index: Index) -> Self {
        Self { term, index }
    }

    /// Raft's "at least as up to date" ordering: later term wins, then longer log.
    pub fn is_up_to_date_with(&self, other: &LogPosition) -> bool {
        (self.term, self.index) >= (other.term, other.index)
    }
}

/// The part of node state that must survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<PeerId>,
}

/// Append-only, randomly indexable sequence of log entries.
///
/// Implementations decide where entries live; the node only relies on the
/// contract below. Indexes are 1-based and contiguous.
pub trait Ledger: Send {
    /// Number of entries, which is also the index of the last one.
    fn len(&self) -> Index;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry at `index`, `None` for 0 or past the end.
    fn get(&self, index: Index) -> Option<&LogEntry>;

    /// Add `entry` at the tail; its index must be `len + 1`.
    fn append(&mut self, entry: LogEntry) -> Result<(), LedgerError>;

    /// Discard everything from `start` onward and put `entries` in its place.
    fn replace(&mut self, start: Index, entries: Vec<LogEntry>) -> Result<(), LedgerError>;

    /// Clone of every entry from `start` to the tail.
    fn entries_from(&self, start: Index) -> Vec<LogEntry>;

    fn last_position(&self) -> LogPosition {
        self.get(self.len())
            .map(LogEntry::position)
            .unwrap_or_default()
    }

    /// Term stored at `index`, 0 when absent.
    fn term_at(&self, index: Index) -> Term {
        self.get(index).map(|e| e.term).unwrap_or(0)
    }

    /// Scanning from the tail, position of the first entry whose term is at
    /// most `term`; `(0, 0)` when there is none.
    fn find_term_start(&self, term: Term) -> LogPosition {
        let mut index = self.len();
        while index > 0 {
            if let Some(entry) = self.get(index) {
                if entry.term <= term {
                    return entry.position();
                }
            }
            index -= 1;
        }
        LogPosition::default()
    }

    /// Persist term and vote. Volatile ledgers keep them in memory.
    fn save_hard_state(&mut self, state: &HardState) -> Result<(), LedgerError>;

    fn load_hard_state(&self) -> Result<HardState, LedgerError>;
}

/// Check that `entries` run contiguously from `start`.
pub(crate) fn check_contiguous(start: Index, entries: &[LogEntry]) -> Result<(), LedgerError> {
    for (offset, entry) in entries.iter().enumerate() {
        let expected = start + offset as Index;
        if entry.index != expected {
            return Err(LedgerError::NonContiguous {
                expected,
                got: entry.index,
            });
        }
    }
    Ok(())
}

/// In-memory ledger; the default for tests and the simulator.
#[derive(Debug, Clone, Default)]
pub struct VecLedger {
    entries: Vec<LogEntry>,
    hard_state: HardState,
}

impl VecLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ledger from pre-existing entries (must start at index 1).
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self, LedgerError> {
        check_contiguous(1, &entries)?;
        Ok(Self {
            entries,
            hard_state: HardState::default(),
        })
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}

impl Ledger for VecLedger {
    fn len(&self) -> Index {
        self.entries.len() as Index
    }

    fn get(&self, index: Index) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    fn append(&mut self, entry: LogEntry) -> Result<(), LedgerError> {
        check_contiguous(self.len() + 1, std::slice::from_ref(&entry))?;
        self.entries.push(entry);
        Ok(())
    }

    fn replace(&mut self, start: Index, entries: Vec<LogEntry>) -> Result<(), LedgerError> {
        if start == 0 || start > self.len() + 1 {
            return Err(LedgerError::OutOfRange {
                start,
                len: self.len(),
            });
        }
        check_contiguous(start, &entries)?;
        self.entries.truncate((start - 1) as usize);
        self.entries.extend(entries);
        Ok(())
    }

    fn entries_from(&self, start: Index) -> Vec<LogEntry> {
        let from = start.max(1) - 1;
        self.entries
            .get(from as usize..)
            .map(<[LogEntry]>::to_vec)
            .unwrap_or_default()
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<(), LedgerError> {
        self.hard_state = state.clone();
        Ok(())
    }

    fn load_hard_state(&self) -> Result<HardState, LedgerError> {
        Ok(self.hard_state.clone())
    }
}

impl std::ops::Index<Index> for VecLedger {
    type Output = LogEntry;

    fn index(&self, index: Index) -> &LogEntry {
        assert!(index >= 1, "ledgers have no index 0");
        &self.entries[(index - 1) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(term: Term, index: Index) -> LogEntry {
        LogEntry::new(term, index, Command::App(vec![index as u8]))
    }

    fn ledger_with_terms(terms: &[Term]) -> VecLedger {
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, t)| app(*t, i as Index + 1))
            .collect();
        VecLedger::from_entries(entries).unwrap()
    }

    #[test]
    fn append_requires_next_index() {
        let mut ledger = VecLedger::new();
        ledger.append(app(1, 1)).unwrap();

        let err = ledger.append(app(1, 3)).unwrap_err();
        assert!(matches!(err, LedgerError::NonContiguous { expected: 2, got: 3 }));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn replace_truncates_suffix() {
        let mut ledger = ledger_with_terms(&[1, 1, 1, 2]);

        ledger.replace(3, vec![app(3, 3)]).unwrap();

        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger[3].term, 3);
        assert_eq!(ledger[2].term, 1);
    }

    #[test]
    fn replace_rejects_gap() {
        let mut ledger = ledger_with_terms(&[1]);
        assert!(ledger.replace(3, vec![app(1, 3)]).is_err());
        assert!(ledger.replace(0, vec![]).is_err());
    }

    #[test]
    fn find_term_start_scans_from_tail() {
        let ledger = ledger_with_terms(&[1, 1, 2, 2, 4]);

        assert_eq!(ledger.find_term_start(4), LogPosition::new(4, 5));
        assert_eq!(ledger.find_term_start(3), LogPosition::new(2, 4));
        assert_eq!(ledger.find_term_start(1), LogPosition::new(1, 2));
        assert_eq!(ledger.find_term_start(0), LogPosition::default());
    }

    #[test]
    fn entries_from_past_end_is_empty() {
        let ledger = ledger_with_terms(&[1, 1]);
        assert_eq!(ledger.entries_from(2).len(), 1);
        assert!(ledger.entries_from(3).is_empty());
        assert_eq!(ledger.entries_from(0).len(), 2);
    }

    #[test]
    fn up_to_date_prefers_term_then_length() {
        let short_new = LogPosition::new(3, 1);
        let long_old = LogPosition::new(2, 9);
        assert!(short_new.is_up_to_date_with(&long_old));
        assert!(!long_old.is_up_to_date_with(&short_new));
        assert!(long_old.is_up_to_date_with(&LogPosition::new(2, 9)));
    }
}
