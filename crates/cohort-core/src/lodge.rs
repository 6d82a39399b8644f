//! # lodge
//!
//! why: apply committed commands to local state, one entry at a time, in index order
//! relations: invoked by node.rs once the ledger shows an entry as committed
//! what: Lodge trait (with the ignore_exc contract) and MemLodge, a key/value reference lodge

use crate::error::ApplyError;
use crate::log::{Command, LogEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Deterministic state machine fed with committed entries.
pub trait Lodge: Send {
    /// Execute the entry's command, failing on anything malformed or unknown.
    fn execute(&mut self, entry: &LogEntry) -> Result<(), ApplyError>;

    /// Execute the entry, swallowing the failure when the entry asks for it.
    fn apply(&mut self, entry: &LogEntry) -> Result<(), ApplyError> {
        match self.execute(entry) {
            Err(err) if entry.ignore_exc => {
                tracing::warn!(index = entry.index, error = %err, "ignored apply failure");
                Ok(())
            }
            other => other,
        }
    }

    /// JSON view of the state, for status reports.
    fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Operations understood by [`MemLodge`], carried as JSON in `Command::App`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KvOp {
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvOp {
    /// Encode as an application command.
    pub fn to_command(&self) -> Command {
        // a KvOp has only string fields, serialization cannot fail
        Command::App(serde_json::to_vec(self).unwrap_or_default())
    }
}

/// In-memory key/value lodge.
#[derive(Debug, Clone, Default)]
pub struct MemLodge {
    data: BTreeMap<String, String>,
    applied: u64,
}

impl MemLodge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Number of entries executed successfully.
    pub fn applied(&self) -> u64 {
        self.applied
    }
}

impl Lodge for MemLodge {
    fn execute(&mut self, entry: &LogEntry) -> Result<(), ApplyError> {
        let payload = match &entry.command {
            Command::App(payload) => payload,
            Command::Noop => return Ok(()),
            other => {
                return Err(ApplyError::Malformed(format!(
                    "kv lodge cannot apply {:?}",
                    other
                )))
            }
        };
        let op: KvOp = serde_json::from_slice(payload)
            .map_err(|e| ApplyError::Malformed(e.to_string()))?;
        match op {
            KvOp::Set { key, value } => {
                self.data.insert(key, value);
            }
            KvOp::Delete { key } => {
                self.data.remove(&key);
            }
        }
        self.applied += 1;
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&self.data).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &str) -> Command {
        KvOp::Set {
            key: key.into(),
            value: value.into(),
        }
        .to_command()
    }

    #[test]
    fn applies_set_and_delete() {
        let mut lodge = MemLodge::new();
        lodge.apply(&LogEntry::new(1, 1, set("a", "1"))).unwrap();
        lodge.apply(&LogEntry::new(1, 2, set("b", "2"))).unwrap();
        lodge
            .apply(&LogEntry::new(
                1,
                3,
                KvOp::Delete { key: "a".into() }.to_command(),
            ))
            .unwrap();

        assert_eq!(lodge.get("a"), None);
        assert_eq!(lodge.get("b"), Some("2"));
        assert_eq!(lodge.applied(), 3);
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let mut lodge = MemLodge::new();
        let entry = LogEntry::new(1, 1, Command::App(b"not json".to_vec()));

        assert!(matches!(lodge.apply(&entry), Err(ApplyError::Malformed(_))));
    }

    #[test]
    fn ignore_exc_swallows_failure() {
        let mut lodge = MemLodge::new();
        let entry = LogEntry::internal(1, 1, Command::App(b"{\"op\":\"explode\"}".to_vec()));

        assert!(lodge.apply(&entry).is_ok());
        assert_eq!(lodge.applied(), 0);
    }

    #[test]
    fn snapshot_lists_keys() {
        let mut lodge = MemLodge::new();
        lodge.apply(&LogEntry::new(1, 1, set("k", "v"))).unwrap();
        assert_eq!(lodge.snapshot(), serde_json::json!({"k": "v"}));
    }
}
