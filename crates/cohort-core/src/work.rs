//! # work
//!
//! why: let replication schedule follow-up proposals without spawning tasks from inside a tick
//! relations: filled by role/leader.rs and node.rs presence handling, drained by the node supervisor
//! what: Work items and the bounded WorkQueue

use crate::error::NodeError;
use crate::log::Command;
use std::collections::VecDeque;

/// A proposal the node issues on its own behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Work {
    pub command: Command,
    /// Short label for logs ("add_cohort", "leave", ...)
    pub reason: &'static str,
}

/// FIFO of pending internal proposals with a hard bound.
#[derive(Debug)]
pub struct WorkQueue {
    items: VecDeque<Work>,
    capacity: usize,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, work: Work) -> Result<(), NodeError> {
        if self.items.len() >= self.capacity {
            return Err(NodeError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.items.push_back(work);
        Ok(())
    }

    /// Take everything queued so far, oldest first.
    pub fn drain(&mut self) -> Vec<Work> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
