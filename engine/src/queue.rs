//! Ordered queue of pending mutations.
//!
//! Ordering rules:
//! 1. Mutations for the same record leave the queue in enqueue order.
//! 2. Once a Delete is queued for a record, later mutations for that record
//!    are cancelled instead of queued.
//! 3. Mutations for different records carry no relative ordering; a record
//!    whose head mutation is in flight does not block the others.

use crate::{MutationId, PendingMutation, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// What happened to a mutation offered to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    /// Queued at this sequence number
    Queued(u64),
    /// Dropped because a Delete for the same record is already queued
    Superseded { by: MutationId },
}

/// FIFO of pending mutations keyed by a monotonically increasing sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationQueue {
    entries: BTreeMap<u64, PendingMutation>,
    next_seq: u64,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from persisted entries, keeping their sequence numbers.
    pub fn from_entries(entries: impl IntoIterator<Item = PendingMutation>) -> Self {
        let mut queue = Self::new();
        for entry in entries {
            queue.next_seq = queue.next_seq.max(entry.seq + 1);
            queue.entries.insert(entry.seq, entry);
        }
        queue
    }

    /// Offer a mutation. Assigns its sequence number when queued.
    pub fn enqueue(&mut self, mut mutation: PendingMutation) -> Enqueued {
        if let Some(delete) = self
            .entries
            .values()
            .find(|m| m.record_id == mutation.record_id && m.is_delete())
        {
            return Enqueued::Superseded {
                by: delete.mutation_id.clone(),
            };
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        mutation.seq = seq;
        self.entries.insert(seq, mutation);
        Enqueued::Queued(seq)
    }

    /// Oldest mutation overall.
    pub fn peek(&self) -> Option<&PendingMutation> {
        self.entries.values().next()
    }

    /// Remove and return the oldest mutation overall.
    pub fn dequeue(&mut self) -> Option<PendingMutation> {
        let seq = *self.entries.keys().next()?;
        self.entries.remove(&seq)
    }

    /// Oldest mutation of each record, skipping records in `busy`, in queue
    /// order. At most `limit` entries are returned.
    pub fn ready_heads(&self, busy: &HashSet<RecordId>, limit: usize) -> Vec<&PendingMutation> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut heads = Vec::new();
        for mutation in self.entries.values() {
            if heads.len() >= limit {
                break;
            }
            if !seen.insert(mutation.record_id.as_str()) {
                continue;
            }
            if busy.contains(&mutation.record_id) {
                continue;
            }
            heads.push(mutation);
        }
        heads
    }

    /// Oldest mutation for a record.
    pub fn head_for(&self, record_id: &str) -> Option<&PendingMutation> {
        self.entries.values().find(|m| m.record_id == record_id)
    }

    /// All mutations for a record in queue order.
    pub fn pending_for(&self, record_id: &str) -> Vec<&PendingMutation> {
        self.entries
            .values()
            .filter(|m| m.record_id == record_id)
            .collect()
    }

    /// Remove and return every mutation for a record, in queue order.
    pub fn take_for(&mut self, record_id: &str) -> Vec<PendingMutation> {
        let seqs: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, m)| m.record_id == record_id)
            .map(|(seq, _)| *seq)
            .collect();
        seqs.into_iter()
            .filter_map(|seq| self.entries.remove(&seq))
            .collect()
    }

    /// Remove one mutation by id.
    pub fn remove(&mut self, mutation_id: &str) -> Option<PendingMutation> {
        let seq = self
            .entries
            .iter()
            .find(|(_, m)| m.mutation_id == mutation_id)
            .map(|(seq, _)| *seq)?;
        self.entries.remove(&seq)
    }

    /// Replace a queued mutation in place, keeping its position.
    pub fn replace(&mut self, mutation: PendingMutation) -> bool {
        match self.entries.get_mut(&mutation.seq) {
            Some(slot) if slot.mutation_id == mutation.mutation_id => {
                *slot = mutation;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingMutation> {
        self.entries.values()
    }
}
