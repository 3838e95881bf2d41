//! The replicated Raft log, layered over a `LogStore`.
//!
//! Entries carry an index and term. Index 0 with term 0 is the implicit
//! empty prefix. Two logs that contain an entry with the same index and
//! term are identical up to that entry, and committed entries are never
//! removed except by compaction behind a snapshot.

use super::store::{HardState, LogStore};
use super::{Index, NodeId, Snapshot, Term};
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};

/// A log entry. A `None` command is the no-op a new leader appends to commit
/// entries from earlier terms.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub index: Index,
    pub term: Term,
    pub command: Option<Vec<u8>>,
}

pub struct RaftLog {
    store: Box<dyn LogStore>,
    /// Retained entries, contiguous. May overlap the snapshot when trailing
    /// entries are kept for slow followers.
    entries: Vec<Entry>,
    snapshot: Option<Snapshot>,
    term: Term,
    vote: Option<NodeId>,
    commit_index: Index,
}

impl RaftLog {
    /// Recover the log from a store.
    pub fn new(mut store: Box<dyn LogStore>) -> Result<Self> {
        let stored = store.load()?;
        for pair in stored.entries.windows(2) {
            if pair[1].index != pair[0].index + 1 || pair[1].term < pair[0].term {
                return Err(Error::Corrupted(format!(
                    "log entries out of order at index {}",
                    pair[1].index
                )));
            }
        }
        let mut log = Self {
            store,
            entries: stored.entries,
            snapshot: stored.snapshot,
            term: stored.hard_state.term,
            vote: stored.hard_state.vote,
            commit_index: 0,
        };
        if let (Some(first), Some(snapshot)) = (log.entries.first(), &log.snapshot) {
            if first.index > snapshot.last_index + 1 {
                return Err(Error::Corrupted("gap between snapshot and log".into()));
            }
        }
        if stored.hard_state.commit_index > log.last_index() {
            return Err(Error::Corrupted(format!(
                "committed index {} missing from log ending at {}",
                stored.hard_state.commit_index,
                log.last_index()
            )));
        }
        log.commit_index = stored.hard_state.commit_index.max(log.snapshot_index());
        Ok(log)
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn vote(&self) -> Option<&NodeId> {
        self.vote.as_ref()
    }

    /// Durably record the current term and vote.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeId>) -> Result<()> {
        if term < self.term {
            return Err(Error::Internal(format!(
                "term regression {} -> {}",
                self.term, term
            )));
        }
        if term == self.term && self.vote.is_some() && vote != self.vote {
            return Err(Error::Internal(format!("vote change in term {}", term)));
        }
        self.term = term;
        self.vote = vote;
        self.save_hard_state()
    }

    fn save_hard_state(&mut self) -> Result<()> {
        let hard_state = HardState {
            term: self.term,
            vote: self.vote.clone(),
            commit_index: self.commit_index,
        };
        self.store.save_hard_state(&hard_state)
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn snapshot_index(&self) -> Index {
        self.snapshot.as_ref().map(|s| s.last_index).unwrap_or(0)
    }

    fn snapshot_term(&self) -> Term {
        self.snapshot.as_ref().map(|s| s.last_term).unwrap_or(0)
    }

    /// First index that can still be read from the log.
    pub fn first_index(&self) -> Index {
        self.entries
            .first()
            .map(|e| e.index)
            .unwrap_or_else(|| self.snapshot_index() + 1)
    }

    pub fn last_index(&self) -> Index {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or_else(|| self.snapshot_index())
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or_else(|| self.snapshot_term())
    }

    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    pub fn commit_term(&self) -> Term {
        self.term_at(self.commit_index).unwrap_or(0)
    }

    pub fn get(&self, index: Index) -> Option<&Entry> {
        let first = self.entries.first()?.index;
        if index < first {
            return None;
        }
        self.entries.get((index - first) as usize)
    }

    /// Term of the entry at `index`, if it is known.
    pub fn term_at(&self, index: Index) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if let Some(entry) = self.get(index) {
            return Some(entry.term);
        }
        if index == self.snapshot_index() {
            return Some(self.snapshot_term());
        }
        None
    }

    /// Whether the log contains (index, term). Indexes covered by the
    /// snapshot are committed, so they always match the leader's.
    pub fn has(&self, index: Index, term: Term) -> bool {
        if index <= self.snapshot_index() && self.get(index).is_none() {
            return true;
        }
        self.term_at(index) == Some(term)
    }

    /// Entries in `[from, to]`, or None if part of the range was compacted.
    pub fn scan(&self, from: Index, to: Index) -> Option<Vec<Entry>> {
        if from < self.first_index() {
            return None;
        }
        if from > to || from > self.last_index() {
            return Some(Vec::new());
        }
        let first = self.first_index();
        let start = (from - first) as usize;
        let end = ((to.min(self.last_index()) + 1).saturating_sub(first)) as usize;
        Some(self.entries.get(start..end.max(start))?.to_vec())
    }

    /// Append a command at the current term. Returns its index.
    pub fn append(&mut self, command: Option<Vec<u8>>) -> Result<Index> {
        let entry = Entry {
            index: self.last_index() + 1,
            term: self.term,
            command,
        };
        self.store.append(std::slice::from_ref(&entry))?;
        let index = entry.index;
        self.entries.push(entry);
        Ok(index)
    }

    /// Splice leader entries into the log, truncating any conflicting
    /// suffix. Entries must be contiguous and directly follow a matching
    /// prefix. Returns the last index of the spliced range.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        let Some(last) = entries.last().map(|e| e.index) else {
            return Ok(self.last_index());
        };

        // Skip entries we already have, including ones behind the snapshot.
        let mut new_entries = Vec::new();
        for entry in entries {
            if !new_entries.is_empty() {
                new_entries.push(entry);
                continue;
            }
            if entry.index <= self.snapshot_index() && self.get(entry.index).is_none() {
                continue;
            }
            if self.term_at(entry.index) == Some(entry.term) {
                continue;
            }
            new_entries.push(entry);
        }
        let Some(first_new) = new_entries.first().map(|e| e.index) else {
            return Ok(last);
        };

        if first_new > self.last_index() + 1 {
            return Err(Error::Internal(format!(
                "splice gap: entry {} after last index {}",
                first_new,
                self.last_index()
            )));
        }

        if first_new <= self.last_index() {
            if first_new <= self.commit_index {
                return Err(Error::Internal(format!(
                    "conflicting entry {} at or below commit index {}",
                    first_new, self.commit_index
                )));
            }
            tracing::debug!("Truncating log from index {}", first_new);
            let keep = (first_new - self.first_index()) as usize;
            self.entries.truncate(keep);
            self.entries.extend(new_entries);
            self.store.rewrite(&self.entries)?;
        } else {
            self.store.append(&new_entries)?;
            self.entries.extend(new_entries);
        }
        Ok(last)
    }

    /// Advance the commit index. Never moves backwards.
    pub fn commit(&mut self, index: Index) -> Result<()> {
        if index <= self.commit_index {
            return Ok(());
        }
        if index > self.last_index() {
            return Err(Error::Internal(format!(
                "commit index {} beyond last index {}",
                index,
                self.last_index()
            )));
        }
        self.commit_index = index;
        self.save_hard_state()
    }

    /// Store a snapshot taken at or below the commit index and drop entries
    /// older than `trailing` entries behind it.
    pub fn compact(&mut self, snapshot: Snapshot, trailing: u64) -> Result<()> {
        if snapshot.last_index > self.commit_index {
            return Err(Error::Internal(format!(
                "snapshot at {} beyond commit index {}",
                snapshot.last_index, self.commit_index
            )));
        }
        self.store.save_snapshot(&snapshot)?;
        let keep_from = snapshot.last_index.saturating_sub(trailing) + 1;
        self.snapshot = Some(snapshot);
        if keep_from > self.first_index() {
            self.entries.retain(|e| e.index >= keep_from);
            self.store.rewrite(&self.entries)?;
        }
        Ok(())
    }

    /// Replace the log prefix with a snapshot received from the leader.
    /// Entries after the snapshot survive only if the log matches it.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let matches = self.term_at(snapshot.last_index) == Some(snapshot.last_term);
        self.store.save_snapshot(&snapshot)?;
        if matches {
            self.entries.retain(|e| e.index > snapshot.last_index);
        } else {
            self.entries.clear();
        }
        self.store.rewrite(&self.entries)?;
        self.commit_index = self.commit_index.max(snapshot.last_index);
        self.snapshot = Some(snapshot);
        self.save_hard_state()
    }
}
