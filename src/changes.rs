/// Window change tracking.
///
/// Every structural change to a DataView window (a record inserted by a
/// chunk or by the user, a record removed by delete or by eviction) is
/// recorded as a `WindowChange`. Hosts poll the changeset to refresh their
/// row displays incrementally; the DataView itself turns evictions into the
/// cache-deletion notices of its next outbound diff.
///
/// # Usage Pattern
///
/// 1. Window operations push `WindowChange` events
/// 2. Changes accumulate until the host drains them
/// 3. `IndexAdjuster` keeps positional state (current, top) pointing at
///    the same records across the change

use crate::record::RecId;

/// A single structural change to the window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowChange {
    /// A record now occupies `index`
    RecordInserted { index: usize, id: RecId },

    /// The record at `index` left the window. `evicted` is true when it
    /// was dropped to bound the window size rather than deleted.
    RecordRemoved { index: usize, id: RecId, evicted: bool },
}

impl WindowChange {
    pub fn index(&self) -> usize {
        match self {
            WindowChange::RecordInserted { index, .. } => *index,
            WindowChange::RecordRemoved { index, .. } => *index,
        }
    }

    pub fn id(&self) -> RecId {
        match self {
            WindowChange::RecordInserted { id, .. } => *id,
            WindowChange::RecordRemoved { id, .. } => *id,
        }
    }
}

/// Changes accumulated since the last drain
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    changes: Vec<WindowChange>,
    /// Incremented each time the changeset is drained or cleared
    generation: u64,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: WindowChange) {
        self.changes.push(change);
    }

    pub fn changes(&self) -> &[WindowChange] {
        &self.changes
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn clear(&mut self) {
        self.changes.clear();
        self.generation += 1;
    }

    /// Drain changes, returning ownership and clearing the buffer
    pub fn drain(&mut self) -> Vec<WindowChange> {
        self.generation += 1;
        std::mem::take(&mut self.changes)
    }

    /// Ids evicted since the last drain
    pub fn evicted_ids(&self) -> Vec<RecId> {
        self.changes
            .iter()
            .filter_map(|c| match c {
                WindowChange::RecordRemoved { id, evicted: true, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }
}

/// Keeps window positions pointing at the same record across inserts and
/// removals.
pub struct IndexAdjuster;

impl IndexAdjuster {
    /// Position after a record was inserted at `insert_index`
    pub fn adjust_for_insert(index: usize, insert_index: usize) -> usize {
        if index >= insert_index {
            index + 1
        } else {
            index
        }
    }

    /// Position after the record at `delete_index` was removed, or None if
    /// it was that record
    pub fn adjust_for_delete(index: usize, delete_index: usize) -> Option<usize> {
        if index == delete_index {
            None
        } else if index > delete_index {
            Some(index - 1)
        } else {
            Some(index)
        }
    }
}
