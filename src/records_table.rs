/// RecordsTable Implementation
///
/// An ordered sequence of records plus an id index. The sequence is a
/// `VecDeque` so that a window can grow at either edge in O(1) amortized
/// time; the index stores a logical slot number and a moving `front` offset
/// turns it into a position, so a prepend never renumbers the index.
///
/// In linked mode every record's prev/next ids mirror its neighbors. The
/// window uses linked mode; the modified set does not.

use crate::error::{Error, Result};
use crate::heap_sort::heap_sort_by;
use crate::record::{RecId, Record};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Default)]
pub struct RecordsTable {
    records: VecDeque<Record>,
    /// id -> logical slot; position = slot - front
    slots: HashMap<RecId, i64>,
    front: i64,
    linked: bool,
}

impl RecordsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table maintaining prev/next links between neighbors
    pub fn linked() -> Self {
        RecordsTable {
            linked: true,
            ..Self::default()
        }
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: RecId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Position of a record, or None when it is not in the table.
    pub fn index_of(&self, id: RecId) -> Option<usize> {
        self.slots.get(&id).map(|slot| (slot - self.front) as usize)
    }

    pub fn get(&self, idx: usize) -> Option<&Record> {
        self.records.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Record> {
        self.records.get_mut(idx)
    }

    pub fn by_id(&self, id: RecId) -> Option<&Record> {
        self.index_of(id).and_then(|idx| self.records.get(idx))
    }

    pub fn by_id_mut(&mut self, id: RecId) -> Option<&mut Record> {
        let idx = self.index_of(id)?;
        self.records.get_mut(idx)
    }

    pub fn first(&self) -> Option<&Record> {
        self.records.front()
    }

    pub fn last(&self) -> Option<&Record> {
        self.records.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.records.iter_mut()
    }

    pub fn ids(&self) -> Vec<RecId> {
        self.records.iter().map(Record::id).collect()
    }

    pub fn append(&mut self, record: Record) -> Result<()> {
        let len = self.records.len();
        self.insert_at(len, record)
    }

    pub fn prepend(&mut self, record: Record) -> Result<()> {
        self.insert_at(0, record)
    }

    /// Insert at a position, `0..=len`. A duplicate id is rejected.
    pub fn insert_at(&mut self, idx: usize, record: Record) -> Result<()> {
        let id = record.id();
        if self.slots.contains_key(&id) {
            return Err(Error::Corrupted {
                id,
                reason: "duplicate record id in table".to_string(),
            });
        }
        let len = self.records.len();
        if idx > len {
            return Err(Error::Corrupted {
                id,
                reason: format!("insert position {} past end {}", idx, len),
            });
        }

        if idx == 0 {
            self.front -= 1;
            self.records.push_front(record);
            self.slots.insert(id, self.front);
        } else if idx == len {
            self.records.push_back(record);
            self.slots.insert(id, self.front + idx as i64);
        } else {
            self.records.insert(idx, record);
            self.renumber_from(idx);
        }

        if self.linked {
            self.relink(idx);
            if idx > 0 {
                self.relink(idx - 1);
            }
            if idx + 1 < self.records.len() {
                self.relink(idx + 1);
            }
        }
        Ok(())
    }

    pub fn remove_by_id(&mut self, id: RecId) -> Option<Record> {
        let idx = self.index_of(id)?;
        self.remove_at(idx)
    }

    /// Remove a record and repair its neighbors' links.
    pub fn remove_at(&mut self, idx: usize) -> Option<Record> {
        let mut record = self.records.remove(idx)?;
        self.slots.remove(&record.id());

        if idx == 0 {
            self.front += 1;
        } else if idx < self.records.len() {
            self.renumber_from(idx);
        }

        if self.linked {
            if idx > 0 {
                self.relink(idx - 1);
            }
            if idx < self.records.len() {
                self.relink(idx);
            }
            record.set_links(None, None);
        }
        Some(record)
    }

    /// Replace a record that has the same id, keeping its position.
    /// Appends when the id is not present.
    pub fn upsert(&mut self, record: Record) -> Result<usize> {
        match self.index_of(record.id()) {
            Some(idx) => {
                let (prev, next) = {
                    let old = &self.records[idx];
                    (old.prev_id(), old.next_id())
                };
                let mut record = record;
                if self.linked {
                    record.set_links(prev, next);
                }
                self.records[idx] = record;
                Ok(idx)
            }
            None => {
                let idx = self.records.len();
                self.append(record)?;
                Ok(idx)
            }
        }
    }

    /// Change the id of a record in place (server confirmation of a
    /// client-created row).
    pub fn rekey(&mut self, old: RecId, new: RecId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if self.slots.contains_key(&new) {
            return Err(Error::Corrupted {
                id: new,
                reason: "rekey target already present".to_string(),
            });
        }
        let slot = self.slots.remove(&old).ok_or(Error::RecordNotFound(old))?;
        self.slots.insert(new, slot);
        let idx = (slot - self.front) as usize;
        self.records[idx].set_id(new);
        if self.linked {
            if idx > 0 {
                self.relink(idx - 1);
            }
            self.relink(idx);
            if idx + 1 < self.records.len() {
                self.relink(idx + 1);
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.slots.clear();
        self.front = 0;
    }

    /// Deep copy with a freshly built index.
    pub fn replicate(&self) -> RecordsTable {
        let mut copy = RecordsTable {
            linked: self.linked,
            ..RecordsTable::default()
        };
        copy.records = self.records.iter().map(Record::replicate).collect();
        copy.rebuild_index();
        copy
    }

    /// Reorder every record and rebuild the index and links.
    pub fn sort_by<F>(&mut self, cmp: F)
    where
        F: Fn(&Record, &Record) -> Ordering,
    {
        let mut rows: Vec<Record> = self.records.drain(..).collect();
        heap_sort_by(&mut rows, &cmp);
        self.records = rows.into();
        self.rebuild_index();
    }

    /// Reverse the current order
    pub fn reverse(&mut self) {
        let rows: Vec<Record> = self.records.drain(..).rev().collect();
        self.records = rows.into();
        self.rebuild_index();
    }

    fn rebuild_index(&mut self) {
        self.front = 0;
        self.slots.clear();
        for (i, rec) in self.records.iter().enumerate() {
            self.slots.insert(rec.id(), i as i64);
        }
        if self.linked {
            for i in 0..self.records.len() {
                self.relink(i);
            }
        }
    }

    fn renumber_from(&mut self, start: usize) {
        for i in start..self.records.len() {
            let id = self.records[i].id();
            self.slots.insert(id, self.front + i as i64);
        }
    }

    fn relink(&mut self, idx: usize) {
        let prev = idx
            .checked_sub(1)
            .and_then(|p| self.records.get(p))
            .map(Record::id);
        let next = self.records.get(idx + 1).map(Record::id);
        if let Some(rec) = self.records.get_mut(idx) {
            rec.set_links(prev, next);
        }
    }
}
