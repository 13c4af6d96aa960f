/// Shared lookup-value sets.
///
/// A DcValues set is the list of values (and their display strings) a
/// choice control offers. The server sends each set once and records refer
/// to it by `DcRef`. The registry counts references the same way the string
/// interner counts string uses; when a count drops to zero the set is queued
/// for an outbound removal notice so the server can release its copy.
///
/// # Examples
///
/// ```
/// use dataview::{DcRef, DcValuesRegistry};
///
/// let mut registry = DcValuesRegistry::new();
/// let r = DcRef { dit_idx: 3, dc_id: 1 };
/// registry.add_ref(r);
/// registry.add_ref(r);
///
/// registry.release(r);
/// assert!(registry.take_removed().is_empty());
///
/// registry.release(r);
/// assert_eq!(registry.take_removed(), vec![r]);
/// ```

use crate::error::{Error, Result};
use crate::wire::{Tag, TagKind, TagSource};
use std::collections::HashMap;

/// Handle of one lookup-value set: control index and set id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DcRef {
    pub dit_idx: i32,
    pub dc_id: i32,
}

impl DcRef {
    /// `dit,dc$dit,dc`
    pub fn parse_list(raw: &str) -> Result<Vec<DcRef>> {
        raw.split('$')
            .filter(|part| !part.trim().is_empty())
            .map(|part| {
                let (dit, dc) = part
                    .split_once(',')
                    .ok_or_else(|| Error::wire(format!("bad dc_refs entry {:?}", part)))?;
                let parse = |s: &str| {
                    s.trim()
                        .parse::<i32>()
                        .map_err(|_| Error::wire(format!("bad dc_refs entry {:?}", part)))
                };
                Ok(DcRef {
                    dit_idx: parse(dit)?,
                    dc_id: parse(dc)?,
                })
            })
            .collect()
    }

    pub fn join(refs: &[DcRef]) -> String {
        refs.iter()
            .map(|r| format!("{},{}", r.dit_idx, r.dc_id))
            .collect::<Vec<_>>()
            .join("$")
    }
}

/// One lookup-value set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcValues {
    pub id: i32,
    pub dit_idx: i32,
    pub values: Vec<String>,
    pub displays: Vec<String>,
}

impl DcValues {
    pub fn dc_ref(&self) -> DcRef {
        DcRef {
            dit_idx: self.dit_idx,
            dc_id: self.id,
        }
    }

    /// Parse the body of `<dc_vals id dit_idx>` up to `</dc_vals>`:
    /// one `<dc val=".." disp=".."/>` per entry.
    pub fn parse<S: TagSource + ?Sized>(open: &Tag, source: &mut S) -> Result<Self> {
        let id = open.attr_i32("id")?.ok_or_else(|| Error::wire("<dc_vals> without id"))?;
        let dit_idx = open
            .attr_i32("dit_idx")?
            .ok_or_else(|| Error::wire("<dc_vals> without dit_idx"))?;
        let mut set = DcValues {
            id,
            dit_idx,
            values: Vec::new(),
            displays: Vec::new(),
        };
        if open.kind == TagKind::Empty {
            return Ok(set);
        }
        while let Some(tag) = source.next_tag()? {
            if tag.is_close("dc_vals") {
                return Ok(set);
            }
            if tag.name == "dc" {
                let value = tag.attr("val").unwrap_or("").to_string();
                let display = tag.attr("disp").map(str::to_string).unwrap_or_else(|| value.clone());
                set.values.push(value);
                set.displays.push(display);
            } else {
                log::warn!("skipping unknown tag <{}> in <dc_vals>", tag.name);
            }
        }
        Err(Error::wire("missing </dc_vals>"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DcValuesRegistry {
    sets: HashMap<DcRef, DcValues>,
    ref_counts: HashMap<DcRef, u32>,
    /// Sets whose count reached zero, pending an outbound notice
    removed: Vec<DcRef>,
}

impl DcValuesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a set received from the server. The set starts unreferenced.
    pub fn register(&mut self, set: DcValues) {
        let r = set.dc_ref();
        self.removed.retain(|x| *x != r);
        self.sets.insert(r, set);
    }

    pub fn get(&self, r: DcRef) -> Option<&DcValues> {
        self.sets.get(&r)
    }

    pub fn ref_count(&self, r: DcRef) -> u32 {
        self.ref_counts.get(&r).copied().unwrap_or(0)
    }

    pub fn add_ref(&mut self, r: DcRef) {
        *self.ref_counts.entry(r).or_insert(0) += 1;
    }

    pub fn add_refs(&mut self, refs: &[DcRef]) {
        for &r in refs {
            self.add_ref(r);
        }
    }

    /// Drop one reference. At zero the set is forgotten and queued for
    /// removal. Releasing an unreferenced handle is ignored.
    pub fn release(&mut self, r: DcRef) {
        let Some(count) = self.ref_counts.get_mut(&r) else {
            log::warn!("release of unreferenced dc values {:?}", r);
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.ref_counts.remove(&r);
            self.sets.remove(&r);
            self.removed.push(r);
        }
    }

    pub fn release_refs(&mut self, refs: &[DcRef]) {
        for &r in refs {
            self.release(r);
        }
    }

    /// Removals not yet reported to the server
    pub fn pending_removals(&self) -> &[DcRef] {
        &self.removed
    }

    /// Drain the removal queue.
    pub fn take_removed(&mut self) -> Vec<DcRef> {
        std::mem::take(&mut self.removed)
    }

    pub fn clear(&mut self) {
        self.sets.clear();
        self.ref_counts.clear();
        self.removed.clear();
    }
}
