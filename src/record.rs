/// Record Implementation
///
/// A Record is one row of a dataview: an array of field values sized to the
/// field schema, two parallel per-field flag arrays and a modification mode.
///
/// # Flag history
///
/// `flags` holds the current per-field bits. `flags_history` mirrors only
/// CURSOR_MODIFIED and is cleared after a successful transmission, so the
/// server always sees one round trip of lookback.
///
/// # Ownership
///
/// Records are owned by exactly one `RecordsTable`. The prev/next links are
/// record ids maintained by a linked table, never references. `replicate()`
/// makes an independent snapshot for the `original`/backup copies.

use crate::codec;
use crate::config::WireEncoding;
use crate::dc_values::DcRef;
use crate::error::{Error, Result};
use crate::field::{truncate_to_size, FieldValue, StorageAttr};
use crate::fields::FieldsTable;
use crate::wire::{Tag, TagWriter};

/// Record identity. Negative ids are client-created rows the server has not
/// confirmed yet.
pub type RecId = i32;

/// Per-field flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flag {
    Null = 0x01,
    Invalid = 0x02,
    Modified = 0x04,
    Updated = 0x08,
    CursorModified = 0x10,
    ValueNotPassed = 0x20,
    ModifiedAtLeastOnce = 0x40,
}

impl Flag {
    #[inline]
    pub fn bit(self) -> u8 {
        self as u8
    }
}

/// Record modification mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordMode {
    #[default]
    None,
    Insert,
    Update,
    Delete,
}

impl RecordMode {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "N" => Some(RecordMode::None),
            "I" | "C" => Some(RecordMode::Insert),
            "U" | "M" => Some(RecordMode::Update),
            "D" => Some(RecordMode::Delete),
            _ => None,
        }
    }

    pub fn to_wire(self) -> &'static str {
        match self {
            RecordMode::None => "N",
            RecordMode::Insert => "I",
            RecordMode::Update => "U",
            RecordMode::Delete => "D",
        }
    }
}

/// Options for writing a record to the wire
#[derive(Debug, Clone, Copy)]
pub struct RecordWriteOptions {
    pub encoding: WireEncoding,
    /// Omit fields flagged VALUE_NOT_PASSED
    pub shrink: bool,
    /// Mark as the current record
    pub current: bool,
    /// Write the predecessor id for unconfirmed rows
    pub with_prev: bool,
}

#[derive(Debug, Clone)]
pub struct Record {
    id: RecId,
    values: Vec<FieldValue>,
    flags: Vec<u8>,
    flags_history: Vec<u8>,
    mode: RecordMode,
    /// Some synchronized field was changed since the last commit
    modified: bool,
    is_new: bool,
    computed: bool,
    in_compute: bool,
    in_recompute: bool,
    prev_id: Option<RecId>,
    next_id: Option<RecId>,
    dc_refs: Vec<DcRef>,
    db_pos: Option<String>,
    links_position: Option<String>,
}

impl Record {
    /// A record with every field at its declared default (no init
    /// expressions evaluated).
    pub fn new(id: RecId, fields: &FieldsTable) -> Self {
        let values: Vec<FieldValue> = fields.iter().map(|f| f.default_value().clone()).collect();
        let flags = values
            .iter()
            .map(|v| if v.is_null() { Flag::Null.bit() } else { 0 })
            .collect();
        Record {
            id,
            values,
            flags,
            flags_history: vec![0; fields.len()],
            mode: RecordMode::None,
            modified: false,
            is_new: false,
            computed: false,
            in_compute: false,
            in_recompute: false,
            prev_id: None,
            next_id: None,
            dc_refs: Vec::new(),
            db_pos: None,
            links_position: None,
        }
    }

    /// A client-created record: Insert mode, init expressions evaluated in
    /// field order.
    pub fn new_inserted(id: RecId, fields: &FieldsTable) -> Result<Self> {
        let mut rec = Record::new(id, fields);
        for idx in 0..fields.len() {
            let value = fields.init_value(idx, &rec)?;
            rec.set_field_value(idx, value, false, fields)?;
        }
        rec.mode = RecordMode::Insert;
        rec.is_new = true;
        Ok(rec)
    }

    pub fn id(&self) -> RecId {
        self.id
    }

    /// Server confirmation of a client-created row
    pub fn set_id(&mut self, id: RecId) {
        self.id = id;
    }

    pub fn field_count(&self) -> usize {
        self.values.len()
    }

    fn check_index(&self, idx: usize) -> Result<()> {
        let len = self.values.len();
        if self.flags.len() != len || self.flags_history.len() != len {
            return Err(Error::Corrupted {
                id: self.id,
                reason: format!(
                    "flag arrays ({}, {}) do not match {} fields",
                    self.flags.len(),
                    self.flags_history.len(),
                    len
                ),
            });
        }
        if idx >= len {
            return Err(Error::FieldIndex { index: idx, len });
        }
        Ok(())
    }

    pub fn value(&self, idx: usize) -> Result<&FieldValue> {
        self.check_index(idx)?;
        Ok(&self.values[idx])
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn flags(&self) -> &[u8] {
        &self.flags
    }

    pub fn flags_history(&self) -> &[u8] {
        &self.flags_history
    }

    pub fn is_flag_set(&self, idx: usize, flag: Flag) -> Result<bool> {
        self.check_index(idx)?;
        Ok(self.flags[idx] & flag.bit() != 0)
    }

    pub fn is_null(&self, idx: usize) -> Result<bool> {
        self.is_flag_set(idx, Flag::Null)
    }

    pub fn is_modified(&self, idx: usize) -> Result<bool> {
        self.is_flag_set(idx, Flag::Modified)
    }

    pub fn is_updated(&self, idx: usize) -> Result<bool> {
        self.is_flag_set(idx, Flag::Updated)
    }

    /// Set one flag bit. CURSOR_MODIFIED is mirrored into the history.
    pub fn set_flag(&mut self, idx: usize, flag: Flag) -> Result<()> {
        self.check_index(idx)?;
        self.flags[idx] |= flag.bit();
        if flag == Flag::CursorModified {
            self.flags_history[idx] |= flag.bit();
        }
        Ok(())
    }

    /// Clear one flag bit. The history is left alone.
    pub fn clear_flag(&mut self, idx: usize, flag: Flag) -> Result<()> {
        self.check_index(idx)?;
        self.flags[idx] &= !flag.bit();
        Ok(())
    }

    /// Clear CURSOR_MODIFIED, MODIFIED and their history for one field.
    /// Used for values written by link resolution, which is not user editing.
    pub fn clear_edit_flags(&mut self, idx: usize) -> Result<()> {
        self.check_index(idx)?;
        let mask = Flag::CursorModified.bit() | Flag::Modified.bit();
        self.flags[idx] &= !mask;
        self.flags_history[idx] = 0;
        Ok(())
    }

    /// Called once a transmission has been acknowledged.
    pub fn clear_history_flags(&mut self) {
        self.flags_history.iter_mut().for_each(|f| *f = 0);
    }

    /// Drop MODIFIED/UPDATED marks after a commit; the record keeps its
    /// values.
    pub fn clear_modified_flags(&mut self) {
        let mask = Flag::Modified.bit() | Flag::Updated.bit() | Flag::CursorModified.bit();
        self.flags.iter_mut().for_each(|f| *f &= !mask);
        self.modified = false;
    }

    /// Write a field value.
    ///
    /// The value is truncated to the field's declared size. When
    /// `mark_updated` is set and the field is part of the record main, the
    /// field is flagged MODIFIED/UPDATED and the record moves to Update mode.
    pub fn set_field_value(
        &mut self,
        idx: usize,
        value: FieldValue,
        mark_updated: bool,
        fields: &FieldsTable,
    ) -> Result<()> {
        self.check_index(idx)?;
        let def = fields.get(idx)?;
        if !value.fits(def.attr()) {
            return Err(Error::ValueMismatch {
                field: def.name().to_string(),
                attr: def.attr(),
                value,
            });
        }

        let value = match value {
            FieldValue::Alpha(s) if def.attr() == StorageAttr::Alpha => {
                FieldValue::Alpha(truncate_to_size(&s, def.size(), fields.double_byte()))
            }
            FieldValue::Unicode(s) if def.size() > 0 => {
                FieldValue::Unicode(truncate_to_size(&s, def.size(), false))
            }
            other => other,
        };

        if value.is_null() {
            self.flags[idx] |= Flag::Null.bit();
        } else {
            self.flags[idx] &= !Flag::Null.bit();
        }
        self.flags[idx] &= !Flag::Invalid.bit();
        self.values[idx] = value;

        if mark_updated && fields.in_record_main(idx) {
            self.set_mode(RecordMode::Update)?;
            self.flags[idx] |=
                Flag::Modified.bit() | Flag::Updated.bit() | Flag::ModifiedAtLeastOnce.bit();
            self.modified = true;
        }
        Ok(())
    }

    pub fn mode(&self) -> RecordMode {
        self.mode
    }

    /// Request a mode change.
    ///
    /// - `None` moves to any mode.
    /// - `Insert` absorbs `Update` and `Delete` (stays Insert).
    /// - `Update` moves to `Delete`.
    /// - `Delete` accepts nothing.
    pub fn set_mode(&mut self, mode: RecordMode) -> Result<()> {
        use RecordMode::*;
        let next = match (self.mode, mode) {
            (None, m) => m,
            (Insert, Insert | Update | Delete) => Insert,
            (Update, Update | Delete) => mode,
            (from, to) => return Err(Error::ModeTransition { from, to }),
        };
        self.mode = next;
        Ok(())
    }

    /// Commit: the server now holds this row as-is.
    pub fn reset_mode(&mut self) {
        self.mode = RecordMode::None;
        self.is_new = false;
    }

    /// Restore a sane mode after a rejected transaction.
    ///
    /// A record that had no pending mode is put back into Insert when the
    /// task is creating a row that was never confirmed, or into Update when
    /// its commit was in flight.
    pub fn restart(&mut self, old_mode: RecordMode, task_in_create_mode: bool, commit_in_flight: bool) {
        self.mode = match old_mode {
            RecordMode::None if task_in_create_mode && (self.is_new || self.id < 0) => {
                RecordMode::Insert
            }
            RecordMode::None if commit_in_flight => RecordMode::Update,
            other => other,
        };
    }

    pub fn is_record_modified(&self) -> bool {
        self.modified
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_computed(&self) -> bool {
        self.computed
    }

    pub fn set_computed(&mut self, computed: bool) {
        self.computed = computed;
    }

    pub fn in_compute(&self) -> bool {
        self.in_compute
    }

    pub fn set_in_compute(&mut self, v: bool) {
        self.in_compute = v;
    }

    pub fn in_recompute(&self) -> bool {
        self.in_recompute
    }

    pub fn set_in_recompute(&mut self, v: bool) {
        self.in_recompute = v;
    }

    pub fn prev_id(&self) -> Option<RecId> {
        self.prev_id
    }

    pub fn next_id(&self) -> Option<RecId> {
        self.next_id
    }

    pub(crate) fn set_links(&mut self, prev: Option<RecId>, next: Option<RecId>) {
        self.prev_id = prev;
        self.next_id = next;
    }

    pub(crate) fn set_prev_id(&mut self, prev: Option<RecId>) {
        self.prev_id = prev;
    }

    pub(crate) fn set_next_id(&mut self, next: Option<RecId>) {
        self.next_id = next;
    }

    pub fn dc_refs(&self) -> &[DcRef] {
        &self.dc_refs
    }

    pub fn set_dc_refs(&mut self, refs: Vec<DcRef>) {
        self.dc_refs = refs;
    }

    pub fn db_pos(&self) -> Option<&str> {
        self.db_pos.as_deref()
    }

    pub fn set_db_pos(&mut self, pos: Option<String>) {
        self.db_pos = pos;
    }

    pub fn links_position(&self) -> Option<&str> {
        self.links_position.as_deref()
    }

    pub fn set_links_position(&mut self, pos: Option<String>) {
        self.links_position = pos;
    }

    /// Deep copy of values and flags, independent of `self`.
    pub fn replicate(&self) -> Record {
        self.clone()
    }

    /// Same values with the same null-ness
    pub fn is_same_data(&self, other: &Record) -> bool {
        self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .zip(self.flags.iter().zip(&other.flags))
                .all(|((a, b), (fa, fb))| {
                    let null_a = fa & Flag::Null.bit() != 0;
                    let null_b = fb & Flag::Null.bit() != 0;
                    null_a == null_b && (null_a || a == b)
                })
    }

    /// Copy the values and flags of `src` into `self`, keeping identity and
    /// links. Used to restore from an `original` snapshot.
    pub fn copy_data_from(&mut self, src: &Record) {
        self.values = src.values.clone();
        self.flags = src.flags.clone();
        self.flags_history = src.flags_history.clone();
        self.mode = src.mode;
        self.modified = src.modified;
        self.dc_refs = src.dc_refs.clone();
    }

    /// Mark VALUE_NOT_PASSED on every field the server already holds.
    ///
    /// A field is shrunk iff it is null here, or its value and null-ness are
    /// identical to `server_copy`.
    pub fn set_shrink_flags(&mut self, server_copy: Option<&Record>) {
        let bit = Flag::ValueNotPassed.bit();
        for idx in 0..self.values.len() {
            let null_here = self.flags[idx] & Flag::Null.bit() != 0;
            let same_as_server = server_copy.is_some_and(|srv| {
                match (srv.values.get(idx), srv.flags.get(idx)) {
                    (Some(v), Some(f)) => {
                        let null_there = f & Flag::Null.bit() != 0;
                        null_there == null_here && *v == self.values[idx]
                    }
                    _ => false,
                }
            });
            if null_here || same_as_server {
                self.flags[idx] |= bit;
            } else {
                self.flags[idx] &= !bit;
            }
        }
    }

    pub fn clear_shrink_flags(&mut self) {
        let bit = Flag::ValueNotPassed.bit();
        self.flags.iter_mut().for_each(|f| *f &= !bit);
    }

    /// Write `<rec .../>`.
    pub fn write(&self, w: &mut TagWriter, fields: &FieldsTable, opts: RecordWriteOptions) {
        if fields.len() != self.values.len() {
            log::warn!(
                "record {} has {} fields, schema has {}",
                self.id,
                self.values.len(),
                fields.len()
            );
        }
        let mut buf = Vec::new();
        for (def, (value, flags)) in fields.iter().zip(self.values.iter().zip(&self.flags)) {
            if opts.shrink && flags & Flag::ValueNotPassed.bit() != 0 {
                continue;
            }
            codec::encode_value(&mut buf, def, value);
        }

        let out_flags: Vec<u8> = self
            .flags
            .iter()
            .zip(&self.flags_history)
            .map(|(f, h)| {
                let f = if opts.shrink { *f } else { f & !Flag::ValueNotPassed.bit() };
                f | h
            })
            .collect();

        w.start("rec")
            .attr("id", self.id)
            .attr("mode", self.mode.to_wire())
            .attr("value", codec::render(&buf, opts.encoding))
            .attr("flags", codec::encode_flags(&out_flags));
        if self.modified {
            w.attr("modified", 1);
        }
        if !self.dc_refs.is_empty() {
            w.attr("dc_refs", DcRef::join(&self.dc_refs));
        }
        if opts.with_prev && self.id < 0 {
            w.attr_opt("prev_rec_id", self.prev_id);
        }
        if opts.current {
            w.attr("curr_rec", 1);
        }
        w.end();
    }

    /// Build a record from a `<rec>`/`<REC>` tag.
    ///
    /// Fields flagged VALUE_NOT_PASSED are absent from the value buffer. A
    /// NULL one is null; any other takes its value and null-ness from
    /// `existing` (the copy already held for this id), or its default when
    /// there is none.
    pub fn parse(
        tag: &Tag,
        fields: &FieldsTable,
        encoding: WireEncoding,
        allow_legacy_flags: bool,
        existing: Option<&Record>,
    ) -> Result<Record> {
        let id = tag
            .attr_i32("id")?
            .ok_or_else(|| Error::wire(format!("<{}> without id", tag.name)))?;
        let mut rec = Record::new(id, fields);

        if let Some(raw) = tag.attr("flags") {
            rec.flags = codec::decode_flags(raw, fields.len(), allow_legacy_flags)?;
        }

        let buf = codec::parse_rendered(tag.attr("value").unwrap_or(""), encoding)?;
        let mut pos = 0;
        for (idx, def) in fields.iter().enumerate() {
            if rec.flags[idx] & Flag::ValueNotPassed.bit() != 0 {
                rec.flags[idx] &= !Flag::ValueNotPassed.bit();
                if rec.flags[idx] & Flag::Null.bit() != 0 {
                    rec.values[idx] = FieldValue::Null;
                    continue;
                }
                rec.values[idx] = match existing.and_then(|e| e.values.get(idx)) {
                    Some(v) => v.clone(),
                    None => def.default_value().clone(),
                };
                if let Some(e) = existing {
                    let null_bit = e.flags.get(idx).copied().unwrap_or(0) & Flag::Null.bit();
                    rec.flags[idx] = (rec.flags[idx] & !Flag::Null.bit()) | null_bit;
                }
                continue;
            }
            let value = codec::decode_value(&buf, &mut pos, def)?;
            rec.values[idx] = if rec.flags[idx] & Flag::Null.bit() != 0 {
                FieldValue::Null
            } else {
                value
            };
        }
        if pos != buf.len() {
            log::warn!(
                "record {}: {} trailing bytes in value buffer ignored",
                id,
                buf.len() - pos
            );
        }

        if let Some(mode) = tag.attr("mode") {
            rec.mode = RecordMode::from_wire(mode)
                .ok_or_else(|| Error::wire(format!("record {} has unknown mode {:?}", id, mode)))?;
        }
        rec.modified = tag.attr_bool("modified")?.unwrap_or(false);
        rec.is_new = id < 0;
        if let Some(raw) = tag.attr("dc_refs") {
            rec.dc_refs = DcRef::parse_list(raw)?;
        }
        rec.db_pos = tag.attr("db_pos").map(str::to_string);
        Ok(rec)
    }
}
