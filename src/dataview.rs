/// DataView Implementation
///
/// A DataView is the client-side window over a server-side table that one
/// task navigates. It owns:
///
/// - the window: a contiguous, linked run of records plus the current
///   position and the first visible row
/// - the modified set: snapshots of records changed since the last round
///   trip, waiting to be sent
/// - the resident table caches, links and recompute graph used to derive
///   field values without the server
///
/// # Navigation
///
/// `set_current_by_index` moves the current position. When the target is
/// outside the window and the window does not already hold that end of the
/// table, exactly one chunk is fetched per step and the target index is
/// shifted by however far the window's anchor row moved. A target beyond a
/// known end fails with `Error::OutOfView` and leaves the position alone.
///
/// # Round trips
///
/// Every request carries the outbound diff built by `build_outbound`. The
/// diff is only consumed after the transport reports success, so a failed
/// send loses nothing. The transport blocks; `&mut self` on every entry
/// point keeps the view from being re-entered while a request is in flight.
use crate::changes::{Changeset, IndexAdjuster, WindowChange};
use crate::config::{EngineConfig, InsertSide};
use crate::dc_values::{DcValues, DcValuesRegistry};
use crate::error::{Boundary, Error, Result};
use crate::field::FieldValue;
use crate::fields::FieldsTable;
use crate::host::{DetachedHost, TaskHost};
use crate::link::{links_position, DataviewHeader, EvalTiming};
use crate::recompute::{ExecutionPlan, Recompute, RecomputeItem, RecomputeOutcome, RecomputeTable};
use crate::record::{Flag, RecId, Record, RecordMode, RecordWriteOptions};
use crate::records_table::RecordsTable;
use crate::recovery::{self, RecoveryAction, ServerRecovery, TransactionPhase};
use crate::table_cache::{TableCache, TableCacheSet};
use crate::transport::{ChunkDirection, Command, Disconnected, Request, Transport};
use crate::wire::{skip_element, Tag, TagKind, TagSource, TagWriter, Tokenizer};
use std::collections::{HashSet, VecDeque};

const HEADER_ATTRS: &[&str] = &["rmpos", "compute_by", "has_main_tbl", "chunk_size"];

const DATAVIEW_ATTRS: &[&str] = &[
    "taskid",
    "invalidate",
    "insert_at",
    "include_first",
    "include_last",
    "top_rec_id",
    "recovery",
    "dvpos_value",
    "total_records_count",
    "records_before_current_view",
];

/// Navigation target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecIndex {
    First,
    Last,
    /// Window position; may lie outside the loaded rows
    At(isize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavOptions {
    /// Run the exit action of the record being left
    pub do_suffix: bool,
    /// Re-enter the current record when it is the target
    pub ignore_current: bool,
    /// Resolve the target's links on entry
    pub compute: bool,
    /// Passed through to `TaskHost::current_changed`
    pub display_hint: bool,
}

impl Default for NavOptions {
    fn default() -> Self {
        NavOptions {
            do_suffix: true,
            ignore_current: false,
            compute: true,
            display_hint: true,
        }
    }
}

impl NavOptions {
    pub fn without_suffix() -> Self {
        NavOptions {
            do_suffix: false,
            ..Self::default()
        }
    }

    pub fn reentering(mut self) -> Self {
        self.ignore_current = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskMode {
    #[default]
    Modify,
    Create,
    Query,
}

impl TaskMode {
    pub fn to_wire(self) -> &'static str {
        match self {
            TaskMode::Modify => "M",
            TaskMode::Create => "C",
            TaskMode::Query => "Q",
        }
    }
}

/// Who evaluates computed fields (`compute_by` header attribute)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeBy {
    #[default]
    Client,
    Server,
}

/// Coarse state of the current position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    /// Rows are loaded but none is current
    NoCurrent,
    Pinned,
    /// Nothing loaded yet
    AwaitingFetch,
    /// A recovery must be processed before anything else
    Recovering,
}

pub struct DataView {
    task_id: String,
    config: EngineConfig,
    fields: FieldsTable,

    window: RecordsTable,
    modified: RecordsTable,
    current_index: Option<usize>,
    top_index: usize,
    includes_first: bool,
    includes_last: bool,
    /// Snapshot of the current record taken on entry, for cancel
    original: Option<Record>,
    previous_id: Option<RecId>,

    pending_recovery: RecoveryAction,
    recovery_phase: TransactionPhase,
    stop_execution: bool,
    phase: TransactionPhase,

    chunk_size: usize,
    insert_at: InsertSide,
    inserted_records_count: usize,
    task_mode: TaskMode,
    compute_by: ComputeBy,
    flush_updates: bool,
    has_main_table: bool,

    links: Vec<DataviewHeader>,
    recomputes: RecomputeTable,
    caches: TableCacheSet,
    dc_values: DcValuesRegistry,
    changes: Changeset,
    /// Evicted rows the server may drop from its copy
    pending_cache_deletes: Vec<RecId>,
    reset_range: bool,
    reset_locate: bool,
    reset_sort: bool,

    /// The current record as last transmitted; the base for shrinking
    last_sent_current: Option<Record>,
    /// Ids of the modified set in the last successful request
    last_batch: Vec<RecId>,

    total_records_count: Option<usize>,
    records_before_current_view: Option<usize>,
    dvpos_value: Option<String>,
    top_rec_id: Option<RecId>,
    next_new_id: RecId,

    transport: Box<dyn Transport>,
    host: Box<dyn TaskHost>,
}

impl DataView {
    pub fn new(task_id: impl Into<String>, fields: FieldsTable, config: EngineConfig) -> Self {
        let mut fields = fields;
        fields.set_double_byte(config.double_byte_locale);
        DataView {
            task_id: task_id.into(),
            chunk_size: config.chunk_size,
            insert_at: config.insert_at,
            config,
            fields,
            window: RecordsTable::linked(),
            modified: RecordsTable::new(),
            current_index: None,
            top_index: 0,
            includes_first: false,
            includes_last: false,
            original: None,
            previous_id: None,
            pending_recovery: RecoveryAction::None,
            recovery_phase: TransactionPhase::Idle,
            stop_execution: false,
            phase: TransactionPhase::Idle,
            inserted_records_count: 0,
            task_mode: TaskMode::Modify,
            compute_by: ComputeBy::Client,
            flush_updates: false,
            has_main_table: true,
            links: Vec::new(),
            recomputes: RecomputeTable::new(),
            caches: TableCacheSet::new(),
            dc_values: DcValuesRegistry::new(),
            changes: Changeset::new(),
            pending_cache_deletes: Vec::new(),
            reset_range: false,
            reset_locate: false,
            reset_sort: false,
            last_sent_current: None,
            last_batch: Vec::new(),
            total_records_count: None,
            records_before_current_view: None,
            dvpos_value: None,
            top_rec_id: None,
            next_new_id: -1,
            transport: Box::new(Disconnected),
            host: Box::new(DetachedHost),
        }
    }

    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Box::new(transport);
        self
    }

    pub fn with_host(mut self, host: impl TaskHost + 'static) -> Self {
        self.host = Box::new(host);
        self
    }

    // -- accessors ------------------------------------------------------

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn fields(&self) -> &FieldsTable {
        &self.fields
    }

    pub fn window(&self) -> &RecordsTable {
        &self.window
    }

    /// Records queued for the next request
    pub fn modified_records(&self) -> &RecordsTable {
        &self.modified
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn current_id(&self) -> Option<RecId> {
        self.current_record().map(Record::id)
    }

    pub fn current_record(&self) -> Option<&Record> {
        self.current_index.and_then(|idx| self.window.get(idx))
    }

    pub fn previous_id(&self) -> Option<RecId> {
        self.previous_id
    }

    pub fn top_index(&self) -> usize {
        self.top_index
    }

    pub fn set_top_index(&mut self, top: usize) {
        self.top_index = top;
    }

    pub fn includes_first(&self) -> bool {
        self.includes_first
    }

    pub fn includes_last(&self) -> bool {
        self.includes_last
    }

    pub fn inserted_records_count(&self) -> usize {
        self.inserted_records_count
    }

    pub fn reset_inserted_records_count(&mut self) {
        self.inserted_records_count = 0;
    }

    pub fn task_mode(&self) -> TaskMode {
        self.task_mode
    }

    pub fn set_task_mode(&mut self, mode: TaskMode) {
        self.task_mode = mode;
    }

    pub fn compute_by(&self) -> ComputeBy {
        self.compute_by
    }

    pub fn flush_updates(&self) -> bool {
        self.flush_updates
    }

    pub fn has_main_table(&self) -> bool {
        self.has_main_table
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn insert_side(&self) -> InsertSide {
        self.insert_at
    }

    pub fn pending_recovery(&self) -> RecoveryAction {
        self.pending_recovery
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_execution
    }

    pub fn caches(&self) -> &TableCacheSet {
        &self.caches
    }

    pub fn dc_values(&self) -> &DcValuesRegistry {
        &self.dc_values
    }

    pub fn links(&self) -> &[DataviewHeader] {
        &self.links
    }

    pub fn total_records_count(&self) -> Option<usize> {
        self.total_records_count
    }

    pub fn records_before_current_view(&self) -> Option<usize> {
        self.records_before_current_view
    }

    pub fn dvpos_value(&self) -> Option<&str> {
        self.dvpos_value.as_deref()
    }

    /// Window changes since the last drain
    pub fn drain_changes(&mut self) -> Vec<WindowChange> {
        self.changes.drain()
    }

    pub fn add_table_cache(&mut self, cache: TableCache) {
        self.caches.insert(cache);
    }

    pub fn add_link(&mut self, link: DataviewHeader) {
        self.links.push(link);
    }

    pub fn add_recompute(&mut self, rc: Recompute) {
        self.recomputes.insert(rc);
    }

    pub fn request_range_reset(&mut self) {
        self.reset_range = true;
    }

    pub fn request_locate_reset(&mut self) {
        self.reset_locate = true;
    }

    pub fn request_sort_reset(&mut self) {
        self.reset_sort = true;
    }

    pub fn state(&self) -> ViewState {
        if self.pending_recovery != RecoveryAction::None {
            ViewState::Recovering
        } else if self.current_index.is_some() {
            ViewState::Pinned
        } else if self.window.is_empty() && !(self.includes_first && self.includes_last) {
            ViewState::AwaitingFetch
        } else {
            ViewState::NoCurrent
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stop_execution {
            return Err(Error::PendingRecovery(self.pending_recovery));
        }
        Ok(())
    }

    // -- navigation -----------------------------------------------------

    /// Make the record at `target` current, fetching chunks as needed.
    pub fn set_current_by_index(&mut self, target: RecIndex, opts: NavOptions) -> Result<()> {
        self.ensure_running()?;
        let mut target = target;
        let mut opts = opts;
        let retries = self.config.max_fetch_retries;

        for _ in 0..=retries {
            let len = self.window.len();
            match target {
                RecIndex::First if self.includes_first => {
                    if len == 0 {
                        return Err(Error::OutOfView(Boundary::Top));
                    }
                    return self.pin(0, opts);
                }
                RecIndex::First => self.fetch_for_navigation(ChunkDirection::Top, &mut opts)?,
                RecIndex::Last if self.includes_last => {
                    if len == 0 {
                        return Err(Error::OutOfView(Boundary::Bottom));
                    }
                    self.fill_last_page(&mut opts)?;
                    let last = self.window.len() - 1;
                    return self.pin(last, opts);
                }
                RecIndex::Last => self.fetch_for_navigation(ChunkDirection::Bottom, &mut opts)?,
                RecIndex::At(i) if i < 0 => {
                    if self.includes_first {
                        return Err(Error::OutOfView(Boundary::Top));
                    }
                    let shift = self.fetch_around_anchor(ChunkDirection::Prev, &mut opts)?;
                    target = RecIndex::At(i + shift);
                }
                RecIndex::At(i) if i as usize >= len => {
                    if self.includes_last {
                        return Err(Error::OutOfView(Boundary::Bottom));
                    }
                    let shift = self.fetch_around_anchor(ChunkDirection::Next, &mut opts)?;
                    target = RecIndex::At(i + shift);
                }
                RecIndex::At(i) => return self.pin(i as usize, opts),
            }
        }
        log::warn!(
            "task {}: navigation to {:?} gave up after {} fetches",
            self.task_id,
            target,
            retries + 1
        );
        Err(Error::FetchExhausted(retries + 1))
    }

    /// Request one chunk in `direction`, running the current record's exit
    /// action first when `do_suffix` is set.
    pub fn fetch_chunk_from_server(&mut self, direction: ChunkDirection, do_suffix: bool) -> Result<()> {
        self.ensure_running()?;
        if do_suffix {
            self.run_record_suffix()?;
        }
        let anchor_id = match direction {
            ChunkDirection::Prev => self.window.first().map(Record::id),
            ChunkDirection::Next => self.window.last().map(Record::id),
            ChunkDirection::Top | ChunkDirection::Bottom => None,
        };
        let command = Command::FetchChunk {
            task_id: self.task_id.clone(),
            direction,
            anchor_id,
            chunk_size: self.chunk_size,
        };
        self.round_trip(command)
    }

    fn fetch_for_navigation(&mut self, direction: ChunkDirection, opts: &mut NavOptions) -> Result<()> {
        self.fetch_chunk_from_server(direction, opts.do_suffix)?;
        // The exit action runs at most once per navigation
        opts.do_suffix = false;
        self.ensure_running()
    }

    /// Fetch at one edge and report how far the rows already loaded moved.
    fn fetch_around_anchor(&mut self, direction: ChunkDirection, opts: &mut NavOptions) -> Result<isize> {
        let anchor = match direction {
            ChunkDirection::Prev => self.window.first(),
            _ => self.window.last(),
        }
        .map(Record::id);
        let before = anchor.and_then(|id| self.window.index_of(id));

        self.fetch_for_navigation(direction, opts)?;

        let after = anchor.and_then(|id| self.window.index_of(id));
        Ok(match (before, after) {
            (Some(b), Some(a)) => a as isize - b as isize,
            _ => 0,
        })
    }

    /// Make sure a full page ends at the last row.
    fn fill_last_page(&mut self, opts: &mut NavOptions) -> Result<()> {
        let page = self.host.visible_rows().max(1);
        let mut fetches = 0;
        while !self.includes_first && self.window.len() < page && fetches < self.config.max_fetch_retries {
            let before = self.window.len();
            self.fetch_for_navigation(ChunkDirection::Prev, opts)?;
            fetches += 1;
            if self.window.len() == before {
                break;
            }
        }
        self.top_index = self.window.len().saturating_sub(page);
        Ok(())
    }

    fn pin(&mut self, idx: usize, opts: NavOptions) -> Result<()> {
        let target_id = self
            .window
            .get(idx)
            .map(Record::id)
            .ok_or(Error::OutOfView(Boundary::Bottom))?;
        let same = self.current_index == Some(idx);
        if same && !(opts.ignore_current && opts.compute) {
            return Ok(());
        }

        if !same {
            if opts.do_suffix {
                self.run_record_suffix()?;
            }
            if let Some(id) = self.current_id() {
                self.previous_id = Some(id);
            }
            self.current_index = Some(idx);
            self.keep_visible(idx);
            self.update_task_mode(idx);
        }

        if opts.compute {
            self.compute_current(same)?;
        }

        let DataView {
            window,
            host,
            original,
            ..
        } = self;
        if let Some(rec) = window.get(idx) {
            *original = Some(rec.replicate());
            host.record_prefix(rec);
        }
        if !same {
            self.host.current_changed(self.previous_id, target_id, opts.display_hint);
        }
        log::trace!("task {}: current record {} at {}", self.task_id, target_id, idx);
        Ok(())
    }

    fn keep_visible(&mut self, idx: usize) {
        let page = self.host.visible_rows().max(1);
        if idx < self.top_index {
            self.top_index = idx;
        } else if idx >= self.top_index + page {
            self.top_index = idx + 1 - page;
        }
    }

    fn update_task_mode(&mut self, idx: usize) {
        let mode = self.window.get(idx).map(Record::mode);
        match (self.task_mode, mode) {
            (TaskMode::Modify, Some(RecordMode::Insert)) => self.task_mode = TaskMode::Create,
            (TaskMode::Create, Some(m)) if m != RecordMode::Insert => self.task_mode = TaskMode::Modify,
            _ => {}
        }
    }

    /// Resolve the current record's entry-time links.
    fn compute_current(&mut self, force: bool) -> Result<()> {
        let Some(idx) = self.current_index else {
            return Ok(());
        };
        let DataView {
            window,
            links,
            fields,
            caches,
            ..
        } = self;
        let Some(rec) = window.get_mut(idx) else {
            return Ok(());
        };
        if rec.is_computed() && !force {
            return Ok(());
        }

        rec.set_in_compute(true);
        let mut result = Ok(());
        for link in links.iter_mut().filter(|l| l.timing() == EvalTiming::Prefix) {
            if let Err(e) = link.resolve(rec, fields, caches) {
                result = Err(e);
                break;
            }
        }
        rec.set_in_compute(false);
        rec.set_computed(result.is_ok());
        result
    }

    /// Exit action of the current record, then queue its changes.
    fn run_record_suffix(&mut self) -> Result<()> {
        let Some(rec) = self.current_record() else {
            return Ok(());
        };
        let id = rec.id();
        let DataView { window, host, .. } = self;
        let accepted = window.by_id(id).map_or(true, |rec| host.record_suffix(rec));
        if !accepted {
            log::debug!("task {}: exit action of record {} vetoed the move", self.task_id, id);
            return Err(Error::OutOfView(Boundary::RecSuffixFailed));
        }

        let queued = self.commit_current()?;
        if queued && self.flush_updates {
            self.phase = TransactionPhase::RecordSuffix;
            let result = self.round_trip(Command::Flush {
                task_id: self.task_id.clone(),
            });
            self.phase = TransactionPhase::Idle;
            result?;
            self.ensure_running()?;
        }
        Ok(())
    }

    /// Read a field of the row `offset` positions from the current one.
    /// Rows outside the window read as None.
    pub fn peek_neighbor_field(&self, offset: isize, field: usize) -> Result<Option<&FieldValue>> {
        let Some(current) = self.current_index else {
            return Ok(None);
        };
        let target = current as isize + offset;
        if target < 0 {
            return Ok(None);
        }
        match self.window.get(target as usize) {
            Some(rec) => rec.value(field).map(Some),
            None => Ok(None),
        }
    }

    // -- editing --------------------------------------------------------

    /// User edit of a field of the current record.
    pub fn set_field_value(&mut self, field: usize, value: FieldValue) -> Result<RecomputeOutcome> {
        self.ensure_running()?;
        let idx = self.current_index.ok_or(Error::NoCurrentRecord)?;
        let rec = self.window.get_mut(idx).ok_or(Error::NoCurrentRecord)?;
        rec.set_field_value(field, value, true, &self.fields)?;
        rec.set_flag(field, Flag::CursorModified)?;
        self.recompute(field)
    }

    /// Create a row after the current one and make it current.
    pub fn add_record(&mut self) -> Result<RecId> {
        self.ensure_running()?;
        self.run_record_suffix()?;

        let id = self.next_new_id;
        self.next_new_id -= 1;
        let record = Record::new_inserted(id, &self.fields)?;
        let pos = self.current_index.map_or(self.window.len(), |c| c + 1);
        self.window.insert_at(pos, record)?;
        self.changes.push(WindowChange::RecordInserted { index: pos, id });

        if let Some(prev) = self.current_id() {
            self.previous_id = Some(prev);
        }
        self.current_index = Some(pos);
        self.keep_visible(pos);
        self.task_mode = TaskMode::Create;
        self.compute_current(true)?;

        let DataView {
            window,
            host,
            original,
            ..
        } = self;
        if let Some(rec) = window.get(pos) {
            *original = Some(rec.replicate());
            host.record_prefix(rec);
        }
        self.host.current_changed(self.previous_id, id, true);
        log::debug!("task {}: created record {} at {}", self.task_id, id, pos);
        Ok(id)
    }

    /// Delete the current record and move to its successor, or to its
    /// predecessor when it was the last row.
    pub fn delete_current(&mut self) -> Result<()> {
        self.ensure_running()?;
        let idx = self.current_index.ok_or(Error::NoCurrentRecord)?;
        let rec = self.window.get_mut(idx).ok_or(Error::NoCurrentRecord)?;
        let id = rec.id();

        if rec.mode() == RecordMode::Insert {
            // never sent: forget it entirely
            self.modified.remove_by_id(id);
        } else {
            rec.set_mode(RecordMode::Delete)?;
            let snapshot = rec.replicate();
            self.modified.upsert(snapshot)?;
        }

        if let Some(removed) = self.window.remove_at(idx) {
            self.dc_values.release_refs(removed.dc_refs());
        }
        self.changes.push(WindowChange::RecordRemoved {
            index: idx,
            id,
            evicted: false,
        });
        self.top_index = IndexAdjuster::adjust_for_delete(self.top_index, idx).unwrap_or(idx);
        self.current_index = None;
        self.original = None;
        self.previous_id = Some(id);

        if self.window.is_empty() {
            self.top_index = 0;
            return Ok(());
        }
        let next = idx.min(self.window.len() - 1);
        self.top_index = self.top_index.min(next);
        self.pin(next, NavOptions::without_suffix())
    }

    /// Restore the current record to its state on entry.
    pub fn cancel_edit(&mut self) -> Result<()> {
        let Some(idx) = self.current_index else {
            return Ok(());
        };
        let Some(original) = self.original.as_ref() else {
            return Ok(());
        };
        let rec = self.window.get_mut(idx).ok_or(Error::NoCurrentRecord)?;
        if rec.id() != original.id() {
            return Err(Error::Corrupted {
                id: rec.id(),
                reason: format!("entry snapshot belongs to record {}", original.id()),
            });
        }
        rec.copy_data_from(original);
        Ok(())
    }

    /// Queue the current record for the next request when it carries
    /// changes. Returns whether anything was queued.
    pub fn commit_current(&mut self) -> Result<bool> {
        let Some(idx) = self.current_index else {
            return Ok(false);
        };
        let Some(rec) = self.window.get_mut(idx) else {
            return Ok(false);
        };
        if rec.mode() == RecordMode::None && !rec.is_record_modified() {
            return Ok(false);
        }
        let snapshot = rec.replicate();
        rec.clear_modified_flags();
        let original = rec.replicate();
        self.modified.upsert(snapshot)?;
        self.original = Some(original);
        Ok(true)
    }

    /// Send everything pending.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.commit_current()?;
        self.phase = TransactionPhase::Commit;
        let result = self.round_trip(Command::Flush {
            task_id: self.task_id.clone(),
        });
        self.phase = TransactionPhase::Idle;
        result
    }

    // -- recompute ------------------------------------------------------

    /// Re-derive everything that depends on `field` of the current record.
    ///
    /// Failures are logged and reported as `RecomputeOutcome::Failed`; the
    /// record's recompute marker and link positions are settled either way.
    pub fn recompute(&mut self, field: usize) -> Result<RecomputeOutcome> {
        self.ensure_running()?;
        let Some(rec_id) = self.current_id() else {
            return Ok(RecomputeOutcome::Skipped);
        };
        let Some(rc) = self.recomputes.get(field).cloned() else {
            return Ok(RecomputeOutcome::Skipped);
        };

        if let Some(rec) = self.window.by_id_mut(rec_id) {
            if rec.in_recompute() {
                log::debug!("task {}: recompute of field {} already running", self.task_id, field);
                return Ok(RecomputeOutcome::Skipped);
            }
            rec.set_in_recompute(true);
        }

        let result = self.execute_recompute(rec_id, &rc);

        let position = links_position(&self.links);
        if let Some(rec) = self.window.by_id_mut(rec_id) {
            rec.set_links_position(Some(position));
            rec.set_in_recompute(false);
        }

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                log::error!(
                    "task {}: recompute of field {} on record {} failed: {}",
                    self.task_id,
                    field,
                    rec_id,
                    e
                );
                Ok(RecomputeOutcome::Failed)
            }
        }
    }

    fn execute_recompute(&mut self, rec_id: RecId, rc: &Recompute) -> Result<RecomputeOutcome> {
        let stale: Vec<String> = rc
            .sub_views()
            .iter()
            .filter(|task| self.host.sub_view_needs_refresh(task))
            .cloned()
            .collect();

        match rc.plan(!stale.is_empty()) {
            ExecutionPlan::SubViewsFirst => {
                if stale.iter().all(|task| self.host.refresh_sub_view_from_cache(task)) {
                    return Ok(RecomputeOutcome::SubViewsFromCache);
                }
                self.recompute_on_server(rec_id, rc.owner(), &stale)
            }
            ExecutionPlan::Server => self.recompute_on_server(rec_id, rc.owner(), &stale),
            ExecutionPlan::Client => {
                self.recompute_locally(rec_id, rc)?;
                for task in &stale {
                    self.host.refresh_sub_view(task);
                }
                Ok(RecomputeOutcome::Client)
            }
        }
    }

    fn recompute_on_server(&mut self, rec_id: RecId, field: usize, stale: &[String]) -> Result<RecomputeOutcome> {
        self.round_trip(Command::Recompute {
            task_id: self.task_id.clone(),
            field,
            rec_id,
        })?;
        for task in stale {
            self.host.refresh_sub_view(task);
        }
        Ok(RecomputeOutcome::Server)
    }

    /// Walk the dependents of `rc`, then the dependents of every value that
    /// walk changed, breadth first. A field is expanded at most once.
    fn recompute_locally(&mut self, rec_id: RecId, rc: &Recompute) -> Result<()> {
        let DataView {
            window,
            fields,
            links,
            caches,
            host,
            recomputes,
            task_id,
            ..
        } = self;
        let rec = window.by_id_mut(rec_id).ok_or(Error::RecordNotFound(rec_id))?;

        let mut pending = VecDeque::from([rc.clone()]);
        let mut expanded = HashSet::from([rc.owner()]);
        while let Some(step) = pending.pop_front() {
            let mut changed_fields = Vec::new();
            for item in step.items() {
                match *item {
                    RecomputeItem::Field(idx) => {
                        let value = fields.init_value(idx, rec)?;
                        let changed = rec.value(idx)? != &value;
                        rec.set_field_value(idx, value, changed, fields)?;
                        host.refresh_field(rec, idx);
                        if changed {
                            changed_fields.push(idx);
                        }
                    }
                    RecomputeItem::Link(link_id) => {
                        let link = links
                            .iter_mut()
                            .find(|l| l.id() == link_id)
                            .ok_or(Error::LinkMissing(link_id))?;
                        let bound = link.bound_fields(fields);
                        let before = bound
                            .iter()
                            .map(|&idx| rec.value(idx).cloned())
                            .collect::<Result<Vec<_>>>()?;
                        link.resolve(rec, fields, caches)?;
                        for (idx, old) in bound.into_iter().zip(before) {
                            rec.clear_edit_flags(idx)?;
                            host.refresh_field(rec, idx);
                            if rec.value(idx)? != &old {
                                changed_fields.push(idx);
                            }
                        }
                    }
                }
            }

            for idx in changed_fields {
                let Some(next) = recomputes.get(idx) else {
                    continue;
                };
                if expanded.insert(idx) {
                    pending.push_back(next.clone());
                } else {
                    log::debug!("task {}: field {} already recomputed, cycle cut", task_id, idx);
                }
            }
        }
        Ok(())
    }

    // -- round trips ----------------------------------------------------

    fn round_trip(&mut self, command: Command) -> Result<()> {
        let restarts_window = matches!(
            command,
            Command::FetchChunk {
                direction: ChunkDirection::Top | ChunkDirection::Bottom,
                ..
            }
        );
        let request = Request {
            command,
            payload: self.build_outbound(),
        };
        log::debug!("task {} sends {}", self.task_id, request.to_json());

        let response = self.transport.send_and_await(request)?;
        self.after_send();
        if restarts_window {
            self.invalidate_window();
        }
        self.apply_response(&response.payload)
    }

    /// The outbound diff, without consuming anything.
    ///
    /// Order: cache-delete notices, lookup-set removals, the modified set
    /// with unconfirmed predecessors first, then the current record shrunk
    /// against its last transmitted copy.
    pub fn build_outbound(&self) -> String {
        let mut w = TagWriter::new();
        let current = self.current_record();

        w.start("dataview").attr("taskid", &self.task_id);
        w.attr_opt("curr_rec", current.map(Record::id));
        if let Some(rec) = current {
            w.attr("mode", rec.mode().to_wire());
            w.attr_opt("links_pos", rec.links_position());
        }
        w.attr("task_mode", self.task_mode.to_wire());
        if self.reset_range {
            w.attr("reset_range", 1);
        }
        if self.reset_locate {
            w.attr("reset_locate", 1);
        }
        if self.reset_sort {
            w.attr("reset_sort", 1);
        }

        for id in &self.pending_cache_deletes {
            w.start("cacheDel").attr("id", id).end();
        }
        for r in self.dc_values.pending_removals() {
            w.start("dcRemove").attr("dit_idx", r.dit_idx).attr("dc_id", r.dc_id).end();
        }

        let encoding = self.config.wire_encoding;
        let batch = RecordWriteOptions {
            encoding,
            shrink: false,
            current: false,
            with_prev: true,
        };
        for rec in self.modified_in_dependency_order() {
            rec.write(&mut w, &self.fields, batch);
        }

        if let Some(rec) = current {
            let mut snapshot = rec.replicate();
            let server_copy = self.last_sent_current.as_ref().filter(|s| s.id() == rec.id());
            snapshot.set_shrink_flags(server_copy);
            snapshot.write(
                &mut w,
                &self.fields,
                RecordWriteOptions {
                    encoding,
                    shrink: true,
                    current: true,
                    with_prev: true,
                },
            );
        }

        w.end();
        w.finish()
    }

    /// A row whose unconfirmed predecessor is also queued is written after
    /// that predecessor.
    fn modified_in_dependency_order(&self) -> Vec<&Record> {
        let mut remaining: Vec<&Record> = self.modified.iter().collect();
        let mut written: HashSet<RecId> = HashSet::new();
        let mut out = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let before = remaining.len();
            let mut deferred = Vec::new();
            for rec in remaining {
                let blocked = match rec.prev_id() {
                    Some(prev) if prev < 0 && prev != rec.id() => {
                        self.modified.contains(prev) && !written.contains(&prev)
                    }
                    _ => false,
                };
                if blocked {
                    deferred.push(rec);
                } else {
                    written.insert(rec.id());
                    out.push(rec);
                }
            }
            if deferred.len() == before {
                log::warn!(
                    "task {}: cyclic predecessors among {} queued records",
                    self.task_id,
                    deferred.len()
                );
                out.extend(deferred);
                break;
            }
            remaining = deferred;
        }
        out
    }

    /// Consume what the last request carried.
    fn after_send(&mut self) {
        self.last_batch = self.modified.ids();
        self.modified.clear();
        for id in &self.last_batch {
            if let Some(rec) = self.window.by_id_mut(*id) {
                rec.reset_mode();
            }
        }
        self.window.iter_mut().for_each(Record::clear_history_flags);
        self.pending_cache_deletes.clear();
        self.dc_values.take_removed();
        self.reset_range = false;
        self.reset_locate = false;
        self.reset_sort = false;
        self.last_sent_current = self.current_record().map(Record::replicate);
    }

    /// Drop every loaded row.
    fn invalidate_window(&mut self) {
        if let Some(id) = self.current_id() {
            self.previous_id = Some(id);
        }
        // reported front to back, each removal shifting the rest down
        for rec in self.window.iter() {
            self.dc_values.release_refs(rec.dc_refs());
            self.changes.push(WindowChange::RecordRemoved {
                index: 0,
                id: rec.id(),
                evicted: false,
            });
        }
        self.window.clear();
        self.current_index = None;
        self.original = None;
        self.top_index = 0;
        self.includes_first = false;
        self.includes_last = false;
    }

    // -- inbound --------------------------------------------------------

    pub fn apply_response(&mut self, payload: &str) -> Result<()> {
        let mut tokenizer = Tokenizer::new(payload);
        self.apply_tags(&mut tokenizer)
    }

    /// Apply a server response read from any tag source.
    pub fn apply_tags<S: TagSource + ?Sized>(&mut self, source: &mut S) -> Result<()> {
        while let Some(tag) = source.next_tag()? {
            match (tag.name.as_str(), tag.kind) {
                (name, TagKind::Close) => {
                    log::warn!("task {}: unexpected </{}>", self.task_id, name);
                }
                ("dvheader", kind) => {
                    self.apply_header(&tag)?;
                    if kind == TagKind::Open {
                        skip_element(source, "dvheader")?;
                    }
                }
                ("fields", TagKind::Open) => {
                    if !self.window.is_empty() || !self.modified.is_empty() {
                        return Err(Error::wire("field schema replaced while records are loaded"));
                    }
                    let mut fields = FieldsTable::parse(source)?;
                    fields.set_double_byte(self.config.double_byte_locale);
                    self.fields = fields;
                    self.last_sent_current = None;
                    self.original = None;
                }
                ("dataview", _) => self.apply_dataview(&tag, source)?,
                ("cachedTable", TagKind::Open) => {
                    let cache = TableCache::parse(&tag, source, self.config.wire_encoding)?;
                    self.caches.insert(cache);
                }
                ("links", TagKind::Open) => {
                    let links = DataviewHeader::parse_links(source)?;
                    for link in &links {
                        link.condition().validate(&self.fields)?;
                    }
                    self.links = links;
                }
                ("recomputes", TagKind::Open) => {
                    self.recomputes = RecomputeTable::parse(source)?;
                }
                ("dc_vals", _) => {
                    let set = DcValues::parse(&tag, source)?;
                    self.dc_values.register(set);
                }
                (other, kind) => {
                    log::warn!("task {}: skipping unknown tag <{}>", self.task_id, other);
                    if kind == TagKind::Open {
                        skip_element(source, other)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_header(&mut self, tag: &Tag) -> Result<()> {
        warn_unknown_attrs(tag, HEADER_ATTRS);
        if let Some(raw) = tag.attr("rmpos") {
            let (size, idx) = raw
                .split_once(',')
                .and_then(|(s, i)| Some((s.trim().parse::<usize>().ok()?, i.trim().parse::<usize>().ok()?)))
                .ok_or_else(|| Error::wire(format!("bad rmpos {:?}", raw)))?;
            self.fields.set_record_main(size, idx);
        }
        match tag.attr("compute_by") {
            Some("C") => {
                self.compute_by = ComputeBy::Client;
                self.flush_updates = false;
            }
            Some("S") => {
                self.compute_by = ComputeBy::Server;
                self.flush_updates = false;
            }
            Some("H") => {
                self.compute_by = ComputeBy::Server;
                self.flush_updates = true;
            }
            Some(other) => log::warn!("task {}: unknown compute_by {:?}", self.task_id, other),
            None => {}
        }
        if let Some(v) = tag.attr_bool("has_main_tbl")? {
            self.has_main_table = v;
        }
        if let Some(n) = tag.attr_usize("chunk_size")? {
            if n > 0 {
                self.chunk_size = n;
            }
        }
        Ok(())
    }

    fn apply_dataview<S: TagSource + ?Sized>(&mut self, tag: &Tag, source: &mut S) -> Result<()> {
        warn_unknown_attrs(tag, DATAVIEW_ATTRS);
        if let Some(task) = tag.attr("taskid") {
            if task != self.task_id {
                log::warn!("task {}: response addressed to task {}", self.task_id, task);
            }
        }

        let current_id = self.current_id();
        let invalidated = tag.attr_bool("invalidate")?.unwrap_or(false);
        if invalidated {
            self.invalidate_window();
        }
        if let Some(side) = tag.attr("insert_at") {
            self.insert_at = match InsertSide::from_wire(side) {
                Some(side) => side,
                None => {
                    log::warn!("task {}: unknown insert_at {:?}", self.task_id, side);
                    self.insert_at
                }
            };
        }

        let side = self.insert_at;
        let mut begin_pos = 0usize;
        let mut new_current = None;
        if tag.kind == TagKind::Open {
            let mut closed = false;
            while let Some(child) = source.next_tag()? {
                if child.is_close("dataview") {
                    closed = true;
                    break;
                }
                match child.name.as_str() {
                    "rec" => {
                        let id = self.apply_record(&child, side, &mut begin_pos)?;
                        if child.attr_bool("curr_rec")?.unwrap_or(false) {
                            new_current = Some(id);
                        }
                    }
                    other => {
                        log::warn!("task {}: skipping <{}> in <dataview>", self.task_id, other);
                        if child.kind == TagKind::Open {
                            skip_element(source, other)?;
                        }
                    }
                }
            }
            if !closed {
                return Err(Error::wire("missing </dataview>"));
            }
        }

        if let Some(v) = tag.attr_bool("include_first")? {
            self.includes_first = v;
        }
        if let Some(v) = tag.attr_bool("include_last")? {
            self.includes_last = v;
        }
        if let Some(v) = tag.attr_usize("total_records_count")? {
            self.total_records_count = Some(v);
        }
        if let Some(v) = tag.attr_usize("records_before_current_view")? {
            self.records_before_current_view = Some(v);
        }
        if let Some(v) = tag.attr("dvpos_value") {
            self.dvpos_value = Some(v.to_string());
        }

        if invalidated {
            self.current_index = current_id.and_then(|id| self.window.index_of(id));
        }
        if let Some(id) = new_current {
            if let Some(idx) = self.window.index_of(id) {
                if self.current_index != Some(idx) {
                    if let Some(prev) = self.current_id() {
                        self.previous_id = Some(prev);
                    }
                    self.current_index = Some(idx);
                    self.original = self.window.get(idx).map(Record::replicate);
                }
            }
        }
        if let Some(top) = tag.attr_i32("top_rec_id")? {
            self.top_rec_id = Some(top);
            if let Some(idx) = self.window.index_of(top) {
                self.top_index = idx;
            }
        }

        if let Some(raw) = tag.attr("recovery") {
            let code = ServerRecovery::from_wire(raw)
                .ok_or_else(|| Error::wire(format!("unknown recovery code {:?}", raw)))?;
            let action = recovery::decide(code, self.phase);
            if action != RecoveryAction::None {
                log::warn!(
                    "task {}: server requested recovery {:?} during {:?}",
                    self.task_id,
                    action,
                    self.phase
                );
                self.pending_recovery = action;
                self.recovery_phase = self.phase;
                self.stop_execution = true;
            }
        }

        self.evict_overflow(begin_pos > 0);
        Ok(())
    }

    /// Merge one `<rec>` into the window and return its id.
    fn apply_record(&mut self, tag: &Tag, side: InsertSide, begin_pos: &mut usize) -> Result<RecId> {
        let id = tag
            .attr_i32("id")?
            .ok_or_else(|| Error::wire("<rec> without id"))?;

        if let Some(old) = tag.attr_i32("old_id")? {
            if self.window.contains(old) {
                self.window.rekey(old, id)?;
                log::debug!("task {}: record {} confirmed as {}", self.task_id, old, id);
            }
            self.modified.remove_by_id(old);
            if let Some(original) = self.original.as_mut().filter(|o| o.id() == old) {
                original.set_id(id);
            }
        }

        let record = {
            let existing = self
                .window
                .by_id(id)
                .or_else(|| self.last_sent_current.as_ref().filter(|r| r.id() == id));
            Record::parse(tag, &self.fields, self.config.wire_encoding, false, existing)?
        };
        self.dc_values.add_refs(record.dc_refs());

        if let Some(idx) = self.window.index_of(id) {
            if let Some(old) = self.window.get(idx) {
                self.dc_values.release_refs(old.dc_refs());
            }
            self.window.upsert(record)?;
            if self.current_index == Some(idx) {
                self.original = self.window.get(idx).map(Record::replicate);
            }
            return Ok(id);
        }

        let idx = match side {
            InsertSide::Begin => {
                let pos = *begin_pos;
                *begin_pos += 1;
                pos
            }
            InsertSide::End => self.window.len(),
        };
        self.window.insert_at(idx, record)?;
        if side == InsertSide::Begin {
            self.current_index = self
                .current_index
                .map(|c| IndexAdjuster::adjust_for_insert(c, idx));
            if self.window.len() > idx + 1 {
                self.top_index = IndexAdjuster::adjust_for_insert(self.top_index, idx);
            }
            self.inserted_records_count += 1;
        }
        self.changes.push(WindowChange::RecordInserted { index: idx, id });
        Ok(id)
    }

    /// Keep the window within its configured size by dropping rows at the
    /// edge opposite to where it grew.
    fn evict_overflow(&mut self, grew_at_begin: bool) {
        let limit = self.config.max_window_records;
        if limit == 0 {
            return;
        }
        while self.window.len() > limit {
            let idx = if grew_at_begin { self.window.len() - 1 } else { 0 };
            if !self.is_evictable(idx) {
                log::debug!(
                    "task {}: window holds {} rows over limit {}; edge row is pinned",
                    self.task_id,
                    self.window.len(),
                    limit
                );
                break;
            }
            let Some(rec) = self.window.remove_at(idx) else {
                break;
            };
            let id = rec.id();
            self.dc_values.release_refs(rec.dc_refs());
            self.pending_cache_deletes.push(id);
            self.changes.push(WindowChange::RecordRemoved {
                index: idx,
                id,
                evicted: true,
            });
            self.current_index = self
                .current_index
                .and_then(|c| IndexAdjuster::adjust_for_delete(c, idx));
            self.top_index = IndexAdjuster::adjust_for_delete(self.top_index, idx)
                .unwrap_or_else(|| idx.min(self.window.len().saturating_sub(1)));
            if grew_at_begin {
                self.includes_last = false;
            } else {
                self.includes_first = false;
            }
        }
    }

    fn is_evictable(&self, idx: usize) -> bool {
        if self.current_index == Some(idx) {
            return false;
        }
        match self.window.get(idx) {
            Some(rec) => {
                rec.mode() == RecordMode::None
                    && !rec.is_record_modified()
                    && !self.modified.contains(rec.id())
            }
            None => false,
        }
    }

    // -- recovery -------------------------------------------------------

    /// Replay the pending recovery action, once.
    pub fn process_recovery(&mut self) -> Result<RecoveryAction> {
        let action = std::mem::take(&mut self.pending_recovery);
        let phase = std::mem::take(&mut self.recovery_phase);
        self.stop_execution = false;
        if action == RecoveryAction::None {
            return Ok(action);
        }
        log::info!("task {}: processing recovery {:?}", self.task_id, action);

        self.restart_last_batch(phase == TransactionPhase::Commit)?;
        match action {
            RecoveryAction::None => {}
            RecoveryAction::Cancel => self.cancel_edit()?,
            RecoveryAction::MoveToBegin => {
                self.cancel_edit()?;
                self.set_current_by_index(RecIndex::First, NavOptions::without_suffix())?;
            }
            RecoveryAction::BeginScreen => {
                self.cancel_edit()?;
                self.host.restart(action);
                if !self.window.is_empty() {
                    let top = self.top_index.min(self.window.len() - 1);
                    self.set_current_by_index(
                        RecIndex::At(top as isize),
                        NavOptions::without_suffix().reentering(),
                    )?;
                }
            }
            RecoveryAction::BeginTable => {
                // The resident tables come back with the top chunk
                self.caches.clear();
                self.invalidate_window();
                self.host.restart(action);
                self.set_current_by_index(RecIndex::First, NavOptions::without_suffix())?;
            }
        }
        Ok(action)
    }

    /// Give the rows of the rejected request their pending modes back and
    /// queue them again.
    fn restart_last_batch(&mut self, commit_in_flight: bool) -> Result<()> {
        let create = self.task_mode == TaskMode::Create;
        for id in std::mem::take(&mut self.last_batch) {
            if let Some(rec) = self.window.by_id_mut(id) {
                let old_mode = rec.mode();
                rec.restart(old_mode, create, commit_in_flight);
                if rec.mode() != RecordMode::None {
                    let snapshot = rec.replicate();
                    self.modified.upsert(snapshot)?;
                }
            }
        }
        Ok(())
    }
}

fn warn_unknown_attrs(tag: &Tag, known: &[&str]) {
    for (key, _) in &tag.attrs {
        if !known.contains(&key.as_str()) {
            log::warn!("ignoring unknown attribute '{}' on <{}>", key, tag.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::config::WireEncoding;
    use crate::field::StorageAttr;
    use crate::fields::FieldDef;
    use crate::recompute::RecomputeMode;
    use crate::test_support::{chunk, init_logging, schema, HostLog, RecordingHost, ScriptedTransport};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn loaded(ids: &[RecId], attrs: &[(&str, &str)]) -> DataView {
        let fields = schema();
        let mut dv = DataView::new("t1", fields.clone(), EngineConfig::default());
        dv.apply_response(&chunk(&fields, ids, attrs)).unwrap();
        dv
    }

    fn with_script(
        dv: DataView,
        responses: &[&str],
    ) -> (DataView, Rc<RefCell<Vec<Request>>>) {
        let mut transport = ScriptedTransport::new();
        for r in responses {
            transport = transport.respond(*r);
        }
        let sent = transport.log();
        (dv.with_transport(transport), sent)
    }

    fn current_tag(payload: &str) -> Tag {
        let mut tok = Tokenizer::new(payload);
        while let Some(tag) = tok.next_tag().unwrap() {
            if tag.name == "rec" && tag.attr("curr_rec") == Some("1") {
                return tag;
            }
        }
        panic!("no current record in {}", payload);
    }

    fn rec_ids(payload: &str) -> Vec<RecId> {
        let mut tok = Tokenizer::new(payload);
        let mut ids = Vec::new();
        while let Some(tag) = tok.next_tag().unwrap() {
            if tag.name == "rec" && tag.attr("curr_rec").is_none() {
                ids.push(tag.attr_i32("id").unwrap().unwrap());
            }
        }
        ids
    }

    #[test]
    fn test_first_within_window() {
        init_logging();
        let mut dv = loaded(&[1, 2, 3], &[("include_first", "1")]);
        assert_eq!(dv.state(), ViewState::NoCurrent);

        dv.set_current_by_index(RecIndex::First, NavOptions::default()).unwrap();
        assert_eq!(dv.current_id(), Some(1));
        assert_eq!(dv.state(), ViewState::Pinned);
    }

    #[test]
    fn test_top_boundary_keeps_position() {
        let mut dv = loaded(&[1, 2, 3], &[("include_first", "1")]);
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();

        let err = dv.set_current_by_index(RecIndex::At(-1), NavOptions::default()).unwrap_err();
        assert_eq!(err.boundary(), Some(Boundary::Top));
        assert_eq!(dv.current_index(), Some(0));
    }

    #[test]
    fn test_bottom_boundary_keeps_position() {
        let mut dv = loaded(&[1, 2], &[("include_first", "1"), ("include_last", "1")]);
        dv.set_current_by_index(RecIndex::Last, NavOptions::default()).unwrap();
        assert_eq!(dv.current_id(), Some(2));

        let err = dv.set_current_by_index(RecIndex::At(2), NavOptions::default()).unwrap_err();
        assert_eq!(err.boundary(), Some(Boundary::Bottom));
        assert_eq!(dv.current_index(), Some(1));
    }

    #[test]
    fn test_prev_fetch_shifts_target() {
        init_logging();
        let fields = schema();
        let dv = loaded(&[10, 11, 12], &[]);
        let prev = chunk(&fields, &[7, 8, 9], &[("insert_at", "B"), ("include_first", "1")]);
        let (mut dv, sent) = with_script(dv, &[prev.as_str()]);
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();

        dv.set_current_by_index(RecIndex::At(-1), NavOptions::default()).unwrap();

        let sent = sent.borrow();
        assert_eq!(sent.len(), 1);
        match &sent[0].command {
            Command::FetchChunk {
                direction,
                anchor_id,
                ..
            } => {
                assert_eq!(*direction, ChunkDirection::Prev);
                assert_eq!(*anchor_id, Some(10));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(dv.window().ids(), vec![7, 8, 9, 10, 11, 12]);
        assert_eq!(dv.current_id(), Some(9));
        assert_eq!(dv.previous_id(), Some(10));
        assert!(dv.includes_first());
    }

    #[test]
    fn test_next_fetch_appends() {
        let fields = schema();
        let dv = loaded(&[1, 2], &[("include_first", "1")]);
        let next = chunk(&fields, &[3, 4], &[("include_last", "1")]);
        let (mut dv, sent) = with_script(dv, &[next.as_str()]);
        dv.set_current_by_index(RecIndex::At(1), NavOptions::default()).unwrap();

        dv.set_current_by_index(RecIndex::At(2), NavOptions::default()).unwrap();
        assert_eq!(sent.borrow().len(), 1);
        assert_eq!(dv.current_id(), Some(3));
        assert!(dv.includes_last());
    }

    #[test]
    fn test_first_fetches_top_when_unknown() {
        let fields = schema();
        let fields_for_chunk = fields.clone();
        let dv = DataView::new("t1", fields, EngineConfig::default());
        assert_eq!(dv.state(), ViewState::AwaitingFetch);
        let top = chunk(&fields_for_chunk, &[1, 2], &[("include_first", "1")]);
        let (mut dv, sent) = with_script(dv, &[top.as_str()]);

        dv.set_current_by_index(RecIndex::First, NavOptions::default()).unwrap();
        assert_eq!(sent.borrow().len(), 1);
        assert_eq!(dv.current_id(), Some(1));
    }

    #[test]
    fn test_fetch_gives_up() {
        let fields = schema();
        let mut config = EngineConfig::default();
        config.max_fetch_retries = 2;
        let dv = DataView::new("t1", fields, config);
        // the server never reports the first row
        let (mut dv, sent) = with_script(dv, &["", "", ""]);

        let err = dv.set_current_by_index(RecIndex::First, NavOptions::default()).unwrap_err();
        assert!(matches!(err, Error::FetchExhausted(3)));
        assert_eq!(sent.borrow().len(), 3);
    }

    #[test]
    fn test_transport_failure_keeps_outbound() {
        let dv = loaded(&[1, 2], &[]);
        let mut dv = dv.with_transport(ScriptedTransport::new().fail("timeout"));
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();
        dv.set_field_value(1, FieldValue::alpha("x")).unwrap();
        dv.commit_current().unwrap();

        assert!(matches!(dv.flush(), Err(Error::Transport(_))));
        assert_eq!(dv.modified_records().ids(), vec![1]);
    }

    #[test]
    fn test_begin_insert_shifts_positions() {
        let fields = schema();
        let mut dv = loaded(&[1, 2, 3, 4, 5], &[]);
        dv.set_current_by_index(RecIndex::At(2), NavOptions::default()).unwrap();
        dv.set_top_index(1);
        dv.drain_changes();

        dv.apply_response(&chunk(&fields, &[0], &[("insert_at", "B")])).unwrap();

        assert_eq!(dv.current_index(), Some(3));
        assert_eq!(dv.current_id(), Some(3));
        assert_eq!(dv.top_index(), 2);
        assert_eq!(dv.inserted_records_count(), 1);
        assert_eq!(dv.drain_changes(), vec![WindowChange::RecordInserted { index: 0, id: 0 }]);
    }

    #[test]
    fn test_known_record_is_replaced_in_place() {
        let fields = schema();
        let mut dv = loaded(&[1, 2, 3], &[]);
        let mut updated = crate::test_support::row(&fields, 2);
        updated
            .set_field_value(1, FieldValue::alpha("fresh"), false, &fields)
            .unwrap();
        let mut w = TagWriter::new();
        w.start("dataview");
        updated.write(
            &mut w,
            &fields,
            RecordWriteOptions {
                encoding: dv.config.wire_encoding,
                shrink: false,
                current: false,
                with_prev: false,
            },
        );
        w.end();

        dv.apply_response(&w.finish()).unwrap();
        assert_eq!(dv.window().ids(), vec![1, 2, 3]);
        assert_eq!(
            dv.window().by_id(2).unwrap().value(1).unwrap(),
            &FieldValue::alpha("fresh")
        );
    }

    #[test]
    fn test_suffix_veto_keeps_current() {
        let log = Rc::new(RefCell::new(HostLog {
            veto_suffix: true,
            ..HostLog::default()
        }));
        let mut dv = loaded(&[1, 2, 3], &[]).with_host(RecordingHost::new(log.clone()));
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();

        let err = dv.set_current_by_index(RecIndex::At(1), NavOptions::default()).unwrap_err();
        assert_eq!(err.boundary(), Some(Boundary::RecSuffixFailed));
        assert_eq!(dv.current_id(), Some(1));

        // skipping the exit action moves anyway
        dv.set_current_by_index(RecIndex::At(1), NavOptions::without_suffix()).unwrap();
        assert_eq!(dv.current_id(), Some(2));
    }

    #[test]
    fn test_host_sees_prefix_and_moves() {
        let log = Rc::new(RefCell::new(HostLog::default()));
        let mut dv = loaded(&[1, 2], &[]).with_host(RecordingHost::new(log.clone()));
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();
        dv.set_current_by_index(RecIndex::At(1), NavOptions::default()).unwrap();

        let events = log.borrow().events.clone();
        assert_eq!(
            events,
            vec![
                "prefix:1".to_string(),
                "current:None->1".to_string(),
                "suffix:1".to_string(),
                "prefix:2".to_string(),
                "current:Some(1)->2".to_string(),
            ]
        );
    }

    #[test]
    fn test_modified_set_respects_predecessors() {
        let fields = schema();
        let mut dv = loaded(&[], &[]);
        let mut second = Record::new(-2, &fields);
        second.set_prev_id(Some(-1));
        let mut first = Record::new(-1, &fields);
        first.set_prev_id(Some(5));
        let plain = Record::new(7, &fields);
        dv.modified.append(second).unwrap();
        dv.modified.append(plain).unwrap();
        dv.modified.append(first).unwrap();

        assert_eq!(rec_ids(&dv.build_outbound()), vec![7, -1, -2]);
    }

    #[test]
    fn test_outbound_notices_come_first() {
        let mut dv = loaded(&[1], &[]);
        dv.pending_cache_deletes.push(4);
        dv.request_sort_reset();
        let payload = dv.build_outbound();

        assert!(payload.starts_with(r#"<dataview taskid="t1" task_mode="M" reset_sort="1"><cacheDel id="4"/>"#));
    }

    #[test]
    fn test_current_record_is_shrunk() {
        let dv = loaded(&[1, 2], &[]);
        let (mut dv, sent) = with_script(dv, &["", ""]);
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();
        dv.flush().unwrap();

        dv.set_field_value(1, FieldValue::alpha("abc")).unwrap();
        dv.flush().unwrap();

        let sent = sent.borrow();
        let first = current_tag(&sent[0].payload);
        let flags = codec::decode_flags(first.attr("flags").unwrap(), 3, false).unwrap();
        assert!(flags.iter().all(|f| f & Flag::ValueNotPassed.bit() == 0));

        let second = current_tag(&sent[1].payload);
        let flags = codec::decode_flags(second.attr("flags").unwrap(), 3, false).unwrap();
        assert_ne!(flags[0] & Flag::ValueNotPassed.bit(), 0);
        assert_eq!(flags[1] & Flag::ValueNotPassed.bit(), 0);
        assert_ne!(flags[1] & Flag::CursorModified.bit(), 0);

        // the committed change also travels in the batch
        assert_eq!(rec_ids(&sent[1].payload), vec![1]);
        assert!(dv.modified_records().is_empty());
    }

    #[test]
    fn test_history_flags_survive_one_round_trip() {
        let dv = loaded(&[1], &[]);
        let (mut dv, _sent) = with_script(dv, &[""]);
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();
        dv.set_field_value(1, FieldValue::alpha("abc")).unwrap();
        dv.commit_current().unwrap();
        assert_ne!(dv.current_record().unwrap().flags_history()[1], 0);

        dv.flush().unwrap();
        assert_eq!(dv.current_record().unwrap().flags_history()[1], 0);
        assert_eq!(dv.current_record().unwrap().mode(), RecordMode::None);
    }

    #[test]
    fn test_recovery_consumed_once() {
        let dv = loaded(&[1, 2], &[("include_first", "1")]);
        let (mut dv, _sent) = with_script(dv, &[r#"<dataview recovery="R"/>"#]);
        dv.set_current_by_index(RecIndex::At(1), NavOptions::default()).unwrap();
        dv.set_field_value(1, FieldValue::alpha("bad")).unwrap();

        dv.flush().unwrap();
        assert_eq!(dv.state(), ViewState::Recovering);
        assert_eq!(dv.pending_recovery(), RecoveryAction::MoveToBegin);
        assert!(matches!(
            dv.set_current_by_index(RecIndex::First, NavOptions::default()),
            Err(Error::PendingRecovery(RecoveryAction::MoveToBegin))
        ));

        assert_eq!(dv.process_recovery().unwrap(), RecoveryAction::MoveToBegin);
        assert_eq!(dv.current_id(), Some(1));
        // the rejected row is queued again in update mode
        assert_eq!(dv.modified_records().ids(), vec![2]);
        assert_eq!(dv.window().by_id(2).unwrap().mode(), RecordMode::Update);

        assert_eq!(dv.process_recovery().unwrap(), RecoveryAction::None);
        assert_eq!(dv.state(), ViewState::Pinned);
    }

    #[test]
    fn test_rollback_during_exit_cancels() {
        let dv = loaded(&[1, 2], &[]);
        let (mut dv, _sent) = with_script(dv, &[r#"<dvheader compute_by="H"/>"#, r#"<dataview recovery="R"/>"#]);
        dv.apply_response(r#"<dvheader compute_by="H"/>"#).unwrap();
        assert!(dv.flush_updates());
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();
        dv.set_field_value(1, FieldValue::alpha("x")).unwrap();

        // leaving the record flushes; the first scripted answer is benign
        dv.set_current_by_index(RecIndex::At(1), NavOptions::default()).unwrap();
        dv.set_current_by_index(RecIndex::At(0), NavOptions::without_suffix()).unwrap();
        dv.set_field_value(1, FieldValue::alpha("y")).unwrap();

        let err = dv.set_current_by_index(RecIndex::At(1), NavOptions::default()).unwrap_err();
        assert!(matches!(err, Error::PendingRecovery(RecoveryAction::Cancel)));
        assert_eq!(dv.current_id(), Some(1));
        assert_eq!(dv.process_recovery().unwrap(), RecoveryAction::Cancel);
    }

    #[test]
    fn test_retry_during_exit_restarts_screen() {
        let log = Rc::new(RefCell::new(HostLog::default()));
        let dv = loaded(&[1, 2, 3], &[("include_first", "1"), ("include_last", "1")])
            .with_host(RecordingHost::new(log.clone()));
        let (mut dv, _sent) = with_script(dv, &[r#"<dataview recovery="T"/>"#]);
        dv.apply_response(r#"<dvheader compute_by="H"/>"#).unwrap();
        dv.set_current_by_index(RecIndex::At(1), NavOptions::default()).unwrap();
        dv.set_field_value(1, FieldValue::alpha("x")).unwrap();

        let err = dv.set_current_by_index(RecIndex::At(2), NavOptions::default()).unwrap_err();
        assert!(matches!(err, Error::PendingRecovery(RecoveryAction::BeginScreen)));
        assert_eq!(dv.current_id(), Some(2));

        assert_eq!(dv.process_recovery().unwrap(), RecoveryAction::BeginScreen);
        assert_eq!(log.borrow().restarts, vec![RecoveryAction::BeginScreen]);
        assert_eq!(dv.state(), ViewState::Pinned);
        assert_eq!(dv.current_id(), Some(2));
        assert_eq!(dv.top_index(), 1);
        assert_eq!(dv.current_record().unwrap().value(1).unwrap().as_str(), Some("x"));
        assert_eq!(log.borrow().events.last().map(String::as_str), Some("prefix:2"));
    }

    #[test]
    fn test_eviction_spares_current() {
        let fields = schema();
        let mut config = EngineConfig::default();
        config.max_window_records = 3;
        let mut dv = DataView::new("t1", fields.clone(), config);
        dv.apply_response(&chunk(&fields, &[1, 2, 3], &[("include_first", "1")]))
            .unwrap();
        dv.set_current_by_index(RecIndex::At(1), NavOptions::default()).unwrap();
        dv.drain_changes();

        dv.apply_response(&chunk(&fields, &[4, 5], &[])).unwrap();
        // row 2 is current, so only row 1 goes
        assert_eq!(dv.window().ids(), vec![2, 3, 4, 5]);
        assert_eq!(dv.current_index(), Some(0));
        assert!(!dv.includes_first());
        let evicted: Vec<RecId> = dv
            .drain_changes()
            .iter()
            .filter_map(|c| match c {
                WindowChange::RecordRemoved { id, evicted: true, .. } => Some(*id),
                _ => None,
            })
            .collect();
        assert_eq!(evicted, vec![1]);
        assert!(dv.build_outbound().contains(r#"<cacheDel id="1"/>"#));
    }

    #[test]
    fn test_add_record_and_delete() {
        let mut dv = loaded(&[1, 2], &[("include_first", "1"), ("include_last", "1")]);
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();

        let id = dv.add_record().unwrap();
        assert_eq!(id, -1);
        assert_eq!(dv.window().ids(), vec![1, -1, 2]);
        assert_eq!(dv.current_index(), Some(1));
        assert_eq!(dv.task_mode(), TaskMode::Create);
        assert_eq!(dv.window().by_id(-1).unwrap().prev_id(), Some(1));

        // an unsent insert is simply dropped
        dv.delete_current().unwrap();
        assert_eq!(dv.window().ids(), vec![1, 2]);
        assert_eq!(dv.current_id(), Some(2));
        assert!(dv.modified_records().is_empty());
        assert_eq!(dv.task_mode(), TaskMode::Modify);

        dv.delete_current().unwrap();
        assert_eq!(dv.current_id(), Some(1));
        let queued = dv.modified_records().by_id(2).unwrap();
        assert_eq!(queued.mode(), RecordMode::Delete);
    }

    #[test]
    fn test_cancel_edit_restores_entry_state() {
        let mut dv = loaded(&[1], &[]);
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();
        let before = dv.current_record().unwrap().value(1).unwrap().clone();

        dv.set_field_value(1, FieldValue::alpha("zzz")).unwrap();
        dv.cancel_edit().unwrap();
        let rec = dv.current_record().unwrap();
        assert_eq!(rec.value(1).unwrap(), &before);
        assert_eq!(rec.mode(), RecordMode::None);
        assert!(!rec.is_record_modified());
    }

    #[test]
    fn test_peek_neighbor_field() {
        let mut dv = loaded(&[1, 2, 3], &[]);
        assert_eq!(dv.peek_neighbor_field(0, 0).unwrap(), None);
        dv.set_current_by_index(RecIndex::At(1), NavOptions::default()).unwrap();

        assert_eq!(dv.peek_neighbor_field(-1, 0).unwrap(), Some(&FieldValue::numeric(1)));
        assert_eq!(dv.peek_neighbor_field(1, 0).unwrap(), Some(&FieldValue::numeric(3)));
        assert_eq!(dv.peek_neighbor_field(5, 0).unwrap(), None);
        assert!(matches!(dv.peek_neighbor_field(-1, 9), Err(Error::FieldIndex { .. })));
    }

    #[test]
    fn test_client_recompute_updates_dependents() {
        let log = Rc::new(RefCell::new(HostLog::default()));
        let mut dv = loaded(&[1], &[]).with_host(RecordingHost::new(log.clone()));
        dv.add_recompute(
            Recompute::new(0, RecomputeMode::Client).with_item(RecomputeItem::Field(2)),
        );
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();

        let outcome = dv.set_field_value(0, FieldValue::numeric(21)).unwrap();
        assert_eq!(outcome, RecomputeOutcome::Client);
        let rec = dv.current_record().unwrap();
        assert_eq!(rec.value(2).unwrap(), &FieldValue::numeric(42));
        assert!(rec.is_updated(2).unwrap());
        assert!(!rec.in_recompute());
        assert!(log.borrow().events.contains(&"refresh:1:2".to_string()));
    }

    #[test]
    fn test_recompute_without_dependents_is_skipped() {
        let mut dv = loaded(&[1], &[]);
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();
        assert_eq!(
            dv.set_field_value(1, FieldValue::alpha("a")).unwrap(),
            RecomputeOutcome::Skipped
        );
    }

    #[test]
    fn test_server_recompute() {
        let dv = loaded(&[1], &[]);
        let (mut dv, sent) = with_script(dv, &[""]);
        dv.add_recompute(Recompute::new(0, RecomputeMode::ServerOnChange).with_server_links());
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();

        let outcome = dv.set_field_value(0, FieldValue::numeric(5)).unwrap();
        assert_eq!(outcome, RecomputeOutcome::Server);
        assert_eq!(
            sent.borrow()[0].command,
            Command::Recompute {
                task_id: "t1".to_string(),
                field: 0,
                rec_id: 1,
            }
        );
        assert_eq!(dv.current_record().unwrap().links_position(), Some(""));
    }

    #[test]
    fn test_sub_views_served_from_cache() {
        let log = Rc::new(RefCell::new(HostLog {
            stale_sub_views: vec!["lines".to_string()],
            cached_sub_views: vec!["lines".to_string()],
            ..HostLog::default()
        }));
        let dv = loaded(&[1], &[]).with_host(RecordingHost::new(log.clone()));
        let (mut dv, sent) = with_script(dv, &[]);
        dv.add_recompute(Recompute::new(0, RecomputeMode::ServerOnChange).with_sub_view("lines"));
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();

        let outcome = dv.set_field_value(0, FieldValue::numeric(5)).unwrap();
        assert_eq!(outcome, RecomputeOutcome::SubViewsFromCache);
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn test_failed_recompute_is_contained() {
        init_logging();
        let mut dv = loaded(&[1], &[]);
        dv.add_recompute(Recompute::new(0, RecomputeMode::ServerOnChange).with_server_links());
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();

        let outcome = dv.set_field_value(0, FieldValue::numeric(5)).unwrap();
        assert_eq!(outcome, RecomputeOutcome::Failed);
        let rec = dv.current_record().unwrap();
        assert!(!rec.in_recompute());
        assert!(rec.links_position().is_some());
    }

    #[test]
    fn test_recompute_follows_chains() {
        let fields = FieldsTable::new(vec![
            FieldDef::new("a", StorageAttr::Numeric, 8),
            FieldDef::new("b", StorageAttr::Numeric, 8).with_init(|rec, _| {
                FieldValue::numeric(rec.value(0).ok().and_then(FieldValue::as_i64).unwrap_or(0) * 2)
            }),
            FieldDef::new("c", StorageAttr::Numeric, 8).with_init(|rec, _| {
                FieldValue::numeric(rec.value(1).ok().and_then(FieldValue::as_i64).unwrap_or(0) + 1)
            }),
        ]);
        let mut w = TagWriter::new();
        w.start("dataview").attr("include_first", 1).attr("include_last", 1);
        let opts = RecordWriteOptions {
            encoding: WireEncoding::Hex,
            shrink: false,
            current: false,
            with_prev: false,
        };
        Record::new(1, &fields).write(&mut w, &fields, opts);
        w.end();

        let log = Rc::new(RefCell::new(HostLog::default()));
        let mut dv = DataView::new("t1", fields, EngineConfig::default())
            .with_host(RecordingHost::new(log.clone()));
        dv.apply_response(&w.finish()).unwrap();
        dv.add_recompute(Recompute::new(0, RecomputeMode::Client).with_item(RecomputeItem::Field(1)));
        dv.add_recompute(Recompute::new(1, RecomputeMode::Client).with_item(RecomputeItem::Field(2)));
        // c feeds back into b; the walk must stop there
        dv.add_recompute(Recompute::new(2, RecomputeMode::Client).with_item(RecomputeItem::Field(1)));
        dv.set_current_by_index(RecIndex::First, NavOptions::default()).unwrap();
        log.borrow_mut().events.clear();

        let outcome = dv.set_field_value(0, FieldValue::numeric(5)).unwrap();
        assert_eq!(outcome, RecomputeOutcome::Client);
        let rec = dv.current_record().unwrap();
        assert_eq!(rec.value(1).unwrap().as_i64(), Some(10));
        assert_eq!(rec.value(2).unwrap().as_i64(), Some(11));
        assert!(!rec.in_recompute());
        let refreshes = log.borrow().events.iter().filter(|e| e.starts_with("refresh:1:")).count();
        assert_eq!(refreshes, 3);
    }

    #[test]
    fn test_schema_swap_refused_while_changes_queued() {
        let swap = r#"<fields>
            <fld name="a" attr="N" size="8"/><fld name="b" attr="N" size="8"/>
            <fld name="c" attr="N" size="8"/><fld name="d" attr="N" size="8"/>
        </fields>"#;
        let dv = loaded(&[1], &[]);
        let (mut dv, _sent) = with_script(dv, &[""]);
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();
        dv.delete_current().unwrap();
        assert!(dv.window().is_empty());

        assert!(matches!(dv.apply_response(swap), Err(Error::Wire(_))));
        assert_eq!(dv.fields().len(), 3);
        assert!(dv.build_outbound().contains(r#"mode="D""#));

        dv.flush().unwrap();
        dv.apply_response(swap).unwrap();
        assert_eq!(dv.fields().len(), 4);
        assert!(!dv.build_outbound().contains("<rec"));
    }

    #[test]
    fn test_header_attributes() {
        let mut dv = loaded(&[], &[]);
        dv.apply_response(r#"<dvheader rmpos="2,0" compute_by="S" has_main_tbl="0" chunk_size="50" bogus="1"/>"#)
            .unwrap();
        assert_eq!(dv.fields().record_main(), (2, 0));
        assert_eq!(dv.compute_by(), ComputeBy::Server);
        assert!(!dv.flush_updates());
        assert!(!dv.has_main_table());
        assert_eq!(dv.chunk_size(), 50);
    }

    #[test]
    fn test_confirmation_rekeys_client_row() {
        let fields = schema();
        let mut dv = loaded(&[1], &[]);
        dv.set_current_by_index(RecIndex::At(0), NavOptions::default()).unwrap();
        dv.add_record().unwrap();

        let confirmed = crate::test_support::row(&fields, 40);
        let mut w = TagWriter::new();
        w.start("dataview");
        confirmed.write(
            &mut w,
            &fields,
            RecordWriteOptions {
                encoding: dv.config.wire_encoding,
                shrink: false,
                current: false,
                with_prev: false,
            },
        );
        w.end();
        let payload = w.finish().replace(r#"<rec id="40""#, r#"<rec id="40" old_id="-1""#);

        dv.apply_response(&payload).unwrap();
        assert_eq!(dv.window().ids(), vec![1, 40]);
        assert_eq!(dv.current_id(), Some(40));
    }
}
