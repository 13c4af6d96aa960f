/// Callbacks from a dataview into the task that owns it.
///
/// The dataview never renders or runs task logic itself. Record entry and
/// exit actions, field refreshes and embedded sub-views all belong to the
/// host; the dataview only decides when to invoke them.
use crate::record::{RecId, Record};
use crate::recovery::RecoveryAction;

pub trait TaskHost {
    /// Exit action of the current record. Returning false vetoes the move.
    fn record_suffix(&mut self, _record: &Record) -> bool {
        true
    }

    /// Entry action of the new current record
    fn record_prefix(&mut self, _record: &Record) {}

    fn current_changed(&mut self, _previous: Option<RecId>, _current: RecId, _display_hint: bool) {}

    /// A field of the current record got a new value outside user input
    fn refresh_field(&mut self, _record: &Record, _field: usize) {}

    fn sub_view_needs_refresh(&self, _task_id: &str) -> bool {
        false
    }

    /// Refresh a sub-view from its own cached dataview. Returns false when
    /// the cache cannot serve it and the server must be asked.
    fn refresh_sub_view_from_cache(&mut self, _task_id: &str) -> bool {
        false
    }

    fn refresh_sub_view(&mut self, _task_id: &str) {}

    /// Rows shown at once; used to fill a page when jumping to the end
    fn visible_rows(&self) -> usize {
        1
    }

    /// The task must restart as part of a recovery
    fn restart(&mut self, _action: RecoveryAction) {}
}

/// Host of a dataview with no task attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedHost;

impl TaskHost for DetachedHost {}
