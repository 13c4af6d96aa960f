//! DataView - client-side windowed record cache
//!
//! A task on the client sees a server table through a `DataView`: a window
//! of records fetched in chunks, edited locally and sent back as diffs.
//! Small lookup tables are kept resident so links between tables resolve
//! without a round trip, and a per-field dependency graph decides which
//! derived values to recompute locally and which need the server.

pub mod changes;
pub mod codec;
pub mod config;
pub mod dataview;
pub mod dc_values;
pub mod error;
pub mod expr;
pub mod field;
pub mod fields;
pub mod heap_sort;
pub mod host;
pub mod link;
pub mod recompute;
pub mod record;
pub mod records_table;
pub mod recovery;
pub mod table_cache;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod test_support;

pub use changes::{Changeset, IndexAdjuster, WindowChange};
pub use config::{EngineConfig, InsertSide, WireEncoding};
pub use dataview::{ComputeBy, DataView, NavOptions, RecIndex, TaskMode, ViewState};
pub use dc_values::{DcRef, DcValues, DcValuesRegistry};
pub use error::{Boundary, Error, Result};
pub use expr::Condition;
pub use field::{FieldValue, NumBuf, StorageAttr};
pub use fields::{FieldDef, FieldsTable};
pub use heap_sort::{heap_sort, heap_sort_by};
pub use host::{DetachedHost, TaskHost};
pub use link::{DataviewHeader, EvalTiming, LinkMode, LinkOutcome, LinkRange, LinkSource};
pub use recompute::{Recompute, RecomputeItem, RecomputeMode, RecomputeOutcome, RecomputeTable};
pub use record::{Flag, RecId, Record, RecordMode};
pub use records_table::RecordsTable;
pub use recovery::{RecoveryAction, ServerRecovery, TransactionPhase};
pub use table_cache::{Key, SortDirection, TableCache, TableCacheSet};
pub use transport::{ChunkDirection, Command, Request, Response, Transport, TransportError};
