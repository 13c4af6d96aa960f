/// Error types for the dataview engine.
///
/// Errors fall into two disjoint classes:
///
/// - **Boundary** (`Error::OutOfView`): a navigation request fell outside the
///   loaded window, or an exit action vetoed the move. Callers are expected to
///   catch these and either fetch-and-retry or reset to a boundary state.
/// - **Fatal**: every other variant. These signal a broken invariant or a
///   failed collaborator and are never silently recovered.

use crate::field::{FieldValue, StorageAttr};
use crate::recovery::RecoveryAction;
use crate::record::{RecId, RecordMode};
use crate::transport::TransportError;
use thiserror::Error;

/// Which edge of the window a navigation failed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Before the first row of the dataset
    Top,
    /// Past the last row of the dataset
    Bottom,
    /// The exit action of the current record refused the move
    RecSuffixFailed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("record out of data view: {0:?}")]
    OutOfView(Boundary),

    #[error("field index {index} out of range [0, {len})")]
    FieldIndex { index: usize, len: usize },

    #[error("value {value:?} does not fit field '{field}' ({attr:?})")]
    ValueMismatch {
        field: String,
        attr: StorageAttr,
        value: FieldValue,
    },

    #[error("corrupted record {id}: {reason}")]
    Corrupted { id: RecId, reason: String },

    #[error("record {0} not found")]
    RecordNotFound(RecId),

    #[error("no current record")]
    NoCurrentRecord,

    #[error("invalid mode transition {from:?} -> {to:?}")]
    ModeTransition { from: RecordMode, to: RecordMode },

    #[error("pending recovery action {0:?} must be processed before navigating")]
    PendingRecovery(RecoveryAction),

    #[error("chunk fetch gave up after {0} attempts")]
    FetchExhausted(usize),

    #[error("wire format error: {0}")]
    Wire(String),

    #[error("expression error: {0}")]
    Expression(String),

    #[error("table cache {0} not loaded")]
    TableCacheMissing(i32),

    #[error("key {key} not defined on table cache {table}")]
    KeyMissing { table: i32, key: i32 },

    #[error("link {0} not defined")]
    LinkMissing(i32),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    /// Returns true for the recoverable boundary class
    pub fn is_boundary(&self) -> bool {
        matches!(self, Error::OutOfView(_))
    }

    /// Returns the boundary kind, if this is a boundary-class error
    pub fn boundary(&self) -> Option<Boundary> {
        match self {
            Error::OutOfView(b) => Some(*b),
            _ => None,
        }
    }

    pub(crate) fn wire(msg: impl Into<String>) -> Self {
        Error::Wire(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
