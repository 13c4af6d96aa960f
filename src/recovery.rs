/// Server-driven recovery.
///
/// When the server rejects a change it sends a recovery code with the
/// response. The client turns it into exactly one pending `RecoveryAction`
/// depending on where in the record transaction the failure happened, stops
/// local execution, and replays the action once through
/// `DataView::process_recovery`.

/// Recovery code sent by the server (`recovery="N|R|T"`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerRecovery {
    #[default]
    None,
    Rollback,
    Retry,
}

impl ServerRecovery {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "N" | "" => Some(ServerRecovery::None),
            "R" => Some(ServerRecovery::Rollback),
            "T" => Some(ServerRecovery::Retry),
            _ => None,
        }
    }
}

/// Compensating action replayed by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryAction {
    #[default]
    None,
    /// Cancel the current record's edits without a server rollback
    Cancel,
    /// Move to the first row of the window
    MoveToBegin,
    /// Restart at the beginning of the screen, suppressing the exit action
    BeginScreen,
    /// Restart at the beginning of the table, dropping resident caches
    BeginTable,
}

/// Where in the record-level transaction a request was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionPhase {
    #[default]
    Idle,
    /// Running the current record's exit action
    RecordSuffix,
    /// Committing the task's changes
    Commit,
}

/// Map a server code to the action to replay.
///
/// A rollback during the record exit only needs the edits cancelled; any
/// other rollback moves back to the first row. A retry during the record
/// exit restarts the screen; any other retry restarts the table.
pub fn decide(code: ServerRecovery, phase: TransactionPhase) -> RecoveryAction {
    match (code, phase) {
        (ServerRecovery::None, _) => RecoveryAction::None,
        (ServerRecovery::Rollback, TransactionPhase::RecordSuffix) => RecoveryAction::Cancel,
        (ServerRecovery::Rollback, _) => RecoveryAction::MoveToBegin,
        (ServerRecovery::Retry, TransactionPhase::RecordSuffix) => RecoveryAction::BeginScreen,
        (ServerRecovery::Retry, _) => RecoveryAction::BeginTable,
    }
}
