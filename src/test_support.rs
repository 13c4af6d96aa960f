/// Fakes shared by the unit and integration tests.
use crate::config::WireEncoding;
use crate::field::{FieldValue, StorageAttr};
use crate::fields::{FieldDef, FieldsTable};
use crate::host::TaskHost;
use crate::record::{RecId, Record, RecordWriteOptions};
use crate::recovery::RecoveryAction;
use crate::transport::{Request, Response, Transport, TransportError};
use crate::wire::TagWriter;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// code (numeric), name (alpha, nullable), total = code * 2
pub fn schema() -> FieldsTable {
    FieldsTable::new(vec![
        FieldDef::new("code", StorageAttr::Numeric, 8),
        FieldDef::new("name", StorageAttr::Alpha, 10).nullable(),
        FieldDef::new("total", StorageAttr::Numeric, 8).with_init(|rec, _| {
            let code = rec.value(0).ok().and_then(FieldValue::as_i64).unwrap_or(0);
            FieldValue::numeric(code * 2)
        }),
    ])
}

/// A server row: code = id, name = "row<id>"
pub fn row(fields: &FieldsTable, id: RecId) -> Record {
    let mut rec = Record::new(id, fields);
    rec.set_field_value(0, FieldValue::numeric(id as i64), false, fields)
        .unwrap();
    rec.set_field_value(1, FieldValue::alpha(format!("row{}", id)), false, fields)
        .unwrap();
    rec
}

/// `<dataview attrs...>` holding one `<rec>` per id
pub fn chunk(fields: &FieldsTable, ids: &[RecId], attrs: &[(&str, &str)]) -> String {
    let mut w = TagWriter::new();
    w.start("dataview");
    for &(key, value) in attrs {
        w.attr(key, value);
    }
    let opts = RecordWriteOptions {
        encoding: WireEncoding::Hex,
        shrink: false,
        current: false,
        with_prev: false,
    };
    for &id in ids {
        row(fields, id).write(&mut w, fields, opts);
    }
    w.end();
    w.finish()
}

/// Transport answering from a script and logging every request.
pub struct ScriptedTransport {
    sent: Rc<RefCell<Vec<Request>>>,
    script: VecDeque<Result<Response, TransportError>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        ScriptedTransport {
            sent: Rc::new(RefCell::new(Vec::new())),
            script: VecDeque::new(),
        }
    }

    pub fn respond(mut self, payload: impl Into<String>) -> Self {
        self.script.push_back(Ok(Response::new(payload)));
        self
    }

    pub fn fail(mut self, message: &str) -> Self {
        self.script.push_back(Err(TransportError::new(message)));
        self
    }

    pub fn log(&self) -> Rc<RefCell<Vec<Request>>> {
        self.sent.clone()
    }
}

impl Transport for ScriptedTransport {
    fn send_and_await(&mut self, request: Request) -> Result<Response, TransportError> {
        self.sent.borrow_mut().push(request);
        self.script
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::new("script exhausted")))
    }
}

#[derive(Debug, Default)]
pub struct HostLog {
    pub events: Vec<String>,
    pub veto_suffix: bool,
    pub visible_rows: usize,
    pub stale_sub_views: Vec<String>,
    pub cached_sub_views: Vec<String>,
    pub restarts: Vec<RecoveryAction>,
}

/// Host recording every callback into a shared `HostLog`.
pub struct RecordingHost {
    log: Rc<RefCell<HostLog>>,
}

impl RecordingHost {
    pub fn new(log: Rc<RefCell<HostLog>>) -> Self {
        RecordingHost { log }
    }

    fn push(&self, event: String) {
        self.log.borrow_mut().events.push(event);
    }
}

impl TaskHost for RecordingHost {
    fn record_suffix(&mut self, record: &Record) -> bool {
        self.push(format!("suffix:{}", record.id()));
        !self.log.borrow().veto_suffix
    }

    fn record_prefix(&mut self, record: &Record) {
        self.push(format!("prefix:{}", record.id()));
    }

    fn current_changed(&mut self, previous: Option<RecId>, current: RecId, _display_hint: bool) {
        self.push(format!("current:{:?}->{}", previous, current));
    }

    fn refresh_field(&mut self, record: &Record, field: usize) {
        self.push(format!("refresh:{}:{}", record.id(), field));
    }

    fn sub_view_needs_refresh(&self, task_id: &str) -> bool {
        self.log.borrow().stale_sub_views.iter().any(|t| t == task_id)
    }

    fn refresh_sub_view_from_cache(&mut self, task_id: &str) -> bool {
        self.push(format!("subview_cache:{}", task_id));
        self.log.borrow().cached_sub_views.iter().any(|t| t == task_id)
    }

    fn refresh_sub_view(&mut self, task_id: &str) {
        self.push(format!("subview:{}", task_id));
    }

    fn visible_rows(&self) -> usize {
        self.log.borrow().visible_rows.max(1)
    }

    fn restart(&mut self, action: RecoveryAction) {
        self.log.borrow_mut().restarts.push(action);
    }
}
