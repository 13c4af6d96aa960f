/// Resident lookup tables.
///
/// A TableCache holds every row of a small server table client-side so that
/// links can be resolved without a round trip. Rows are ordered lazily:
/// `sort_table` only re-sorts when the requested (key, direction) differs
/// from the current sort state.

use crate::config::WireEncoding;
use crate::error::{Error, Result};
use crate::field::FieldValue;
use crate::fields::FieldsTable;
use crate::record::{RecId, Record};
use crate::records_table::RecordsTable;
use crate::wire::{skip_element, Tag, TagKind, TagSource};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Sort direction of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "A" | "a" => Some(SortDirection::Ascending),
            "D" | "d" => Some(SortDirection::Descending),
            _ => None,
        }
    }
}

/// Ordered list of column references identifying a sortable key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub id: i32,
    pub columns: Vec<usize>,
}

impl Key {
    pub fn new(id: i32, columns: Vec<usize>) -> Self {
        Key { id, columns }
    }

    /// Compare two rows by the key's columns in order; null sorts last.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for &col in &self.columns {
            let va = a.values().get(col).unwrap_or(&FieldValue::Null);
            let vb = b.values().get(col).unwrap_or(&FieldValue::Null);
            let cmp = va.key_cmp(vb);
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    }
}

/// Inclusive range test on one column. `None` leaves that side open;
/// `min == max` is a locate.
#[derive(Debug, Clone, PartialEq)]
pub struct Boundary {
    pub column: usize,
    pub min: Option<FieldValue>,
    pub max: Option<FieldValue>,
}

impl Boundary {
    pub fn locate(column: usize, value: FieldValue) -> Self {
        Boundary {
            column,
            min: Some(value.clone()),
            max: Some(value),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        let value = record.values().get(self.column).unwrap_or(&FieldValue::Null);
        let above_min = self
            .min
            .as_ref()
            .map_or(true, |min| value.key_cmp(min) != Ordering::Less);
        let below_max = self
            .max
            .as_ref()
            .map_or(true, |max| value.key_cmp(max) != Ordering::Greater);
        above_min && below_max
    }
}

#[derive(Debug, Clone)]
pub struct TableCache {
    id: i32,
    name: String,
    ident: String,
    fields: FieldsTable,
    rows: RecordsTable,
    keys: Vec<Key>,
    sorted_by: Option<(i32, SortDirection)>,
}

impl TableCache {
    pub fn new(id: i32, name: impl Into<String>, fields: FieldsTable) -> Self {
        TableCache {
            id,
            name: name.into(),
            ident: String::new(),
            fields,
            rows: RecordsTable::new(),
            keys: Vec::new(),
            sorted_by: None,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn fields(&self) -> &FieldsTable {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &Record> {
        self.rows.iter()
    }

    pub fn row(&self, id: RecId) -> Option<&Record> {
        self.rows.by_id(id)
    }

    pub fn add_key(&mut self, key: Key) {
        self.keys.retain(|k| k.id != key.id);
        self.keys.push(key);
    }

    pub fn key(&self, id: i32) -> Option<&Key> {
        self.keys.iter().find(|k| k.id == id)
    }

    /// Adding a row invalidates the sort state.
    pub fn add_row(&mut self, row: Record) -> Result<()> {
        self.rows.append(row)?;
        self.sorted_by = None;
        Ok(())
    }

    pub fn sorted_by(&self) -> Option<(i32, SortDirection)> {
        self.sorted_by
    }

    /// Order every row by `key_id`. Ties fall through the key's columns and
    /// finally the row id, so the order is total.
    pub fn sort_table(&mut self, key_id: i32, direction: SortDirection) -> Result<()> {
        if self.sorted_by == Some((key_id, direction)) {
            return Ok(());
        }
        let key = self
            .key(key_id)
            .cloned()
            .ok_or(Error::KeyMissing { table: self.id, key: key_id })?;

        self.rows
            .sort_by(|a, b| key.compare(a, b).then_with(|| a.id().cmp(&b.id())));
        if direction == SortDirection::Descending {
            self.rows.reverse();
        }
        log::trace!(
            "table cache {} sorted by key {} {:?} ({} rows)",
            self.id,
            key_id,
            direction,
            self.rows.len()
        );
        self.sorted_by = Some((key_id, direction));
        Ok(())
    }

    /// First row in the current order satisfying every boundary. With no
    /// boundaries this is simply the first row. Callers sort by the key the
    /// boundaries imply beforehand.
    pub fn fetch(&self, boundaries: &[Boundary]) -> Option<&Record> {
        self.rows
            .iter()
            .find(|row| boundaries.iter().all(|b| b.matches(row)))
    }

    /// Position token of a row: its `db_pos` when the server sent one,
    /// otherwise its id.
    pub fn position_token(row: &Record) -> String {
        row.db_pos()
            .map(str::to_string)
            .unwrap_or_else(|| row.id().to_string())
    }

    /// Parse the body of a `<cachedTable>` element whose open tag is `open`.
    pub fn parse<S: TagSource + ?Sized>(
        open: &Tag,
        source: &mut S,
        encoding: WireEncoding,
    ) -> Result<Self> {
        let id = open
            .attr_i32("id")?
            .ok_or_else(|| Error::wire("<cachedTable> without id"))?;
        let mut cache = TableCache::new(id, open.attr("name").unwrap_or(""), FieldsTable::new(vec![]));
        cache.ident = open.attr("ident").unwrap_or("").to_string();

        let mut current_key: Option<Key> = None;
        while let Some(tag) = source.next_tag()? {
            match tag.name.as_str() {
                "cachedTable" if tag.is_close("cachedTable") => {
                    log::debug!("loaded table cache {} '{}' with {} rows", id, cache.name, cache.len());
                    return Ok(cache);
                }
                "fields" if tag.is_open("fields") => {
                    cache.fields = FieldsTable::parse(source)?;
                }
                "KEY" => match tag.kind {
                    TagKind::Open => {
                        let key_id = tag.attr_i32("id")?.ok_or_else(|| Error::wire("<KEY> without id"))?;
                        current_key = Some(Key::new(key_id, Vec::new()));
                    }
                    TagKind::Close => {
                        if let Some(key) = current_key.take() {
                            cache.add_key(key);
                        }
                    }
                    TagKind::Empty => {
                        let key_id = tag.attr_i32("id")?.ok_or_else(|| Error::wire("<KEY> without id"))?;
                        cache.add_key(Key::new(key_id, Vec::new()));
                    }
                },
                "column" => {
                    let col = tag
                        .attr_usize("id")?
                        .ok_or_else(|| Error::wire("<column> without id"))?;
                    if col >= cache.fields.len() {
                        return Err(Error::FieldIndex { index: col, len: cache.fields.len() });
                    }
                    match current_key.as_mut() {
                        Some(key) => key.columns.push(col),
                        None => log::warn!("<column> outside <KEY> in table cache {}", id),
                    }
                }
                "records" => {}
                "REC" | "rec" => {
                    let row = Record::parse(&tag, &cache.fields, encoding, true, None)?;
                    cache.add_row(row)?;
                }
                other => {
                    log::warn!("skipping unknown tag <{}> in table cache {}", other, id);
                    if tag.kind == TagKind::Open {
                        skip_element(source, other)?;
                    }
                }
            }
        }
        Err(Error::wire("missing </cachedTable>"))
    }
}

/// Every table cache loaded for a task, by id.
#[derive(Debug, Clone, Default)]
pub struct TableCacheSet {
    tables: HashMap<i32, TableCache>,
}

impl TableCacheSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cache: TableCache) {
        self.tables.insert(cache.id(), cache);
    }

    pub fn get(&self, id: i32) -> Option<&TableCache> {
        self.tables.get(&id)
    }

    pub fn get_mut(&mut self, id: i32) -> Result<&mut TableCache> {
        self.tables.get_mut(&id).ok_or(Error::TableCacheMissing(id))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }
}
