/// Link resolution.
///
/// A link (dataview header) binds a subset of the window's fields to one row
/// of a resident table. Resolving it for a record evaluates the link's
/// condition, orders the table by the link's key and takes the first row in
/// the ranges computed from the record. The bound fields then receive that
/// row's columns; when nothing is found they are re-initialized instead.
/// Either way the link's return field receives the outcome.

use crate::error::{Error, Result};
use crate::expr::Condition;
use crate::field::{FieldValue, StorageAttr};
use crate::fields::FieldsTable;
use crate::record::Record;
use crate::table_cache::{Boundary, SortDirection, TableCache, TableCacheSet};
use crate::wire::{Tag, TagKind, TagSource};

/// `link_mode` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkMode {
    #[default]
    Query,
    Write,
    Create,
}

impl LinkMode {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "Q" => Some(LinkMode::Query),
            "W" => Some(LinkMode::Write),
            "C" | "A" => Some(LinkMode::Create),
            _ => None,
        }
    }
}

/// When a link is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalTiming {
    /// On record entry and on recompute
    #[default]
    Prefix,
    /// Only when a field it depends on is recomputed
    Recompute,
}

/// Where the linked rows live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkSource {
    #[default]
    Resident,
    /// Only the server can resolve it
    Remote,
}

/// Range on one table column, bounded by values of the current record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkRange {
    pub column: usize,
    pub min_field: Option<usize>,
    pub max_field: Option<usize>,
}

/// Result of one resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Found,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct DataviewHeader {
    id: i32,
    table_index: i32,
    key_id: i32,
    direction: SortDirection,
    cond: Condition,
    ret_field: Option<usize>,
    mode: LinkMode,
    timing: EvalTiming,
    source: LinkSource,
    ranges: Vec<LinkRange>,
    /// Position token of the last row found
    last_pos: Option<String>,
}

impl DataviewHeader {
    pub fn new(id: i32, table_index: i32, key_id: i32) -> Self {
        DataviewHeader {
            id,
            table_index,
            key_id,
            direction: SortDirection::Ascending,
            cond: Condition::always(),
            ret_field: None,
            mode: LinkMode::Query,
            timing: EvalTiming::Prefix,
            source: LinkSource::Resident,
            ranges: Vec::new(),
            last_pos: None,
        }
    }

    pub fn with_direction(mut self, direction: SortDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_condition(mut self, cond: Condition) -> Self {
        self.cond = cond;
        self
    }

    pub fn with_return_field(mut self, field: usize) -> Self {
        self.ret_field = Some(field);
        self
    }

    pub fn with_timing(mut self, timing: EvalTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_source(mut self, source: LinkSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_range(mut self, range: LinkRange) -> Self {
        self.ranges.push(range);
        self
    }

    /// Locate: the column must equal the record's field
    pub fn with_locate(self, column: usize, field: usize) -> Self {
        self.with_range(LinkRange {
            column,
            min_field: Some(field),
            max_field: Some(field),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn table_index(&self) -> i32 {
        self.table_index
    }

    pub fn condition(&self) -> &Condition {
        &self.cond
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn timing(&self) -> EvalTiming {
        self.timing
    }

    pub fn source(&self) -> LinkSource {
        self.source
    }

    pub fn return_field(&self) -> Option<usize> {
        self.ret_field
    }

    pub fn last_pos(&self) -> Option<&str> {
        self.last_pos.as_deref()
    }

    /// Window fields this link writes: bound fields then the return field
    pub fn bound_fields(&self, fields: &FieldsTable) -> Vec<usize> {
        let mut out: Vec<usize> = fields
            .link_fields(self.id)
            .into_iter()
            .map(|(field, _)| field)
            .collect();
        if let Some(ret) = self.ret_field {
            if !out.contains(&ret) {
                out.push(ret);
            }
        }
        out
    }

    /// Table boundaries for the current record
    pub fn boundaries(&self, record: &Record) -> Result<Vec<Boundary>> {
        self.ranges
            .iter()
            .map(|r| {
                let read = |f: Option<usize>| -> Result<Option<FieldValue>> {
                    f.map(|idx| record.value(idx).cloned()).transpose()
                };
                Ok(Boundary {
                    column: r.column,
                    min: read(r.min_field)?,
                    max: read(r.max_field)?,
                })
            })
            .collect()
    }

    /// Resolve against the resident tables and write the bound fields.
    pub fn resolve(
        &mut self,
        record: &mut Record,
        fields: &FieldsTable,
        caches: &mut TableCacheSet,
    ) -> Result<LinkOutcome> {
        if !self.cond.eval(record, fields) {
            log::trace!("link {}: condition '{}' is false", self.id, self.cond);
            return self.not_found(record, fields);
        }
        if self.source == LinkSource::Remote {
            log::warn!("link {} is remote and cannot be resolved locally", self.id);
            return self.not_found(record, fields);
        }

        let boundaries = self.boundaries(record)?;
        let cache = caches.get_mut(self.table_index)?;
        cache.sort_table(self.key_id, self.direction)?;

        let bindings = fields.link_fields(self.id);
        let found = cache.fetch(&boundaries).map(|row| {
            let values: Vec<(usize, FieldValue)> = bindings
                .iter()
                .map(|&(field, column)| {
                    let value = row.values().get(column).cloned().unwrap_or(FieldValue::Null);
                    (field, value)
                })
                .collect();
            (values, TableCache::position_token(row))
        });

        let Some((values, token)) = found else {
            return self.not_found(record, fields);
        };
        for (field, value) in values {
            record.set_field_value(field, value, false, fields)?;
        }
        self.last_pos = Some(token);
        self.write_return(record, fields, true)?;
        Ok(LinkOutcome::Found)
    }

    fn not_found(&mut self, record: &mut Record, fields: &FieldsTable) -> Result<LinkOutcome> {
        for (field, _) in fields.link_fields(self.id) {
            let value = fields.init_value(field, record)?;
            record.set_field_value(field, value, false, fields)?;
        }
        self.last_pos = None;
        self.write_return(record, fields, false)?;
        Ok(LinkOutcome::NotFound)
    }

    fn write_return(&self, record: &mut Record, fields: &FieldsTable, found: bool) -> Result<()> {
        let Some(ret) = self.ret_field else {
            return Ok(());
        };
        let value = match fields.get(ret)?.attr() {
            StorageAttr::Boolean => FieldValue::Boolean(found),
            a if a.is_numeric() => FieldValue::numeric(i64::from(found)),
            _ => FieldValue::alpha(if found { "1" } else { "0" }),
        };
        record.set_field_value(ret, value, false, fields)
    }

    /// Parse `<link .../>` (or `<link ...>` with `<range/>` children).
    pub fn parse<S: TagSource + ?Sized>(tag: &Tag, source: &mut S) -> Result<Self> {
        let id = tag.attr_i32("id")?.ok_or_else(|| Error::wire("<link> without id"))?;
        let table_index = tag.attr_i32("table_index")?.unwrap_or(-1);
        let key_id = tag.attr_i32("key")?.unwrap_or(0);
        let mut link = DataviewHeader::new(id, table_index, key_id);

        if let Some(dir) = tag.attr("dir") {
            link.direction = SortDirection::from_wire(dir)
                .ok_or_else(|| Error::wire(format!("link {}: bad dir {:?}", id, dir)))?;
        }
        if let Some(cond) = tag.attr("cond") {
            link.cond = Condition::parse(cond)?;
        }
        link.ret_field = tag
            .attr_i32("ret_val")?
            .and_then(|v| usize::try_from(v).ok());
        if let Some(mode) = tag.attr("link_mode") {
            link.mode = LinkMode::from_wire(mode).unwrap_or_else(|| {
                log::warn!("link {}: unknown link_mode {:?}", id, mode);
                LinkMode::Query
            });
        }
        link.timing = match tag.attr("eval_time") {
            Some("R") => EvalTiming::Recompute,
            _ => EvalTiming::Prefix,
        };
        if table_index < 0 || tag.attr("source") == Some("R") {
            link.source = LinkSource::Remote;
        }

        if tag.kind == TagKind::Open {
            while let Some(child) = source.next_tag()? {
                if child.is_close("link") {
                    return Ok(link);
                }
                if child.name == "range" {
                    let column = child
                        .attr_usize("col")?
                        .ok_or_else(|| Error::wire("<range> without col"))?;
                    link.ranges.push(LinkRange {
                        column,
                        min_field: child.attr_usize("min_fld")?,
                        max_field: child.attr_usize("max_fld")?,
                    });
                } else {
                    log::warn!("link {}: skipping unknown tag <{}>", id, child.name);
                }
            }
            return Err(Error::wire("missing </link>"));
        }
        Ok(link)
    }

    /// Parse `<link>` entries up to `</links>`.
    pub fn parse_links<S: TagSource + ?Sized>(source: &mut S) -> Result<Vec<Self>> {
        let mut links = Vec::new();
        while let Some(tag) = source.next_tag()? {
            if tag.is_close("links") {
                return Ok(links);
            }
            if tag.name == "link" && tag.kind != TagKind::Close {
                links.push(DataviewHeader::parse(&tag, source)?);
            } else {
                log::warn!("skipping unknown tag <{}> in <links>", tag.name);
            }
        }
        Err(Error::wire("missing </links>"))
    }
}

/// `id:pos;id:pos` for every link with a resolved position
pub fn links_position(links: &[DataviewHeader]) -> String {
    links
        .iter()
        .filter_map(|l| l.last_pos().map(|pos| format!("{}:{}", l.id(), pos)))
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldDef;
    use crate::record::RecId;
    use crate::table_cache::Key;
    use crate::wire::Tokenizer;

    /// Resident table: code -> label
    fn caches() -> TableCacheSet {
        let fields = FieldsTable::new(vec![
            FieldDef::new("code", StorageAttr::Numeric, 8),
            FieldDef::new("label", StorageAttr::Alpha, 10),
        ]);
        let mut cache = TableCache::new(7, "labels", fields.clone());
        for (id, code, label) in [(1, 30, "thirty"), (2, 10, "ten"), (3, 20, "twenty")] {
            let mut row = Record::new(id as RecId, &fields);
            row.set_field_value(0, FieldValue::numeric(code), false, &fields).unwrap();
            row.set_field_value(1, FieldValue::alpha(label), false, &fields).unwrap();
            cache.add_row(row).unwrap();
        }
        cache.add_key(Key::new(1, vec![0]));
        let mut set = TableCacheSet::new();
        set.insert(cache);
        set
    }

    /// Window: code, label (bound to link 1 column 1), found flag
    fn window_fields() -> FieldsTable {
        FieldsTable::new(vec![
            FieldDef::new("code", StorageAttr::Numeric, 8),
            FieldDef::new("label", StorageAttr::Alpha, 10)
                .with_default(FieldValue::alpha("?"))
                .linked_to(1, 1),
            FieldDef::new("found", StorageAttr::Boolean, 1),
        ])
    }

    fn link() -> DataviewHeader {
        DataviewHeader::new(1, 7, 1).with_locate(0, 0).with_return_field(2)
    }

    #[test]
    fn test_resolve_found() {
        let fields = window_fields();
        let mut caches = caches();
        let mut rec = Record::new(1, &fields);
        rec.set_field_value(0, FieldValue::numeric(20), false, &fields).unwrap();

        let mut link = link();
        assert_eq!(link.resolve(&mut rec, &fields, &mut caches).unwrap(), LinkOutcome::Found);
        assert_eq!(rec.value(1).unwrap().as_str(), Some("twenty"));
        assert_eq!(rec.value(2).unwrap().as_bool(), Some(true));
        assert_eq!(link.last_pos(), Some("3"));
        assert_eq!(links_position(std::slice::from_ref(&link)), "1:3");
    }

    #[test]
    fn test_resolve_not_found_reinitializes() {
        let fields = window_fields();
        let mut caches = caches();
        let mut rec = Record::new(1, &fields);
        rec.set_field_value(0, FieldValue::numeric(99), false, &fields).unwrap();
        rec.set_field_value(1, FieldValue::alpha("stale"), false, &fields).unwrap();

        let mut link = link();
        assert_eq!(link.resolve(&mut rec, &fields, &mut caches).unwrap(), LinkOutcome::NotFound);
        assert_eq!(rec.value(1).unwrap().as_str(), Some("?"));
        assert_eq!(rec.value(2).unwrap().as_bool(), Some(false));
        assert_eq!(link.last_pos(), None);
    }

    #[test]
    fn test_false_condition_skips_lookup() {
        let fields = window_fields();
        let mut caches = caches();
        let mut rec = Record::new(1, &fields);
        rec.set_field_value(0, FieldValue::numeric(10), false, &fields).unwrap();

        let mut link = link().with_condition(Condition::parse("code > 50").unwrap());
        assert_eq!(link.resolve(&mut rec, &fields, &mut caches).unwrap(), LinkOutcome::NotFound);
        assert_eq!(rec.value(2).unwrap().as_bool(), Some(false));
    }

    #[test]
    fn test_range_uses_sort_order() {
        let fields = window_fields();
        let mut caches = caches();
        let mut rec = Record::new(1, &fields);
        rec.set_field_value(0, FieldValue::numeric(15), false, &fields).unwrap();

        // first code >= 15 in ascending order
        let mut link = DataviewHeader::new(1, 7, 1).with_range(LinkRange {
            column: 0,
            min_field: Some(0),
            max_field: None,
        });
        link.resolve(&mut rec, &fields, &mut caches).unwrap();
        assert_eq!(rec.value(1).unwrap().as_str(), Some("twenty"));

        // descending: first row is 30
        let mut link = DataviewHeader::new(1, 7, 1)
            .with_direction(SortDirection::Descending)
            .with_range(LinkRange { column: 0, min_field: Some(0), max_field: None });
        link.resolve(&mut rec, &fields, &mut caches).unwrap();
        assert_eq!(rec.value(1).unwrap().as_str(), Some("thirty"));
    }

    #[test]
    fn test_missing_table_is_fatal() {
        let fields = window_fields();
        let mut caches = TableCacheSet::new();
        let mut rec = Record::new(1, &fields);
        let err = link().resolve(&mut rec, &fields, &mut caches).unwrap_err();
        assert!(matches!(err, Error::TableCacheMissing(7)));
    }

    #[test]
    fn test_parse_links() {
        let xml = r#"<links>
            <link table_index="7" id="1" key="1" dir="D" cond="code &gt; 0" ret_val="2" link_mode="W"/>
            <link table_index="7" id="2" key="1" eval_time="R"><range col="0" min_fld="0" max_fld="0"/></link>
            <link table_index="-1" id="3" ret_val="-1"/>
        </links>"#;
        let mut tok = Tokenizer::new(xml);
        tok.next_tag().unwrap();
        let links = DataviewHeader::parse_links(&mut tok).unwrap();

        assert_eq!(links.len(), 3);
        assert_eq!(links[0].mode(), LinkMode::Write);
        assert_eq!(links[0].return_field(), Some(2));
        assert_eq!(links[0].direction, SortDirection::Descending);
        assert_eq!(links[1].timing(), EvalTiming::Recompute);
        assert_eq!(links[1].ranges.len(), 1);
        assert_eq!(links[2].source(), LinkSource::Remote);
        assert_eq!(links[2].return_field(), None);
    }
}
