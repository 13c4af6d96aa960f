/// Field schema of a dataview or resident table.
///
/// A `FieldsTable` defines the structure every `Record` of a window follows:
/// name, storage attribute, declared size and nullability of each field,
/// plus the record-main range that says which fields are synchronized with
/// the server.
///
/// # Examples
///
/// ```
/// use dataview::{FieldDef, FieldsTable, StorageAttr};
///
/// let fields = FieldsTable::new(vec![
///     FieldDef::new("id", StorageAttr::Numeric, 8),
///     FieldDef::new("name", StorageAttr::Alpha, 20),
///     FieldDef::new("notes", StorageAttr::Unicode, 200).nullable(),
/// ]);
///
/// assert_eq!(fields.len(), 3);
/// assert_eq!(fields.index_of("name"), Some(1));
/// assert!(fields.in_record_main(2));
/// ```

use crate::error::{Error, Result};
use crate::field::{FieldValue, NumBuf, StorageAttr};
use crate::record::Record;
use crate::wire::{Tag, TagSource};
use std::fmt;
use std::rc::Rc;

/// Computation of a field's value from the rest of its record.
pub type InitFn = Rc<dyn Fn(&Record, &FieldsTable) -> FieldValue>;

/// Binding of a window field to a column of a link's resolved row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkBinding {
    pub link_id: i32,
    /// Column index in the resident table
    pub column: usize,
}

/// Definition of a single field.
#[derive(Clone)]
pub struct FieldDef {
    name: String,
    attr: StorageAttr,
    size: usize,
    nullable: bool,
    default: FieldValue,
    init: Option<InitFn>,
    link: Option<LinkBinding>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, attr: StorageAttr, size: usize) -> Self {
        FieldDef {
            name: name.into(),
            attr,
            size,
            nullable: false,
            default: FieldValue::zero_of(attr, size),
            init: None,
            link: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_default(mut self, value: FieldValue) -> Self {
        self.default = value;
        self
    }

    /// Attach an init expression, evaluated on record creation, on link
    /// miss and by recompute.
    pub fn with_init<F>(mut self, init: F) -> Self
    where
        F: Fn(&Record, &FieldsTable) -> FieldValue + 'static,
    {
        self.init = Some(Rc::new(init));
        self
    }

    pub fn linked_to(mut self, link_id: i32, column: usize) -> Self {
        self.link = Some(LinkBinding { link_id, column });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr(&self) -> StorageAttr {
        self.attr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn default_value(&self) -> &FieldValue {
        &self.default
    }

    pub fn has_init(&self) -> bool {
        self.init.is_some()
    }

    pub fn link(&self) -> Option<LinkBinding> {
        self.link
    }
}

impl fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FieldDef {{ name: '{}', attr: {:?}, size: {}, nullable: {}, init: {}, link: {:?} }}",
            self.name,
            self.attr,
            self.size,
            self.nullable,
            self.init.is_some(),
            self.link
        )
    }
}

/// Ordered field definitions plus the record-main range.
#[derive(Debug, Clone)]
pub struct FieldsTable {
    fields: Vec<FieldDef>,
    /// First field of the record main
    rm_idx: usize,
    /// Number of record-main fields
    rm_size: usize,
    double_byte: bool,
}

impl FieldsTable {
    /// Creates a table whose record main spans every field.
    pub fn new(fields: Vec<FieldDef>) -> Self {
        let rm_size = fields.len();
        FieldsTable {
            fields,
            rm_idx: 0,
            rm_size,
            double_byte: false,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, idx: usize) -> Result<&FieldDef> {
        self.fields.get(idx).ok_or(Error::FieldIndex {
            index: idx,
            len: self.fields.len(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter()
    }

    /// Returns the index of a field by name, or None if not found.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Record-main range as sent in `<dvheader rmpos="S,I">`
    pub fn set_record_main(&mut self, size: usize, idx: usize) {
        self.rm_size = size;
        self.rm_idx = idx;
    }

    pub fn record_main(&self) -> (usize, usize) {
        (self.rm_size, self.rm_idx)
    }

    /// True if the field belongs to the synchronized schema
    pub fn in_record_main(&self, idx: usize) -> bool {
        idx >= self.rm_idx && idx < self.rm_idx + self.rm_size
    }

    pub fn set_double_byte(&mut self, double_byte: bool) {
        self.double_byte = double_byte;
    }

    pub fn double_byte(&self) -> bool {
        self.double_byte
    }

    /// Fields bound to the given link, as (field index, table column)
    pub fn link_fields(&self, link_id: i32) -> Vec<(usize, usize)> {
        self.fields
            .iter()
            .enumerate()
            .filter_map(|(i, f)| match f.link {
                Some(b) if b.link_id == link_id => Some((i, b.column)),
                _ => None,
            })
            .collect()
    }

    /// Value a field takes when initialized: its init expression if it has
    /// one, otherwise its declared default.
    pub fn init_value(&self, idx: usize, record: &Record) -> Result<FieldValue> {
        let def = self.get(idx)?;
        Ok(match &def.init {
            Some(init) => init(record, self),
            None => def.default.clone(),
        })
    }

    /// Parse `<fld .../>` tags up to `</fields>`. The opening `<fields>` tag
    /// must already have been consumed.
    pub fn parse<S: TagSource + ?Sized>(source: &mut S) -> Result<Self> {
        let mut fields = Vec::new();
        while let Some(tag) = source.next_tag()? {
            if tag.is_close("fields") {
                return Ok(FieldsTable::new(fields));
            }
            if tag.name == "fld" {
                fields.push(parse_field(&tag)?);
            } else {
                log::warn!("skipping unknown tag <{}> in <fields>", tag.name);
            }
        }
        Err(Error::wire("missing </fields>"))
    }
}

fn parse_field(tag: &Tag) -> Result<FieldDef> {
    let name = tag.require("name")?;
    let attr_raw = tag.require("attr")?;
    let attr = StorageAttr::from_wire(attr_raw)
        .ok_or_else(|| Error::wire(format!("unknown storage attribute {:?}", attr_raw)))?;
    let size = tag.attr_usize("size")?.unwrap_or(match attr {
        StorageAttr::Boolean => 1,
        a if a.is_numeric() => NumBuf::I64_WIDTH,
        _ => 0,
    });

    let mut def = FieldDef::new(name, attr, size);
    if tag.attr_bool("nullable")?.unwrap_or(false) {
        def = def.nullable();
    }
    if let Some(raw) = tag.attr("default") {
        def = def.with_default(parse_literal(attr, raw)?);
    }
    if let Some(link_id) = tag.attr_i32("link")? {
        let column = tag.attr_usize("link_col")?.unwrap_or(0);
        def = def.linked_to(link_id, column);
    }
    Ok(def)
}

/// Parse a default value written in its display form.
pub fn parse_literal(attr: StorageAttr, raw: &str) -> Result<FieldValue> {
    Ok(match attr {
        StorageAttr::Alpha => FieldValue::Alpha(raw.to_string()),
        StorageAttr::Unicode => FieldValue::Unicode(raw.to_string()),
        StorageAttr::Blob => FieldValue::Blob(raw.as_bytes().to_vec()),
        StorageAttr::Numeric | StorageAttr::Date | StorageAttr::Time => {
            let n: i64 = raw
                .trim()
                .parse()
                .map_err(|_| Error::wire(format!("bad numeric literal {:?}", raw)))?;
            FieldValue::numeric(n)
        }
        StorageAttr::Boolean => FieldValue::Boolean(matches!(raw, "1" | "true" | "TRUE" | "Y")),
    })
}
