/// Recompute dependency table.
///
/// For each field that other values depend on, a `Recompute` lists the
/// dependents in evaluation order: fields whose init computation reads it
/// and links whose condition or ranges read it. It also records whether the
/// server must take part and which embedded sub-views show data derived
/// from it. Execution lives in `DataView::recompute`; this module only
/// holds the graph and the server-vs-client decision.

use crate::error::{Error, Result};
use crate::wire::{Tag, TagKind, TagSource};
use std::collections::HashMap;

/// One dependent of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeItem {
    /// Re-evaluate this field's init computation
    Field(usize),
    /// Re-resolve this link
    Link(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecomputeMode {
    /// Never involves the server
    #[default]
    Client,
    /// Goes to the server when links or sub-views require it
    ServerOnChange,
}

/// How a recompute is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPlan {
    Client,
    Server,
    /// Server only because of sub-views; try their cached dataviews first
    SubViewsFirst,
}

/// What a recompute ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeOutcome {
    /// No current record or no dependents
    Skipped,
    Client,
    Server,
    /// Sub-views were refreshed from their cached dataviews
    SubViewsFromCache,
    /// Internal failure, already logged
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recompute {
    owner: usize,
    items: Vec<RecomputeItem>,
    mode: RecomputeMode,
    /// Some dependent link can only be recomputed by the server
    server_link_recomputes: bool,
    /// Task ids of sub-views showing dependent data
    sub_views: Vec<String>,
}

impl Recompute {
    pub fn new(owner: usize, mode: RecomputeMode) -> Self {
        Recompute {
            owner,
            items: Vec::new(),
            mode,
            server_link_recomputes: false,
            sub_views: Vec::new(),
        }
    }

    pub fn with_item(mut self, item: RecomputeItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn with_server_links(mut self) -> Self {
        self.server_link_recomputes = true;
        self
    }

    pub fn with_sub_view(mut self, task_id: impl Into<String>) -> Self {
        self.sub_views.push(task_id.into());
        self
    }

    pub fn owner(&self) -> usize {
        self.owner
    }

    pub fn items(&self) -> &[RecomputeItem] {
        &self.items
    }

    pub fn mode(&self) -> RecomputeMode {
        self.mode
    }

    pub fn sub_views(&self) -> &[String] {
        &self.sub_views
    }

    pub fn has_server_link_recomputes(&self) -> bool {
        self.server_link_recomputes
    }

    /// The server is needed when the mode allows it and either a link must
    /// be recomputed there or a sub-view needs refreshing.
    pub fn plan(&self, sub_views_need_refresh: bool) -> ExecutionPlan {
        if self.mode == RecomputeMode::Client {
            return ExecutionPlan::Client;
        }
        match (self.server_link_recomputes, sub_views_need_refresh) {
            (true, _) => ExecutionPlan::Server,
            (false, true) => ExecutionPlan::SubViewsFirst,
            (false, false) => ExecutionPlan::Client,
        }
    }

    /// Parse `<recompute fld mode srv_links>` with `<dep fld|link/>` and
    /// `<subview task/>` children.
    fn parse<S: TagSource + ?Sized>(open: &Tag, source: &mut S) -> Result<Self> {
        let owner = open
            .attr_usize("fld")?
            .ok_or_else(|| Error::wire("<recompute> without fld"))?;
        let mode = match open.attr("mode") {
            Some("S") => RecomputeMode::ServerOnChange,
            _ => RecomputeMode::Client,
        };
        let mut rc = Recompute::new(owner, mode);
        rc.server_link_recomputes = open.attr_bool("srv_links")?.unwrap_or(false);
        if open.kind == TagKind::Empty {
            return Ok(rc);
        }
        while let Some(tag) = source.next_tag()? {
            if tag.is_close("recompute") {
                return Ok(rc);
            }
            match tag.name.as_str() {
                "dep" => {
                    if let Some(field) = tag.attr_usize("fld")? {
                        rc.items.push(RecomputeItem::Field(field));
                    } else if let Some(link) = tag.attr_i32("link")? {
                        rc.items.push(RecomputeItem::Link(link));
                    } else {
                        return Err(Error::wire("<dep> needs fld or link"));
                    }
                }
                "subview" => rc.sub_views.push(tag.require("task")?.to_string()),
                other => log::warn!("skipping unknown tag <{}> in <recompute>", other),
            }
        }
        Err(Error::wire("missing </recompute>"))
    }
}

/// Recompute entries by owner field
#[derive(Debug, Clone, Default)]
pub struct RecomputeTable {
    by_owner: HashMap<usize, Recompute>,
}

impl RecomputeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rc: Recompute) {
        self.by_owner.insert(rc.owner, rc);
    }

    pub fn get(&self, field: usize) -> Option<&Recompute> {
        self.by_owner.get(&field)
    }

    pub fn len(&self) -> usize {
        self.by_owner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_owner.is_empty()
    }

    /// Parse `<recompute>` entries up to `</recomputes>`.
    pub fn parse<S: TagSource + ?Sized>(source: &mut S) -> Result<Self> {
        let mut table = RecomputeTable::new();
        while let Some(tag) = source.next_tag()? {
            if tag.is_close("recomputes") {
                return Ok(table);
            }
            if tag.name == "recompute" {
                table.insert(Recompute::parse(&tag, source)?);
            } else {
                log::warn!("skipping unknown tag <{}> in <recomputes>", tag.name);
            }
        }
        Err(Error::wire("missing </recomputes>"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Tokenizer;

    #[test]
    fn test_plan() {
        let client = Recompute::new(0, RecomputeMode::Client).with_server_links();
        assert_eq!(client.plan(true), ExecutionPlan::Client);

        let rc = Recompute::new(0, RecomputeMode::ServerOnChange);
        assert_eq!(rc.plan(false), ExecutionPlan::Client);
        assert_eq!(rc.plan(true), ExecutionPlan::SubViewsFirst);

        let rc = rc.with_server_links();
        assert_eq!(rc.plan(false), ExecutionPlan::Server);
        assert_eq!(rc.plan(true), ExecutionPlan::Server);
    }

    #[test]
    fn test_parse_table() {
        let xml = r#"<recomputes>
            <recompute fld="0" mode="S" srv_links="1">
                <dep fld="2"/><dep link="1"/><subview task="lines"/>
            </recompute>
            <recompute fld="3"/>
        </recomputes>"#;
        let mut tok = Tokenizer::new(xml);
        tok.next_tag().unwrap();
        let table = RecomputeTable::parse(&mut tok).unwrap();

        assert_eq!(table.len(), 2);
        let rc = table.get(0).unwrap();
        assert_eq!(rc.items(), &[RecomputeItem::Field(2), RecomputeItem::Link(1)]);
        assert_eq!(rc.sub_views(), &["lines".to_string()]);
        assert!(rc.has_server_link_recomputes());
        assert_eq!(table.get(3).unwrap().mode(), RecomputeMode::Client);
    }
}
