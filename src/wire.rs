//! Tag grammar tokenizer and writer.
//!
//! The server speaks an XML-like, attribute-delimited grammar:
//!
//! - `<dataview taskid="7" include_first="1">` ... `</dataview>`
//! - `<rec id="3" value="0003414243" flags="00"/>`
//!
//! Text between tags carries no meaning and is skipped. Parsers in this crate
//! consume tags through the `TagSource` trait so a host can inject its own
//! tokenizer; `Tokenizer` is the default one over a string slice.

use crate::error::{Error, Result};
use std::fmt::Write as _;

/// Open / close / self-closing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Open,
    Close,
    Empty,
}

/// One tag with its (unescaped) attributes in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub name: String,
    pub kind: TagKind,
    pub attrs: Vec<(String, String)>,
}

impl Tag {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, name: &str) -> Result<&str> {
        self.attr(name)
            .ok_or_else(|| Error::wire(format!("<{}> is missing attribute '{}'", self.name, name)))
    }

    pub fn attr_i32(&self, name: &str) -> Result<Option<i32>> {
        self.parse_attr(name)
    }

    pub fn attr_usize(&self, name: &str) -> Result<Option<usize>> {
        self.parse_attr(name)
    }

    /// "1" / "0"; any other non-empty value is an error
    pub fn attr_bool(&self, name: &str) -> Result<Option<bool>> {
        match self.attr(name) {
            None => Ok(None),
            Some("1") | Some("Y") | Some("true") => Ok(Some(true)),
            Some("0") | Some("N") | Some("false") => Ok(Some(false)),
            Some(other) => Err(Error::wire(format!(
                "<{}> attribute '{}' is not a boolean: {:?}",
                self.name, name, other
            ))),
        }
    }

    fn parse_attr<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>> {
        match self.attr(name) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                Error::wire(format!(
                    "<{}> attribute '{}' has bad value {:?}",
                    self.name, name, raw
                ))
            }),
        }
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.name == name && self.kind == TagKind::Open
    }

    pub fn is_close(&self, name: &str) -> bool {
        self.name == name && self.kind == TagKind::Close
    }
}

/// Anything that yields tags in document order.
pub trait TagSource {
    /// Returns `Ok(None)` at end of input
    fn next_tag(&mut self) -> Result<Option<Tag>>;
}

/// Default tokenizer over an in-memory document.
pub struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Tokenizer { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_name(&mut self) -> String {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' || c == ':' || c == '.' {
                name.push(c);
                self.advance();
            } else {
                break;
            }
        }
        name
    }

    fn read_quoted(&mut self) -> Result<String> {
        let quote = match self.advance() {
            Some(q @ ('"' | '\'')) => q,
            other => return Err(Error::wire(format!("expected quoted value, got {:?}", other))),
        };
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == quote {
                let raw = &self.input[start..self.pos];
                self.advance();
                return Ok(unescape(raw));
            }
            self.advance();
        }
        Err(Error::wire("unterminated attribute value"))
    }

    fn read_tag(&mut self) -> Result<Tag> {
        // '<' already consumed
        let kind = if self.peek() == Some('/') {
            self.advance();
            TagKind::Close
        } else {
            TagKind::Open
        };

        let name = self.read_name();
        if name.is_empty() {
            return Err(Error::wire(format!("tag without a name at byte {}", self.pos)));
        }

        let mut attrs = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(Error::wire(format!("unterminated <{}>", name))),
                Some('>') => {
                    self.advance();
                    return Ok(Tag { name, kind, attrs });
                }
                Some('/') => {
                    // Accept "/>" and the legacy "//>"
                    while self.peek() == Some('/') {
                        self.advance();
                    }
                    if self.advance() != Some('>') {
                        return Err(Error::wire(format!("malformed end of <{}>", name)));
                    }
                    return Ok(Tag { name, kind: TagKind::Empty, attrs });
                }
                Some(_) => {
                    let key = self.read_name();
                    if key.is_empty() {
                        return Err(Error::wire(format!("bad attribute in <{}>", name)));
                    }
                    self.skip_whitespace();
                    if self.advance() != Some('=') {
                        return Err(Error::wire(format!("attribute '{}' without value", key)));
                    }
                    self.skip_whitespace();
                    let value = self.read_quoted()?;
                    attrs.push((key, value));
                }
            }
        }
    }
}

impl TagSource for Tokenizer<'_> {
    fn next_tag(&mut self) -> Result<Option<Tag>> {
        loop {
            match self.advance() {
                None => return Ok(None),
                Some('<') => {
                    // Skip declarations and comments
                    if matches!(self.peek(), Some('?') | Some('!')) {
                        while let Some(c) = self.advance() {
                            if c == '>' {
                                break;
                            }
                        }
                        continue;
                    }
                    return self.read_tag().map(Some);
                }
                Some(_) => continue,
            }
        }
    }
}

/// Consume tags up to and including the close tag of `name`.
pub fn skip_element<S: TagSource + ?Sized>(source: &mut S, name: &str) -> Result<()> {
    let mut depth = 1usize;
    while let Some(tag) = source.next_tag()? {
        if tag.name == name {
            match tag.kind {
                TagKind::Open => depth += 1,
                TagKind::Close => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                TagKind::Empty => {}
            }
        }
    }
    Err(Error::wire(format!("missing </{}>", name)))
}

fn unescape(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    raw.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn escape_into(out: &mut String, raw: &str) {
    for c in raw.chars() {
        match c {
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            _ => out.push(c),
        }
    }
}

/// Builder for outbound tag text.
#[derive(Debug, Default)]
pub struct TagWriter {
    out: String,
    open: Vec<String>,
    in_start: bool,
}

impl TagWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn close_start(&mut self) {
        if self.in_start {
            self.out.push('>');
            self.in_start = false;
        }
    }

    /// Begin `<name`; attributes follow until the next element call
    pub fn start(&mut self, name: &str) -> &mut Self {
        self.close_start();
        self.out.push('<');
        self.out.push_str(name);
        self.open.push(name.to_string());
        self.in_start = true;
        self
    }

    pub fn attr(&mut self, key: &str, value: impl std::fmt::Display) -> &mut Self {
        debug_assert!(self.in_start, "attribute written outside a start tag");
        let mut rendered = String::new();
        let _ = write!(rendered, "{}", value);
        self.out.push(' ');
        self.out.push_str(key);
        self.out.push_str("=\"");
        escape_into(&mut self.out, &rendered);
        self.out.push('"');
        self
    }

    pub fn attr_opt(&mut self, key: &str, value: Option<impl std::fmt::Display>) -> &mut Self {
        if let Some(v) = value {
            self.attr(key, v);
        }
        self
    }

    /// Close the innermost element, self-closing it when it has no children
    pub fn end(&mut self) -> &mut Self {
        let Some(name) = self.open.pop() else {
            return self;
        };
        if self.in_start {
            self.out.push_str("/>");
            self.in_start = false;
        } else {
            self.out.push_str("</");
            self.out.push_str(&name);
            self.out.push('>');
        }
        self
    }

    pub fn finish(mut self) -> String {
        while !self.open.is_empty() {
            self.end();
        }
        self.out
    }
}
