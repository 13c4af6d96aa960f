//! Condition expressions for links.
//!
//! A link is only resolved when its condition holds for the current record.
//! Conditions compare fields of that record with literals or with each other:
//! - `code > 90`
//! - `kind == 'A' AND code != 0`
//! - `(qty >= 1) OR (free == TRUE)`
//! - `parent IS NOT NULL`
//! - `ship_code == bill_code`
//! - `TRUE`

use crate::error::Error;
use crate::field::FieldValue;
use crate::fields::FieldsTable;
use crate::record::Record;
use std::fmt;

/// A parsed condition AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Constant outcome
    Const(bool),
    /// Compare a field to a literal or to another field
    Compare {
        field: String,
        op: CompareOp,
        rhs: Operand,
    },
    IsNull { field: String },
    IsNotNull { field: String },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompareOp {
    Eq, // == or =
    Ne, // != or <>
    Lt,
    Le,
    Gt,
    Ge,
}

/// Right-hand side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Int(i64),
    Str(String),
    Bool(bool),
    Null,
    Field(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    Bool(bool),
    Null,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Is,
    LParen,
    RParen,
    Eof,
}

struct Lexer {
    input: Vec<char>,
    pos: usize,
}

impl Lexer {
    fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek();
        self.pos += 1;
        c
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn read_ident(&mut self) -> String {
        let mut ident = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                ident.push(c);
                self.advance();
            } else {
                break;
            }
        }
        ident
    }

    fn read_int(&mut self, negative: bool) -> Result<Token, String> {
        let mut digits = String::new();
        while let Some(c) = self.peek().filter(char::is_ascii_digit) {
            digits.push(c);
            self.advance();
        }
        let n: i64 = digits
            .parse()
            .map_err(|_| format!("Integer literal out of range: {}", digits))?;
        Ok(Token::Int(if negative { -n } else { n }))
    }

    fn read_string(&mut self, quote: char) -> Result<Token, String> {
        self.advance();
        let mut s = String::new();
        while let Some(c) = self.advance() {
            if c == quote {
                // doubled quote is an escaped quote
                if self.peek() == Some(quote) {
                    self.advance();
                    s.push(quote);
                    continue;
                }
                return Ok(Token::Str(s));
            }
            s.push(c);
        }
        Err("Unterminated string".to_string())
    }

    fn next_token(&mut self) -> Result<Token, String> {
        self.skip_whitespace();
        let Some(c) = self.peek() else {
            return Ok(Token::Eof);
        };
        let two = |lexer: &mut Lexer, tok: Token| -> Result<Token, String> {
            lexer.pos += 2;
            Ok(tok)
        };
        let one = |lexer: &mut Lexer, tok: Token| -> Result<Token, String> {
            lexer.pos += 1;
            Ok(tok)
        };
        match (c, self.peek_at(1)) {
            ('(', _) => one(self, Token::LParen),
            (')', _) => one(self, Token::RParen),
            ('=', Some('=')) => two(self, Token::Eq),
            ('=', _) => one(self, Token::Eq),
            ('!', Some('=')) => two(self, Token::Ne),
            ('!', _) => one(self, Token::Not),
            ('<', Some('>')) => two(self, Token::Ne),
            ('<', Some('=')) => two(self, Token::Le),
            ('<', _) => one(self, Token::Lt),
            ('>', Some('=')) => two(self, Token::Ge),
            ('>', _) => one(self, Token::Gt),
            ('\'' | '"', _) => self.read_string(c),
            ('-', Some(d)) if d.is_ascii_digit() => {
                self.advance();
                self.read_int(true)
            }
            (d, _) if d.is_ascii_digit() => self.read_int(false),
            (a, _) if a.is_alphabetic() || a == '_' => {
                let ident = self.read_ident();
                Ok(match ident.to_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IS" => Token::Is,
                    "NULL" => Token::Null,
                    "TRUE" => Token::Bool(true),
                    "FALSE" => Token::Bool(false),
                    _ => Token::Ident(ident),
                })
            }
            _ => Err(format!("Unexpected character: {}", c)),
        }
    }
}

struct Parser {
    lexer: Lexer,
    current: Token,
}

impl Parser {
    fn new(input: &str) -> Result<Self, String> {
        let mut lexer = Lexer::new(input);
        let current = lexer.next_token()?;
        Ok(Parser { lexer, current })
    }

    fn advance(&mut self) -> Result<(), String> {
        self.current = self.lexer.next_token()?;
        Ok(())
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        if &self.current == expected {
            self.advance()
        } else {
            Err(format!("Expected {:?}, got {:?}", expected, self.current))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.current == Token::Or {
            self.advance()?;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_not()?;
        while self.current == Token::And {
            self.advance()?;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.current == Token::Not {
            self.advance()?;
            Ok(Expr::Not(Box::new(self.parse_not()?)))
        } else {
            self.parse_primary()
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.current.clone() {
            Token::LParen => {
                self.advance()?;
                let expr = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Token::Bool(b) => {
                self.advance()?;
                Ok(Expr::Const(b))
            }
            Token::Int(n) => {
                // "1" / "0" as a whole condition
                self.advance()?;
                Ok(Expr::Const(n != 0))
            }
            Token::Ident(field) => {
                self.advance()?;
                self.parse_predicate(field)
            }
            other => Err(format!("Expected field name, got {:?}", other)),
        }
    }

    fn parse_predicate(&mut self, field: String) -> Result<Expr, String> {
        if self.current == Token::Is {
            self.advance()?;
            let negated = self.current == Token::Not;
            if negated {
                self.advance()?;
            }
            self.expect(&Token::Null)?;
            return Ok(if negated {
                Expr::IsNotNull { field }
            } else {
                Expr::IsNull { field }
            });
        }

        let op = match self.current {
            Token::Eq => CompareOp::Eq,
            Token::Ne => CompareOp::Ne,
            Token::Lt => CompareOp::Lt,
            Token::Le => CompareOp::Le,
            Token::Gt => CompareOp::Gt,
            Token::Ge => CompareOp::Ge,
            _ => return Err(format!("Expected comparison operator, got {:?}", self.current)),
        };
        self.advance()?;

        let rhs = match &self.current {
            Token::Int(n) => Operand::Int(*n),
            Token::Str(s) => Operand::Str(s.clone()),
            Token::Bool(b) => Operand::Bool(*b),
            Token::Null => Operand::Null,
            Token::Ident(name) => Operand::Field(name.clone()),
            _ => return Err(format!("Expected value, got {:?}", self.current)),
        };
        self.advance()?;
        Ok(Expr::Compare { field, op, rhs })
    }
}

/// Parse a condition string into an Expr AST.
pub fn parse_expr(input: &str) -> Result<Expr, String> {
    let mut parser = Parser::new(input)?;
    let expr = parser.parse_or()?;
    if parser.current != Token::Eof {
        return Err(format!("Unexpected token after expression: {:?}", parser.current));
    }
    Ok(expr)
}

/// Evaluate using a field lookup. Unknown fields read as NULL.
pub fn eval_expr<F>(expr: &Expr, get_field: &F) -> bool
where
    F: Fn(&str) -> Option<FieldValue>,
{
    let is_null = |name: &str| get_field(name).map_or(true, |v| v.is_null());
    match expr {
        Expr::Const(b) => *b,
        Expr::Compare { field, op, rhs } => {
            let Some(lhs) = get_field(field) else {
                return false;
            };
            match rhs {
                Operand::Field(other) => match get_field(other) {
                    Some(rv) => compare_fields(&lhs, *op, &rv),
                    None => false,
                },
                lit => compare_literal(&lhs, *op, lit),
            }
        }
        Expr::IsNull { field } => is_null(field),
        Expr::IsNotNull { field } => !is_null(field),
        Expr::And(l, r) => eval_expr(l, get_field) && eval_expr(r, get_field),
        Expr::Or(l, r) => eval_expr(l, get_field) || eval_expr(r, get_field),
        Expr::Not(inner) => !eval_expr(inner, get_field),
    }
}

/// Evaluate against a record of the given schema
pub fn eval_on_record(expr: &Expr, record: &Record, fields: &FieldsTable) -> bool {
    eval_expr(expr, &|name: &str| {
        fields
            .index_of(name)
            .and_then(|idx| record.values().get(idx).cloned())
    })
}

// Comparisons involving NULL are unknown, i.e. false.
fn compare_literal(lhs: &FieldValue, op: CompareOp, lit: &Operand) -> bool {
    match (lhs, lit) {
        (FieldValue::Null, _) | (_, Operand::Null) => false,
        (FieldValue::Numeric(_), Operand::Int(b)) => match lhs.as_i64() {
            Some(a) => compare_ord(a, *b, op),
            None => false,
        },
        (FieldValue::Alpha(a) | FieldValue::Unicode(a), Operand::Str(b)) => {
            // fixed-size alpha values carry trailing blanks
            compare_ord(a.trim_end(), b.trim_end(), op)
        }
        (FieldValue::Boolean(a), Operand::Bool(b)) => match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            _ => false,
        },
        (FieldValue::Boolean(a), Operand::Int(b)) => match op {
            CompareOp::Eq => *a == (*b != 0),
            CompareOp::Ne => *a != (*b != 0),
            _ => false,
        },
        _ => false,
    }
}

fn compare_fields(lhs: &FieldValue, op: CompareOp, rhs: &FieldValue) -> bool {
    if lhs.is_null() || rhs.is_null() {
        return false;
    }
    let ord = lhs.key_cmp(rhs);
    compare_ord(ord, std::cmp::Ordering::Equal, op)
}

fn compare_ord<T: PartialOrd>(a: T, b: T, op: CompareOp) -> bool {
    match op {
        CompareOp::Eq => a == b,
        CompareOp::Ne => a != b,
        CompareOp::Lt => a < b,
        CompareOp::Le => a <= b,
        CompareOp::Gt => a > b,
        CompareOp::Ge => a >= b,
    }
}

/// Every field name the expression reads, sorted and deduplicated.
pub fn extract_fields(expr: &Expr) -> Vec<String> {
    fn walk(expr: &Expr, out: &mut Vec<String>) {
        match expr {
            Expr::Const(_) => {}
            Expr::Compare { field, rhs, .. } => {
                out.push(field.clone());
                if let Operand::Field(other) = rhs {
                    out.push(other.clone());
                }
            }
            Expr::IsNull { field } | Expr::IsNotNull { field } => out.push(field.clone()),
            Expr::And(l, r) | Expr::Or(l, r) => {
                walk(l, out);
                walk(r, out);
            }
            Expr::Not(inner) => walk(inner, out),
        }
    }
    let mut fields = Vec::new();
    walk(expr, &mut fields);
    fields.sort();
    fields.dedup();
    fields
}

/// A link condition with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// An empty string is the always-true condition.
    pub fn parse(source: &str) -> crate::error::Result<Self> {
        let expr = if source.trim().is_empty() {
            Expr::Const(true)
        } else {
            parse_expr(source).map_err(|e| Error::Expression(format!("{}: {}", source, e)))?
        };
        Ok(Condition {
            source: source.to_string(),
            expr,
        })
    }

    pub fn always() -> Self {
        Condition {
            source: String::new(),
            expr: Expr::Const(true),
        }
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Fails when the condition names a field the schema does not have.
    pub fn validate(&self, fields: &FieldsTable) -> crate::error::Result<()> {
        match extract_fields(&self.expr)
            .into_iter()
            .find(|name| fields.index_of(name).is_none())
        {
            Some(missing) => Err(Error::Expression(format!(
                "{}: unknown field '{}'",
                self.source, missing
            ))),
            None => Ok(()),
        }
    }

    pub fn eval(&self, record: &Record, fields: &FieldsTable) -> bool {
        eval_on_record(&self.expr, record, fields)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::StorageAttr;
    use crate::fields::FieldDef;

    fn record() -> (Record, FieldsTable) {
        let fields = FieldsTable::new(vec![
            FieldDef::new("id", StorageAttr::Numeric, 8),
            FieldDef::new("name", StorageAttr::Alpha, 10),
            FieldDef::new("active", StorageAttr::Boolean, 1),
            FieldDef::new("parent", StorageAttr::Numeric, 8).nullable(),
            FieldDef::new("other", StorageAttr::Numeric, 8),
        ]);
        let mut rec = Record::new(1, &fields);
        rec.set_field_value(0, FieldValue::numeric(1), false, &fields).unwrap();
        rec.set_field_value(1, FieldValue::alpha("Alice  "), false, &fields).unwrap();
        rec.set_field_value(2, FieldValue::Boolean(true), false, &fields).unwrap();
        rec.set_field_value(3, FieldValue::Null, false, &fields).unwrap();
        rec.set_field_value(4, FieldValue::numeric(1), false, &fields).unwrap();
        (rec, fields)
    }

    fn holds(src: &str) -> bool {
        let (rec, fields) = record();
        Condition::parse(src).unwrap().eval(&rec, &fields)
    }

    #[test]
    fn test_simple_comparison() {
        assert!(holds("id == 1"));
        assert!(holds("id = 1"));
        assert!(!holds("id > 1"));
        assert!(holds("name == 'Alice'"));
        assert!(holds("name <> 'Bob'"));
    }

    #[test]
    fn test_and_or_not() {
        assert!(holds("id >= 1 AND active == TRUE"));
        assert!(!holds("id > 5 AND active == TRUE"));
        assert!(holds("id > 5 OR active = 1"));
        assert!(holds("NOT id > 5"));
        assert!(holds("(id < 0 OR id == 1) AND NOT (name == 'Bob')"));
    }

    #[test]
    fn test_null_handling() {
        assert!(holds("parent IS NULL"));
        assert!(!holds("parent IS NOT NULL"));
        assert!(!holds("parent == 0"));
        assert!(holds("missing IS NULL"));
    }

    #[test]
    fn test_field_to_field() {
        assert!(holds("id == other"));
        assert!(!holds("id != other"));
        assert!(!holds("id == parent"));
    }

    #[test]
    fn test_constant_conditions() {
        assert!(holds(""));
        assert!(holds("TRUE"));
        assert!(!holds("0"));
        assert_eq!(Condition::always().expr(), &Expr::Const(true));
    }

    #[test]
    fn test_errors() {
        assert!(parse_expr("id >").is_err());
        assert!(parse_expr("id == 'open").is_err());
        assert!(parse_expr("id == 1 )").is_err());
        assert!(matches!(Condition::parse("id ~ 2"), Err(Error::Expression(_))));

        let (_, fields) = record();
        assert!(Condition::parse("nope == 1").unwrap().validate(&fields).is_err());
        assert!(Condition::parse("id == other").unwrap().validate(&fields).is_ok());
    }

    #[test]
    fn test_extract_fields() {
        let expr = parse_expr("b == 1 AND (a IS NULL OR b == c)").unwrap();
        assert_eq!(extract_fields(&expr), vec!["a", "b", "c"]);
    }
}
