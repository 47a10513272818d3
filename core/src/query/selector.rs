//! Selector language parser.
//!
//! Selectors look like `room > light[on=1], switch[name="hall"]`. The parser
//! is a small recursive descent over the input producing an explicit AST:
//! a [`Selector`] is a list of alternative [`Chain`]s, each chain a list of
//! [`SimpleSelector`]s joined by the direct-child combinator `>`.
//!
//! ```text
//! selector := chain ( "," chain )*
//! chain    := simple ( ">" simple )*
//! simple   := ( "*" | KIND ) filter*  |  filter+
//! filter   := "[" ATTR ( "=" value )? "]"
//! value    := BARE | '"' chars '"' | "'" chars "'"
//! ```
//!
//! There is deliberately no descendant combinator.

use std::fmt;

use crate::error::TreeError;
use crate::namespace::{TreePath, NAME_ATTRIBUTE, ROOT_KIND};


// ---------------------------------------------------------------------------
// Facet: what a selector can see of a node
// ---------------------------------------------------------------------------

/// The parts of a node a selector tests: name, kind and attributes.
///
/// Implemented by live arena entries and by detached summaries so the same
/// matching code serves queries and subscription re-evaluation.
pub trait Facet {
    fn name(&self) -> Option<&str>;
    fn kind(&self) -> &str;
    fn attribute(&self, key: &str) -> Option<&str>;
}

impl<T: Facet + ?Sized> Facet for &T {
    fn name(&self) -> Option<&str> {
        (**self).name()
    }

    fn kind(&self) -> &str {
        (**self).kind()
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        (**self).attribute(key)
    }
}


// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Kind test of a simple selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindMatch {
    /// `*`, or a filter-only selector.
    Any,
    Kind(String),
}

/// `[attr]` (presence) or `[attr=value]` (equality).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrFilter {
    pub name: String,
    pub value: Option<String>,
}

impl AttrFilter {
    fn matches<F: Facet>(&self, node: &F) -> bool {
        let actual = if self.name == NAME_ATTRIBUTE {
            node.name()
        } else {
            node.attribute(&self.name)
        };
        match (&self.value, actual) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(expected), Some(actual)) => expected == actual,
        }
    }
}

/// A kind test plus ANDed attribute filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleSelector {
    pub kind: KindMatch,
    pub filters: Vec<AttrFilter>,
}

impl SimpleSelector {
    pub fn matches<F: Facet>(&self, node: &F) -> bool {
        let kind_ok = match &self.kind {
            KindMatch::Any => true,
            KindMatch::Kind(k) => k == node.kind(),
        };
        kind_ok && self.filters.iter().all(|f| f.matches(node))
    }
}

/// Simple selectors joined by `>`, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub steps: Vec<SimpleSelector>,
}

impl Chain {
    /// Test a lineage (root first, candidate last).
    ///
    /// The candidate must match the last step, its parent the one before,
    /// and so on; the chain may start at any depth.
    pub fn matches_lineage<F: Facet>(&self, lineage: &[F]) -> bool {
        if self.steps.is_empty() || self.steps.len() > lineage.len() {
            return false;
        }
        self.steps
            .iter()
            .rev()
            .zip(lineage.iter().rev())
            .all(|(step, node)| step.matches(node))
    }
}

/// A parsed selector: alternatives ORed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub chains: Vec<Chain>,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self, TreeError> {
        Parser::new(input).selector()
    }

    /// True if any alternative matches the lineage.
    pub fn matches_lineage<F: Facet>(&self, lineage: &[F]) -> bool {
        self.chains.iter().any(|c| c.matches_lineage(lineage))
    }
}


// ---------------------------------------------------------------------------
// Display: canonical text form
// ---------------------------------------------------------------------------

impl fmt::Display for AttrFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            None => write!(f, "[{}]", self.name),
            Some(v) => write!(f, "[{}=\"{}\"]", self.name, escape(v)),
        }
    }
}

impl fmt::Display for SimpleSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            KindMatch::Any if !self.filters.is_empty() => {}
            KindMatch::Any => f.write_str("*")?,
            KindMatch::Kind(k) => f.write_str(k)?,
        }
        for filter in &self.filters {
            write!(f, "{}", filter)?;
        }
        Ok(())
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(" > ")?;
            }
            write!(f, "{}", step)?;
        }
        Ok(())
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chain) in self.chains.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", chain)?;
        }
        Ok(())
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}


/// Derive the selector addressing exactly the node at `path`.
///
/// Every component becomes a `[name="..."]` filter; the chain is anchored
/// at the root kind so it cannot match deeper copies of the same names.
pub fn path_to_query(path: &str) -> Result<String, TreeError> {
    let path = TreePath::parse(path)?;
    let mut out = ROOT_KIND.to_string();
    for component in path.components() {
        out.push_str(&format!(" > [{}=\"{}\"]", NAME_ATTRIBUTE, escape(component)));
    }
    Ok(out)
}


// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Parser { src, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn error(&self, reason: impl Into<String>) -> TreeError {
        TreeError::selector(self.src, format!("{} at offset {}", reason.into(), self.pos))
    }

    fn expect(&mut self, want: char) -> Result<(), TreeError> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(self.error(format!("expected '{}', found '{}'", want, c))),
            None => Err(self.error(format!("expected '{}', found end of input", want))),
        }
    }

    fn selector(&mut self) -> Result<Selector, TreeError> {
        let mut chains = vec![self.chain()?];
        loop {
            self.skip_ws();
            match self.peek() {
                None => break,
                Some(',') => {
                    self.bump();
                    chains.push(self.chain()?);
                }
                Some(c) if is_ident_char(c) || c == '*' || c == '[' => {
                    return Err(self.error("descendant combinator is not supported; use '>'"));
                }
                Some(c) => return Err(self.error(format!("unexpected '{}'", c))),
            }
        }
        Ok(Selector { chains })
    }

    fn chain(&mut self) -> Result<Chain, TreeError> {
        let mut steps = vec![self.simple()?];
        loop {
            self.skip_ws();
            if self.peek() == Some('>') {
                self.bump();
                steps.push(self.simple()?);
            } else {
                break;
            }
        }
        Ok(Chain { steps })
    }

    fn simple(&mut self) -> Result<SimpleSelector, TreeError> {
        self.skip_ws();
        let kind = match self.peek() {
            Some('*') => {
                self.bump();
                KindMatch::Any
            }
            Some('[') => KindMatch::Any,
            Some(c) if is_ident_char(c) => KindMatch::Kind(self.ident()),
            Some(c) => return Err(self.error(format!("unexpected '{}'", c))),
            None => return Err(self.error("expected a selector")),
        };
        let mut filters = Vec::new();
        while self.peek() == Some('[') {
            filters.push(self.filter()?);
        }
        Ok(SimpleSelector { kind, filters })
    }

    fn filter(&mut self) -> Result<AttrFilter, TreeError> {
        self.expect('[')?;
        self.skip_ws();
        let name = self.ident();
        if name.is_empty() {
            return Err(self.error("expected attribute name"));
        }
        self.skip_ws();
        let value = if self.peek() == Some('=') {
            self.bump();
            self.skip_ws();
            Some(self.value()?)
        } else {
            None
        };
        self.skip_ws();
        self.expect(']')?;
        Ok(AttrFilter { name, value })
    }

    fn value(&mut self) -> Result<String, TreeError> {
        match self.peek() {
            Some(q @ ('"' | '\'')) => {
                self.bump();
                let mut out = String::new();
                loop {
                    match self.bump() {
                        None => return Err(self.error("unterminated string")),
                        Some('\\') => match self.bump() {
                            Some(c) => out.push(c),
                            None => return Err(self.error("unterminated escape")),
                        },
                        Some(c) if c == q => break,
                        Some(c) => out.push(c),
                    }
                }
                Ok(out)
            }
            _ => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c != ']' && !c.is_whitespace()) {
                    self.bump();
                }
                if start == self.pos {
                    return Err(self.error("expected attribute value"));
                }
                Ok(self.src[start..self.pos].to_string())
            }
        }
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_char(c)) {
            self.bump();
        }
        self.src[start..self.pos].to_string()
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
