//! Reference resolution for archive transform expressions.
//!
//! Transforms are postfix expressions evaluated by the archive tool itself.
//! This module only rewrites the series references inside them:
//!
//! - `%name%`: the series defined by the archive type being compiled
//! - `%name_i%`: the i-th series of the same export, zero-indexed
//!
//! Every raw series is defined before any derived one, so an index is
//! valid exactly when it is within the export's archive type list.

use crate::error::{ReportingError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Text(String),
    Current,
    Series(usize),
}

/// A parsed transform expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    source: String,
    tokens: Vec<Token>,
}

impl Expression {
    pub fn parse(source: &str) -> Self {
        let mut tokens = Vec::new();
        let mut text = String::new();
        let mut rest = source;

        while let Some(pos) = rest.find('%') {
            text.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            match parse_reference(tail) {
                Some((token, consumed)) => {
                    if !text.is_empty() {
                        tokens.push(Token::Text(std::mem::take(&mut text)));
                    }
                    tokens.push(token);
                    rest = &tail[consumed..];
                }
                None => {
                    text.push('%');
                    rest = &tail[1..];
                }
            }
        }
        text.push_str(rest);
        if !text.is_empty() {
            tokens.push(Token::Text(text));
        }

        Self {
            source: source.to_string(),
            tokens,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Distinct indices addressed with `%name_i%`, in order of first appearance.
    pub fn references(&self) -> Vec<usize> {
        let mut indices = Vec::new();
        for token in &self.tokens {
            if let Token::Series(i) = token {
                if !indices.contains(i) {
                    indices.push(*i);
                }
            }
        }
        indices
    }
}

/// Parses a reference at the start of `s` (which begins with `%`).
fn parse_reference(s: &str) -> Option<(Token, usize)> {
    let body = s.strip_prefix("%name")?;
    if body.starts_with('%') {
        return Some((Token::Current, "%name%".len()));
    }
    let digits_and_rest = body.strip_prefix('_')?;
    let end = digits_and_rest.find('%')?;
    let digits = &digits_and_rest[..end];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index = digits.parse().ok()?;
    Some((Token::Series(index), "%name_".len() + end + 1))
}

/// One series of an export, in definition order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesDef {
    /// Raw series name, `<archive>_<field>`.
    pub name: String,
    /// Whether the archive type carries a transform.
    pub derived: bool,
}

impl SeriesDef {
    /// Name the series is exported under: the derived `c<name>` when
    /// transformed, the raw name otherwise.
    pub fn exported_name(&self) -> String {
        if self.derived {
            format!("c{}", self.name)
        } else {
            self.name.clone()
        }
    }
}

/// Resolves references against the series defined for one export.
pub struct ExpressionEngine<'a> {
    defs: &'a [SeriesDef],
}

impl<'a> ExpressionEngine<'a> {
    pub fn new(defs: &'a [SeriesDef]) -> Self {
        Self { defs }
    }

    /// Resolves a per-archive-type transform; references map to raw names.
    pub fn resolve_transform(&self, expr: &Expression, current: usize) -> Result<String> {
        self.render(expr, Some(current), |def| def.name.clone())
    }

    /// Resolves an extra series line; references map to exported names.
    /// `%name%` has no meaning outside a per-type transform.
    pub fn resolve_extra(&self, expr: &Expression) -> Result<String> {
        self.render(expr, None, SeriesDef::exported_name)
    }

    fn render(
        &self,
        expr: &Expression,
        current: Option<usize>,
        name_of: impl Fn(&SeriesDef) -> String,
    ) -> Result<String> {
        let mut out = String::with_capacity(expr.source.len());
        for token in &expr.tokens {
            match token {
                Token::Text(text) => out.push_str(text),
                Token::Current => {
                    let def = current.and_then(|i| self.defs.get(i)).ok_or_else(|| {
                        ReportingError::UndefinedReference {
                            reference: "%name%".to_string(),
                            expression: expr.source.clone(),
                        }
                    })?;
                    out.push_str(&def.name);
                }
                Token::Series(i) => {
                    let def =
                        self.defs
                            .get(*i)
                            .ok_or_else(|| ReportingError::UndefinedReference {
                                reference: format!("%name_{}%", i),
                                expression: expr.source.clone(),
                            })?;
                    out.push_str(&name_of(def));
                }
            }
        }
        Ok(out)
    }
}

// ============================================================
// Builders for null-coalescing expressions
// ============================================================

/// `ref,UN,0,ref,IF`: unknown values count as zero.
pub fn coalesce(reference: &str) -> String {
    format!("{reference},UN,0,{reference},IF")
}

/// Series `index` stacked on top of every earlier series, unknowns as zero.
pub fn stacked(index: usize) -> String {
    let mut expr = coalesce("%name%");
    for i in 0..index {
        expr.push(',');
        expr.push_str(&coalesce(&format!("%name_{i}%")));
        expr.push_str(",+");
    }
    expr
}

/// Stacked series `index` as a percentage of the sum of all `count` series.
pub fn stacked_percent(index: usize, count: usize) -> String {
    let mut total = coalesce("%name_0%");
    for i in 1..count {
        total.push(',');
        total.push_str(&coalesce(&format!("%name_{i}%")));
        total.push_str(",+");
    }
    format!("{},{},/,100,*", stacked(index), total)
}
