//! Parameterized SQL fragments.
//!
//! A [`Sql`] value is a sequence of raw text, bound parameters and named
//! variables. Variables stand for values supplied at query time (the subkey of
//! a role-scoped column) and must be bound before the fragment is rendered.

use std::collections::HashMap;
use std::fmt;

use crate::naming::quote_literal;

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Param(Option<String>),
    Var(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sql {
    parts: Vec<Part>,
}

/// Variable bound to the subkey of a parameterized column (`column@key`).
pub const SUBKEY_VAR: &str = "__key";

impl Sql {
    pub fn new() -> Self {
        Sql::default()
    }

    pub fn raw(text: impl Into<String>) -> Self {
        Sql {
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn param(value: impl Into<String>) -> Self {
        Sql {
            parts: vec![Part::Param(Some(value.into()))],
        }
    }

    pub fn opt_param(value: Option<String>) -> Self {
        Sql {
            parts: vec![Part::Param(value)],
        }
    }

    pub fn null() -> Self {
        Sql::raw("NULL")
    }

    pub fn var(name: impl Into<String>) -> Self {
        Sql {
            parts: vec![Part::Var(name.into())],
        }
    }

    /// Substitute each `?` in `template` with the next fragment of `args`.
    pub fn format(template: &str, args: impl IntoIterator<Item = Sql>) -> Self {
        let mut args = args.into_iter();
        let mut out = Sql::new();
        let mut pieces = template.split('?').peekable();
        while let Some(piece) = pieces.next() {
            out.push_text(piece);
            if pieces.peek().is_some() {
                match args.next() {
                    Some(arg) => out.append(arg),
                    None => debug_assert!(false, "missing argument for {template}"),
                }
            }
        }
        debug_assert!(args.next().is_none(), "too many arguments for {template}");
        out
    }

    /// Join fragments with a separator.
    pub fn join(items: impl IntoIterator<Item = Sql>, separator: &str) -> Self {
        let mut out = Sql::new();
        for (index, item) in items.into_iter().enumerate() {
            if index > 0 {
                out.push_text(separator);
            }
            out.append(item);
        }
        out
    }

    pub fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Part::Text(last)) = self.parts.last_mut() {
            last.push_str(text);
        } else {
            self.parts.push(Part::Text(text.to_string()));
        }
    }

    pub fn append(&mut self, other: Sql) {
        for part in other.parts {
            match part {
                Part::Text(text) => self.push_text(&text),
                part => self.parts.push(part),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Names of the variables still unbound in this fragment.
    pub fn variables(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Var(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Replace variables with fragments from `env`. Returns the name of the
    /// first variable without a binding.
    pub fn bind(&self, env: &HashMap<String, Sql>) -> Result<Sql, String> {
        let mut out = Sql::new();
        for part in &self.parts {
            match part {
                Part::Var(name) => match env.get(name) {
                    Some(value) => out.append(value.clone()),
                    None => return Err(name.clone()),
                },
                Part::Text(text) => out.push_text(text),
                other => out.parts.push(other.clone()),
            }
        }
        Ok(out)
    }

    /// Render with `$n` placeholders and the matching parameter list.
    pub fn to_numbered(&self) -> (String, Vec<Option<String>>) {
        let mut text = String::new();
        let mut params = Vec::new();
        for part in &self.parts {
            match part {
                Part::Text(t) => text.push_str(t),
                Part::Param(value) => {
                    params.push(value.clone());
                    text.push_str(&format!("${}", params.len()));
                }
                Part::Var(name) => text.push_str(&format!(":{name}")),
            }
        }
        (text, params)
    }

    /// Render with parameters inlined as untyped string literals. Postgres
    /// infers the literal type from context, matching unknown-typed
    /// parameter semantics.
    pub fn to_inline(&self) -> String {
        let mut text = String::new();
        for part in &self.parts {
            match part {
                Part::Text(t) => text.push_str(t),
                Part::Param(Some(value)) => text.push_str(&quote_literal(value)),
                Part::Param(None) => text.push_str("NULL"),
                Part::Var(name) => text.push_str(&format!(":{name}")),
            }
        }
        text
    }

    pub fn params(&self) -> Vec<Option<String>> {
        self.to_numbered().1
    }
}

impl fmt::Display for Sql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_inline())
    }
}

impl From<&str> for Sql {
    fn from(text: &str) -> Self {
        Sql::raw(text)
    }
}

/// Project attribute `field` out of a composite-valued expression.
/// A bare alias is accessed directly, anything else is parenthesized.
pub fn field_access(base: &Sql, column: &str) -> Sql {
    let quoted = format!(".{}", crate::naming::quote_ident(column));
    let is_alias = matches!(
        base.parts(),
        [Part::Text(text)] if text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    );
    if is_alias {
        let mut out = base.clone();
        out.push_text(&quoted);
        out
    } else {
        let mut out = Sql::raw("(");
        out.append(base.clone());
        out.push_text(")");
        out.push_text(&quoted);
        out
    }
}

/// Normalize a statement for logs using the PostgreSQL dialect, falling back
/// to the raw text when it does not parse.
pub fn pretty(text: &str) -> String {
    use sqlparser::dialect::PostgreSqlDialect;
    use sqlparser::parser::Parser;

    match Parser::parse_sql(&PostgreSqlDialect {}, text) {
        Ok(statements) => statements
            .iter()
            .map(|statement| statement.to_string())
            .collect::<Vec<_>>()
            .join(";\n"),
        Err(_) => text.to_string(),
    }
}
