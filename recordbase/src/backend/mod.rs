//! Relational backend seam.
//!
//! Everything above this module talks to Postgres through [`Backend`]: a
//! statement goes in as a [`Sql`] fragment, rows come back as positional
//! [`Cell`]s.

use chrono::{DateTime, NaiveDate, Utc};
use postgres::{Client, GenericClient, NoTls, SimpleQueryMessage};
use std::collections::VecDeque;

use crate::error::{RecordbaseError, Result};
use crate::naming::quote_ident;
use crate::sql::{pretty, Sql};

/// One value of a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Text(String),
    Bool(bool),
    Int(i64),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Int(i) => Some(*i),
            Cell::Text(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Cell::Bool(b) => Some(*b),
            Cell::Text(text) => Some(text == "t" || text == "true"),
            _ => None,
        }
    }
}

pub type Row = Vec<Cell>;

pub trait Backend {
    /// Run a statement, returning the affected row count.
    fn execute(&mut self, sql: &Sql) -> Result<u64>;

    /// Run a query, returning its rows.
    fn query(&mut self, sql: &Sql) -> Result<Vec<Row>>;
}

impl<B: Backend + ?Sized> Backend for &mut B {
    fn execute(&mut self, sql: &Sql) -> Result<u64> {
        (**self).execute(sql)
    }

    fn query(&mut self, sql: &Sql) -> Result<Vec<Row>> {
        (**self).query(sql)
    }
}

// ── Postgres ────────────────────────────────────────────────────────

/// Backend over any postgres client or transaction. Statements go through
/// the simple-query protocol with parameters inlined as untyped literals,
/// so every cell arrives as text.
pub struct PgBackend<C> {
    client: C,
    log_queries: bool,
}

impl<C: GenericClient> PgBackend<C> {
    pub fn new(client: C) -> Self {
        PgBackend {
            client,
            log_queries: false,
        }
    }

    pub fn log_queries(mut self, enabled: bool) -> Self {
        self.log_queries = enabled;
        self
    }

    pub fn into_inner(self) -> C {
        self.client
    }

    fn run(&mut self, sql: &Sql) -> Result<Vec<SimpleQueryMessage>> {
        let text = sql.to_inline();
        let started = std::time::Instant::now();
        match self.client.simple_query(&text) {
            Ok(messages) => {
                if self.log_queries {
                    log::debug!("{:?} {}", started.elapsed(), pretty(&text));
                }
                Ok(messages)
            }
            Err(e) => {
                log::error!("statement failed: {e}\n{}", pretty(&text));
                Err(e.into())
            }
        }
    }
}

impl<C: GenericClient> Backend for PgBackend<C> {
    fn execute(&mut self, sql: &Sql) -> Result<u64> {
        let mut affected = 0;
        for message in self.run(sql)? {
            if let SimpleQueryMessage::CommandComplete(n) = message {
                affected = n;
            }
        }
        Ok(affected)
    }

    fn query(&mut self, sql: &Sql) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for message in self.run(sql)? {
            if let SimpleQueryMessage::Row(row) = message {
                let cells = (0..row.len())
                    .map(|i| match row.get(i) {
                        Some(text) => Cell::Text(text.to_string()),
                        None => Cell::Null,
                    })
                    .collect();
                rows.push(cells);
            }
        }
        Ok(rows)
    }
}

/// A postgres connection scoped to one schema.
pub struct Database {
    client: Client,
    log_queries: bool,
}

impl Database {
    pub fn connect(url: &str, schema: &str) -> Result<Self> {
        let mut client = Client::connect(url, NoTls)?;
        client.batch_execute(&format!("SET search_path TO {}", quote_ident(schema)))?;
        log::info!("connected to database, schema {schema}");
        Ok(Database {
            client,
            log_queries: false,
        })
    }

    pub fn log_queries(mut self, enabled: bool) -> Self {
        self.log_queries = enabled;
        self
    }

    /// Run `f` inside one transaction, committing on `Ok` and rolling back
    /// on `Err`.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut PgBackend<postgres::Transaction<'_>>) -> Result<T>) -> Result<T> {
        let tx = self.client.transaction()?;
        let mut backend = PgBackend::new(tx).log_queries(self.log_queries);
        match f(&mut backend) {
            Ok(value) => {
                backend.into_inner().commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = backend.into_inner().rollback() {
                    log::warn!("rollback failed: {rollback}");
                }
                Err(e)
            }
        }
    }
}

// ── Scripted ────────────────────────────────────────────────────────

/// In-process backend that records statements and answers queries from
/// canned rows. Used to exercise SQL generation without a server.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    /// Every statement seen, rendered with inline literals.
    pub statements: Vec<String>,
    responses: Vec<(String, VecDeque<Vec<Row>>)>,
    failures: Vec<String>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        ScriptedBackend::default()
    }

    /// Answer the next query containing `pattern` with `rows`. Several
    /// responses for one pattern are used in order; the last one repeats.
    pub fn respond(&mut self, pattern: &str, rows: Vec<Row>) -> &mut Self {
        match self.responses.iter_mut().find(|(p, _)| p == pattern) {
            Some((_, queue)) => queue.push_back(rows),
            None => self.responses.push((pattern.to_string(), VecDeque::from([rows]))),
        }
        self
    }

    /// Fail any statement containing `pattern`.
    pub fn fail_on(&mut self, pattern: &str) -> &mut Self {
        self.failures.push(pattern.to_string());
        self
    }

    /// Statements that are not plain queries.
    pub fn writes(&self) -> Vec<&str> {
        self.statements
            .iter()
            .map(String::as_str)
            .filter(|s| !s.trim_start().to_ascii_lowercase().starts_with("select"))
            .collect()
    }

    fn record(&mut self, sql: &Sql) -> Result<String> {
        let text = sql.to_inline();
        self.statements.push(text.clone());
        if let Some(pattern) = self.failures.iter().find(|p| text.contains(p.as_str())) {
            return Err(RecordbaseError::Other(format!("scripted failure on '{pattern}'")));
        }
        Ok(text)
    }
}

impl Backend for ScriptedBackend {
    fn execute(&mut self, sql: &Sql) -> Result<u64> {
        self.record(sql)?;
        Ok(1)
    }

    fn query(&mut self, sql: &Sql) -> Result<Vec<Row>> {
        let text = self.record(sql)?;
        for (pattern, queue) in self.responses.iter_mut() {
            if text.contains(pattern.as_str()) {
                let rows = if queue.len() > 1 {
                    queue.pop_front().unwrap_or_default()
                } else {
                    queue.front().cloned().unwrap_or_default()
                };
                return Ok(rows);
            }
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_accessors() {
        assert_eq!(Cell::text("42").as_i64(), Some(42));
        assert_eq!(Cell::Int(7).as_i64(), Some(7));
        assert_eq!(Cell::text("t").as_bool(), Some(true));
        assert_eq!(Cell::Null.as_str(), None);
        assert!(Cell::Null.is_null());
    }

    #[test]
    fn test_scripted_backend_answers_by_pattern() {
        let mut backend = ScriptedBackend::new();
        backend
            .respond("from families", vec![vec![Cell::text("a")]])
            .respond("from families", vec![vec![Cell::text("b")]]);

        let query = Sql::raw("select id from families");
        assert_eq!(backend.query(&query).unwrap(), vec![vec![Cell::text("a")]]);
        assert_eq!(backend.query(&query).unwrap(), vec![vec![Cell::text("b")]]);
        assert_eq!(backend.query(&query).unwrap(), vec![vec![Cell::text("b")]]);
        assert!(backend.query(&Sql::raw("select 1")).unwrap().is_empty());
    }

    #[test]
    fn test_scripted_backend_records_and_fails() {
        let mut backend = ScriptedBackend::new();
        backend.fail_on("DROP");
        backend
            .execute(&Sql::format("insert into t values (?)", [Sql::param("x")]))
            .unwrap();
        assert!(backend.execute(&Sql::raw("DROP TABLE t")).is_err());
        assert_eq!(backend.statements[0], "insert into t values ('x')");
        assert_eq!(backend.writes().len(), 2);
    }
}
