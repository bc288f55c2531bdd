//! Table queries: column selection, filters, sorting, segments and limits
//! compiled into one statement.

pub mod filter;

pub use filter::{Filter, FilterDetail};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

use crate::backend::{Backend, Cell};
use crate::codec;
use crate::columns::segment_alias;
use crate::context::Context;
use crate::error::{RecordbaseError, Result};
use crate::meta::Meta;
use crate::naming;
use crate::sql::{field_access, Sql};
use filter::FilterTranslator;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub table_name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub sorts: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub segment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Vec<Value>>,
    pub full_count: u64,
}

/// A compiled query, ready to run.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: Sql,
    /// Meta of each requested column, in order.
    pub metas: Vec<Meta>,
    pub limited: bool,
}

/// Compile a query request against the context's column trees.
pub fn build_query(context: &Context, request: &QueryRequest) -> Result<Statement> {
    let record = context.table(&request.table_name)?;
    let table = record.name.as_str();
    let segment = request.segment.as_deref();
    let tree = &context.columns;
    // Validates the segment name before anything else resolves against it.
    tree.root(table, segment)?;

    let mut fields = Vec::new();
    let mut metas = Vec::new();
    for column in &request.columns {
        let value = tree.resolve_path(table, segment, column)?;
        metas.push(value.meta);
        fields.push(Sql::format(&format!("? AS c{}", fields.len()), [value.sql]));
    }

    let mut order = Vec::new();
    for sort in &request.sorts {
        let (column, descending) = match sort.strip_prefix('-') {
            Some(column) => (column, true),
            None => (sort.as_str(), false),
        };
        let value = match tree.resolve_path(table, segment, &format!("{column}Sort")) {
            Ok(value) => value,
            Err(_) => tree.resolve_path(table, segment, column)?,
        };
        let expression = if value.meta == Meta::String {
            Sql::format("naturalsort(lower(?))", [value.sql])
        } else {
            value.sql
        };
        let alias = format!("c{}", fields.len());
        fields.push(Sql::format(&format!("? AS {alias}"), [expression]));
        order.push(if descending { format!("{alias} DESC") } else { alias });
    }

    let mut joins = Vec::new();
    if let Some(segment) = segment {
        let paths = record.segment(segment).ok_or_else(|| {
            RecordbaseError::InvalidRequest(format!("unknown segment {segment} of {table}"))
        })?;
        for (index, path) in paths.iter().enumerate() {
            let array = segment_array(context, table, path)?;
            let alias = segment_alias(index);
            joins.push(Sql::format(
                &format!(
                    " CROSS JOIN LATERAL (SELECT (?)[u.ordinality] AS item, u.ordinality FROM unnest(?) WITH ORDINALITY AS u) AS {alias}"
                ),
                [array.clone(), array],
            ));
            order.push(format!("{alias}.ordinality"));
        }
    }

    let rewrites = context
        .model
        .rewrites
        .iter()
        .filter(|rule| rule.table.as_deref().map_or(true, |t| t == table))
        .collect();
    let mut translator = FilterTranslator::new(tree, table, segment, rewrites);
    let predicate = translator.translate_all(&request.filters)?;

    if request.limit.is_some() {
        fields.push(Sql::raw("count(*) over() AS full_count"));
    }

    let mut sql = Sql::new();
    if !translator.withs.is_empty() {
        sql.push_text("WITH ");
        sql.append(Sql::join(translator.withs, ", "));
        sql.push_text(" ");
    }
    sql.push_text("SELECT ");
    sql.append(Sql::join(fields, ", "));
    sql.push_text(&format!(" FROM {}", record.table_name()));
    for join in joins {
        sql.append(join);
    }
    if let Some(predicate) = predicate {
        sql.push_text(" WHERE ");
        sql.append(predicate);
    }
    if !order.is_empty() {
        sql.push_text(&format!(" ORDER BY {}", order.join(", ")));
    }
    if let Some(limit) = request.limit {
        sql.push_text(&format!(" LIMIT {limit}"));
    }

    Ok(Statement {
        sql,
        metas,
        limited: request.limit.is_some(),
    })
}

/// The array a segment path iterates, read from the row itself.
fn segment_array(context: &Context, table: &str, path: &str) -> Result<Sql> {
    let value = context.columns.resolve_path(table, None, path)?;
    if !value.meta.is_array() {
        return Err(RecordbaseError::Schema(format!("segment path {table}.{path} is not an array")));
    }
    Ok(value.sql)
}

/// Run a query and decode its rows.
pub fn query_table(backend: &mut dyn Backend, context: &Context, request: &QueryRequest) -> Result<QueryResult> {
    let statement = build_query(context, request)?;
    let started = Instant::now();
    let rows = backend.query(&statement.sql)?;
    log::debug!(
        "query {} returned {} rows in {:?}",
        request.table_name,
        rows.len(),
        started.elapsed()
    );

    let full_count = match (statement.limited, rows.first()) {
        (true, Some(first)) => first
            .last()
            .and_then(Cell::as_i64)
            .map(|n| n as u64)
            .unwrap_or(rows.len() as u64),
        _ => rows.len() as u64,
    };

    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut values = Vec::with_capacity(statement.metas.len());
        for (index, meta) in statement.metas.iter().enumerate() {
            let cell = row.get(index).unwrap_or(&Cell::Null);
            values.push(codec::decode_cell(&context.layout, meta, cell)?);
        }
        decoded.push(values);
    }
    Ok(QueryResult {
        rows: decoded,
        full_count,
    })
}

/// Read every row of a table, decoded as whole records.
pub fn read_records(backend: &mut dyn Backend, context: &Context, table: &str) -> Result<Vec<Value>> {
    let record = context.table(table)?;
    let meta = Meta::Record(record.clone());
    let alias = "R";
    let fields = context.layout.fields(&record.name)?;
    let columns: Vec<String> = fields
        .iter()
        .map(|f| field_access(&Sql::raw(alias), &naming::column_name(f)).to_inline())
        .collect();
    let sql = Sql::raw(format!(
        "SELECT ROW({}) FROM {} {alias}",
        columns.join(", "),
        record.table_name()
    ));
    backend
        .query(&sql)?
        .iter()
        .map(|row| codec::decode_cell(&context.layout, &meta, row.first().unwrap_or(&Cell::Null)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::meta::parse_model_str;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    const MODEL: &str = r#"
records:
  Person:
    fields:
      name: string
      happy: boolean
  Role:
    fields:
      role: uuid
      user: link<User>
  User:
    table: true
    fields:
      name: string
  Family:
    table: true
    fields:
      surname: string
      size: quantity
      children: Person[]
      personnel: Role[]
    functions:
      surnameSort:
        params: [Family]
        returns: quantity
        body: "(family) => family.size"
    segments:
      byChild: [children]
rewrites:
  - table: Family
    prefix: "personnelByRole.name@"
    personnel: personnel
"#;

    fn context() -> Context {
        Context::declared(Arc::new(parse_model_str(MODEL).unwrap())).unwrap()
    }

    fn request(value: serde_json::Value) -> QueryRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_simple_select_with_sort() {
        let context = context();
        let statement = build_query(
            &context,
            &request(json!({"tableName": "Family", "columns": ["surname", "children.name"], "sorts": ["-surname"]})),
        )
        .unwrap();
        let text = statement.sql.to_inline();
        assert!(text.starts_with("SELECT families.\"surname\" AS c0, "), "{text}");
        // surnameSort exists and is preferred; it is numeric, so no natural sort.
        assert!(text.contains("families.\"size\" AS c2"), "{text}");
        assert!(text.ends_with(" FROM families ORDER BY c2 DESC"), "{text}");
        assert_eq!(statement.metas.len(), 2);
    }

    #[test]
    fn test_string_sorts_are_natural() {
        let context = context();
        let statement = build_query(
            &context,
            &request(json!({"tableName": "User", "columns": ["name"], "sorts": ["name"]})),
        )
        .unwrap();
        assert_eq!(
            statement.sql.to_inline(),
            "SELECT users.\"name\" AS c0, naturalsort(lower(users.\"name\")) AS c1 FROM users ORDER BY c1"
        );
    }

    #[test]
    fn test_segment_join_and_limit() {
        let context = context();
        let statement = build_query(
            &context,
            &request(json!({
                "tableName": "Family",
                "columns": ["children.name"],
                "segment": "byChild",
                "limit": 10
            })),
        )
        .unwrap();
        assert_eq!(
            statement.sql.to_inline(),
            "SELECT (S0.item).\"name\" AS c0, count(*) over() AS full_count FROM families \
             CROSS JOIN LATERAL (SELECT (families.\"children\")[u.ordinality] AS item, u.ordinality \
             FROM unnest(families.\"children\") WITH ORDINALITY AS u) AS S0 ORDER BY S0.ordinality LIMIT 10"
        );
    }

    #[test]
    fn test_rewrite_rule_hoists_user_filter() {
        let context = context();
        let statement = build_query(
            &context,
            &request(json!({
                "tableName": "Family",
                "columns": ["surname"],
                "filters": [{"column": "personnelByRole.name@r-1", "filter": {"like": "Ann%"}}]
            })),
        )
        .unwrap();
        assert_eq!(
            statement.sql.to_inline(),
            "WITH W0 AS MATERIALIZED (SELECT id FROM users WHERE \"name\" ilike 'Ann%') \
             SELECT families.\"surname\" AS c0 FROM families WHERE exists(select 1 from unnest(families.\"personnel\") P \
             where P.\"role\" = 'r-1'::uuid and P.\"user\" in (select id from W0))"
        );
    }

    #[test]
    fn test_invalid_column() {
        let context = context();
        let err = build_query(&context, &request(json!({"tableName": "Family", "columns": ["nope"]}))).unwrap_err();
        assert_eq!(err.status(), "INVALID_COLUMN");
    }

    #[test]
    fn test_query_table_decodes_rows_and_full_count() {
        let context = context();
        let mut backend = ScriptedBackend::new();
        backend.respond(
            "FROM families",
            vec![
                vec![Cell::text("Adams"), Cell::text("{\"(Cain,f)\",\"(Abel,t)\"}"), Cell::text("7")],
                vec![Cell::text("Brown"), Cell::text("{}"), Cell::text("7")],
            ],
        );
        let result = query_table(
            &mut backend,
            &context,
            &request(json!({"tableName": "Family", "columns": ["surname", "children"], "limit": 2})),
        )
        .unwrap();
        assert_eq!(result.full_count, 7);
        assert_eq!(
            result.rows[0],
            vec![
                json!("Adams"),
                json!([{"name": "Cain", "happy": false}, {"name": "Abel", "happy": true}])
            ]
        );
        assert_eq!(result.rows[1][1], json!([]));
    }

    #[test]
    fn test_full_count_without_limit_is_row_count() {
        let context = context();
        let mut backend = ScriptedBackend::new();
        backend.respond("FROM users", vec![vec![Cell::text("a")], vec![Cell::Null]]);
        let result = query_table(&mut backend, &context, &request(json!({"tableName": "User", "columns": ["name"]}))).unwrap();
        assert_eq!(result.full_count, 2);
        assert_eq!(result.rows[1], vec![Value::Null]);
    }
}
