//! Schema synchronization: bring the live schema in line with the metadata
//! model.
//!
//! Synchronization is additive. Missing tables, composite types, columns
//! and attributes are created and existing rows are backfilled with the
//! field defaults. Type changes, undeclared table columns and undeclared
//! attributes are reported but never applied automatically.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::backend::Backend;
use crate::codec::{self, Layout};
use crate::error::Result;
use crate::meta::{Meta, Model, RecordMeta};
use crate::naming::{column_name, quote_ident, quote_literal};
use crate::sql::{field_access, Sql};

/// Tables every schema needs regardless of the model.
pub const HISTORY_TABLE: &str = "record_history";
pub const EDITING_TABLE: &str = "editing";
pub const BLOBS_TABLE: &str = "blobs";

const NATURAL_SORT: &str = "naturalsort";

/// Relations found in one live schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveSchema {
    /// Table name to (column, type) in column order.
    pub tables: BTreeMap<String, Vec<(String, String)>>,
    /// Composite type name to (attribute, type) in attribute order.
    pub types: BTreeMap<String, Vec<(String, String)>>,
    pub functions: BTreeSet<String>,
}

impl LiveSchema {
    /// Read tables, composite types and helper functions of `schema`.
    pub fn introspect(backend: &mut dyn Backend, schema: &str) -> Result<Self> {
        let mut live = LiveSchema::default();
        let relations = Sql::raw(format!(
            "SELECT c.relname, c.relkind, a.attname, format_type(a.atttypid, a.atttypmod) \
             FROM pg_catalog.pg_class c \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             LEFT JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped \
             WHERE n.nspname = {} AND c.relkind IN ('r', 'c') \
             ORDER BY c.relname, a.attnum",
            quote_literal(schema)
        ));
        for row in backend.query(&relations)? {
            let cell = |i: usize| row.get(i).and_then(|c| c.as_str()).map(str::to_string);
            let (Some(name), Some(kind)) = (cell(0), cell(1)) else {
                continue;
            };
            let target = if kind == "c" { &mut live.types } else { &mut live.tables };
            let attributes = target.entry(name).or_default();
            if let (Some(attribute), Some(sql_type)) = (cell(2), cell(3)) {
                attributes.push((attribute, sql_type));
            }
        }

        let functions = Sql::raw(format!(
            "SELECT p.proname FROM pg_catalog.pg_proc p \
             JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace \
             WHERE n.nspname = {} AND p.proname = {}",
            quote_literal(schema),
            quote_literal(NATURAL_SORT)
        ));
        for row in backend.query(&functions)? {
            if let Some(name) = row.first().and_then(|c| c.as_str()) {
                live.functions.insert(name.to_string());
            }
        }
        log::debug!(
            "live schema {schema}: {} tables, {} types",
            live.tables.len(),
            live.types.len()
        );
        Ok(live)
    }
}

/// One structural difference between the model and the live schema.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    /// Audit, presence or blob table is missing.
    BootstrapTable { name: &'static str },
    FunctionInstalled { name: String },
    TypeCreated { name: String, attributes: Vec<(String, String)> },
    AttributeAdded { type_name: String, attribute: String, sql_type: String },
    /// Live attribute with no field. Kept in the layout and skipped when
    /// decoding.
    AttributeUndeclared { type_name: String, attribute: String },
    TableCreated { table: String, columns: Vec<(String, String)> },
    ColumnAdded { table: String, column: String, sql_type: String },
    IndexCreated { table: String, column: String, unique: bool },
    /// Rewrite existing rows: new columns get their defaults and composite
    /// values are rebuilt around new attributes.
    Backfill { table: String, assignments: Vec<(String, Sql)> },
    /// Live column or attribute type differs from the declared one.
    TypeChanged { relation: String, column: String, live: String, declared: String },
    /// Live table column with no field.
    ColumnUndeclared { table: String, column: String },
}

impl SchemaChange {
    /// Safe changes are applied; the rest are only reported.
    pub fn is_safe(&self) -> bool {
        !matches!(
            self,
            SchemaChange::TypeChanged { .. }
                | SchemaChange::ColumnUndeclared { .. }
                | SchemaChange::AttributeUndeclared { .. }
        )
    }

    pub fn describe(&self) -> String {
        match self {
            SchemaChange::BootstrapTable { name } => format!("Table '{name}' created"),
            SchemaChange::FunctionInstalled { name } => format!("Function '{name}' installed"),
            SchemaChange::TypeCreated { name, attributes } => {
                format!("Type '{name}' created with {} attributes", attributes.len())
            }
            SchemaChange::AttributeAdded { type_name, attribute, sql_type } => {
                format!("Attribute '{attribute}' ({sql_type}) added to type '{type_name}'")
            }
            SchemaChange::AttributeUndeclared { type_name, attribute } => {
                format!("Attribute '{type_name}.{attribute}' is not declared")
            }
            SchemaChange::TableCreated { table, columns } => {
                format!("Table '{table}' created with {} columns", columns.len())
            }
            SchemaChange::ColumnAdded { table, column, sql_type } => {
                format!("Column '{column}' ({sql_type}) added to '{table}'")
            }
            SchemaChange::IndexCreated { table, column, unique } => {
                let kind = if *unique { "Unique index" } else { "Index" };
                format!("{kind} on '{table}.{column}' created")
            }
            SchemaChange::Backfill { table, assignments } => {
                let columns: Vec<&str> = assignments.iter().map(|(c, _)| c.as_str()).collect();
                format!("Rows of '{table}' backfilled ({})", columns.join(", "))
            }
            SchemaChange::TypeChanged { relation, column, live, declared } => {
                format!("'{relation}.{column}' is {live}, declared {declared}")
            }
            SchemaChange::ColumnUndeclared { table, column } => {
                format!("Column '{table}.{column}' is not declared")
            }
        }
    }

    /// Statements applying this change inside `schema`.
    pub fn statements(&self, schema: &str) -> Vec<Sql> {
        let qualify = |name: &str| format!("{}.{}", quote_ident(schema), quote_ident(name));
        let definitions = |columns: &[(String, String)]| {
            columns
                .iter()
                .map(|(column, sql_type)| format!("{} {sql_type}", quote_ident(column)))
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            SchemaChange::BootstrapTable { name } => bootstrap(schema, name),
            SchemaChange::FunctionInstalled { name } => vec![Sql::raw(format!(
                "CREATE OR REPLACE FUNCTION {}.{}(text) RETURNS bytea LANGUAGE sql IMMUTABLE STRICT AS $f$ \
                 SELECT string_agg(convert_to(coalesce(r[2], length(length(r[1])::text) || length(r[1])::text || r[1]), 'SQL_ASCII'), '\\x00') \
                 FROM regexp_matches($1, '0*([0-9]+)|([^0-9]+)', 'g') r $f$",
                quote_ident(schema),
                name
            ))],
            SchemaChange::TypeCreated { name, attributes } => vec![Sql::raw(format!(
                "CREATE TYPE {} AS ({})",
                qualify(name),
                definitions(attributes)
            ))],
            SchemaChange::AttributeAdded { type_name, attribute, sql_type } => vec![Sql::raw(format!(
                "ALTER TYPE {} ADD ATTRIBUTE {} {sql_type}",
                qualify(type_name),
                quote_ident(attribute)
            ))],
            SchemaChange::TableCreated { table, columns } => {
                let rest: Vec<(String, String)> = columns
                    .iter()
                    .filter(|(column, _)| column != "id" && column != "record_version")
                    .cloned()
                    .collect();
                let mut sql = format!("CREATE TABLE {} (\"id\" uuid PRIMARY KEY, \"record_version\" integer", qualify(table));
                if !rest.is_empty() {
                    sql.push_str(", ");
                    sql.push_str(&definitions(&rest));
                }
                sql.push(')');
                vec![Sql::raw(sql)]
            }
            SchemaChange::ColumnAdded { table, column, sql_type } => vec![Sql::raw(format!(
                "ALTER TABLE {} ADD COLUMN {} {sql_type}",
                qualify(table),
                quote_ident(column)
            ))],
            SchemaChange::IndexCreated { table, column, unique } => vec![Sql::raw(format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if *unique { "UNIQUE " } else { "" },
                quote_ident(&format!("{table}_{column}_idx")),
                qualify(table),
                quote_ident(column)
            ))],
            SchemaChange::Backfill { table, assignments } => {
                let mut sql = Sql::raw(format!("UPDATE {} SET ", qualify(table)));
                let sets = assignments
                    .iter()
                    .map(|(column, value)| Sql::format(&format!("{} = ?", quote_ident(column)), [value.clone()]));
                sql.append(Sql::join(sets, ", "));
                vec![sql]
            }
            SchemaChange::TypeChanged { .. }
            | SchemaChange::ColumnUndeclared { .. }
            | SchemaChange::AttributeUndeclared { .. } => Vec::new(),
        }
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

fn bootstrap(schema: &str, name: &str) -> Vec<Sql> {
    let table = format!("{}.{}", quote_ident(schema), quote_ident(name));
    match name {
        HISTORY_TABLE => vec![
            Sql::raw(format!(
                "CREATE TABLE {table} (tablename text NOT NULL, id uuid NOT NULL, diff jsonb, \
                 version integer NOT NULL, user_id uuid, form text, changed_time timestamptz NOT NULL DEFAULT now())"
            )),
            Sql::raw(format!(
                "CREATE INDEX IF NOT EXISTS record_history_record_idx ON {table} (tablename, id, version)"
            )),
        ],
        EDITING_TABLE => vec![Sql::raw(format!(
            "CREATE TABLE {table} (tablename text NOT NULL, id uuid NOT NULL, user_id uuid NOT NULL, \
             time timestamptz NOT NULL, PRIMARY KEY (tablename, id, user_id))"
        ))],
        _ => vec![Sql::raw(format!(
            "CREATE TABLE {table} (id char(64) PRIMARY KEY, type text NOT NULL, data bytea NOT NULL)"
        ))],
    }
}

/// Changes to apply plus the attribute order the schema will have once
/// they are applied.
#[derive(Debug, Clone)]
pub struct Plan {
    pub changes: Vec<SchemaChange>,
    pub layout: Layout,
}

/// Type name as the live schema reports it for a field.
pub fn live_type(meta: &Meta) -> String {
    match meta {
        Meta::Record(record) => record.type_name(),
        Meta::Array(items) | Meta::OptionalArray(items) => format!("{}[]", live_type(items)),
        Meta::Money
        | Meta::OptionalMoney
        | Meta::Quantity
        | Meta::OptionalQuantity
        | Meta::Percentage
        | Meta::OptionalPercentage => "numeric".into(),
        Meta::DateTime => "timestamp with time zone".into(),
        Meta::Serial | Meta::Version => "integer".into(),
        other => other.sql_type(""),
    }
}

/// Strip schema qualification and quoting from a live type name.
fn normalize(live: &str) -> String {
    let (base, array) = match live.strip_suffix("[]") {
        Some(base) => (base, "[]"),
        None => (live, ""),
    };
    let base = base.rsplit('.').next().unwrap_or(base);
    format!("{}{array}", base.trim_matches('"'))
}

/// Records stored as composite types: every record used as a field, with
/// the records it contains ordered before it.
fn nested_records(model: &Model) -> Vec<&RecordMeta> {
    fn visit<'a>(meta: &'a Meta, order: &mut Vec<&'a RecordMeta>, seen: &mut HashSet<String>) {
        match meta {
            Meta::Record(record) => {
                if seen.insert(record.name.clone()) {
                    for (_, field) in &record.fields {
                        visit(field, order, seen);
                    }
                    order.push(record);
                }
            }
            Meta::Array(items) | Meta::OptionalArray(items) => visit(items, order, seen),
            _ => {}
        }
    }

    let mut order = Vec::new();
    let mut seen = HashSet::new();
    for record in model.records.values() {
        for (_, field) in &record.fields {
            visit(field, &mut order, &mut seen);
        }
    }
    order
}

/// Compare declared fields with live columns. Returns the live order of the
/// declared fields followed by the missing ones, plus the columns with no
/// field.
fn reconcile(
    record: &RecordMeta,
    relation: &str,
    live: &[(String, String)],
    changes: &mut Vec<SchemaChange>,
) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut order = Vec::new();
    let mut undeclared = Vec::new();
    for (column, live_sql_type) in live {
        match record.fields.iter().find(|(key, _)| column_name(key) == *column) {
            Some((key, meta)) => {
                let declared = live_type(meta);
                let found = normalize(live_sql_type);
                if found != declared {
                    changes.push(SchemaChange::TypeChanged {
                        relation: relation.to_string(),
                        column: column.clone(),
                        live: found,
                        declared,
                    });
                }
                order.push(key.clone());
            }
            None => {
                order.push(Layout::undeclared_slot(column));
                undeclared.push(column.clone());
            }
        }
    }
    let missing: Vec<String> = record
        .fields
        .iter()
        .map(|(key, _)| key.clone())
        .filter(|key| !order.contains(key))
        .collect();
    order.extend(missing.iter().cloned());
    (order, missing, undeclared)
}

fn needs_index(key: &str, meta: &Meta) -> Option<bool> {
    match meta {
        Meta::Serial => Some(true),
        Meta::Uuid { .. } if key == "project" => Some(false),
        _ => None,
    }
}

/// Compute the changes that make `live` match `model`.
pub fn plan(model: &Model, schema: &str, live: &LiveSchema) -> Result<Plan> {
    let mut changes = Vec::new();
    let mut layout = Layout::declared(model);

    for name in [HISTORY_TABLE, EDITING_TABLE, BLOBS_TABLE] {
        if !live.tables.contains_key(name) {
            changes.push(SchemaChange::BootstrapTable { name });
        }
    }
    if !live.functions.contains(NATURAL_SORT) {
        changes.push(SchemaChange::FunctionInstalled {
            name: NATURAL_SORT.to_string(),
        });
    }

    // Records whose composite type gains attributes, with the new fields.
    let mut extended: HashMap<String, Vec<String>> = HashMap::new();
    for record in nested_records(model) {
        let type_name = record.type_name();
        match live.types.get(&type_name) {
            None => changes.push(SchemaChange::TypeCreated {
                attributes: record
                    .fields
                    .iter()
                    .map(|(key, meta)| (column_name(key), meta.sql_type(schema)))
                    .collect(),
                name: type_name,
            }),
            Some(attributes) => {
                let (order, missing, undeclared) = reconcile(record, &type_name, attributes, &mut changes);
                for attribute in undeclared {
                    changes.push(SchemaChange::AttributeUndeclared {
                        type_name: type_name.clone(),
                        attribute,
                    });
                }
                for key in &missing {
                    if let Some(meta) = record.field(key) {
                        changes.push(SchemaChange::AttributeAdded {
                            type_name: type_name.clone(),
                            attribute: column_name(key),
                            sql_type: meta.sql_type(schema),
                        });
                    }
                }
                if !missing.is_empty() {
                    extended.insert(record.name.clone(), missing);
                }
                layout.set(&record.name, order);
            }
        }
    }

    let mut backfills = Vec::new();
    for record in model.tables() {
        let table = record.table_name();
        match live.tables.get(&table) {
            None => {
                changes.push(SchemaChange::TableCreated {
                    table: table.clone(),
                    columns: record
                        .fields
                        .iter()
                        .map(|(key, meta)| (column_name(key), meta.sql_type(schema)))
                        .collect(),
                });
                for (key, meta) in &record.fields {
                    if let Some(unique) = needs_index(key, meta) {
                        changes.push(SchemaChange::IndexCreated {
                            table: table.clone(),
                            column: column_name(key),
                            unique,
                        });
                    }
                }
            }
            Some(columns) => {
                let (mut order, missing, undeclared) = reconcile(record, &table, columns, &mut changes);
                order.retain(|slot| Layout::undeclared(slot).is_none());
                for column in undeclared {
                    changes.push(SchemaChange::ColumnUndeclared {
                        table: table.clone(),
                        column,
                    });
                }
                for key in &missing {
                    if let Some(meta) = record.field(key) {
                        changes.push(SchemaChange::ColumnAdded {
                            table: table.clone(),
                            column: column_name(key),
                            sql_type: meta.sql_type(schema),
                        });
                        if let Some(unique) = needs_index(key, meta) {
                            changes.push(SchemaChange::IndexCreated {
                                table: table.clone(),
                                column: column_name(key),
                                unique,
                            });
                        }
                    }
                }
                layout.set(&record.name, order);
                backfills.push((record, table, missing));
            }
        }
    }

    // Defaults are encoded against the final layout, so backfills come last.
    let rebuild = Rebuild {
        schema,
        layout: &layout,
        extended: &extended,
    };
    for (record, table, missing) in backfills {
        let mut assignments = Vec::new();
        for (key, meta) in &record.fields {
            let column = column_name(key);
            if missing.contains(key) {
                if *meta != Meta::Serial && !meta.default_value().is_null() {
                    assignments.push((column, rebuild.default(meta)?));
                }
            } else if rebuild.affects(meta) {
                if let Some(expression) = rebuild.expression(meta, &Sql::raw(quote_ident(&column)))? {
                    assignments.push((column, expression));
                }
            }
        }
        if !assignments.is_empty() {
            changes.push(SchemaChange::Backfill { table, assignments });
        }
    }

    Ok(Plan { changes, layout })
}

/// Builds expressions that carry existing composite values over into types
/// with added attributes.
struct Rebuild<'a> {
    schema: &'a str,
    layout: &'a Layout,
    extended: &'a HashMap<String, Vec<String>>,
}

impl Rebuild<'_> {
    fn affects(&self, meta: &Meta) -> bool {
        match meta {
            Meta::Record(record) => {
                self.extended.contains_key(&record.name) || record.fields.iter().any(|(_, m)| self.affects(m))
            }
            Meta::Array(items) | Meta::OptionalArray(items) => self.affects(items),
            _ => false,
        }
    }

    /// Typed default literal.
    fn default(&self, meta: &Meta) -> Result<Sql> {
        let text = codec::encode(self.layout, meta, &meta.default_value())?;
        Ok(Sql::format(&format!("?::{}", meta.sql_type(self.schema)), [Sql::opt_param(text)]))
    }

    fn expression(&self, meta: &Meta, value: &Sql) -> Result<Option<Sql>> {
        if !self.affects(meta) {
            return Ok(None);
        }
        match meta {
            Meta::Record(record) => {
                let added = self.extended.get(&record.name);
                let mut fields = Vec::new();
                for key in self.layout.fields(&record.name)? {
                    if let Some(attribute) = Layout::undeclared(key) {
                        fields.push(field_access(value, attribute));
                        continue;
                    }
                    let Some(field_meta) = record.field(key) else {
                        continue;
                    };
                    let access = field_access(value, &column_name(key));
                    let field = if added.map_or(false, |keys| keys.contains(key)) {
                        self.default(field_meta)?
                    } else {
                        self.expression(field_meta, &access)?.unwrap_or(access)
                    };
                    fields.push(field);
                }
                let row = Sql::format(
                    &format!("ROW(?)::{}", meta.sql_type(self.schema)),
                    [Sql::join(fields, ", ")],
                );
                Ok(Some(Sql::format(
                    "CASE WHEN ? IS NULL THEN NULL ELSE ? END",
                    [value.clone(), row],
                )))
            }
            Meta::Array(items) | Meta::OptionalArray(items) => {
                let item = Sql::format("(?)[i]", [value.clone()]);
                let rebuilt = self.expression(items, &item)?.unwrap_or(item);
                Ok(Some(Sql::format(
                    "CASE WHEN ? IS NULL THEN NULL ELSE coalesce((SELECT array_agg(? ORDER BY i) FROM generate_subscripts(?, 1) AS i), '{}') END",
                    [value.clone(), rebuilt, value.clone()],
                )))
            }
            _ => Ok(None),
        }
    }
}

/// Outcome of one synchronization run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub applied: Vec<SchemaChange>,
    pub skipped: Vec<SchemaChange>,
    pub statements: usize,
    pub layout: Layout,
}

/// Introspect, plan and apply. Run it inside one transaction so that a
/// failing statement leaves the schema untouched.
pub fn synchronize(backend: &mut dyn Backend, model: &Model, schema: &str) -> Result<SyncReport> {
    let live = LiveSchema::introspect(backend, schema)?;
    let Plan { changes, layout } = plan(model, schema, &live)?;

    let mut report = SyncReport {
        applied: Vec::new(),
        skipped: Vec::new(),
        statements: 0,
        layout,
    };
    for change in changes {
        if !change.is_safe() {
            log::warn!("schema drift not applied: {change}");
            report.skipped.push(change);
            continue;
        }
        log::info!("{change}");
        for statement in change.statements(schema) {
            log::info!("{}", statement.to_inline());
            backend.execute(&statement)?;
            report.statements += 1;
        }
        report.applied.push(change);
    }
    if report.statements == 0 {
        log::info!("schema {schema} is up to date");
    }
    Ok(report)
}

/// Attribute order of the live composite types, without changing anything.
/// Types the database does not have yet fall back to declaration order.
pub fn live_layout(backend: &mut dyn Backend, model: &Model, schema: &str) -> Result<Layout> {
    let live = LiveSchema::introspect(backend, schema)?;
    let plan = plan(model, schema, &live)?;
    let pending = plan.changes.iter().filter(|change| change.is_safe()).count();
    if pending > 0 {
        log::warn!("schema {schema} has {pending} pending changes; run sync");
    }
    Ok(plan.layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Cell, ScriptedBackend};
    use crate::meta::parse_model_str;
    use pretty_assertions::assert_eq;

    const MODEL: &str = r#"
records:
  Person:
    fields:
      name: string
      happy: boolean
  Family:
    table: true
    fields:
      surname: string
      budget: money
      mother: Person
      children: Person[]
      number: serial
      project: uuid
"#;

    fn columns(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    /// The live schema a first synchronization of MODEL leaves behind.
    fn synced() -> LiveSchema {
        let mut live = LiveSchema::default();
        for name in [HISTORY_TABLE, EDITING_TABLE, BLOBS_TABLE] {
            live.tables.insert(name.to_string(), Vec::new());
        }
        live.functions.insert(NATURAL_SORT.to_string());
        live.types.insert(
            "person".into(),
            columns(&[("name", "text"), ("happy", "boolean")]),
        );
        live.tables.insert(
            "families".into(),
            columns(&[
                ("id", "uuid"),
                ("record_version", "integer"),
                ("surname", "text"),
                ("budget", "numeric"),
                ("mother", "person"),
                ("children", "person[]"),
                ("number", "integer"),
                ("project", "uuid"),
            ]),
        );
        live
    }

    #[test]
    fn test_plan_empty_schema() {
        let model = parse_model_str(MODEL).unwrap();
        let plan = plan(&model, "public", &LiveSchema::default()).unwrap();
        let described: Vec<String> = plan.changes.iter().map(|c| c.describe()).collect();
        assert_eq!(
            described,
            vec![
                "Table 'record_history' created",
                "Table 'editing' created",
                "Table 'blobs' created",
                "Function 'naturalsort' installed",
                "Type 'person' created with 2 attributes",
                "Table 'families' created with 8 columns",
                "Unique index on 'families.number' created",
                "Index on 'families.project' created",
            ]
        );
        assert_eq!(
            plan.changes[2].statements("public")[0].to_inline(),
            "CREATE TABLE \"public\".\"blobs\" (id char(64) PRIMARY KEY, type text NOT NULL, data bytea NOT NULL)"
        );
        let create = plan.changes[5].statements("public");
        assert_eq!(
            create[0].to_inline(),
            "CREATE TABLE \"public\".\"families\" (\"id\" uuid PRIMARY KEY, \"record_version\" integer, \
             \"surname\" text, \"budget\" decimal, \"mother\" \"public\".\"person\", \
             \"children\" \"public\".\"person\"[], \"number\" serial, \"project\" uuid)"
        );
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let model = parse_model_str(MODEL).unwrap();
        let plan = plan(&model, "public", &synced()).unwrap();
        assert_eq!(plan.changes, Vec::new());
    }

    #[test]
    fn test_live_type_names_are_normalized() {
        let model = parse_model_str(MODEL).unwrap();
        let mut live = synced();
        live.tables.get_mut("families").unwrap()[4].1 = "public.person".into();
        live.tables.get_mut("families").unwrap()[5].1 = "\"public\".\"person\"[]".into();
        assert!(plan(&model, "public", &live).unwrap().changes.is_empty());
    }

    #[test]
    fn test_added_column_is_backfilled() {
        let model = parse_model_str(MODEL).unwrap();
        let mut live = synced();
        live.tables.get_mut("families").unwrap().retain(|(c, _)| c != "budget" && c != "number");
        let plan = plan(&model, "public", &live).unwrap();
        let statements: Vec<String> = plan
            .changes
            .iter()
            .flat_map(|c| c.statements("public"))
            .map(|s| s.to_inline())
            .collect();
        assert_eq!(
            statements,
            vec![
                "ALTER TABLE \"public\".\"families\" ADD COLUMN \"budget\" decimal",
                "ALTER TABLE \"public\".\"families\" ADD COLUMN \"number\" serial",
                "CREATE UNIQUE INDEX IF NOT EXISTS \"families_number_idx\" ON \"public\".\"families\" (\"number\")",
                "UPDATE \"public\".\"families\" SET \"budget\" = '0'::decimal",
            ]
        );
        // Added columns go after the live ones.
        assert_eq!(
            plan.layout.fields("Family").unwrap(),
            ["id", "recordVersion", "surname", "mother", "children", "project", "budget", "number"]
        );
    }

    #[test]
    fn test_added_attribute_rebuilds_nested_values() {
        let model = parse_model_str(MODEL).unwrap();
        let mut live = synced();
        live.types.insert("person".into(), columns(&[("happy", "boolean")]));
        let plan = plan(&model, "public", &live).unwrap();

        assert_eq!(
            plan.changes[0],
            SchemaChange::AttributeAdded {
                type_name: "person".into(),
                attribute: "name".into(),
                sql_type: "text".into(),
            }
        );
        assert_eq!(plan.layout.fields("Person").unwrap(), ["happy", "name"]);

        let SchemaChange::Backfill { table, assignments } = &plan.changes[1] else {
            panic!("Expected Backfill, got {:?}", plan.changes[1]);
        };
        assert_eq!(table, "families");
        let rendered: Vec<(String, String)> =
            assignments.iter().map(|(c, s)| (c.clone(), s.to_inline())).collect();
        assert_eq!(
            rendered,
            vec![
                (
                    "mother".to_string(),
                    "CASE WHEN \"mother\" IS NULL THEN NULL ELSE ROW((\"mother\").\"happy\", ''::text)::\"public\".\"person\" END"
                        .to_string()
                ),
                (
                    "children".to_string(),
                    "CASE WHEN \"children\" IS NULL THEN NULL ELSE coalesce((SELECT array_agg(\
                     CASE WHEN (\"children\")[i] IS NULL THEN NULL ELSE ROW(((\"children\")[i]).\"happy\", ''::text)::\"public\".\"person\" END \
                     ORDER BY i) FROM generate_subscripts(\"children\", 1) AS i), '{}') END"
                        .to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_drift_is_reported_not_applied() {
        let model = parse_model_str(MODEL).unwrap();
        let mut live = synced();
        live.tables.get_mut("families").unwrap()[2].1 = "integer".into();
        live.tables
            .get_mut("families")
            .unwrap()
            .push(("legacy".into(), "text".into()));
        let plan = plan(&model, "public", &live).unwrap();
        assert_eq!(plan.changes.len(), 2);
        assert!(plan.changes.iter().all(|c| !c.is_safe()));
        assert!(plan.changes.iter().all(|c| c.statements("public").is_empty()));
    }

    #[test]
    fn test_undeclared_attribute_is_reported_and_kept() {
        let model = parse_model_str(MODEL).unwrap();
        let mut live = synced();
        live.types
            .get_mut("person")
            .unwrap()
            .insert(1, ("age".into(), "integer".into()));
        let plan = plan(&model, "public", &live).unwrap();
        assert_eq!(
            plan.changes,
            vec![SchemaChange::AttributeUndeclared {
                type_name: "person".into(),
                attribute: "age".into(),
            }]
        );
        assert!(!plan.changes[0].is_safe());
        assert!(plan.changes[0].statements("public").is_empty());
        assert_eq!(
            plan.layout.fields("Person").unwrap(),
            ["name".to_string(), Layout::undeclared_slot("age"), "happy".to_string()]
        );
    }

    #[test]
    fn test_rebuild_carries_undeclared_attribute() {
        let model = parse_model_str(MODEL).unwrap();
        let mut live = synced();
        live.types
            .insert("person".into(), columns(&[("age", "integer"), ("happy", "boolean")]));
        let plan = plan(&model, "public", &live).unwrap();
        let backfill = plan
            .changes
            .iter()
            .find_map(|change| match change {
                SchemaChange::Backfill { assignments, .. } => Some(assignments),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            backfill[0].1.to_inline(),
            "CASE WHEN \"mother\" IS NULL THEN NULL ELSE ROW((\"mother\").\"age\", (\"mother\").\"happy\", ''::text)::\"public\".\"person\" END"
        );
    }

    #[test]
    fn test_synchronize_runs_ddl_through_backend() {
        let model = parse_model_str(MODEL).unwrap();
        let mut backend = ScriptedBackend::new();
        backend.respond(
            "FROM pg_catalog.pg_class",
            vec![
                vec![Cell::text("editing"), Cell::text("r"), Cell::Null, Cell::Null],
                vec![Cell::text("person"), Cell::text("c"), Cell::text("name"), Cell::text("text")],
                vec![Cell::text("person"), Cell::text("c"), Cell::text("happy"), Cell::text("boolean")],
            ],
        );
        let report = synchronize(&mut backend, &model, "public").unwrap();
        assert!(report.skipped.is_empty());
        let writes = backend.writes();
        assert_eq!(writes.len(), report.statements);
        assert!(writes[0].starts_with("CREATE TABLE \"public\".\"record_history\""));
        assert!(writes.iter().any(|s| s.starts_with("CREATE OR REPLACE FUNCTION \"public\".naturalsort(text)")));
        assert!(!writes.iter().any(|s| s.contains("\"editing\"")));
        assert!(!writes.iter().any(|s| s.starts_with("CREATE TYPE")));
    }

    #[test]
    fn test_failed_statement_aborts() {
        let model = parse_model_str(MODEL).unwrap();
        let mut backend = ScriptedBackend::new();
        backend.fail_on("CREATE TYPE");
        assert!(synchronize(&mut backend, &model, "public").is_err());
        assert!(!backend.statements.iter().any(|s| s.starts_with("CREATE TABLE \"public\".\"families\"")));
    }
}
