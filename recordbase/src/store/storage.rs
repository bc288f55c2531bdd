use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::{Backend, Cell};
use crate::codec;
use crate::context::Context;
use crate::error::{RecordbaseError, Result};
use crate::meta::{Meta, Model, RecordMeta};
use crate::query;
use crate::naming::{column_name, quote_ident};
use crate::sql::Sql;
use crate::sync::{EDITING_TABLE, HISTORY_TABLE};

use super::history::{history_query, HistoryChange, HistoryEntry, HistoryRequest};

/// Another user with a record open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Editor {
    pub user_id: String,
    pub time: DateTime<Utc>,
}

/// Persistence needed by the record store. Rows are whole decoded records.
pub trait Storage {
    /// Current row, optionally locked for the rest of the transaction.
    fn read_row(&mut self, record: &RecordMeta, id: &str, lock: bool) -> Result<Option<Value>>;

    fn read_rows(&mut self, record: &RecordMeta) -> Result<Vec<Value>>;

    /// Insert a row. Serial fields left null are assigned by the storage;
    /// the returned row carries their values.
    fn insert_row(&mut self, record: &RecordMeta, row: &Value) -> Result<Value>;

    fn update_row(&mut self, record: &RecordMeta, row: &Value) -> Result<()>;

    fn delete_row(&mut self, record: &RecordMeta, id: &str) -> Result<()>;

    /// Ids of `child` rows whose `link_field` points at `parent_id`.
    fn child_ids(&mut self, child: &RecordMeta, link_field: &str, parent_id: &str) -> Result<Vec<String>>;

    /// One past the highest audited version of a record, or 0.
    fn next_history_version(&mut self, table: &str, id: &str) -> Result<i64>;

    fn append_history(&mut self, entry: &HistoryEntry) -> Result<()>;

    /// Audit entries of one record in version order.
    fn record_history(&mut self, table: &str, id: &str) -> Result<Vec<HistoryEntry>>;

    /// Filtered listing, newest first.
    fn list_history(&mut self, model: &Model, request: &HistoryRequest, limit: usize) -> Result<Vec<HistoryChange>>;

    /// Register `user_id` as editing a record at `time`.
    fn touch_editor(&mut self, table: &str, id: &str, user_id: &str, time: DateTime<Utc>) -> Result<()>;

    /// Forget editors last seen before `before`. Returns how many.
    fn evict_editors(&mut self, before: DateTime<Utc>) -> Result<u64>;

    fn editors(&mut self, table: &str, id: &str) -> Result<Vec<Editor>>;
}

fn timestamp(time: DateTime<Utc>) -> Sql {
    Sql::param(time.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn parse_timestamp(cell: Option<&Cell>) -> Result<DateTime<Utc>> {
    match cell {
        Some(Cell::Timestamp(time)) => Ok(*time),
        Some(cell) => {
            let text = cell
                .as_str()
                .ok_or_else(|| RecordbaseError::Codec("missing timestamp".into()))?;
            let normalized = codec::normalize_datetime(text)?;
            DateTime::parse_from_rfc3339(&normalized)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| RecordbaseError::Codec(format!("invalid timestamp '{text}': {e}")))
        }
        None => Err(RecordbaseError::Codec("missing timestamp".into())),
    }
}

fn text(cell: Option<&Cell>) -> Option<String> {
    cell.and_then(Cell::as_str).map(str::to_string)
}

fn parse_diff(cell: Option<&Cell>) -> Result<Option<Value>> {
    match cell.and_then(Cell::as_str) {
        Some(text) => Ok(Some(serde_json::from_str(text)?)),
        None => Ok(None),
    }
}

/// Storage over a postgres backend, encoding rows with the context's
/// layout.
pub struct PgStorage<'a> {
    backend: &'a mut dyn Backend,
    context: &'a Context,
}

impl<'a> PgStorage<'a> {
    pub fn new(backend: &'a mut dyn Backend, context: &'a Context) -> Self {
        PgStorage { backend, context }
    }

    fn encode_field(&self, meta: &Meta, value: &Value) -> Result<Sql> {
        Ok(Sql::opt_param(codec::encode(&self.context.layout, meta, value)?))
    }

    fn decode_row(&self, record: &RecordMeta, row: &[Cell]) -> Result<Value> {
        let mut object = Map::new();
        for (index, (key, meta)) in record.fields.iter().enumerate() {
            let cell = row.get(index).unwrap_or(&Cell::Null);
            object.insert(key.clone(), codec::decode_cell(&self.context.layout, meta, cell)?);
        }
        Ok(Value::Object(object))
    }

    fn select(record: &RecordMeta) -> String {
        let columns: Vec<String> = record
            .fields
            .iter()
            .map(|(key, _)| quote_ident(&column_name(key)))
            .collect();
        format!("SELECT {} FROM {}", columns.join(", "), record.table_name())
    }

    fn history_entry(row: &[Cell], table: &str, id: &str) -> Result<HistoryEntry> {
        Ok(HistoryEntry {
            table_name: table.to_string(),
            id: id.to_string(),
            version: row.first().and_then(Cell::as_i64).unwrap_or_default(),
            diff: parse_diff(row.get(1))?,
            user_id: text(row.get(2)),
            form: text(row.get(3)).unwrap_or_default(),
            changed_time: parse_timestamp(row.get(4))?,
        })
    }
}

impl Storage for PgStorage<'_> {
    fn read_row(&mut self, record: &RecordMeta, id: &str, lock: bool) -> Result<Option<Value>> {
        let mut sql = Sql::format(
            &format!("{} WHERE \"id\" = ?", Self::select(record)),
            [Sql::param(id)],
        );
        if lock {
            sql.push_text(" FOR UPDATE");
        }
        match self.backend.query(&sql)?.first() {
            Some(row) => Ok(Some(self.decode_row(record, row)?)),
            None => Ok(None),
        }
    }

    fn read_rows(&mut self, record: &RecordMeta) -> Result<Vec<Value>> {
        query::read_records(self.backend, self.context, &record.name)
    }

    fn insert_row(&mut self, record: &RecordMeta, row: &Value) -> Result<Value> {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        let mut serials = Vec::new();
        for (key, meta) in &record.fields {
            let value = row.get(key).unwrap_or(&Value::Null);
            if *meta == Meta::Serial && value.is_null() {
                serials.push(key.clone());
                continue;
            }
            columns.push(quote_ident(&column_name(key)));
            values.push(self.encode_field(meta, value)?);
        }
        let mut sql = Sql::raw(format!(
            "INSERT INTO {} ({}) VALUES (",
            record.table_name(),
            columns.join(", ")
        ));
        sql.append(Sql::join(values, ", "));
        sql.push_text(")");

        let mut stored = row.clone();
        if serials.is_empty() {
            self.backend.execute(&sql)?;
        } else {
            let returning: Vec<String> = serials.iter().map(|s| quote_ident(&column_name(s))).collect();
            sql.push_text(&format!(" RETURNING {}", returning.join(", ")));
            let rows = self.backend.query(&sql)?;
            let first = rows.first();
            for (index, key) in serials.iter().enumerate() {
                let value = first
                    .and_then(|r| r.get(index))
                    .and_then(Cell::as_i64)
                    .map(Value::from)
                    .unwrap_or(Value::Null);
                stored[key.as_str()] = value;
            }
        }
        Ok(stored)
    }

    fn update_row(&mut self, record: &RecordMeta, row: &Value) -> Result<()> {
        let mut sets = Vec::new();
        for (key, meta) in &record.fields {
            let value = row.get(key).unwrap_or(&Value::Null);
            if key == "id" || (*meta == Meta::Serial && value.is_null()) {
                continue;
            }
            let assignment = format!("{} = ?", quote_ident(&column_name(key)));
            sets.push(Sql::format(&assignment, [self.encode_field(meta, value)?]));
        }
        let id = row.get("id").and_then(Value::as_str).unwrap_or_default();
        let mut sql = Sql::raw(format!("UPDATE {} SET ", record.table_name()));
        sql.append(Sql::join(sets, ", "));
        sql.append(Sql::format(" WHERE \"id\" = ?", [Sql::param(id)]));
        self.backend.execute(&sql)?;
        Ok(())
    }

    fn delete_row(&mut self, record: &RecordMeta, id: &str) -> Result<()> {
        let sql = Sql::format(
            &format!("DELETE FROM {} WHERE \"id\" = ?", record.table_name()),
            [Sql::param(id)],
        );
        self.backend.execute(&sql)?;
        Ok(())
    }

    fn child_ids(&mut self, child: &RecordMeta, link_field: &str, parent_id: &str) -> Result<Vec<String>> {
        let sql = Sql::format(
            &format!(
                "SELECT \"id\" FROM {} WHERE {} = ?",
                child.table_name(),
                quote_ident(&column_name(link_field))
            ),
            [Sql::param(parent_id)],
        );
        Ok(self
            .backend
            .query(&sql)?
            .iter()
            .filter_map(|row| text(row.first()))
            .collect())
    }

    fn next_history_version(&mut self, table: &str, id: &str) -> Result<i64> {
        let sql = Sql::format(
            &format!("SELECT coalesce(max(version) + 1, 0) FROM {HISTORY_TABLE} WHERE tablename = ? AND id = ?"),
            [Sql::param(table), Sql::param(id)],
        );
        Ok(self
            .backend
            .query(&sql)?
            .first()
            .and_then(|row| row.first())
            .and_then(Cell::as_i64)
            .unwrap_or(0))
    }

    fn append_history(&mut self, entry: &HistoryEntry) -> Result<()> {
        let diff = match &entry.diff {
            Some(diff) => Some(serde_json::to_string(diff)?),
            None => None,
        };
        let sql = Sql::format(
            &format!(
                "INSERT INTO {HISTORY_TABLE} (tablename, id, diff, version, user_id, form, changed_time) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)"
            ),
            [
                Sql::param(entry.table_name.clone()),
                Sql::param(entry.id.clone()),
                Sql::opt_param(diff),
                Sql::param(entry.version.to_string()),
                Sql::opt_param(entry.user_id.clone()),
                Sql::param(entry.form.clone()),
                timestamp(entry.changed_time),
            ],
        );
        self.backend.execute(&sql)?;
        Ok(())
    }

    fn record_history(&mut self, table: &str, id: &str) -> Result<Vec<HistoryEntry>> {
        let sql = Sql::format(
            &format!(
                "SELECT version, diff, user_id, form, changed_time FROM {HISTORY_TABLE} \
                 WHERE tablename = ? AND id = ? ORDER BY version"
            ),
            [Sql::param(table), Sql::param(id)],
        );
        self.backend
            .query(&sql)?
            .iter()
            .map(|row| Self::history_entry(row, table, id))
            .collect()
    }

    fn list_history(&mut self, model: &Model, request: &HistoryRequest, limit: usize) -> Result<Vec<HistoryChange>> {
        let rows = self.backend.query(&history_query(model, request, limit))?;
        let mut changes = Vec::with_capacity(rows.len());
        for row in &rows {
            let table = text(row.first()).unwrap_or_default();
            let id = text(row.get(1)).unwrap_or_default();
            let entry = HistoryEntry {
                table_name: table,
                id,
                version: row.get(2).and_then(Cell::as_i64).unwrap_or_default(),
                user_id: text(row.get(3)),
                form: text(row.get(5)).unwrap_or_default(),
                changed_time: parse_timestamp(row.get(6))?,
                diff: parse_diff(row.get(7))?,
            };
            changes.push(HistoryChange::new(&entry, text(row.get(4)), text(row.get(9))));
        }
        Ok(changes)
    }

    fn touch_editor(&mut self, table: &str, id: &str, user_id: &str, time: DateTime<Utc>) -> Result<()> {
        let sql = Sql::format(
            &format!(
                "INSERT INTO {EDITING_TABLE} (tablename, id, user_id, time) VALUES (?, ?, ?, ?) \
                 ON CONFLICT (tablename, id, user_id) DO UPDATE SET time = excluded.time"
            ),
            [Sql::param(table), Sql::param(id), Sql::param(user_id), timestamp(time)],
        );
        self.backend.execute(&sql)?;
        Ok(())
    }

    fn evict_editors(&mut self, before: DateTime<Utc>) -> Result<u64> {
        let sql = Sql::format(
            &format!("DELETE FROM {EDITING_TABLE} WHERE time < ?"),
            [timestamp(before)],
        );
        self.backend.execute(&sql)
    }

    fn editors(&mut self, table: &str, id: &str) -> Result<Vec<Editor>> {
        let sql = Sql::format(
            &format!("SELECT user_id, time FROM {EDITING_TABLE} WHERE tablename = ? AND id = ? ORDER BY time"),
            [Sql::param(table), Sql::param(id)],
        );
        self.backend
            .query(&sql)?
            .iter()
            .map(|row| {
                Ok(Editor {
                    user_id: text(row.first()).unwrap_or_default(),
                    time: parse_timestamp(row.get(1))?,
                })
            })
            .collect()
    }
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
  Family:
    table: true
    fields:
      surname: string
      children: Person[]
      number: serial
"#;

    fn context() -> Context {
        Context::declared(Arc::new(parse_model_str(MODEL).unwrap())).unwrap()
    }

    #[test]
    fn test_read_row_decodes_and_locks() {
        let context = context();
        let mut backend = ScriptedBackend::new();
        backend.respond(
            "FROM families",
            vec![vec![
                Cell::text("8f14e45f-ceea-4e7a-9b1c-1a2b3c4d5e6f"),
                Cell::text("3"),
                Cell::text("Adams"),
                Cell::text("{\"(Cain,f)\"}"),
                Cell::text("12"),
            ]],
        );
        let family = context.table("Family").unwrap().clone();
        let row = PgStorage::new(&mut backend, &context)
            .read_row(&family, "8f14e45f-ceea-4e7a-9b1c-1a2b3c4d5e6f", true)
            .unwrap();
        assert_eq!(
            row,
            Some(json!({
                "id": "8f14e45f-ceea-4e7a-9b1c-1a2b3c4d5e6f",
                "recordVersion": 3,
                "surname": "Adams",
                "children": [{"name": "Cain", "happy": false}],
                "number": 12
            }))
        );
        assert_eq!(
            backend.statements[0],
            "SELECT \"id\", \"record_version\", \"surname\", \"children\", \"number\" FROM families \
             WHERE \"id\" = '8f14e45f-ceea-4e7a-9b1c-1a2b3c4d5e6f' FOR UPDATE"
        );
    }

    #[test]
    fn test_insert_returns_serials() {
        let context = context();
        let mut backend = ScriptedBackend::new();
        backend.respond("RETURNING", vec![vec![Cell::text("41")]]);
        let family = context.table("Family").unwrap().clone();
        let stored = PgStorage::new(&mut backend, &context)
            .insert_row(
                &family,
                &json!({"id": "a", "recordVersion": 0, "surname": "O'Hara", "children": [], "number": null}),
            )
            .unwrap();
        assert_eq!(stored["number"], json!(41));
        assert_eq!(
            backend.statements[0],
            "INSERT INTO families (\"id\", \"record_version\", \"surname\", \"children\") \
             VALUES ('a', '0', 'O''Hara', '{}') RETURNING \"number\""
        );
    }

    #[test]
    fn test_update_skips_id() {
        let context = context();
        let mut backend = ScriptedBackend::new();
        let family = context.table("Family").unwrap().clone();
        PgStorage::new(&mut backend, &context)
            .update_row(
                &family,
                &json!({"id": "a", "recordVersion": 1, "surname": "Adams", "children": [], "number": 7}),
            )
            .unwrap();
        assert_eq!(
            backend.statements[0],
            "UPDATE families SET \"record_version\" = '1', \"surname\" = 'Adams', \"children\" = '{}', \"number\" = '7' \
             WHERE \"id\" = 'a'"
        );
    }

    #[test]
    fn test_history_rows_parse() {
        let context = context();
        let mut backend = ScriptedBackend::new();
        backend.respond(
            "ORDER BY version",
            vec![
                vec![
                    Cell::text("0"),
                    Cell::text("{\"surname\": [\"\", \"Adams\"]}"),
                    Cell::text("u1"),
                    Cell::text("family-form"),
                    Cell::text("2024-03-01 10:20:30.5+00"),
                ],
                vec![
                    Cell::text("1"),
                    Cell::Null,
                    Cell::Null,
                    Cell::text(""),
                    Cell::text("2024-03-02 08:00:00+00"),
                ],
            ],
        );
        let entries = PgStorage::new(&mut backend, &context).record_history("Family", "a").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].diff, Some(json!({"surname": ["", "Adams"]})));
        assert_eq!(entries[0].changed_time.to_rfc3339_opts(SecondsFormat::Millis, true), "2024-03-01T10:20:30.500Z");
        assert_eq!(entries[1].version, 1);
        assert_eq!(entries[1].user_id, None);
    }

    #[test]
    fn test_editor_upsert() {
        let context = context();
        let mut backend = ScriptedBackend::new();
        let time = "2024-03-01T10:00:00Z".parse().unwrap();
        PgStorage::new(&mut backend, &context).touch_editor("Family", "a", "u1", time).unwrap();
        assert_eq!(
            backend.statements[0],
            "INSERT INTO editing (tablename, id, user_id, time) VALUES ('Family', 'a', 'u1', '2024-03-01T10:00:00.000Z') \
             ON CONFLICT (tablename, id, user_id) DO UPDATE SET time = excluded.time"
        );
    }
}
