use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{RecordbaseError, Result};
use crate::meta::{Meta, Model, RecordMeta};

use super::history::{json_text, HistoryChange, HistoryEntry, HistoryRequest};
use super::storage::{Editor, Storage};

/// In-process storage. Rows are kept decoded, keyed by record name then id.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: BTreeMap<String, BTreeMap<String, Value>>,
    history: Vec<HistoryEntry>,
    editing: BTreeMap<(String, String, String), DateTime<Utc>>,
    serials: BTreeMap<(String, String), i64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    /// Every audit entry in append order.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn row(&self, table: &str, id: &str) -> Option<&Value> {
        self.tables.get(table).and_then(|rows| rows.get(id))
    }

    fn row_id(row: &Value) -> Result<String> {
        row.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RecordbaseError::Other("row without an id".into()))
    }

    fn user_name(&self, model: &Model, user_id: Option<&str>) -> Option<String> {
        let users = model.table("User")?;
        users.field("name")?;
        let row = self.row(&users.name, user_id?)?;
        row.get("name").and_then(json_text)
    }

    /// The record's user-facing key from its row, or from the audit trail
    /// once the row is gone.
    fn user_key(&self, model: &Model, table: &str, id: &str) -> Option<String> {
        let key = model.table(table)?.user_facing_key.as_deref()?;
        if let Some(row) = self.row(table, id) {
            return row.get(key).and_then(json_text);
        }
        self.history
            .iter()
            .filter(|e| e.table_name == table && e.id == id)
            .filter_map(|e| e.diff.as_ref()?.get(key)?.get(1).and_then(json_text))
            .max()
    }
}

impl Storage for MemoryStorage {
    fn read_row(&mut self, record: &RecordMeta, id: &str, _lock: bool) -> Result<Option<Value>> {
        Ok(self.row(&record.name, id).cloned())
    }

    fn read_rows(&mut self, record: &RecordMeta) -> Result<Vec<Value>> {
        Ok(self
            .tables
            .get(&record.name)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn insert_row(&mut self, record: &RecordMeta, row: &Value) -> Result<Value> {
        let id = Self::row_id(row)?;
        if self.row(&record.name, &id).is_some() {
            return Err(RecordbaseError::Other(format!(
                "duplicate key {id} in {}",
                record.table_name()
            )));
        }
        let mut stored = row.clone();
        for (key, meta) in &record.fields {
            if *meta == Meta::Serial && stored.get(key).map_or(true, Value::is_null) {
                let counter = self.serials.entry((record.name.clone(), key.clone())).or_insert(0);
                *counter += 1;
                stored[key.as_str()] = Value::from(*counter);
            }
        }
        self.tables
            .entry(record.name.clone())
            .or_default()
            .insert(id, stored.clone());
        Ok(stored)
    }

    fn update_row(&mut self, record: &RecordMeta, row: &Value) -> Result<()> {
        let id = Self::row_id(row)?;
        let rows = self.tables.entry(record.name.clone()).or_default();
        if let Some(current) = rows.get_mut(&id) {
            *current = row.clone();
        }
        Ok(())
    }

    fn delete_row(&mut self, record: &RecordMeta, id: &str) -> Result<()> {
        if let Some(rows) = self.tables.get_mut(&record.name) {
            rows.remove(id);
        }
        Ok(())
    }

    fn child_ids(&mut self, child: &RecordMeta, link_field: &str, parent_id: &str) -> Result<Vec<String>> {
        Ok(self
            .tables
            .get(&child.name)
            .map(|rows| {
                rows.iter()
                    .filter(|(_, row)| row.get(link_field).and_then(Value::as_str) == Some(parent_id))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn next_history_version(&mut self, table: &str, id: &str) -> Result<i64> {
        Ok(self
            .history
            .iter()
            .filter(|e| e.table_name == table && e.id == id)
            .map(|e| e.version + 1)
            .max()
            .unwrap_or(0))
    }

    fn append_history(&mut self, entry: &HistoryEntry) -> Result<()> {
        self.history.push(entry.clone());
        Ok(())
    }

    fn record_history(&mut self, table: &str, id: &str) -> Result<Vec<HistoryEntry>> {
        let mut entries: Vec<HistoryEntry> = self
            .history
            .iter()
            .filter(|e| e.table_name == table && e.id == id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.version);
        Ok(entries)
    }

    fn list_history(&mut self, model: &Model, request: &HistoryRequest, limit: usize) -> Result<Vec<HistoryChange>> {
        let mut changes: Vec<(DateTime<Utc>, HistoryChange)> = self
            .history
            .iter()
            .map(|entry| {
                let change = HistoryChange::new(
                    entry,
                    self.user_name(model, entry.user_id.as_deref()),
                    self.user_key(model, &entry.table_name, &entry.id),
                );
                (entry.changed_time, change)
            })
            .filter(|(time, change)| request.matches(change, *time))
            .collect();
        changes.sort_by(|(a_time, a), (b_time, b)| {
            b_time
                .cmp(a_time)
                .then(b.record_version.cmp(&a.record_version))
        });
        Ok(changes.into_iter().take(limit).map(|(_, change)| change).collect())
    }

    fn touch_editor(&mut self, table: &str, id: &str, user_id: &str, time: DateTime<Utc>) -> Result<()> {
        self.editing
            .insert((table.to_string(), id.to_string(), user_id.to_string()), time);
        Ok(())
    }

    fn evict_editors(&mut self, before: DateTime<Utc>) -> Result<u64> {
        let count = self.editing.len();
        self.editing.retain(|_, time| *time >= before);
        Ok((count - self.editing.len()) as u64)
    }

    fn editors(&mut self, table: &str, id: &str) -> Result<Vec<Editor>> {
        let mut editors: Vec<Editor> = self
            .editing
            .iter()
            .filter(|((t, i, _), _)| t == table && i == id)
            .map(|((_, _, user_id), time)| Editor {
                user_id: user_id.clone(),
                time: *time,
            })
            .collect();
        editors.sort_by_key(|e| e.time);
        Ok(editors)
    }
}
