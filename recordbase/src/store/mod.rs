//! Versioned record store.
//!
//! Every write locks the current row, diffs it against the incoming record
//! and appends the delta to `record_history`, so any past version can be
//! rebuilt by replaying the trail from a zero-valued base.

pub mod diff;
pub mod history;
pub mod memory;
pub mod storage;

pub use history::{HistoryChange, HistoryEntry, HistoryRequest};
pub use memory::MemoryStorage;
pub use storage::{Editor, PgStorage, Storage};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::codec::format_date;
use crate::context::Context;
use crate::error::{RecordbaseError, Result};
use crate::ledger::AppliedPatches;
use crate::meta::{Meta, RecordMeta};
use crate::naming::field_name;
use crate::permission::{verify, Action, PermissionOracle, User, HISTORY_PERMISSION_TABLE};

const VERSION_FIELD: &str = "recordVersion";
const ADDED_STAMPS: [&str; 3] = ["addedBy", "addedDate", "addedDateTime"];

/// A committed change to one record. `old` is `None` for an insert and
/// `new` is `None` for a delete.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub table: String,
    pub user_id: String,
    pub id: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// Told about every change once its transaction has committed.
pub trait ChangeListener: Send + Sync {
    fn record_changed(&self, change: &Change);
}

/// Body of a `PATCH` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRequest {
    pub patch_ids: Vec<String>,
    pub patches: Vec<Value>,
    #[serde(default)]
    pub form: String,
    #[serde(default)]
    pub r#override: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOutcome {
    /// The record after patching, `None` when nothing applied to an
    /// absent record.
    pub record: Option<Value>,
    /// Ids applied by this request.
    pub new_patches: Vec<String>,
    /// Ids skipped because they were applied before.
    pub applied_patches: Vec<String>,
}

/// Zero-valued record every audit trail starts from.
pub fn make_base(record: &RecordMeta, id: &str) -> Value {
    let mut base = Meta::Record(Arc::new(record.clone())).default_value();
    base["id"] = Value::String(id.to_string());
    base[VERSION_FIELD] = Value::Null;
    base
}

fn version_of(record: &Value) -> i64 {
    record.get(VERSION_FIELD).and_then(Value::as_i64).unwrap_or(0)
}

fn without_version(record: &Value) -> Value {
    let mut record = record.clone();
    if let Some(object) = record.as_object_mut() {
        object.remove(VERSION_FIELD);
    }
    record
}

/// Rebuild a record from its audit entries, applied in order. `None` when
/// the last entry was a deletion or there is nothing to replay.
pub fn replay(record: &RecordMeta, id: &str, entries: &[HistoryEntry]) -> Result<Option<Value>> {
    let meta = Meta::Record(Arc::new(record.clone()));
    let base = make_base(record, id);
    let mut current: Option<Value> = None;
    for entry in entries {
        let Some(delta) = &entry.diff else {
            continue;
        };
        let start = match current.take() {
            Some(value) if !value.is_null() => value,
            _ if delta.is_object() => base.clone(),
            other => other.unwrap_or(Value::Null),
        };
        let patched = diff::patch(Some(&start), delta).map_err(|e| RecordbaseError::BadPatch {
            table: record.name.clone(),
            id: id.to_string(),
            detail: format!("history version {}: {e}", entry.version),
        })?;
        current = match patched {
            Some(value) if !value.is_null() => {
                let mut repaired = meta.repair(&value);
                repaired[VERSION_FIELD] = Value::from(entry.version);
                Some(repaired)
            }
            _ => Some(Value::Null),
        };
    }
    Ok(current.filter(|value| !value.is_null()))
}

/// One request's view of the store: a caller, a clock and the storage of
/// the enclosing transaction.
pub struct RecordStore<'a> {
    context: &'a Context,
    storage: &'a mut dyn Storage,
    permissions: &'a dyn PermissionOracle,
    user: &'a User,
    time: DateTime<Utc>,
    system: bool,
    changes: Vec<Change>,
}

impl<'a> RecordStore<'a> {
    pub fn new(
        context: &'a Context,
        storage: &'a mut dyn Storage,
        permissions: &'a dyn PermissionOracle,
        user: &'a User,
        time: DateTime<Utc>,
    ) -> Self {
        RecordStore {
            context,
            storage,
            permissions,
            user,
            time,
            system: false,
            changes: Vec::new(),
        }
    }

    /// System writes skip the `modified*`/`added*` stamps and are audited
    /// without a user.
    pub fn system(mut self, system: bool) -> Self {
        self.system = system;
        self
    }

    /// Changes made so far, in order.
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn into_changes(self) -> Vec<Change> {
        self.changes
    }

    fn check(&self, table: &str, action: Action) -> Result<()> {
        verify(self.permissions, self.user, table, action)
    }

    fn audit_user(&self) -> Option<String> {
        (!self.system).then(|| self.user.id.clone())
    }

    fn stamp(&self, record: &RecordMeta, value: &mut Value, prefix: &str) {
        for (suffix, stamp) in [
            ("By", Value::String(self.user.id.clone())),
            ("Date", Value::String(format_date(self.time.date_naive()))),
            (
                "DateTime",
                Value::String(self.time.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ),
        ] {
            let field = format!("{prefix}{suffix}");
            if record.field(&field).is_some() {
                value[field.as_str()] = stamp;
            }
        }
    }

    fn append(&mut self, table: &str, id: &str, version: i64, diff: Option<Value>, form: &str) -> Result<()> {
        let entry = HistoryEntry {
            table_name: table.to_string(),
            id: id.to_string(),
            version,
            diff,
            user_id: self.audit_user(),
            form: form.to_string(),
            changed_time: self.time,
        };
        self.storage.append_history(&entry)
    }

    fn push_change(&mut self, table: &str, id: &str, old: Option<Value>, new: Option<Value>) {
        self.changes.push(Change {
            table: table.to_string(),
            user_id: self.user.id.clone(),
            id: id.to_string(),
            old,
            new,
        });
    }

    pub fn read_record(&mut self, table: &str, id: &str) -> Result<Option<Value>> {
        self.check(table, Action::Read)?;
        let record = self.context.table(table)?;
        self.storage.read_row(record, id, false)
    }

    pub fn read_records(&mut self, table: &str) -> Result<Vec<Value>> {
        self.check(table, Action::Read)?;
        let record = self.context.table(table)?;
        self.storage.read_rows(record)
    }

    /// Insert or update a whole record. Returns the stored record; an
    /// update that changes nothing returns the current row untouched.
    pub fn store(&mut self, table: &str, record: &Value, form: &str) -> Result<Value> {
        self.check(table, Action::Write)?;
        let meta = self.context.table(table)?.clone();
        if !record.is_object() {
            return Err(RecordbaseError::InvalidRequest(format!("{table} record must be an object")));
        }
        let mut value = record.clone();
        if value.get(VERSION_FIELD).is_none() {
            value[VERSION_FIELD] = Value::Null;
        }
        if !self.system {
            self.stamp(&meta, &mut value, "modified");
        }
        self.context.validator.require_valid(table, &value)?;
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RecordbaseError::InvalidRequest(format!("{table} record has no id")))?;

        match self.storage.read_row(&meta, &id, true)? {
            None => {
                self.check(table, Action::New)?;
                let version = self.storage.next_history_version(table, &id)?;
                if !self.system {
                    self.stamp(&meta, &mut value, "added");
                }
                value[VERSION_FIELD] = Value::from(version);
                let stored = self.storage.insert_row(&meta, &value)?;
                let delta = diff::diff(&without_version(&make_base(&meta, &id)), &without_version(&stored));
                self.append(table, &id, version, delta, form)?;
                log::debug!("inserted {table}/{id} at version {version}");
                self.push_change(table, &id, None, Some(stored.clone()));
                Ok(stored)
            }
            Some(current) => {
                for (key, field) in &meta.fields {
                    if *field == Meta::Serial && value.get(key).map_or(true, Value::is_null) {
                        value[key.as_str()] = current.get(key).cloned().unwrap_or(Value::Null);
                    }
                }
                let Some(delta) = diff::diff(&without_version(&current), &without_version(&value)) else {
                    return Ok(current);
                };
                let version = version_of(&current) + 1;
                value[VERSION_FIELD] = Value::from(version);
                self.storage.update_row(&meta, &value)?;
                self.append(table, &id, version, Some(delta), form)?;
                log::debug!("updated {table}/{id} to version {version}");
                self.push_change(table, &id, Some(current), Some(value.clone()));
                Ok(value)
            }
        }
    }

    /// Delete a record and, first, the rows of its cascade tables that link
    /// to it.
    pub fn delete(&mut self, table: &str, id: &str, form: &str) -> Result<()> {
        self.check(table, Action::Delete)?;
        let meta = self.context.table(table)?.clone();
        let current = self.storage.read_row(&meta, id, true)?.ok_or_else(|| RecordbaseError::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        })?;

        let model = self.context.model.clone();
        if let Some(children) = model.cascades.get(table) {
            let link = field_name(table);
            for child in children {
                let child_meta = self.context.table(child)?.clone();
                for child_id in self.storage.child_ids(&child_meta, &link, id)? {
                    self.delete(child, &child_id, form)?;
                }
            }
        }

        self.storage.delete_row(&meta, id)?;
        let version = version_of(&current) + 1;
        let delta = Value::Array(vec![current.clone(), Value::Null]);
        self.append(table, id, version, Some(delta), form)?;
        log::debug!("deleted {table}/{id} at version {version}");
        self.push_change(table, id, Some(current), None);
        Ok(())
    }

    /// Apply client-computed deltas to a record by id. Patches whose ids are
    /// in `ledger`, or repeated in the request, are skipped.
    pub fn patch(
        &mut self,
        table: &str,
        id: &str,
        request: &PatchRequest,
        ledger: &dyn AppliedPatches,
    ) -> Result<PatchOutcome> {
        if request.patch_ids.len() != request.patches.len() {
            return Err(RecordbaseError::InvalidPatch);
        }
        self.check(table, Action::Write)?;
        let meta = self.context.table(table)?.clone();
        let current = self.storage.read_row(&meta, id, true)?;
        if current.is_none() && self.storage.next_history_version(table, id)? != 0 {
            return Err(RecordbaseError::DeletedRecord {
                table: table.to_string(),
                id: id.to_string(),
            });
        }

        let record_meta = Meta::Record(meta.clone());
        let mut value = current.clone().unwrap_or_else(|| make_base(&meta, id));
        let mut seen = BTreeSet::new();
        let mut outcome = PatchOutcome {
            record: None,
            new_patches: Vec::new(),
            applied_patches: Vec::new(),
        };
        for (patch_id, delta) in request.patch_ids.iter().zip(&request.patches) {
            if !seen.insert(patch_id.as_str()) || ledger.is_applied(patch_id)? {
                log::debug!("skipping applied patch {patch_id} on {table}/{id}");
                outcome.applied_patches.push(patch_id.clone());
                continue;
            }
            let bad_patch = |detail: String| RecordbaseError::BadPatch {
                table: table.to_string(),
                id: id.to_string(),
                detail,
            };
            let patched = diff::apply(Some(&value), delta, request.r#override)
                .map_err(|e| bad_patch(format!("patch {patch_id}: {e}")))?
                .filter(Value::is_object)
                .ok_or_else(|| bad_patch(format!("patch {patch_id} does not leave a record")))?;
            value = if request.r#override {
                record_meta.repair(&patched)
            } else {
                patched
            };
            outcome.new_patches.push(patch_id.clone());
        }

        if outcome.new_patches.is_empty() {
            outcome.record = current;
            return Ok(outcome);
        }
        if let Some(current) = &current {
            for stamp in ADDED_STAMPS {
                if meta.field(stamp).is_some() {
                    value[stamp] = current.get(stamp).cloned().unwrap_or(Value::Null);
                }
            }
            value[VERSION_FIELD] = Value::from(version_of(current));
        }
        value["id"] = Value::String(id.to_string());
        outcome.record = Some(self.store(table, &value, &request.form)?);
        Ok(outcome)
    }

    /// Restore the record as it was at `version`. The restore is written as
    /// a new version on top of the trail.
    pub fn revert(&mut self, table: &str, id: &str, version: i64, form: &str) -> Result<Option<Value>> {
        self.check(table, Action::Write)?;
        let meta = self.context.table(table)?.clone();
        let entries: Vec<HistoryEntry> = self
            .storage
            .record_history(table, id)?
            .into_iter()
            .filter(|entry| entry.version <= version)
            .collect();
        if entries.is_empty() {
            return Err(RecordbaseError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        let current = self.storage.read_row(&meta, id, true)?;
        match replay(&meta, id, &entries)? {
            None => {
                if current.is_some() {
                    self.delete(table, id, form)?;
                }
                Ok(None)
            }
            Some(mut restored) => {
                restored[VERSION_FIELD] = match &current {
                    Some(current) => Value::from(version_of(current)),
                    None => Value::Null,
                };
                self.store(table, &restored, form).map(Some)
            }
        }
    }

    /// Mark the caller as editing a record and list everyone else who is.
    /// Entries older than `ttl` are dropped first.
    pub fn edit(&mut self, table: &str, id: &str, ttl: Duration) -> Result<Vec<Editor>> {
        self.check(table, Action::Read)?;
        self.context.table(table)?;
        self.storage.touch_editor(table, id, &self.user.id, self.time)?;
        let evicted = self.storage.evict_editors(self.time - ttl)?;
        if evicted > 0 {
            log::debug!("evicted {evicted} stale editors");
        }
        let user_id = self.user.id.clone();
        Ok(self
            .storage
            .editors(table, id)?
            .into_iter()
            .filter(|editor| editor.user_id != user_id)
            .collect())
    }

    pub fn fetch_history(&mut self, request: &HistoryRequest, limit: usize) -> Result<Vec<HistoryChange>> {
        self.check(HISTORY_PERMISSION_TABLE, Action::Read)?;
        let model = self.context.model.clone();
        self.storage.list_history(&model, request, limit)
    }
}
