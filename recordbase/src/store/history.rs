//! Audit trail entries and the history listing.

use chrono::{DateTime, Days, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::meta::Model;
use crate::naming::{column_name, quote_ident};
use crate::sql::Sql;
use crate::sync::HISTORY_TABLE;

/// One row of `record_history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub table_name: String,
    pub id: String,
    pub version: i64,
    /// Delta from the previous state; `[old, null]` for a deletion.
    pub diff: Option<Value>,
    pub user_id: Option<String>,
    pub form: String,
    pub changed_time: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn is_deletion(&self) -> bool {
        is_deletion(self.diff.as_ref())
    }
}

pub fn is_deletion(diff: Option<&Value>) -> bool {
    matches!(diff.and_then(|d| d.get(1)), Some(Value::Null))
}

/// Filters of a `FETCH_HISTORY` request. All are optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub record_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_key: Option<String>,
    #[serde(default)]
    pub from_date: Option<NaiveDate>,
    #[serde(default)]
    pub to_date: Option<NaiveDate>,
}

impl HistoryRequest {
    pub fn record(&self) -> Option<&str> {
        self.id.as_deref().or(self.record_id.as_deref())
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.from_date
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
    }

    /// Start of the day after `to_date`, so the whole last day is included.
    pub fn until(&self) -> Option<DateTime<Utc>> {
        self.to_date
            .and_then(|d| d.checked_add_days(Days::new(1)))
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
    }

    pub fn matches(&self, change: &HistoryChange, time: DateTime<Utc>) -> bool {
        self.table_name.as_ref().map_or(true, |t| *t == change.table_name)
            && self.record().map_or(true, |id| id == change.id)
            && self
                .user_id
                .as_ref()
                .map_or(true, |u| change.user_id.as_ref() == Some(u))
            && self
                .user_key
                .as_ref()
                .map_or(true, |k| change.user_key.as_ref() == Some(k))
            && self.since().map_or(true, |since| time >= since)
            && self.until().map_or(true, |until| time < until)
    }
}

/// One line of the history listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryChange {
    pub table_name: String,
    pub id: String,
    pub record_version: i64,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub form: String,
    pub diff: Option<Value>,
    pub changed_time: String,
    /// Human-facing identifier of the record, when its table declares one.
    pub user_key: Option<String>,
    pub deleted: bool,
}

impl HistoryChange {
    pub fn new(entry: &HistoryEntry, user_name: Option<String>, user_key: Option<String>) -> Self {
        HistoryChange {
            table_name: entry.table_name.clone(),
            id: entry.id.clone(),
            record_version: entry.version,
            user_id: entry.user_id.clone(),
            user_name,
            form: entry.form.clone(),
            diff: entry.diff.clone(),
            changed_time: entry.changed_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            user_key,
            deleted: entry.is_deletion(),
        }
    }
}

/// Text of a JSON value the way `->>` renders it.
pub fn json_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Listing query over `record_history`, newest first.
pub fn history_query(model: &Model, request: &HistoryRequest, limit: usize) -> Sql {
    let mut keys = Vec::new();
    for record in model.tables() {
        let Some(key) = &record.user_facing_key else {
            continue;
        };
        let table = record.table_name();
        let column = quote_ident(&column_name(key));
        keys.push(Sql::format(
            &format!(
                "WHEN {HISTORY_TABLE}.tablename = ? THEN coalesce(\
                 (SELECT {table}.{column}::text FROM {table} WHERE {table}.id = {HISTORY_TABLE}.id), \
                 (SELECT max(rr.diff -> ? ->> 1) FROM {HISTORY_TABLE} rr WHERE rr.tablename = ? AND rr.id = {HISTORY_TABLE}.id))"
            ),
            [
                Sql::param(record.name.clone()),
                Sql::param(key.clone()),
                Sql::param(record.name.clone()),
            ],
        ));
    }
    let user_key = if keys.is_empty() {
        Sql::raw("NULL")
    } else {
        let mut sql = Sql::raw("CASE ");
        sql.append(Sql::join(keys, " "));
        sql.push_text(" END");
        sql
    };

    let user_name = match model.table("User") {
        Some(users) if users.field("name").is_some() => {
            let table = users.table_name();
            format!("(SELECT {table}.\"name\" FROM {table} WHERE {table}.id = {HISTORY_TABLE}.user_id)")
        }
        _ => "NULL".to_string(),
    };

    let mut sql = Sql::raw(format!(
        "SELECT tablename, id, version, user_id, username, form, changed_time, diff, deleted, userkey FROM (\
         SELECT tablename, id, version, user_id, {user_name} AS username, form, changed_time, diff, \
         coalesce(diff -> 1 = 'null'::jsonb, false) AS deleted, "
    ));
    sql.append(user_key);
    sql.push_text(&format!(" AS userkey FROM {HISTORY_TABLE}) AS data"));

    let mut conditions = Vec::new();
    let mut condition = |template: &str, value: String| conditions.push(Sql::format(template, [Sql::param(value)]));
    if let Some(table) = &request.table_name {
        condition("tablename = ?", table.clone());
    }
    if let Some(id) = request.record() {
        condition("id = ?", id.to_string());
    }
    if let Some(user) = &request.user_id {
        condition("user_id = ?", user.clone());
    }
    if let Some(since) = request.since() {
        condition("changed_time >= ?", since.to_rfc3339_opts(SecondsFormat::Millis, true));
    }
    if let Some(until) = request.until() {
        condition("changed_time < ?", until.to_rfc3339_opts(SecondsFormat::Millis, true));
    }
    if let Some(key) = &request.user_key {
        condition("userkey = ?", key.clone());
    }
    if !conditions.is_empty() {
        sql.push_text(" WHERE ");
        sql.append(Sql::join(conditions, " AND "));
    }
    sql.push_text(&format!(" ORDER BY changed_time DESC, version DESC LIMIT {limit}"));
    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::parse_model_str;
    use serde_json::json;

    #[test]
    fn test_to_date_includes_the_whole_day() {
        let request: HistoryRequest = serde_json::from_value(json!({"toDate": "2024-03-01"})).unwrap();
        let entry = HistoryEntry {
            table_name: "Family".into(),
            id: "a".into(),
            version: 0,
            diff: None,
            user_id: None,
            form: "".into(),
            changed_time: "2024-03-01T23:59:00Z".parse().unwrap(),
        };
        let change = HistoryChange::new(&entry, None, None);
        assert!(request.matches(&change, entry.changed_time));
        assert!(!request.matches(&change, "2024-03-02T00:00:00Z".parse().unwrap()));
    }

    #[test]
    fn test_deletion_flag() {
        assert!(is_deletion(Some(&json!([{"id": "a"}, null]))));
        assert!(!is_deletion(Some(&json!({"name": ["a", "b"]}))));
        assert!(!is_deletion(None));
    }

    #[test]
    fn test_history_query_filters_and_keys() {
        let model = parse_model_str(
            r#"
records:
  User:
    table: true
    fields:
      name: string
  Family:
    table: true
    user_facing_key: surname
    fields:
      surname: string
"#,
        )
        .unwrap();
        let request = HistoryRequest {
            table_name: Some("Family".into()),
            user_key: Some("Adams".into()),
            ..HistoryRequest::default()
        };
        let text = history_query(&model, &request, 200).to_inline();
        assert!(text.contains("(SELECT users.\"name\" FROM users WHERE users.id = record_history.user_id) AS username"), "{text}");
        assert!(text.contains(
            "WHEN record_history.tablename = 'Family' THEN coalesce((SELECT families.\"surname\"::text FROM families"
        ));
        assert!(text.contains("max(rr.diff -> 'surname' ->> 1)"));
        assert!(text.ends_with(
            "WHERE tablename = 'Family' AND userkey = 'Adams' ORDER BY changed_time DESC, version DESC LIMIT 200"
        ));
    }
}
