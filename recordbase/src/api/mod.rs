//! Request processing: one transport request, one transaction.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::backend::{Backend, Database};
use crate::context::SharedContext;
use crate::error::{RecordbaseError, Result};
use crate::ledger::PatchLedger;
use crate::permission::{verify, Action, PermissionOracle, User};
use crate::query::{query_table, QueryRequest};
use crate::store::{
    Change, ChangeListener, Editor, HistoryChange, HistoryRequest, PatchOutcome, PatchRequest, PgStorage,
    RecordStore,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRequest {
    pub table_name: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsRequest {
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRequest {
    pub table_name: String,
    pub record: Value,
    #[serde(default)]
    pub form: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRecordRequest {
    pub table_name: String,
    pub id: String,
    #[serde(flatten)]
    pub patch: PatchRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub table_name: String,
    pub record_id: String,
    #[serde(default)]
    pub form: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertRequest {
    pub table_name: String,
    pub id: String,
    pub record_version: i64,
    #[serde(default)]
    pub form: String,
}

/// A transport request, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    Record(RecordRequest),
    Records(RecordsRequest),
    Query(QueryRequest),
    Store(StoreRequest),
    Patch(PatchRecordRequest),
    Delete(DeleteRequest),
    FetchHistory(HistoryRequest),
    Revert(RevertRequest),
    Edit(RecordRequest),
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Record(_) => "RECORD",
            Request::Records(_) => "RECORDS",
            Request::Query(_) => "QUERY",
            Request::Store(_) => "STORE",
            Request::Patch(_) => "PATCH",
            Request::Delete(_) => "DELETE",
            Request::FetchHistory(_) => "FETCH_HISTORY",
            Request::Revert(_) => "REVERT",
            Request::Edit(_) => "EDIT",
        }
    }

    /// Record ids named by the request. They must be uuids.
    fn ids(&self) -> Vec<&str> {
        match self {
            Request::Record(r) | Request::Edit(r) => vec![r.id.as_str()],
            Request::Patch(r) => vec![r.id.as_str()],
            Request::Delete(r) => vec![r.record_id.as_str()],
            Request::Revert(r) => vec![r.id.as_str()],
            Request::FetchHistory(r) => r.record().into_iter().collect(),
            Request::Records(_) | Request::Query(_) | Request::Store(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Response {
    Record {
        record: Option<Value>,
    },
    Records {
        records: Vec<Value>,
    },
    Query {
        rows: Vec<Vec<Value>>,
        #[serde(rename = "fullCount")]
        full_count: u64,
    },
    Store {
        record: Value,
    },
    Patch(PatchOutcome),
    Delete {},
    FetchHistory {
        changes: Vec<HistoryChange>,
    },
    Revert {
        record: Option<Value>,
    },
    Edit {
        editors: Vec<Editor>,
    },
}

/// What a request produced inside its transaction. Listeners and the
/// patch ledger only hear about it once the transaction has committed.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub response: Response,
    pub changes: Vec<Change>,
    pub new_patches: Vec<String>,
}

impl Outcome {
    fn new(response: Response) -> Self {
        Outcome {
            response,
            changes: Vec::new(),
            new_patches: Vec::new(),
        }
    }
}

pub struct Service {
    context: Arc<SharedContext>,
    permissions: Box<dyn PermissionOracle>,
    ledger: PatchLedger,
    listeners: Vec<Box<dyn ChangeListener>>,
    history_limit: usize,
    editing_ttl: Duration,
}

impl Service {
    pub fn new(context: Arc<SharedContext>, permissions: Box<dyn PermissionOracle>, ledger: PatchLedger) -> Self {
        Service {
            context,
            permissions,
            ledger,
            listeners: Vec::new(),
            history_limit: 200,
            editing_ttl: Duration::minutes(60),
        }
    }

    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn editing_ttl(mut self, ttl: Duration) -> Self {
        self.editing_ttl = ttl;
        self
    }

    pub fn listen(&mut self, listener: Box<dyn ChangeListener>) {
        self.listeners.push(listener);
    }

    pub fn ledger(&self) -> &PatchLedger {
        &self.ledger
    }

    /// Run a request in its own transaction. Nothing is persisted and no
    /// listener is told anything when it fails.
    pub fn process(&self, database: &mut Database, user: &User, request: &Request) -> Result<Response> {
        let time = Utc::now();
        let outcome = database.transaction(|backend| self.dispatch(backend, user, request, time))?;
        self.committed(outcome)
    }

    /// Parse and run a JSON request, answering with the response or the
    /// error's structured detail.
    pub fn process_json(&self, database: &mut Database, user: &User, body: &Value) -> Value {
        let result = serde_json::from_value::<Request>(body.clone())
            .map_err(|e| RecordbaseError::InvalidRequest(e.to_string()))
            .and_then(|request| self.process(database, user, &request))
            .and_then(|response| Ok(serde_json::to_value(response)?));
        match result {
            Ok(value) => value,
            Err(err) => {
                if err.is_user_facing() {
                    log::debug!("request rejected: {err}");
                } else {
                    log::error!("request failed: {err}");
                }
                err.detail()
            }
        }
    }

    /// Execute a request against a backend whose transaction the caller
    /// owns.
    pub fn dispatch(
        &self,
        backend: &mut dyn Backend,
        user: &User,
        request: &Request,
        time: DateTime<Utc>,
    ) -> Result<Outcome> {
        for id in request.ids() {
            if uuid::Uuid::parse_str(id).is_err() {
                return Err(RecordbaseError::InvalidRequest(format!("'{id}' is not a record id")));
            }
        }
        log::debug!("{} request from {}", request.kind(), user.id);
        let context = self.context.current();
        let permissions = self.permissions.as_ref();

        if let Request::Query(query) = request {
            verify(permissions, user, &query.table_name, Action::Read)?;
            let result = query_table(backend, &context, query)?;
            return Ok(Outcome::new(Response::Query {
                rows: result.rows,
                full_count: result.full_count,
            }));
        }

        let mut storage = PgStorage::new(backend, &context);
        let mut store = RecordStore::new(&context, &mut storage, permissions, user, time);
        let mut new_patches = Vec::new();
        let response = match request {
            Request::Record(r) => Response::Record {
                record: store.read_record(&r.table_name, &r.id)?,
            },
            Request::Records(r) => Response::Records {
                records: store.read_records(&r.table_name)?,
            },
            Request::Store(r) => Response::Store {
                record: store.store(&r.table_name, &r.record, &r.form)?,
            },
            Request::Patch(r) => {
                let outcome = store.patch(&r.table_name, &r.id, &r.patch, &self.ledger)?;
                new_patches = outcome.new_patches.clone();
                Response::Patch(outcome)
            }
            Request::Delete(r) => {
                store.delete(&r.table_name, &r.record_id, &r.form)?;
                Response::Delete {}
            }
            Request::FetchHistory(r) => Response::FetchHistory {
                changes: store.fetch_history(r, self.history_limit)?,
            },
            Request::Revert(r) => Response::Revert {
                record: store.revert(&r.table_name, &r.id, r.record_version, &r.form)?,
            },
            Request::Edit(r) => Response::Edit {
                editors: store.edit(&r.table_name, &r.id, self.editing_ttl)?,
            },
            Request::Query(_) => {
                return Err(RecordbaseError::InvalidRequest("queries do not go through the store".into()))
            }
        };
        Ok(Outcome {
            response,
            changes: store.into_changes(),
            new_patches,
        })
    }

    /// Post-commit work: record applied patches and notify listeners.
    pub fn committed(&self, outcome: Outcome) -> Result<Response> {
        self.ledger.mark_applied(&outcome.new_patches)?;
        for change in &outcome.changes {
            for listener in &self.listeners {
                listener.record_changed(change);
            }
        }
        Ok(outcome.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Cell, ScriptedBackend};
    use crate::context::Context;
    use crate::meta::parse_model_str;
    use crate::permission::{AllowAll, UserGrants};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const MODEL: &str = r#"
records:
  Family:
    table: true
    fields:
      surname: string
"#;

    const ADAMS: &str = "8f14e45f-ceea-4e7a-9b1c-1a2b3c4d5e6f";

    #[derive(Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<Change>>>,
    }

    impl ChangeListener for Recorder {
        fn record_changed(&self, change: &Change) {
            self.seen.lock().push(change.clone());
        }
    }

    fn service(permissions: Box<dyn PermissionOracle>) -> Service {
        let model = Arc::new(parse_model_str(MODEL).unwrap());
        let context = Arc::new(SharedContext::new(Context::declared(model).unwrap()));
        Service::new(context, permissions, PatchLedger::open_in_memory().unwrap())
    }

    fn at() -> DateTime<Utc> {
        "2024-03-01T10:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_request_shapes() {
        let request: Request = serde_json::from_value(json!({
            "type": "PATCH",
            "tableName": "Family",
            "id": ADAMS,
            "patchIds": ["p1"],
            "patches": [{"surname": ["Adams", "Addams"]}],
            "form": "family-form",
            "override": true
        }))
        .unwrap();
        let Request::Patch(patch) = &request else {
            panic!("expected a patch, got {request:?}");
        };
        assert!(patch.patch.r#override);
        assert_eq!(patch.patch.form, "family-form");

        let request: Request = serde_json::from_value(json!({
            "type": "FETCH_HISTORY",
            "tableName": "Family",
            "fromDate": "2024-03-01"
        }))
        .unwrap();
        assert_eq!(request.kind(), "FETCH_HISTORY");
        assert!(serde_json::from_value::<Request>(json!({"type": "DROP", "tableName": "Family"})).is_err());
    }

    #[test]
    fn test_store_notifies_after_commit() {
        let mut service = service(Box::new(AllowAll));
        let recorder = Recorder::default();
        let seen = recorder.seen.clone();
        service.listen(Box::new(recorder));

        let mut backend = ScriptedBackend::new();
        let request = Request::Store(StoreRequest {
            table_name: "Family".into(),
            record: json!({"id": ADAMS, "recordVersion": null, "surname": "Adams"}),
            form: "family-form".into(),
        });
        let outcome = service.dispatch(&mut backend, &User::new("u1"), &request, at()).unwrap();
        assert_eq!(outcome.changes.len(), 1);
        assert!(seen.lock().is_empty());

        let response = service.committed(outcome).unwrap();
        assert_eq!(seen.lock().len(), 1);
        let Response::Store { record } = response else {
            panic!("expected a stored record");
        };
        assert_eq!(record["recordVersion"], json!(0));
        let writes = backend.writes();
        assert!(writes[0].starts_with("INSERT INTO families"), "{writes:?}");
        assert!(writes[1].starts_with("INSERT INTO record_history"), "{writes:?}");
        assert!(writes[1].contains("'family-form'"));
    }

    #[test]
    fn test_denied_request_issues_no_sql() {
        let service = service(Box::new(UserGrants));
        let mut backend = ScriptedBackend::new();
        let request = Request::Delete(DeleteRequest {
            table_name: "Family".into(),
            record_id: ADAMS.into(),
            form: String::new(),
        });
        let err = service.dispatch(&mut backend, &User::new("u1"), &request, at()).unwrap_err();
        assert_eq!(err.status(), "PERMISSION_DENIED");
        assert!(backend.statements.is_empty());
    }

    #[test]
    fn test_malformed_id_is_invalid_request() {
        let service = service(Box::new(AllowAll));
        let mut backend = ScriptedBackend::new();
        let request = Request::Record(RecordRequest {
            table_name: "Family".into(),
            id: "1; drop table families".into(),
        });
        let err = service.dispatch(&mut backend, &User::new("u1"), &request, at()).unwrap_err();
        assert_eq!(err.status(), "INVALID_REQUEST");
        assert!(backend.statements.is_empty());
    }

    #[test]
    fn test_patch_ids_recorded_on_commit() {
        let service = service(Box::new(AllowAll));
        let mut backend = ScriptedBackend::new();
        backend.respond(
            "FROM families",
            vec![vec![Cell::text(ADAMS), Cell::text("0"), Cell::text("Adams")]],
        );
        let request: Request = serde_json::from_value(json!({
            "type": "PATCH",
            "tableName": "Family",
            "id": ADAMS,
            "patchIds": ["p1"],
            "patches": [{"surname": ["Adams", "Addams"]}]
        }))
        .unwrap();
        let outcome = service.dispatch(&mut backend, &User::new("u1"), &request, at()).unwrap();
        assert_eq!(outcome.new_patches, vec!["p1".to_string()]);
        assert!(service.ledger().applied_at("p1").unwrap().is_none());
        service.committed(outcome).unwrap();
        assert!(service.ledger().applied_at("p1").unwrap().is_some());
        assert!(backend
            .writes()
            .iter()
            .any(|w| w.starts_with("UPDATE families SET \"record_version\" = '1', \"surname\" = 'Addams'")));
    }

    #[test]
    fn test_query_requires_read() {
        let service = service(Box::new(UserGrants));
        let mut backend = ScriptedBackend::new();
        let request: Request = serde_json::from_value(json!({
            "type": "QUERY",
            "tableName": "Family",
            "columns": ["surname"]
        }))
        .unwrap();
        let user = User::new("u1");
        assert_eq!(
            service.dispatch(&mut backend, &user, &request, at()).unwrap_err().status(),
            "PERMISSION_DENIED"
        );
        let reader = User::new("u2").grant("Family", &[Action::Read]);
        backend.respond("SELECT", vec![vec![Cell::text("Adams")]]);
        let outcome = service.dispatch(&mut backend, &reader, &request, at()).unwrap();
        assert_eq!(
            outcome.response,
            Response::Query {
                rows: vec![vec![json!("Adams")]],
                full_count: 1
            }
        );
    }
}
