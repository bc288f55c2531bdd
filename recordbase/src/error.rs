use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordbaseError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Expression compile error: {0}")]
    Compile(String),

    #[error("Permission denied: {action} on {table}")]
    PermissionDenied { table: String, action: String },

    #[error("Invalid record for {table}:\n  - {}", errors.join("\n  - "))]
    InvalidRecord { table: String, errors: Vec<String> },

    #[error("Record not found: {table}/{id}")]
    NotFound { table: String, id: String },

    #[error("Invalid column: {column}")]
    InvalidColumn { column: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid patch: patch ids and patches differ in length")]
    InvalidPatch,

    #[error("Patch does not apply to {table}/{id}: {detail}")]
    BadPatch {
        table: String,
        id: String,
        detail: String,
    },

    #[error("Record {table}/{id} was deleted")]
    DeletedRecord { table: String, id: String },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Postgres error: {0}")]
    Postgres(#[from] postgres::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl RecordbaseError {
    /// Machine-readable status carried back to callers.
    pub fn status(&self) -> &'static str {
        match self {
            RecordbaseError::PermissionDenied { .. } => "PERMISSION_DENIED",
            RecordbaseError::InvalidRecord { .. } => "INVALID_RECORD",
            RecordbaseError::NotFound { .. } => "NOT_FOUND",
            RecordbaseError::InvalidColumn { .. } => "INVALID_COLUMN",
            RecordbaseError::InvalidRequest(_) => "INVALID_REQUEST",
            RecordbaseError::InvalidPatch => "INVALID_PATCH",
            RecordbaseError::BadPatch { .. } => "BAD_PATCH",
            RecordbaseError::DeletedRecord { .. } => "DELETED_RECORD",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Whether this error is part of the user-facing taxonomy (as opposed to a
    /// backend or programming failure).
    pub fn is_user_facing(&self) -> bool {
        self.status() != "INTERNAL_ERROR"
    }

    /// Structured detail for transport layers.
    pub fn detail(&self) -> serde_json::Value {
        let mut detail = serde_json::json!({ "status": self.status() });
        match self {
            RecordbaseError::PermissionDenied { table, action } => {
                detail["tableName"] = table.clone().into();
                detail["permission"] = action.clone().into();
            }
            RecordbaseError::InvalidRecord { table, errors } => {
                detail["tableName"] = table.clone().into();
                detail["errors"] = errors.clone().into();
            }
            RecordbaseError::NotFound { table, id }
            | RecordbaseError::DeletedRecord { table, id } => {
                detail["tableName"] = table.clone().into();
                detail["id"] = id.clone().into();
            }
            RecordbaseError::BadPatch { table, id, .. } => {
                detail["tableName"] = table.clone().into();
                detail["recordId"] = id.clone().into();
            }
            RecordbaseError::InvalidColumn { column } => {
                detail["column"] = column.clone().into();
            }
            RecordbaseError::InvalidRequest(message) => {
                detail["message"] = message.clone().into();
            }
            _ => {
                detail["message"] = self.to_string().into();
            }
        }
        detail
    }
}

pub type Result<T> = std::result::Result<T, RecordbaseError>;
