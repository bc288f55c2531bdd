use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{RecordbaseError, Result};

/// Table name used for permission checks on the audit trail.
pub const HISTORY_PERMISSION_TABLE: &str = "RecordHistory";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
    New,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::New => "new",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Grants of the form `<Table>-<action>`, e.g. `Family-write`.
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        User {
            id: id.into(),
            ..User::default()
        }
    }

    pub fn grant(mut self, table: &str, actions: &[Action]) -> Self {
        for action in actions {
            self.permissions.insert(format!("{table}-{action}"));
        }
        self
    }
}

/// Decides whether a user may perform an action on a table.
pub trait PermissionOracle: Send + Sync {
    fn has_permission(&self, user: &User, table: &str, action: Action) -> bool;
}

/// Grants everything. For system jobs and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionOracle for AllowAll {
    fn has_permission(&self, _user: &User, _table: &str, _action: Action) -> bool {
        true
    }
}

/// Checks the grants carried on the user.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserGrants;

impl PermissionOracle for UserGrants {
    fn has_permission(&self, user: &User, table: &str, action: Action) -> bool {
        user.permissions.contains(&format!("{table}-{action}"))
    }
}

pub fn verify(oracle: &dyn PermissionOracle, user: &User, table: &str, action: Action) -> Result<()> {
    if oracle.has_permission(user, table, action) {
        Ok(())
    } else {
        log::debug!("user {} lacks {action} on {table}", user.id);
        Err(RecordbaseError::PermissionDenied {
            table: table.to_string(),
            action: action.to_string(),
        })
    }
}
