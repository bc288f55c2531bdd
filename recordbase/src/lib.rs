pub mod api;
pub mod backend;
pub mod codec;
pub mod columns;
pub mod compiler;
pub mod config;
pub mod context;
pub mod error;
pub mod ledger;
pub mod meta;
pub mod naming;
pub mod permission;
pub mod query;
pub mod sql;
pub mod store;
pub mod sync;
pub mod validation;

pub use api::{Request, Response, Service};
pub use backend::{Backend, Database, PgBackend};
pub use config::Config;
pub use context::{Context, SharedContext};
pub use error::{RecordbaseError, Result};
pub use ledger::PatchLedger;
pub use meta::{parse_model, parse_model_str, Meta, Model, RecordMeta};
pub use permission::{Action, PermissionOracle, User};
pub use store::{Change, ChangeListener, RecordStore};
pub use sync::{synchronize, SyncReport};
