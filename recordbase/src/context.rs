use parking_lot::RwLock;
use std::sync::Arc;

use crate::codec::Layout;
use crate::columns::ColumnTree;
use crate::error::{RecordbaseError, Result};
use crate::meta::{Model, RecordMeta};
use crate::validation::Validator;

/// Everything derived from one metadata model and one live schema.
/// Built in full before it is shared and never mutated afterwards.
#[derive(Debug)]
pub struct Context {
    pub model: Arc<Model>,
    pub layout: Layout,
    pub validator: Validator,
    pub columns: ColumnTree,
}

impl Context {
    /// Compile every column tree and the validator. Expression errors
    /// abort here rather than at query time.
    pub fn new(model: Arc<Model>, layout: Layout) -> Result<Self> {
        let columns = ColumnTree::build(&model)?;
        let validator = Validator::new(model.clone())?;
        log::info!("context ready: {} tables", model.tables().count());
        Ok(Context {
            model,
            layout,
            validator,
            columns,
        })
    }

    /// Context whose layout follows declaration order.
    pub fn declared(model: Arc<Model>) -> Result<Self> {
        let layout = Layout::declared(&model);
        Context::new(model, layout)
    }

    /// Meta of a table named in a request.
    pub fn table(&self, name: &str) -> Result<&Arc<RecordMeta>> {
        self.model
            .table(name)
            .ok_or_else(|| RecordbaseError::InvalidRequest(format!("unknown table '{name}'")))
    }
}

/// The current context, swapped whole when the model or schema changes.
#[derive(Debug)]
pub struct SharedContext {
    current: RwLock<Arc<Context>>,
}

impl SharedContext {
    pub fn new(context: Context) -> Self {
        SharedContext {
            current: RwLock::new(Arc::new(context)),
        }
    }

    pub fn current(&self) -> Arc<Context> {
        self.current.read().clone()
    }

    pub fn replace(&self, context: Context) {
        *self.current.write() = Arc::new(context);
    }
}
