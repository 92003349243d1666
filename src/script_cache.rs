use moka::future::Cache;
use std::sync::Arc;
use tracing::debug;
use tracing::instrument;

use crate::error::StoreError;
use crate::script::Script;
use crate::script::ScriptShape;
use crate::script_gen;
use crate::store::Store;

/// Compiled scripts by shape.
///
/// Entries are never invalidated: a shape always compiles to the same program. Two tasks racing to compile the same
/// shape is harmless.
#[derive(Debug, Clone)]
pub struct ScriptCache {
    scripts: Cache<ScriptShape, Arc<Script>>,
}

impl Default for ScriptCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptCache {
    pub fn new() -> Self {
        Self {
            scripts: Cache::builder().name("wt-cache scripts").build(),
        }
    }

    pub async fn script(&self, shape: &ScriptShape) -> Arc<Script> {
        self.scripts
            .get_with_by_ref(shape, async { Arc::new(script_gen::build(shape)) })
            .await
    }

    /// Runs the script of the given shape by hash, falling back to the full script once if the store has lost it.
    /// Any other failure is returned as is.
    #[instrument(level = "trace", skip_all, fields(shape = %shape.label()))]
    pub async fn eval(
        &self,
        store: &dyn Store,
        shape: &ScriptShape,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let script = self.script(shape).await;

        match store.eval_hash(script.hash(), keys, args).await {
            Err(StoreError::NoScript(hash)) => {
                debug!("store doesn't hold script {hash}, sending full source");
                store.eval(&script, keys, args).await
            }
            outcome => outcome,
        }
    }

    pub fn len(&self) -> u64 {
        self.scripts.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
