//! Compiled-tree cache: avoids recompiling the same `ComputeDefinition`'s or
//! `RuleSet`'s JSON body across submissions. Grounded on the teacher's
//! `eval_cache.rs::CompiledLogicStore`, a `dashmap`-backed cache keyed by
//! logic id and version.

use dashmap::DashMap;

use crate::compute::{self, ComputeExpr};
use crate::expr::{self, Expression};

/// Cache key: an entity id paired with its version, so a republished
/// definition at a new version recompiles rather than reusing stale state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    id: i64,
    version: u32,
}

/// Process-wide cache of compiled compute expressions.
pub struct ComputeCache {
    entries: DashMap<CacheKey, ComputeExpr>,
}

impl ComputeCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Returns the compiled tree for `(id, version)`, compiling and caching
    /// it on first use.
    pub fn get_or_compile(&self, id: i64, version: u32, definition: &serde_json::Value) -> ComputeExpr {
        let key = CacheKey { id, version };
        if let Some(existing) = self.entries.get(&key) {
            return existing.clone();
        }
        let compiled = compute::compile(definition);
        self.entries.insert(key, compiled.clone());
        compiled
    }
}

impl Default for ComputeCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide cache of compiled rule-set expressions.
pub struct ExpressionCache {
    entries: DashMap<CacheKey, Expression>,
}

impl ExpressionCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get_or_compile(&self, id: i64, version: u32, expression: &serde_json::Value) -> Expression {
        let key = CacheKey { id, version };
        if let Some(existing) = self.entries.get(&key) {
            return existing.clone();
        }
        let compiled = expr::compile(expression);
        self.entries.insert(key, compiled.clone());
        compiled
    }
}

impl Default for ExpressionCache {
    fn default() -> Self {
        Self::new()
    }
}
