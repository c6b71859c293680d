//! Engine-wide configuration, builder-style (grounded on `RLogicConfig` in
//! the teacher's `rlogic/config.rs`).

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Maximum recursion depth for the expression and compute evaluators.
    pub recursion_limit: usize,
    /// Cache compiled `text` field validation regexes across calls.
    pub cache_compiled_regex: bool,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_cache_compiled_regex(mut self, enable: bool) -> Self {
        self.cache_compiled_regex = enable;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recursion_limit: 64,
            cache_compiled_regex: true,
        }
    }
}
