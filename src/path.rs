//! Path resolver (C1). Maps dotted variable paths (`answers.x.y`) to values
//! inside a submission context. Never throws; missing intermediates yield
//! `None`. Grounded on the teacher's `path_utils.rs` pointer conversions and
//! `rlogic/evaluator.rs::get_var`'s object-only walk.

use serde_json::Value;
use smallvec::SmallVec;

/// The three scopes a dotted path may address, per spec §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Answers,
    Computed,
    Metadata,
}

impl Scope {
    fn parse(segment: &str) -> Option<Self> {
        match segment {
            "answers" => Some(Scope::Answers),
            "computed" => Some(Scope::Computed),
            "metadata" => Some(Scope::Metadata),
            _ => None,
        }
    }
}

/// The three scope maps visible to expression and compute evaluation.
pub struct Context<'a> {
    pub answers: &'a Value,
    pub computed: &'a Value,
    pub metadata: &'a Value,
}

impl<'a> Context<'a> {
    pub fn new(answers: &'a Value, computed: &'a Value, metadata: &'a Value) -> Self {
        Self {
            answers,
            computed,
            metadata,
        }
    }

    fn scope_value(&self, scope: Scope) -> &'a Value {
        match scope {
            Scope::Answers => self.answers,
            Scope::Computed => self.computed,
            Scope::Metadata => self.metadata,
        }
    }

    /// Resolve `scope.seg1.seg2` against this context. Returns `None` for an
    /// unrecognised scope, a missing key at any depth, or a non-object
    /// container along the way (arrays are not indexed by this resolver).
    pub fn resolve(&self, dotted_path: &str) -> Option<&'a Value> {
        let mut segments: SmallVec<[&str; 6]> = dotted_path.split('.').collect();
        if segments.is_empty() {
            return None;
        }
        let scope = Scope::parse(segments.remove(0))?;
        resolve_in(self.scope_value(scope), &segments)
    }
}

fn resolve_in<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        match current {
            Value::Object(map) => current = map.get(*segment)?,
            _ => return None,
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_answer() {
        let answers = json!({"x": {"y": 7}});
        let computed = json!({});
        let metadata = json!({});
        let ctx = Context::new(&answers, &computed, &metadata);
        assert_eq!(ctx.resolve("answers.x.y"), Some(&json!(7)));
    }

    #[test]
    fn missing_intermediate_is_none() {
        let answers = json!({"x": 1});
        let computed = json!({});
        let metadata = json!({});
        let ctx = Context::new(&answers, &computed, &metadata);
        assert_eq!(ctx.resolve("answers.x.y"), None);
    }

    #[test]
    fn unknown_scope_is_none() {
        let answers = json!({});
        let computed = json!({});
        let metadata = json!({});
        let ctx = Context::new(&answers, &computed, &metadata);
        assert_eq!(ctx.resolve("bogus.y"), None);
    }

    #[test]
    fn array_is_not_indexed() {
        let answers = json!({"list": [1, 2, 3]});
        let computed = json!({});
        let metadata = json!({});
        let ctx = Context::new(&answers, &computed, &metadata);
        assert_eq!(ctx.resolve("answers.list.0"), None);
    }
}
