//! Expression evaluator (C2): a pure, total function `(Expression, Context)
//! -> bool`. Grounded on the teacher's `CompiledLogic` (a tree compiled once
//! from `serde_json::Value`) and `rlogic/evaluator/comparison.rs`'s
//! comparison ladder, adapted to spec §4.2's closed operator set.

use std::cmp::Ordering;

use ahash::AHashSet;
use chrono::NaiveDate;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::path::Context;

/// A variable reference or an inline literal (spec §4.2 `Operand`).
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Var(String),
    Literal(Value),
}

impl Operand {
    fn compile(value: &Value) -> Self {
        if let Value::Object(map) = value {
            if let Some(path) = map.get("var").and_then(Value::as_str) {
                return Operand::Var(path.to_string());
            }
            if let Some(literal) = map.get("value") {
                return Operand::Literal(literal.clone());
            }
        }
        Operand::Literal(value.clone())
    }

    fn resolve(&self, ctx: &Context<'_>) -> Value {
        match self {
            Operand::Var(path) => ctx.resolve(path).cloned().unwrap_or(Value::Null),
            Operand::Literal(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// The compiled expression tree. `Unknown` stands in for any malformed or
/// unrecognised node — evaluating it always yields `false`, matching §4.2's
/// "unknown operator ⇒ false".
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    All(Vec<Expression>),
    Any(Vec<Expression>),
    Not(Box<Expression>),
    Exists(Operand),
    Compare(CompareOp, Operand, Operand),
    In {
        left: Operand,
        right: Operand,
        negate: bool,
    },
    Between {
        left: Operand,
        min: Operand,
        max: Operand,
    },
    Unknown,
}

/// Compile a JSON expression tree. Infallible: a node that doesn't match
/// the grammar compiles to `Expression::Unknown` rather than an error,
/// since malformed declarative data is not a structural payload error.
pub fn compile(value: &Value) -> Expression {
    let Some(map) = value.as_object() else {
        return Expression::Unknown;
    };

    if let Some(list) = map.get("all") {
        return Expression::All(compile_list(list));
    }
    if let Some(list) = map.get("any") {
        return Expression::Any(compile_list(list));
    }
    if let Some(inner) = map.get("not") {
        return Expression::Not(Box::new(compile(inner)));
    }

    let op = map.get("op").and_then(Value::as_str).unwrap_or("");
    match op {
        "exists" => match map.get("left").or_else(|| map.get("value")) {
            Some(v) => Expression::Exists(Operand::compile(v)),
            None => Expression::Unknown,
        },
        "==" | "!=" | ">" | ">=" | "<" | "<=" => {
            match (map.get("left"), map.get("right")) {
                (Some(l), Some(r)) => {
                    let cmp = match op {
                        "==" => CompareOp::Eq,
                        "!=" => CompareOp::Ne,
                        ">" => CompareOp::Gt,
                        ">=" => CompareOp::Ge,
                        "<" => CompareOp::Lt,
                        _ => CompareOp::Le,
                    };
                    Expression::Compare(cmp, Operand::compile(l), Operand::compile(r))
                }
                _ => Expression::Unknown,
            }
        }
        "in" | "not_in" => match (map.get("left"), map.get("right")) {
            (Some(l), Some(r)) => Expression::In {
                left: Operand::compile(l),
                right: Operand::compile(r),
                negate: op == "not_in",
            },
            _ => Expression::Unknown,
        },
        "between" => match (map.get("left"), map.get("min"), map.get("max")) {
            (Some(l), Some(mn), Some(mx)) => Expression::Between {
                left: Operand::compile(l),
                min: Operand::compile(mn),
                max: Operand::compile(mx),
            },
            _ => Expression::Unknown,
        },
        _ => Expression::Unknown,
    }
}

fn compile_list(value: &Value) -> Vec<Expression> {
    value
        .as_array()
        .map(|items| items.iter().map(compile).collect())
        .unwrap_or_default()
}

/// Evaluate a compiled expression against a context. The only error this
/// can produce is `DepthExceeded`; every other outcome is a plain `bool`.
pub fn evaluate(expr: &Expression, ctx: &Context<'_>, recursion_limit: usize) -> EngineResult<bool> {
    eval_with_depth(expr, ctx, 0, recursion_limit)
}

fn eval_with_depth(
    expr: &Expression,
    ctx: &Context<'_>,
    depth: usize,
    limit: usize,
) -> EngineResult<bool> {
    if depth > limit {
        return Err(EngineError::DepthExceeded);
    }
    let next = depth + 1;

    match expr {
        Expression::All(items) => {
            for item in items {
                if !eval_with_depth(item, ctx, next, limit)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expression::Any(items) => {
            for item in items {
                if eval_with_depth(item, ctx, next, limit)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Expression::Not(inner) => Ok(!eval_with_depth(inner, ctx, next, limit)?),
        Expression::Exists(operand) => Ok(is_present(&operand.resolve(ctx))),
        Expression::Compare(op, left, right) => {
            let a = left.resolve(ctx);
            let b = right.resolve(ctx);
            Ok(compare_values(*op, &a, &b))
        }
        Expression::In { left, right, negate } => {
            let needle = left.resolve(ctx);
            let haystack = right.resolve(ctx);
            let member = match haystack.as_array() {
                Some(items) => array_contains(&needle, items),
                None => false,
            };
            Ok(member != *negate)
        }
        Expression::Between { left, min, max } => {
            let l = to_comparable(&left.resolve(ctx));
            let lo = to_comparable(&min.resolve(ctx));
            let hi = to_comparable(&max.resolve(ctx));
            Ok(match (l, lo, hi) {
                (Some(l), Some(lo), Some(hi)) => {
                    ordering_of(&l, &lo).map(|o| o != Ordering::Less).unwrap_or(false)
                        && ordering_of(&l, &hi).map(|o| o != Ordering::Greater).unwrap_or(false)
                }
                _ => false,
            })
        }
        Expression::Unknown => Ok(false),
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        _ => true,
    }
}

fn array_contains(needle: &Value, haystack: &[Value]) -> bool {
    if haystack.len() > 32 {
        if let Some(key) = scalar_key(needle) {
            let mut all_scalar = true;
            let set: AHashSet<String> = haystack
                .iter()
                .filter_map(|item| {
                    let k = scalar_key(item);
                    if k.is_none() {
                        all_scalar = false;
                    }
                    k
                })
                .collect();
            if all_scalar {
                return set.contains(&key);
            }
        }
    }
    haystack.iter().any(|item| item == needle)
}

/// A type-discriminated key for the hash-set fast path: values that are
/// `==`-unequal (e.g. `Bool(true)` vs `String("true")`) must never collapse
/// to the same key.
fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some("null:".to_string()),
        Value::Bool(b) => Some(format!("b:{b}")),
        Value::Number(n) => Some(format!("n:{n}")),
        Value::String(s) => Some(format!("s:{s}")),
        _ => None,
    }
}

/// The comparable key a value coerces to for ordering comparisons (§4.2,
/// §9's "Comparable enum with an explicit total order and a null bottom").
#[derive(Debug, Clone, PartialEq)]
enum Comparable {
    Num(f64),
    Str(String),
}

fn to_comparable(value: &Value) -> Option<Comparable> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).map(Comparable::Num),
        Value::String(s) => {
            if let Ok(f) = s.parse::<f64>() {
                if f.is_finite() {
                    return Some(Comparable::Num(f));
                }
            }
            if let Some(ms) = parse_iso_to_epoch_ms(s) {
                return Some(Comparable::Num(ms as f64));
            }
            Some(Comparable::Str(s.trim().to_string()))
        }
        _ => None,
    }
}

fn ordering_of(a: &Comparable, b: &Comparable) -> Option<Ordering> {
    match (a, b) {
        (Comparable::Num(x), Comparable::Num(y)) => x.partial_cmp(y),
        (Comparable::Str(x), Comparable::Str(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compare_values(op: CompareOp, a: &Value, b: &Value) -> bool {
    match op {
        CompareOp::Eq => a == b,
        CompareOp::Ne => a != b,
        CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
            match (to_comparable(a), to_comparable(b)) {
                (Some(ca), Some(cb)) => match ordering_of(&ca, &cb) {
                    Some(ord) => match op {
                        CompareOp::Gt => ord == Ordering::Greater,
                        CompareOp::Ge => ord != Ordering::Less,
                        CompareOp::Lt => ord == Ordering::Less,
                        CompareOp::Le => ord != Ordering::Greater,
                        _ => unreachable!(),
                    },
                    None => false,
                },
                _ => false,
            }
        }
    }
}

/// ISO date/date-time parse, epoch milliseconds. Supports `YYYY-MM-DD` and
/// `YYYY-MM-DDTHH:MM:SS(.fff)Z`, mirroring the formats the teacher's date
/// functions accept in `rlogic/evaluator.rs`.
pub(crate) fn parse_iso_to_epoch_ms(s: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|ndt| ndt.and_utc().timestamp_millis());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(answers: &'a Value, computed: &'a Value, metadata: &'a Value) -> Context<'a> {
        Context::new(answers, computed, metadata)
    }

    #[test]
    fn empty_all_is_true_empty_any_is_false() {
        let answers = json!({});
        let c = json!({});
        let m = json!({});
        let context = ctx(&answers, &c, &m);
        assert!(evaluate(&compile(&json!({"all": []})), &context, 64).unwrap());
        assert!(!evaluate(&compile(&json!({"any": []})), &context, 64).unwrap());
    }

    #[test]
    fn not_negates() {
        let answers = json!({"x": true});
        let c = json!({});
        let m = json!({});
        let context = ctx(&answers, &c, &m);
        let e = compile(&json!({"not": {"op": "==", "left": {"var": "answers.x"}, "right": true}}));
        assert!(!evaluate(&e, &context, 64).unwrap());
    }

    #[test]
    fn s2_logical_composition() {
        let answers = json!({"age": 25, "cohort": "A"});
        let computed = json!({"score": 12});
        let metadata = json!({"site": "main"});
        let context = ctx(&answers, &computed, &metadata);
        let e = compile(&json!({
            "all": [
                {"op": ">=", "left": {"var": "answers.age"}, "right": 18},
                {"op": "in", "left": {"var": "answers.cohort"}, "right": ["A", "B"]},
                {"any": [
                    {"op": "==", "left": {"var": "metadata.site"}, "right": "main"},
                    {"op": ">", "left": {"var": "computed.score"}, "right": 15}
                ]}
            ]
        }));
        assert!(evaluate(&e, &context, 64).unwrap());
    }

    #[test]
    fn s3_negation_and_between() {
        let answers = json!({});
        let computed = json!({"score": 7});
        let metadata = json!({});
        let context = ctx(&answers, &computed, &metadata);
        let e = compile(&json!({
            "not": {"op": "between", "left": {"var": "computed.score"}, "min": 8, "max": 10}
        }));
        assert!(evaluate(&e, &context, 64).unwrap());
    }

    #[test]
    fn not_in_on_non_sequence_is_true() {
        let answers = json!({"x": "a"});
        let c = json!({});
        let m = json!({});
        let context = ctx(&answers, &c, &m);
        let e = compile(&json!({"op": "not_in", "left": {"var": "answers.x"}, "right": "not-an-array"}));
        assert!(evaluate(&e, &context, 64).unwrap());
    }

    #[test]
    fn comparison_has_no_coercion_for_equality() {
        let answers = json!({"n": 5});
        let c = json!({});
        let m = json!({});
        let context = ctx(&answers, &c, &m);
        let e = compile(&json!({"op": "==", "left": {"var": "answers.n"}, "right": "5"}));
        assert!(!evaluate(&e, &context, 64).unwrap());
    }

    #[test]
    fn in_fast_path_does_not_conflate_types_above_threshold() {
        let answers = json!({});
        let c = json!({});
        let m = json!({});
        let context = ctx(&answers, &c, &m);
        let mut haystack: Vec<Value> = (0..40).map(|n| json!(n.to_string())).collect();
        haystack.push(json!(true));
        let e = compile(&json!({"op": "in", "left": {"value": "true"}, "right": Value::Array(haystack)}));
        // "true" (a string) must not match Bool(true) even though their scalar
        // text representations coincide.
        assert!(!evaluate(&e, &context, 64).unwrap());
    }

    #[test]
    fn depth_exceeded_errors() {
        let answers = json!({});
        let c = json!({});
        let m = json!({});
        let context = ctx(&answers, &c, &m);
        let mut expr = Expression::Not(Box::new(Expression::Unknown));
        for _ in 0..10 {
            expr = Expression::Not(Box::new(expr));
        }
        assert_eq!(evaluate(&expr, &context, 3), Err(EngineError::DepthExceeded));
    }
}
