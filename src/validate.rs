//! Answer validator (C4): validates a raw answer map against an ordered list
//! of field definitions. Grounded on spec §4.4 and the teacher's per-field
//! rule tables in `parse_schema/common.rs`; the `text` pattern constraint
//! reuses the teacher's `once_cell`-cached-regex idiom.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::FieldIssue;
use crate::model::{FieldType, FormField};

static REGEX_CACHE: Lazy<Mutex<HashMap<String, Option<Regex>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn compiled_pattern(pattern: &str) -> Option<Regex> {
    let mut cache = REGEX_CACHE.lock().unwrap();
    if let Some(entry) = cache.get(pattern) {
        return entry.clone();
    }
    let compiled = Regex::new(pattern).ok();
    if compiled.is_none() {
        tracing::warn!(pattern, "ignoring invalid text validation pattern");
    }
    cache.insert(pattern.to_string(), compiled.clone());
    compiled
}

fn is_absent(value: Option<&Value>) -> bool {
    match value {
        None => true,
        Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Validates `answers` against `fields`, in field order. Returns every
/// collected issue; an empty vec means the answers are valid.
pub fn validate(fields: &[FormField], answers: &Value) -> Vec<FieldIssue> {
    let empty = serde_json::Map::new();
    let map = answers.as_object().unwrap_or(&empty);
    let mut issues = Vec::new();

    for field in fields {
        let raw = map.get(&field.key);
        if is_absent(raw) {
            if field.required {
                issues.push(FieldIssue::new(&field.key, "Field is required"));
            }
            continue;
        }
        let value = raw.expect("checked present above");
        if let Some(message) = check_type(field, value) {
            issues.push(FieldIssue::new(&field.key, message));
        }
    }

    issues
}

fn check_type(field: &FormField, value: &Value) -> Option<&'static str> {
    match field.field_type {
        FieldType::Number => {
            let Some(n) = (match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }) else {
                return Some("Must be a number");
            };
            if !n.is_finite() {
                return Some("Must be a number");
            }
            if let Some(min) = field.validation.min {
                if n < min {
                    return Some("Value is below the minimum");
                }
            }
            if let Some(max) = field.validation.max {
                if n > max {
                    return Some("Value is above the maximum");
                }
            }
            None
        }
        FieldType::Boolean => {
            if !matches!(value, Value::Bool(_)) {
                return Some("Must be a boolean");
            }
            None
        }
        FieldType::Date => match value {
            Value::String(s) if !s.is_empty() && crate::expr::parse_iso_to_epoch_ms(s).is_some() => None,
            _ => Some("Must be a valid date"),
        },
        FieldType::Time => match value {
            Value::String(s) if time_pattern().is_match(s) => None,
            _ => Some("Must be a valid time"),
        },
        FieldType::Select => match value {
            Value::String(s) if field.options.iter().any(|o| o == s) => None,
            _ => Some("Must be one of the allowed options"),
        },
        FieldType::MultiSelect => match value {
            Value::Array(items) => {
                if items
                    .iter()
                    .all(|item| matches!(item, Value::String(s) if field.options.iter().any(|o| o == s)))
                {
                    None
                } else {
                    Some("Must be a list of allowed options")
                }
            }
            _ => Some("Must be a list of allowed options"),
        },
        FieldType::Text => check_text(field, value),
    }
}

fn check_text(field: &FormField, value: &Value) -> Option<&'static str> {
    let Value::String(s) = value else {
        return Some("Must be text");
    };
    if let Some(min_len) = field.validation.min_length {
        if s.len() < min_len {
            return Some("Text is too short");
        }
    }
    if let Some(max_len) = field.validation.max_length {
        if s.len() > max_len {
            return Some("Text is too long");
        }
    }
    if let Some(pattern) = &field.validation.pattern {
        if let Some(re) = compiled_pattern(pattern) {
            if !re.is_match(s) {
                return Some("Text does not match the required pattern");
            }
        }
    }
    None
}

fn time_pattern() -> &'static Regex {
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,2}:\d{2}(:\d{2})?$").unwrap());
    &RE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldValidation, TemplateStatus};
    use serde_json::json;

    fn field(key: &str, field_type: FieldType, required: bool, validation: FieldValidation) -> FormField {
        FormField {
            id: 1,
            form_template_id: 1,
            key: key.to_string(),
            label: key.to_string(),
            field_type,
            required,
            options: vec![],
            validation,
            order_index: 0,
        }
    }

    #[test]
    fn s5_validation_failure_does_not_short_circuit_other_fields() {
        let fields = vec![field(
            "age",
            FieldType::Number,
            true,
            FieldValidation {
                min: Some(18.0),
                ..Default::default()
            },
        )];
        let issues = validate(&fields, &json!({"age": 15}));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].key, "age");
    }

    #[test]
    fn required_missing_is_one_issue() {
        let fields = vec![field("name", FieldType::Text, true, FieldValidation::default())];
        let issues = validate(&fields, &json!({}));
        assert_eq!(issues, vec![FieldIssue::new("name", "Field is required")]);
    }

    #[test]
    fn optional_absent_is_skipped() {
        let fields = vec![field("nickname", FieldType::Text, false, FieldValidation::default())];
        let issues = validate(&fields, &json!({}));
        assert!(issues.is_empty());
        let _ = TemplateStatus::Draft;
    }

    #[test]
    fn select_must_be_in_options() {
        let mut f = field("color", FieldType::Select, true, FieldValidation::default());
        f.options = vec!["red".into(), "blue".into()];
        assert!(validate(&[f.clone()], &json!({"color": "red"})).is_empty());
        assert_eq!(validate(&[f], &json!({"color": "green"})).len(), 1);
    }

    #[test]
    fn invalid_regex_is_ignored() {
        let mut f = field("code", FieldType::Text, true, FieldValidation::default());
        f.validation.pattern = Some("(unterminated".to_string());
        assert!(validate(&[f], &json!({"code": "anything"})).is_empty());
    }

    #[test]
    fn non_numeric_types_fail_the_number_check() {
        let f = field("age", FieldType::Number, true, FieldValidation::default());
        for bad in [json!(true), json!([]), json!({}), json!("not-a-number")] {
            let issues = validate(&[f.clone()], &json!({"age": bad}));
            assert_eq!(issues.len(), 1, "expected an issue for {bad:?}");
            assert_eq!(issues[0].message, "Must be a number");
        }
    }
}
