//! Entities (spec §3). Ownership is by primary key in the backing store;
//! these are plain data, not active records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateStatus {
    Draft,
    Published,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Boolean,
    Date,
    Time,
    Select,
    MultiSelect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Eligibility,
    GroupAssignment,
    Scheduling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormTemplate {
    pub id: i64,
    pub study_id: String,
    pub name: String,
    pub version: u32,
    pub status: TemplateStatus,
    pub created_at: DateTime<Utc>,
}

/// Per-field constraints (§4.4). All optional; interpreted by the validator
/// according to the field's `type`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldValidation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(rename = "minLength", skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(rename = "maxLength", skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    pub id: i64,
    pub form_template_id: i64,
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub validation: FieldValidation,
    pub order_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormLogic {
    pub id: i64,
    pub form_template_id: i64,
    pub logic: Value,
    pub order_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeDefinition {
    pub id: i64,
    pub study_id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub definition: Value,
    pub version: u32,
    pub status: TemplateStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    pub id: i64,
    pub study_id: String,
    pub rule_type: RuleType,
    pub name: String,
    pub version: u32,
    pub status: TemplateStatus,
    pub expression: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormSubmission {
    pub id: i64,
    pub study_id: String,
    pub participant_id: String,
    pub form_template_id: i64,
    pub answers: Value,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputedValue {
    pub id: i64,
    pub submission_id: i64,
    pub key: String,
    pub value: Value,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub id: i64,
    pub submission_id: i64,
    pub rule_set_id: i64,
    pub result_bool: bool,
    pub result_detail: Value,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantAssignment {
    pub id: i64,
    pub participant_id: String,
    pub study_id: String,
    pub group_key: String,
    pub group_value: String,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulePlan {
    pub id: i64,
    pub participant_id: String,
    pub study_id: String,
    pub plan: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub study_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    pub action: String,
    pub entity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<i64>,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to append an audit row; the id/timestamp are assigned by
/// the sink.
#[derive(Debug, Clone)]
pub struct NewAuditLog {
    pub study_id: Option<String>,
    pub participant_id: Option<String>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<i64>,
    pub detail: Value,
}
