//! Persistence boundary. Not part of the declarative pipeline itself, but
//! the seam the orchestrator (C5) and assembler (C6) are coded against.
//! Grounded on the teacher's repository-style `JSONEval` state holder,
//! generalised into an async trait over the ten tables, with an
//! `InMemoryStore` reference implementation standing in for a relational
//! backing store.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::model::*;

/// One operation per entity read/write the orchestrator and assembler need.
/// A real deployment implements this against a relational database; tests
/// and the bundled binary use `InMemoryStore`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_form_template(&self, study_id: &str, name: &str, version: u32, status: TemplateStatus) -> FormTemplate;
    async fn fetch_form_template(&self, study_id: &str, id: i64) -> Option<FormTemplate>;

    async fn insert_form_field(&self, field: FormFieldInput) -> FormField;
    async fn fetch_form_fields(&self, form_template_id: i64) -> Vec<FormField>;

    async fn insert_form_logic(&self, form_template_id: i64, logic: serde_json::Value, order_index: i64) -> FormLogic;

    async fn insert_compute_definition(
        &self,
        study_id: &str,
        key: &str,
        kind: &str,
        definition: serde_json::Value,
        version: u32,
        status: TemplateStatus,
    ) -> EngineResult<ComputeDefinition>;
    async fn fetch_published_compute_definitions(&self, study_id: &str) -> Vec<ComputeDefinition>;

    async fn insert_rule_set(
        &self,
        study_id: &str,
        rule_type: RuleType,
        name: &str,
        version: u32,
        status: TemplateStatus,
        expression: serde_json::Value,
    ) -> RuleSet;
    async fn fetch_published_rule_sets(&self, study_id: &str) -> Vec<RuleSet>;

    async fn insert_submission(
        &self,
        study_id: &str,
        participant_id: &str,
        form_template_id: i64,
        answers: serde_json::Value,
    ) -> FormSubmission;
    async fn latest_submission(&self, study_id: &str, participant_id: &str) -> Option<FormSubmission>;

    async fn insert_computed_value(&self, submission_id: i64, key: &str, value: serde_json::Value) -> ComputedValue;
    async fn computed_values_for_submission(&self, submission_id: i64) -> Vec<ComputedValue>;

    async fn insert_rule_evaluation(
        &self,
        submission_id: i64,
        rule_set_id: i64,
        result_bool: bool,
        result_detail: serde_json::Value,
    ) -> RuleEvaluation;
    async fn rule_evaluations_for_submission(&self, submission_id: i64) -> Vec<RuleEvaluation>;

    async fn insert_assignment(
        &self,
        participant_id: &str,
        study_id: &str,
        group_key: &str,
        group_value: &str,
    ) -> ParticipantAssignment;
    async fn assignments_for_participant(&self, study_id: &str, participant_id: &str) -> Vec<ParticipantAssignment>;

    async fn insert_schedule_plan(&self, participant_id: &str, study_id: &str, plan: serde_json::Value) -> SchedulePlan;
    async fn latest_schedule_plan(&self, study_id: &str, participant_id: &str) -> Option<SchedulePlan>;
}

/// Arguments for inserting a `FormField`; grouped because the admin
/// endpoint accepts all of them in one request body.
#[derive(Debug, Clone)]
pub struct FormFieldInput {
    pub form_template_id: i64,
    pub key: String,
    pub label: String,
    pub field_type: FieldType,
    pub required: bool,
    pub options: Vec<String>,
    pub validation: FieldValidation,
    pub order_index: i64,
}

#[derive(Default)]
struct State {
    next_id: i64,
    form_templates: Vec<FormTemplate>,
    form_fields: Vec<FormField>,
    form_logic: Vec<FormLogic>,
    compute_definitions: Vec<ComputeDefinition>,
    rule_sets: Vec<RuleSet>,
    submissions: Vec<FormSubmission>,
    computed_values: Vec<ComputedValue>,
    rule_evaluations: Vec<RuleEvaluation>,
    assignments: Vec<ParticipantAssignment>,
    schedule_plans: Vec<SchedulePlan>,
    audit_logs: Vec<AuditLog>,
}

impl State {
    fn next(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Reference `Store` implementation backed by in-process vectors guarded by
/// a single `tokio::sync::RwLock`. Sufficient for tests and for driving the
/// wire layer without an external database.
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// Snapshot of every audit row recorded so far, oldest first. Exposed
    /// for tests and for an admin audit-log viewer.
    pub async fn audit_logs(&self) -> Vec<AuditLog> {
        self.state.read().await.audit_logs.clone()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl crate::audit::AuditSink for InMemoryStore {
    async fn emit(&self, record: NewAuditLog) {
        let mut state = self.state.write().await;
        let id = state.next();
        state.audit_logs.push(AuditLog {
            id,
            study_id: record.study_id,
            participant_id: record.participant_id,
            action: record.action,
            entity_type: record.entity_type,
            entity_id: record.entity_id,
            detail: record.detail,
            created_at: Utc::now(),
        });
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_form_template(&self, study_id: &str, name: &str, version: u32, status: TemplateStatus) -> FormTemplate {
        let mut state = self.state.write().await;
        let id = state.next();
        let template = FormTemplate {
            id,
            study_id: study_id.to_string(),
            name: name.to_string(),
            version,
            status,
            created_at: Utc::now(),
        };
        state.form_templates.push(template.clone());
        template
    }

    async fn fetch_form_template(&self, study_id: &str, id: i64) -> Option<FormTemplate> {
        let state = self.state.read().await;
        state
            .form_templates
            .iter()
            .find(|t| t.id == id && t.study_id == study_id)
            .cloned()
    }

    async fn insert_form_field(&self, field: FormFieldInput) -> FormField {
        let mut state = self.state.write().await;
        let id = state.next();
        let row = FormField {
            id,
            form_template_id: field.form_template_id,
            key: field.key,
            label: field.label,
            field_type: field.field_type,
            required: field.required,
            options: field.options,
            validation: field.validation,
            order_index: field.order_index,
        };
        state.form_fields.push(row.clone());
        row
    }

    async fn fetch_form_fields(&self, form_template_id: i64) -> Vec<FormField> {
        let state = self.state.read().await;
        let mut fields: Vec<FormField> = state
            .form_fields
            .iter()
            .filter(|f| f.form_template_id == form_template_id)
            .cloned()
            .collect();
        fields.sort_by_key(|f| f.order_index);
        fields
    }

    async fn insert_form_logic(&self, form_template_id: i64, logic: serde_json::Value, order_index: i64) -> FormLogic {
        let mut state = self.state.write().await;
        let id = state.next();
        let row = FormLogic {
            id,
            form_template_id,
            logic,
            order_index,
        };
        state.form_logic.push(row.clone());
        row
    }

    async fn insert_compute_definition(
        &self,
        study_id: &str,
        key: &str,
        kind: &str,
        definition: serde_json::Value,
        version: u32,
        status: TemplateStatus,
    ) -> EngineResult<ComputeDefinition> {
        let mut state = self.state.write().await;
        if status == TemplateStatus::Published
            && state
                .compute_definitions
                .iter()
                .any(|d| d.study_id == study_id && d.key == key && d.status == TemplateStatus::Published)
        {
            return Err(EngineError::InvalidPayload(format!(
                "a published compute definition with key `{key}` already exists for this study"
            )));
        }
        let id = state.next();
        let row = ComputeDefinition {
            id,
            study_id: study_id.to_string(),
            key: key.to_string(),
            kind: kind.to_string(),
            definition,
            version,
            status,
        };
        state.compute_definitions.push(row.clone());
        Ok(row)
    }

    async fn fetch_published_compute_definitions(&self, study_id: &str) -> Vec<ComputeDefinition> {
        let state = self.state.read().await;
        state
            .compute_definitions
            .iter()
            .filter(|d| d.study_id == study_id && d.status == TemplateStatus::Published)
            .cloned()
            .collect()
    }

    async fn insert_rule_set(
        &self,
        study_id: &str,
        rule_type: RuleType,
        name: &str,
        version: u32,
        status: TemplateStatus,
        expression: serde_json::Value,
    ) -> RuleSet {
        let mut state = self.state.write().await;
        let id = state.next();
        let row = RuleSet {
            id,
            study_id: study_id.to_string(),
            rule_type,
            name: name.to_string(),
            version,
            status,
            expression,
            created_at: Utc::now(),
        };
        state.rule_sets.push(row.clone());
        row
    }

    async fn fetch_published_rule_sets(&self, study_id: &str) -> Vec<RuleSet> {
        let state = self.state.read().await;
        state
            .rule_sets
            .iter()
            .filter(|r| r.study_id == study_id && r.status == TemplateStatus::Published)
            .cloned()
            .collect()
    }

    async fn insert_submission(
        &self,
        study_id: &str,
        participant_id: &str,
        form_template_id: i64,
        answers: serde_json::Value,
    ) -> FormSubmission {
        let mut state = self.state.write().await;
        let id = state.next();
        let row = FormSubmission {
            id,
            study_id: study_id.to_string(),
            participant_id: participant_id.to_string(),
            form_template_id,
            answers,
            submitted_at: Utc::now(),
        };
        state.submissions.push(row.clone());
        row
    }

    async fn latest_submission(&self, study_id: &str, participant_id: &str) -> Option<FormSubmission> {
        let state = self.state.read().await;
        state
            .submissions
            .iter()
            .filter(|s| s.study_id == study_id && s.participant_id == participant_id)
            .max_by_key(|s| s.id)
            .cloned()
    }

    async fn insert_computed_value(&self, submission_id: i64, key: &str, value: serde_json::Value) -> ComputedValue {
        let mut state = self.state.write().await;
        let id = state.next();
        let row = ComputedValue {
            id,
            submission_id,
            key: key.to_string(),
            value,
            computed_at: Utc::now(),
        };
        state.computed_values.push(row.clone());
        row
    }

    async fn computed_values_for_submission(&self, submission_id: i64) -> Vec<ComputedValue> {
        let state = self.state.read().await;
        let mut rows: Vec<ComputedValue> = state
            .computed_values
            .iter()
            .filter(|v| v.submission_id == submission_id)
            .cloned()
            .collect();
        rows.sort_by_key(|v| v.id);
        rows
    }

    async fn insert_rule_evaluation(
        &self,
        submission_id: i64,
        rule_set_id: i64,
        result_bool: bool,
        result_detail: serde_json::Value,
    ) -> RuleEvaluation {
        let mut state = self.state.write().await;
        let id = state.next();
        let row = RuleEvaluation {
            id,
            submission_id,
            rule_set_id,
            result_bool,
            result_detail,
            evaluated_at: Utc::now(),
        };
        state.rule_evaluations.push(row.clone());
        row
    }

    async fn rule_evaluations_for_submission(&self, submission_id: i64) -> Vec<RuleEvaluation> {
        let state = self.state.read().await;
        let mut rows: Vec<RuleEvaluation> = state
            .rule_evaluations
            .iter()
            .filter(|e| e.submission_id == submission_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.id);
        rows
    }

    async fn insert_assignment(
        &self,
        participant_id: &str,
        study_id: &str,
        group_key: &str,
        group_value: &str,
    ) -> ParticipantAssignment {
        let mut state = self.state.write().await;
        let id = state.next();
        let row = ParticipantAssignment {
            id,
            participant_id: participant_id.to_string(),
            study_id: study_id.to_string(),
            group_key: group_key.to_string(),
            group_value: group_value.to_string(),
            assigned_at: Utc::now(),
        };
        state.assignments.push(row.clone());
        row
    }

    async fn assignments_for_participant(&self, study_id: &str, participant_id: &str) -> Vec<ParticipantAssignment> {
        let state = self.state.read().await;
        let mut rows: Vec<ParticipantAssignment> = state
            .assignments
            .iter()
            .filter(|a| a.study_id == study_id && a.participant_id == participant_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.assigned_at.cmp(&a.assigned_at));
        rows
    }

    async fn insert_schedule_plan(&self, participant_id: &str, study_id: &str, plan: serde_json::Value) -> SchedulePlan {
        let mut state = self.state.write().await;
        let id = state.next();
        let row = SchedulePlan {
            id,
            participant_id: participant_id.to_string(),
            study_id: study_id.to_string(),
            plan,
            created_at: Utc::now(),
        };
        state.schedule_plans.push(row.clone());
        row
    }

    async fn latest_schedule_plan(&self, study_id: &str, participant_id: &str) -> Option<SchedulePlan> {
        let state = self.state.read().await;
        state
            .schedule_plans
            .iter()
            .filter(|p| p.study_id == study_id && p.participant_id == participant_id)
            .max_by_key(|p| p.id)
            .cloned()
    }
}
