//! Intake orchestrator (C5): fetch -> validate -> persist submission ->
//! compute -> persist computed -> evaluate rules -> persist
//! evaluations/assignments/plan -> emit audit. Grounded on the teacher's
//! `JSONEval::evaluate_all` top-level driver, generalised from a single
//! in-process evaluation into the full persisted pipeline.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::audit::AuditSink;
use crate::cache::{ComputeCache, ExpressionCache};
use crate::compute::{CompiledCompute, ComputeEngine};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::expr;
use crate::model::{FormSubmission, ParticipantAssignment, RuleEvaluation, RuleType};
use crate::path::Context;
use crate::store::Store;
use crate::validate;

/// Request body for `POST .../intake-submit` (spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct IntakeSubmitRequest {
    pub form_template_id: i64,
    #[serde(default = "default_answers")]
    pub answers: Value,
    pub metadata: Option<Value>,
}

fn default_answers() -> Value {
    Value::Object(Map::new())
}

/// The response envelope shared by C5 (submit) and C6 (result read).
#[derive(Debug, Clone, Serialize)]
pub struct IntakeEnvelope {
    pub submission: FormSubmission,
    pub answers: Value,
    pub computed: Value,
    pub rule_evaluations: Vec<RuleEvaluation>,
    pub assignments: Vec<ParticipantAssignment>,
    pub schedule_plan: Option<Value>,
}

pub struct IntakeOrchestrator {
    store: Arc<dyn Store>,
    audit: Arc<dyn AuditSink>,
    compute_cache: ComputeCache,
    expression_cache: ExpressionCache,
    config: EngineConfig,
}

impl IntakeOrchestrator {
    pub fn new(store: Arc<dyn Store>, audit: Arc<dyn AuditSink>, config: EngineConfig) -> Self {
        Self {
            store,
            audit,
            compute_cache: ComputeCache::new(),
            expression_cache: ExpressionCache::new(),
            config,
        }
    }

    #[tracing::instrument(skip(self, request), fields(study_id, participant_id))]
    pub async fn submit(
        &self,
        study_id: &str,
        participant_id: &str,
        request: IntakeSubmitRequest,
    ) -> EngineResult<IntakeEnvelope> {
        let template = self
            .store
            .fetch_form_template(study_id, request.form_template_id)
            .await
            .ok_or(EngineError::TemplateNotFound)?;

        let fields = self.store.fetch_form_fields(template.id).await;

        let issues = validate::validate(&fields, &request.answers);
        if !issues.is_empty() {
            return Err(EngineError::ValidationFailed(issues));
        }

        let submission = self
            .store
            .insert_submission(study_id, participant_id, template.id, request.answers.clone())
            .await;

        let metadata = build_metadata(study_id, participant_id, template.id, &submission, request.metadata.as_ref());

        let compute_defs = self.store.fetch_published_compute_definitions(study_id).await;
        let compiled: Vec<CompiledCompute> = compute_defs
            .iter()
            .map(|def| CompiledCompute {
                key: def.key.clone(),
                expr: self.compute_cache.get_or_compile(def.id, def.version, &def.definition),
            })
            .collect();

        let engine = ComputeEngine::new(&compiled, &submission.answers, &metadata, self.config.recursion_limit);
        let computed_map = engine.resolve_all()?;

        for def in &compute_defs {
            let value = computed_map.get(&def.key).cloned().unwrap_or(Value::Null);
            self.store.insert_computed_value(submission.id, &def.key, value).await;
        }

        let computed_value = Value::Object(computed_map.into_iter().collect());
        let ctx = Context::new(&submission.answers, &computed_value, &metadata);

        let rule_sets = self.store.fetch_published_rule_sets(study_id).await;
        let mut rule_evaluations = Vec::with_capacity(rule_sets.len());
        let mut assignments = Vec::new();
        let mut schedule_plans = Vec::new();

        for rule in &rule_sets {
            let predicate = predicate_for(rule.rule_type, &rule.expression);
            let compiled_predicate = self.expression_cache.get_or_compile(rule.id, rule.version, &predicate);
            let matched = expr::evaluate(&compiled_predicate, &ctx, self.config.recursion_limit)?;

            let assignment = if matched && rule.rule_type == RuleType::GroupAssignment {
                assignment_for(&rule.expression)
            } else {
                None
            };
            let plan = if matched && rule.rule_type == RuleType::Scheduling {
                plan_for(&rule.expression)
            } else {
                None
            };

            let detail = serde_json::json!({
                "rule_set_id": rule.id,
                "rule_type": rule.rule_type,
                "name": rule.name,
                "matched": matched,
                "assignment": assignment.as_ref().map(|(k, v)| serde_json::json!({"key": k, "value": v})),
                "plan": plan,
            });
            let evaluation = self
                .store
                .insert_rule_evaluation(submission.id, rule.id, matched, detail)
                .await;
            rule_evaluations.push(evaluation);

            if let Some((key, value)) = &assignment {
                let row = self.store.insert_assignment(participant_id, study_id, key, value).await;
                assignments.push(row);
            }
            if let Some(plan) = plan {
                schedule_plans.push(plan);
            }
        }

        let schedule_plan = if schedule_plans.is_empty() {
            None
        } else {
            let plan_row = self
                .store
                .insert_schedule_plan(participant_id, study_id, serde_json::json!({ "plans": schedule_plans }))
                .await;
            Some(plan_row.plan)
        };

        self.audit
            .emit(crate::model::NewAuditLog {
                study_id: Some(study_id.to_string()),
                participant_id: Some(participant_id.to_string()),
                action: "intake_submitted".to_string(),
                entity_type: "form_submission".to_string(),
                entity_id: Some(submission.id),
                detail: serde_json::json!({
                    "form_template_id": template.id,
                    "computed_keys": compute_defs.iter().map(|d| d.key.clone()).collect::<Vec<_>>(),
                    "rule_count": rule_sets.len(),
                }),
            })
            .await;

        Ok(IntakeEnvelope {
            answers: submission.answers.clone(),
            submission,
            computed: computed_value,
            rule_evaluations,
            assignments,
            schedule_plan,
        })
    }
}

fn build_metadata(
    study_id: &str,
    participant_id: &str,
    form_template_id: i64,
    submission: &FormSubmission,
    body_metadata: Option<&Value>,
) -> Value {
    let mut map = Map::new();
    map.insert("study_id".to_string(), Value::String(study_id.to_string()));
    map.insert("participant_id".to_string(), Value::String(participant_id.to_string()));
    map.insert("form_template_id".to_string(), Value::from(form_template_id));
    map.insert("submission_id".to_string(), Value::from(submission.id));
    map.insert(
        "submitted_at".to_string(),
        Value::String(submission.submitted_at.to_rfc3339()),
    );
    if let Some(Value::Object(extra)) = body_metadata {
        for (k, v) in extra {
            map.insert(k.clone(), v.clone());
        }
    }
    Value::Object(map)
}

/// Resolves the predicate JSON embedded in a rule set's `expression`
/// according to its `rule_type` (spec §4.5, "Rule payload resolution").
fn predicate_for(rule_type: RuleType, payload: &Value) -> Value {
    match rule_type {
        RuleType::Eligibility => payload
            .get("expression")
            .or_else(|| payload.get("criteria"))
            .cloned()
            .unwrap_or_else(|| payload.clone()),
        RuleType::GroupAssignment | RuleType::Scheduling => payload
            .get("when")
            .or_else(|| payload.get("expression"))
            .or_else(|| payload.get("criteria"))
            .cloned()
            .unwrap_or_else(|| payload.clone()),
    }
}

/// Resolves a `group_assignment` rule's action payload into a `(key,
/// value)` pair, string-coercing both (spec §9 open question: string
/// coercion for compatibility).
fn assignment_for(payload: &Value) -> Option<(String, String)> {
    if let Some(assignment) = payload.get("assignment").and_then(Value::as_object) {
        let key = assignment.get("key")?;
        let value = assignment.get("value")?;
        return Some((value_to_string(key), value_to_string(value)));
    }
    let group_key = payload.get("group_key");
    let group_value = payload.get("group_value");
    if let (Some(key), Some(value)) = (group_key, group_value) {
        return Some((value_to_string(key), value_to_string(value)));
    }
    None
}

/// Resolves a `scheduling` rule's plan payload (spec §4.5): `payload.plan ??
/// payload.schedule ?? payload` — always present for a matched rule.
fn plan_for(payload: &Value) -> Option<Value> {
    Some(
        payload
            .get("plan")
            .or_else(|| payload.get("schedule"))
            .cloned()
            .unwrap_or_else(|| payload.clone()),
    )
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingAuditSink;
    use crate::model::TemplateStatus;
    use crate::store::{FormFieldInput, InMemoryStore};
    use crate::model::FieldType;
    use serde_json::json;

    async fn seed_sleep_pipeline() -> (Arc<InMemoryStore>, i64) {
        let store = Arc::new(InMemoryStore::new());
        let template = store
            .insert_form_template("study-1", "Sleep intake", 1, TemplateStatus::Published)
            .await;
        store
            .insert_form_field(FormFieldInput {
                form_template_id: template.id,
                key: "age".into(),
                label: "Age".into(),
                field_type: FieldType::Number,
                required: true,
                options: vec![],
                validation: crate::model::FieldValidation {
                    min: Some(18.0),
                    ..Default::default()
                },
                order_index: 0,
            })
            .await;
        store
            .insert_form_field(FormFieldInput {
                form_template_id: template.id,
                key: "sleep_start".into(),
                label: "Sleep start".into(),
                field_type: FieldType::Time,
                required: true,
                options: vec![],
                validation: Default::default(),
                order_index: 1,
            })
            .await;
        store
            .insert_form_field(FormFieldInput {
                form_template_id: template.id,
                key: "sleep_end".into(),
                label: "Sleep end".into(),
                field_type: FieldType::Time,
                required: true,
                options: vec![],
                validation: Default::default(),
                order_index: 2,
            })
            .await;

        store
            .insert_compute_definition(
                "study-1",
                "sleep_duration",
                "expression",
                json!({"func": "duration", "args": [{"var": "answers.sleep_start"}, {"var": "answers.sleep_end"}]}),
                1,
                TemplateStatus::Published,
            )
            .await
            .unwrap();

        store
            .insert_rule_set(
                "study-1",
                RuleType::Eligibility,
                "adult",
                1,
                TemplateStatus::Published,
                json!({"op": ">=", "left": {"var": "answers.age"}, "right": 18}),
            )
            .await;
        store
            .insert_rule_set(
                "study-1",
                RuleType::GroupAssignment,
                "cohort",
                1,
                TemplateStatus::Published,
                json!({
                    "when": {"op": "between", "left": {"var": "answers.age"}, "min": 18, "max": 30},
                    "assignment": {"key": "cohort", "value": "young-adult"}
                }),
            )
            .await;
        store
            .insert_rule_set(
                "study-1",
                RuleType::Scheduling,
                "baseline-visit",
                1,
                TemplateStatus::Published,
                json!({
                    "when": {"op": ">=", "left": {"var": "answers.age"}, "right": 18},
                    "plan": {"visit": "baseline", "offset_days": 7}
                }),
            )
            .await;

        (store, template.id)
    }

    #[tokio::test]
    async fn s1_sleep_pipeline_happy_path() {
        let (store, template_id) = seed_sleep_pipeline().await;
        let orchestrator = IntakeOrchestrator::new(store.clone(), Arc::new(TracingAuditSink), EngineConfig::default());

        let envelope = orchestrator
            .submit(
                "study-1",
                "participant-1",
                IntakeSubmitRequest {
                    form_template_id: template_id,
                    answers: json!({"age": 24, "sleep_start": "22:00", "sleep_end": "06:00"}),
                    metadata: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(envelope.computed["sleep_duration"], json!(480));
        assert_eq!(envelope.rule_evaluations.len(), 3);
        assert!(envelope.rule_evaluations.iter().all(|r| r.result_bool));
        assert_eq!(envelope.assignments.len(), 1);
        assert_eq!(envelope.assignments[0].group_key, "cohort");
        assert_eq!(envelope.assignments[0].group_value, "young-adult");
        let plan = envelope.schedule_plan.unwrap();
        assert_eq!(plan["plans"][0]["visit"], json!("baseline"));
        assert_eq!(plan["plans"][0]["offset_days"], json!(7));
    }

    #[tokio::test]
    async fn s5_validation_failure_writes_nothing() {
        let (store, template_id) = seed_sleep_pipeline().await;
        let orchestrator = IntakeOrchestrator::new(store.clone(), Arc::new(TracingAuditSink), EngineConfig::default());

        let err = orchestrator
            .submit(
                "study-1",
                "participant-2",
                IntakeSubmitRequest {
                    form_template_id: template_id,
                    answers: json!({"age": 15, "sleep_start": "22:00", "sleep_end": "06:00"}),
                    metadata: None,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::ValidationFailed(_)));
        assert!(store.latest_submission("study-1", "participant-2").await.is_none());
    }

    #[tokio::test]
    async fn s6_compute_cycle_writes_no_computed_values() {
        let store = Arc::new(InMemoryStore::new());
        let template = store
            .insert_form_template("study-2", "Cycle", 1, TemplateStatus::Published)
            .await;
        store
            .insert_compute_definition(
                "study-2",
                "a",
                "expression",
                json!({"op": "add", "args": [{"var": "computed.b"}, {"value": 1}]}),
                1,
                TemplateStatus::Published,
            )
            .await
            .unwrap();
        store
            .insert_compute_definition(
                "study-2",
                "b",
                "expression",
                json!({"op": "add", "args": [{"var": "computed.a"}, {"value": 1}]}),
                1,
                TemplateStatus::Published,
            )
            .await
            .unwrap();

        let orchestrator = IntakeOrchestrator::new(store.clone(), Arc::new(TracingAuditSink), EngineConfig::default());
        let err = orchestrator
            .submit(
                "study-2",
                "participant-3",
                IntakeSubmitRequest {
                    form_template_id: template.id,
                    answers: json!({}),
                    metadata: None,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::ComputeCycle(_)));
        let submission = store.latest_submission("study-2", "participant-3").await.unwrap();
        assert!(store.computed_values_for_submission(submission.id).await.is_empty());
    }
}
