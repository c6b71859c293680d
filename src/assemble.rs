//! Result assembler (C6): reads the latest submission for a
//! `(study_id, participant_id)` pair and projects the same envelope shape
//! C5 returns at submit time. Grounded on the teacher's read-side
//! projection helpers in `subform_methods.rs`.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::orchestrate::IntakeEnvelope;
use crate::store::Store;

pub struct ResultAssembler {
    store: Arc<dyn Store>,
}

impl ResultAssembler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[tracing::instrument(skip(self), fields(study_id, participant_id))]
    pub async fn assemble(&self, study_id: &str, participant_id: &str) -> EngineResult<IntakeEnvelope> {
        let submission = self
            .store
            .latest_submission(study_id, participant_id)
            .await
            .ok_or(EngineError::NotFound)?;

        let computed_values = self.store.computed_values_for_submission(submission.id).await;
        let computed = Value::Object(
            computed_values
                .into_iter()
                .map(|row| (row.key, row.value))
                .collect(),
        );

        let rule_evaluations = self.store.rule_evaluations_for_submission(submission.id).await;
        let assignments = self.store.assignments_for_participant(study_id, participant_id).await;
        let schedule_plan = self
            .store
            .latest_schedule_plan(study_id, participant_id)
            .await
            .map(|row| row.plan);

        Ok(IntakeEnvelope {
            answers: submission.answers.clone(),
            submission,
            computed,
            rule_evaluations,
            assignments,
            schedule_plan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingAuditSink;
    use crate::config::EngineConfig;
    use crate::model::{FieldType, RuleType, TemplateStatus};
    use crate::orchestrate::{IntakeOrchestrator, IntakeSubmitRequest};
    use crate::store::{FormFieldInput, InMemoryStore};
    use serde_json::json;

    #[tokio::test]
    async fn no_submission_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let assembler = ResultAssembler::new(store);
        let err = assembler.assemble("study-x", "nobody").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound));
    }

    #[tokio::test]
    async fn assemble_matches_submit_response() {
        let store = Arc::new(InMemoryStore::new());
        let template = store
            .insert_form_template("study-1", "Basic", 1, TemplateStatus::Published)
            .await;
        store
            .insert_form_field(FormFieldInput {
                form_template_id: template.id,
                key: "age".into(),
                label: "Age".into(),
                field_type: FieldType::Number,
                required: true,
                options: vec![],
                validation: Default::default(),
                order_index: 0,
            })
            .await;
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

        let orchestrator = IntakeOrchestrator::new(store.clone(), Arc::new(TracingAuditSink), EngineConfig::default());
        orchestrator
            .submit(
                "study-1",
                "participant-9",
                IntakeSubmitRequest {
                    form_template_id: template.id,
                    answers: json!({"age": 30}),
                    metadata: None,
                },
            )
            .await
            .unwrap();

        let assembler = ResultAssembler::new(store);
        let result = assembler.assemble("study-1", "participant-9").await.unwrap();
        assert_eq!(result.answers["age"], json!(30));
        assert_eq!(result.rule_evaluations.len(), 1);
        assert!(result.rule_evaluations[0].result_bool);
    }
}
