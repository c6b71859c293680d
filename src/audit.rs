//! Audit emitter: an append-only, best-effort sink invoked at the last step
//! of the intake pipeline. Failures here must never roll back an intake, so
//! `emit` has no `Result` to propagate.

use async_trait::async_trait;

use crate::model::NewAuditLog;

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, record: NewAuditLog);
}

/// Forwards audit records to the `tracing` log pipeline instead of a table,
/// for deployments that ship audit data to an external log sink.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, record: NewAuditLog) {
        tracing::info!(
            study_id = record.study_id.as_deref().unwrap_or(""),
            participant_id = record.participant_id.as_deref().unwrap_or(""),
            action = %record.action,
            entity_type = %record.entity_type,
            entity_id = record.entity_id.unwrap_or_default(),
            detail = %record.detail,
            "audit"
        );
    }
}
