//! HTTP/JSON surface: a thin `axum` router mounting the seven endpoints
//! named in spec §6. The engine underneath is what's tested; this module
//! is a translation layer with no business logic of its own, grounded on
//! the teacher's benchmark-harness request/response shapes, adapted to a
//! live service instead of a one-shot CLI run.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::assemble::ResultAssembler;
use crate::error::{EngineError, FieldIssue};
use crate::model::{ComputeDefinition, FieldType, FieldValidation, FormField, FormLogic, FormTemplate, RuleSet, RuleType, TemplateStatus};
use crate::orchestrate::{IntakeEnvelope, IntakeOrchestrator, IntakeSubmitRequest};
use crate::store::{FormFieldInput, Store};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub orchestrator: Arc<IntakeOrchestrator>,
    pub assembler: Arc<ResultAssembler>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, orchestrator: Arc<IntakeOrchestrator>, assembler: Arc<ResultAssembler>) -> Self {
        Self {
            store,
            orchestrator,
            assembler,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/studies/:study/forms", post(create_form_template))
        .route("/api/studies/:study/forms/:form_id/fields", post(create_form_field))
        .route("/api/studies/:study/forms/:form_id/logic", post(create_form_logic))
        .route("/api/studies/:study/compute-definitions", post(create_compute_definition))
        .route("/api/studies/:study/rule-sets", post(create_rule_set))
        .route(
            "/api/studies/:study/participants/:pid/intake-submit",
            post(intake_submit),
        )
        .route(
            "/api/studies/:study/participants/:pid/intake-result",
            get(intake_result),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<FieldIssue>>,
}

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let errors = match &self.0 {
            EngineError::ValidationFailed(issues) => Some(issues.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            errors,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct CreateFormTemplateRequest {
    name: String,
    version: Option<u32>,
    status: Option<TemplateStatus>,
}

#[derive(Debug, Serialize)]
struct FormTemplateResponse {
    form_template: FormTemplate,
}

async fn create_form_template(
    State(state): State<AppState>,
    Path(study): Path<String>,
    Json(req): Json<CreateFormTemplateRequest>,
) -> Result<(StatusCode, Json<FormTemplateResponse>), ApiError> {
    let template = state
        .store
        .insert_form_template(&study, &req.name, req.version.unwrap_or(1), req.status.unwrap_or(TemplateStatus::Draft))
        .await;
    Ok((StatusCode::CREATED, Json(FormTemplateResponse { form_template: template })))
}

#[derive(Debug, Deserialize)]
struct CreateFormFieldRequest {
    key: String,
    label: String,
    #[serde(rename = "type")]
    field_type: FieldType,
    required: Option<bool>,
    options: Option<Vec<String>>,
    validation: Option<FieldValidation>,
    order_index: Option<i64>,
}

#[derive(Debug, Serialize)]
struct FormFieldResponse {
    form_field: FormField,
}

async fn create_form_field(
    State(state): State<AppState>,
    Path((_study, form_id)): Path<(String, i64)>,
    Json(req): Json<CreateFormFieldRequest>,
) -> Result<(StatusCode, Json<FormFieldResponse>), ApiError> {
    let field = state
        .store
        .insert_form_field(FormFieldInput {
            form_template_id: form_id,
            key: req.key,
            label: req.label,
            field_type: req.field_type,
            required: req.required.unwrap_or(false),
            options: req.options.unwrap_or_default(),
            validation: req.validation.unwrap_or_default(),
            order_index: req.order_index.unwrap_or(0),
        })
        .await;
    Ok((StatusCode::CREATED, Json(FormFieldResponse { form_field: field })))
}

#[derive(Debug, Deserialize)]
struct CreateFormLogicRequest {
    logic: Value,
    order_index: Option<i64>,
}

#[derive(Debug, Serialize)]
struct FormLogicResponse {
    form_logic: FormLogic,
}

async fn create_form_logic(
    State(state): State<AppState>,
    Path((_study, form_id)): Path<(String, i64)>,
    Json(req): Json<CreateFormLogicRequest>,
) -> Result<(StatusCode, Json<FormLogicResponse>), ApiError> {
    let logic = state
        .store
        .insert_form_logic(form_id, req.logic, req.order_index.unwrap_or(0))
        .await;
    Ok((StatusCode::CREATED, Json(FormLogicResponse { form_logic: logic })))
}

#[derive(Debug, Deserialize)]
struct CreateComputeDefinitionRequest {
    key: String,
    #[serde(rename = "type")]
    kind: String,
    definition: Value,
    version: Option<u32>,
    status: Option<TemplateStatus>,
}

#[derive(Debug, Serialize)]
struct ComputeDefinitionResponse {
    compute_definition: ComputeDefinition,
}

async fn create_compute_definition(
    State(state): State<AppState>,
    Path(study): Path<String>,
    Json(req): Json<CreateComputeDefinitionRequest>,
) -> Result<(StatusCode, Json<ComputeDefinitionResponse>), ApiError> {
    let definition = state
        .store
        .insert_compute_definition(
            &study,
            &req.key,
            &req.kind,
            req.definition,
            req.version.unwrap_or(1),
            req.status.unwrap_or(TemplateStatus::Draft),
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ComputeDefinitionResponse { compute_definition: definition }),
    ))
}

#[derive(Debug, Deserialize)]
struct CreateRuleSetRequest {
    rule_type: RuleType,
    name: String,
    version: Option<u32>,
    status: Option<TemplateStatus>,
    expression: Value,
}

#[derive(Debug, Serialize)]
struct RuleSetResponse {
    rule_set: RuleSet,
}

async fn create_rule_set(
    State(state): State<AppState>,
    Path(study): Path<String>,
    Json(req): Json<CreateRuleSetRequest>,
) -> Result<(StatusCode, Json<RuleSetResponse>), ApiError> {
    let rule_set = state
        .store
        .insert_rule_set(
            &study,
            req.rule_type,
            &req.name,
            req.version.unwrap_or(1),
            req.status.unwrap_or(TemplateStatus::Draft),
            req.expression,
        )
        .await;
    Ok((StatusCode::CREATED, Json(RuleSetResponse { rule_set })))
}

async fn intake_submit(
    State(state): State<AppState>,
    Path((study, pid)): Path<(String, String)>,
    Json(req): Json<IntakeSubmitRequest>,
) -> Result<(StatusCode, Json<IntakeEnvelope>), ApiError> {
    let envelope = state.orchestrator.submit(&study, &pid, req).await?;
    Ok((StatusCode::CREATED, Json(envelope)))
}

async fn intake_result(
    State(state): State<AppState>,
    Path((study, pid)): Path<(String, String)>,
) -> Result<Json<IntakeEnvelope>, ApiError> {
    let envelope = state.assembler.assemble(&study, &pid).await?;
    Ok(Json(envelope))
}
