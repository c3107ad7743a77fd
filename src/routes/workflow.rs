use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::documents::{load_detail, DocumentDetailResponse};
use crate::{
    audit::ClientInfo,
    auth::{permissions::load_permissions, AuthenticatedUser},
    error::{AppError, AppResult},
    models::{Document, DocumentTransition, DocumentWorkflow},
    schema::documents,
    state::AppState,
    workflow::{
        available_actions,
        service::{self, Actor, TransitionOutcome, TransitionRequest},
        version::VersionBump,
        WorkflowAction,
    },
};

/// What a workflow URL segment asks for once the request body is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteAction {
    Transition(WorkflowAction),
    CompleteReview,
    NewVersion,
}

fn parse_route_action(segment: &str) -> Option<RouteAction> {
    let action = match segment {
        "submit-for-review" => RouteAction::Transition(WorkflowAction::SubmitForReview),
        "start-review" => RouteAction::Transition(WorkflowAction::StartReview),
        "complete-review" => RouteAction::CompleteReview,
        "route-for-approval" => RouteAction::Transition(WorkflowAction::RouteForApproval),
        "start-approval" => RouteAction::Transition(WorkflowAction::StartApproval),
        "approve" => RouteAction::Transition(WorkflowAction::Approve),
        "reject-approval" => RouteAction::Transition(WorkflowAction::RejectApproval),
        "schedule-obsolescence" => RouteAction::Transition(WorkflowAction::ScheduleObsolescence),
        "cancel-obsolescence" => RouteAction::Transition(WorkflowAction::CancelObsolescence),
        "terminate" => RouteAction::Transition(WorkflowAction::Terminate),
        "new-version" => RouteAction::NewVersion,
        _ => return None,
    };
    Some(action)
}

#[derive(Debug, Default, Deserialize)]
pub struct ActionBody {
    #[serde(flatten)]
    pub request: TransitionRequest,
    pub approved: Option<bool>,
    pub bump: Option<VersionBump>,
    pub reason_for_change: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TransitionResponse {
    #[serde(flatten)]
    pub outcome: TransitionOutcome,
    pub available_actions: Vec<WorkflowAction>,
}

pub async fn perform_action(
    State(state): State<AppState>,
    Path((document_id, segment)): Path<(Uuid, String)>,
    user: AuthenticatedUser,
    client: ClientInfo,
    body: Option<Json<ActionBody>>,
) -> AppResult<Response> {
    let route_action = parse_route_action(&segment)
        .ok_or_else(|| AppError::bad_request(format!("unknown workflow action '{segment}'")))?;
    let body = body.map(|Json(body)| body).unwrap_or_default();

    let mut conn = state.db()?;
    let permissions = load_permissions(&mut conn, user.user_id)?;

    let action = match route_action {
        RouteAction::NewVersion => {
            let bump = body.bump.unwrap_or(VersionBump::Minor);
            let reason = body.reason_for_change.unwrap_or_default();
            let document = service::create_new_version(
                &mut conn,
                document_id,
                &permissions,
                bump,
                reason,
                &client,
            )?;
            info!(source_id = %document_id, new_id = %document.id, "new version drafted");
            let detail = load_detail(&mut conn, document, &permissions)?;
            return Ok((StatusCode::CREATED, Json(detail)).into_response());
        }
        RouteAction::CompleteReview => match body.approved {
            Some(true) => WorkflowAction::ApproveReview,
            Some(false) => WorkflowAction::RejectReview,
            None => return Err(AppError::bad_request("approved is required")),
        },
        RouteAction::Transition(action) => action,
    };

    let actor = Actor::User(permissions);
    let outcome = service::transition(
        &mut conn,
        document_id,
        action,
        &actor,
        body.request,
        &client,
        service::today(),
    )?;

    let ctx = service::context_for(&mut conn, &outcome.document, &actor, service::today())?;
    let status = service::parse_status(&outcome.document)?;
    let actions = available_actions(status, &ctx);

    Ok(Json(TransitionResponse {
        outcome,
        available_actions: actions,
    })
    .into_response())
}

#[derive(Debug, Serialize)]
pub struct WorkflowHistoryResponse {
    pub workflow: DocumentWorkflow,
    pub transitions: Vec<DocumentTransition>,
}

pub async fn get_workflow(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    _user: AuthenticatedUser,
) -> AppResult<Json<WorkflowHistoryResponse>> {
    let mut conn = state.db()?;
    let workflow = service::load_workflow(&mut conn, document_id)?;
    let transitions = service::load_transitions(&mut conn, workflow.id)?;
    Ok(Json(WorkflowHistoryResponse {
        workflow,
        transitions,
    }))
}

pub async fn list_actions(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<WorkflowAction>>> {
    let mut conn = state.db()?;
    let permissions = load_permissions(&mut conn, user.user_id)?;
    let document: Document = documents::table.find(document_id).first(&mut conn)?;

    let actor = Actor::User(permissions);
    let ctx = service::context_for(&mut conn, &document, &actor, service::today())?;
    let status = service::parse_status(&document)?;
    Ok(Json(available_actions(status, &ctx)))
}

pub async fn my_tasks(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<DocumentDetailResponse>>> {
    let mut conn = state.db()?;
    let permissions = load_permissions(&mut conn, user.user_id)?;
    let tasks = service::pending_tasks(&mut conn, user.user_id)?;

    let mut details = Vec::with_capacity(tasks.len());
    for document in tasks {
        details.push(load_detail(&mut conn, document, &permissions)?);
    }
    Ok(Json(details))
}

#[derive(Debug, Deserialize)]
pub struct TaskCountQuery {
    #[serde(default)]
    pub unchanged_polls: u32,
}

#[derive(Debug, Serialize)]
pub struct TaskCountResponse {
    pub count: usize,
    pub poll_after_seconds: u64,
}

/// Clients back off while their task count stays the same.
pub fn poll_after_seconds(unchanged_polls: u32) -> u64 {
    match unchanged_polls {
        0..=1 => 15,
        2..=4 => 30,
        _ => 60,
    }
}

pub async fn my_task_count(
    State(state): State<AppState>,
    Query(params): Query<TaskCountQuery>,
    user: AuthenticatedUser,
) -> AppResult<Json<TaskCountResponse>> {
    let mut conn = state.db()?;
    let count = service::pending_tasks(&mut conn, user.user_id)?.len();
    Ok(Json(TaskCountResponse {
        count,
        poll_after_seconds: poll_after_seconds(params.unchanged_polls),
    }))
}
