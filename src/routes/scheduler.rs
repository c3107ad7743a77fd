use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use serde::Serialize;
use tracing::info;

use crate::{
    audit::{self, AuditEvent, ClientInfo, RESOURCE_SYSTEM},
    auth::{permissions::require_admin, AuthenticatedUser},
    error::AppResult,
    models::Job,
    scheduler::{self, SchedulerStatus},
    state::AppState,
};

pub async fn scheduler_status(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
) -> AppResult<Json<SchedulerStatus>> {
    let mut conn = state.db()?;
    Ok(Json(scheduler::status(&mut conn)?))
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub task: String,
    pub queued: bool,
    pub job: Option<Job>,
}

pub async fn trigger_task(
    State(state): State<AppState>,
    Path(task): Path<String>,
    user: AuthenticatedUser,
    client: ClientInfo,
) -> AppResult<(StatusCode, Json<TriggerResponse>)> {
    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let job = scheduler::trigger(&mut conn, &task)?;
    audit::record(
        &mut conn,
        AuditEvent::new(
            Some(user.user_id),
            "scheduler.trigger",
            RESOURCE_SYSTEM,
            &task,
            format!("Triggered {task}"),
        ),
        &client,
    )?;
    info!(task = %task, queued = job.is_some(), "scheduler task triggered");

    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            queued: job.is_some(),
            task,
            job,
        }),
    ))
}
