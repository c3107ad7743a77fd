use chrono::{NaiveDate, Utc};
use diesel::dsl::exists;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    assignee_for, plan_transition, target_status,
    version::{
        document_number_prefix, format_document_number, next_sequence, VersionBump,
        VersionNumber,
    },
    DocumentStatus, TransitionContext, WorkflowAction, WorkflowError, WORKFLOW_REVIEW,
    WORKFLOW_UP_VERSION,
};
use crate::{
    audit::{self, AuditEvent, ClientInfo, RESOURCE_DOCUMENT},
    auth::permissions::{load_permissions, PermissionLevel, UserPermissions},
    error::{AppError, AppResult},
    models::{
        Document, DocumentDependency, DocumentTransition, DocumentType, DocumentWorkflow,
        NewDocument, NewDocumentDependency, NewDocumentTransition, NewDocumentWorkflow, User,
    },
    notifications,
    schema::{
        document_dependencies, document_transitions, document_types, document_workflows,
        documents, users,
    },
};

/// Who is driving a transition.
#[derive(Debug, Clone)]
pub enum Actor {
    User(UserPermissions),
    System,
}

impl Actor {
    pub fn id(&self) -> Option<Uuid> {
        match self {
            Actor::User(permissions) => Some(permissions.user_id),
            Actor::System => None,
        }
    }

    fn level(&self) -> PermissionLevel {
        match self {
            Actor::User(permissions) => permissions.level,
            Actor::System => PermissionLevel::Admin,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransitionRequest {
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub effective_date: Option<NaiveDate>,
    #[serde(default)]
    pub obsolescence_date: Option<NaiveDate>,
    #[serde(default)]
    pub reviewer_id: Option<Uuid>,
    #[serde(default)]
    pub approver_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct TransitionOutcome {
    pub document: Document,
    pub workflow: DocumentWorkflow,
    pub transition: DocumentTransition,
    pub superseded_document_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct DocumentDraft {
    pub title: String,
    pub description: String,
    pub document_type_id: Uuid,
    pub document_source_id: Option<Uuid>,
    pub reviewer_id: Option<Uuid>,
    pub approver_id: Option<Uuid>,
    pub reason_for_change: String,
    pub effective_date: Option<NaiveDate>,
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn parse_status(document: &Document) -> Result<DocumentStatus, WorkflowError> {
    document.status.parse()
}

/// Checks that `user_id` names an active user holding at least `level`.
pub fn ensure_assignable(
    conn: &mut PgConnection,
    user_id: Uuid,
    level: PermissionLevel,
) -> AppResult<()> {
    let user: Option<User> = users::table.find(user_id).first(conn).optional()?;
    match user {
        Some(user) if user.is_active => {}
        _ => return Err(AppError::bad_request("assigned user not found or inactive")),
    }
    let permissions = load_permissions(conn, user_id)?;
    if !permissions.has(level) {
        return Err(AppError::bad_request(format!(
            "assigned user lacks {level} permission"
        )));
    }
    Ok(())
}

pub fn has_effective_dependents(conn: &mut PgConnection, document_id: Uuid) -> AppResult<bool> {
    let effective: Vec<&str> = DocumentStatus::ALL
        .into_iter()
        .filter(|status| status.is_effective())
        .map(DocumentStatus::as_str)
        .collect();

    let found = diesel::select(exists(
        document_dependencies::table
            .inner_join(documents::table.on(documents::id.eq(document_dependencies::document_id)))
            .filter(document_dependencies::depends_on_id.eq(document_id))
            .filter(documents::status.eq_any(effective)),
    ))
    .get_result(conn)?;
    Ok(found)
}

pub fn load_workflow(conn: &mut PgConnection, document_id: Uuid) -> AppResult<DocumentWorkflow> {
    let workflow = document_workflows::table
        .filter(document_workflows::document_id.eq(document_id))
        .first(conn)?;
    Ok(workflow)
}

pub fn load_transitions(
    conn: &mut PgConnection,
    workflow_id: Uuid,
) -> AppResult<Vec<DocumentTransition>> {
    let transitions = document_transitions::table
        .filter(document_transitions::workflow_id.eq(workflow_id))
        .order((
            document_transitions::transitioned_at.asc(),
            document_transitions::id.asc(),
        ))
        .load(conn)?;
    Ok(transitions)
}

/// Facts the rules need about `document` for the given actor, before any request data.
pub fn context_for(
    conn: &mut PgConnection,
    document: &Document,
    actor: &Actor,
    today: NaiveDate,
) -> AppResult<TransitionContext> {
    let status = parse_status(document)?;
    let has_effective_dependents = if status == DocumentStatus::ApprovedAndEffective {
        has_effective_dependents(conn, document.id)?
    } else {
        false
    };

    Ok(TransitionContext {
        actor_id: actor.id(),
        actor_level: actor.level(),
        author_id: document.author_id,
        reviewer_id: document.reviewer_id,
        approver_id: document.approver_id,
        effective_date: document.effective_date,
        obsolescence_date: document.obsolescence_date,
        comment: None,
        has_effective_dependents,
        today,
    })
}

/// Next number for `document_type` this year. The type row is locked so concurrent
/// creations of one type serialize.
fn allocate_document_number(
    conn: &mut PgConnection,
    document_type_id: Uuid,
    today: NaiveDate,
) -> AppResult<String> {
    let document_type: DocumentType = document_types::table
        .find(document_type_id)
        .for_update()
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::bad_request("unknown document type"))?;

    let prefix = document_number_prefix(&document_type.code, today);
    let existing: Vec<String> = documents::table
        .filter(documents::document_number.like(format!("{prefix}%")))
        .select(documents::document_number)
        .distinct()
        .load(conn)?;
    let sequence = next_sequence(existing.iter().map(String::as_str), &prefix);

    Ok(format_document_number(&document_type.code, today, sequence))
}

fn start_workflow(
    conn: &mut PgConnection,
    document: &Document,
    initiated_by: Uuid,
    workflow_type: &str,
    comment: &str,
) -> AppResult<DocumentWorkflow> {
    let workflow: DocumentWorkflow = diesel::insert_into(document_workflows::table)
        .values(NewDocumentWorkflow {
            id: Uuid::new_v4(),
            document_id: document.id,
            workflow_type: workflow_type.to_string(),
            current_state: DocumentStatus::Draft.as_str().to_string(),
            initiated_by,
            current_assignee: Some(document.author_id),
        })
        .get_result(conn)?;

    diesel::insert_into(document_transitions::table)
        .values(NewDocumentTransition {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            from_state: DocumentStatus::Draft.as_str().to_string(),
            to_state: DocumentStatus::Draft.as_str().to_string(),
            transitioned_by: Some(initiated_by),
            comment: comment.to_string(),
            transition_data: json!({ "action": "create" }),
            transitioned_at: Utc::now().naive_utc(),
        })
        .execute(conn)?;

    Ok(workflow)
}

pub fn create_document(
    conn: &mut PgConnection,
    author: &UserPermissions,
    draft: DocumentDraft,
    client: &ClientInfo,
) -> AppResult<Document> {
    if draft.title.trim().is_empty() {
        return Err(AppError::bad_request("title is required"));
    }
    if let Some(reviewer) = draft.reviewer_id {
        ensure_assignable(conn, reviewer, PermissionLevel::Review)?;
    }
    if let Some(approver) = draft.approver_id {
        ensure_assignable(conn, approver, PermissionLevel::Approve)?;
    }

    conn.transaction::<_, AppError, _>(|conn| {
        let document_number = allocate_document_number(conn, draft.document_type_id, today())?;
        let version = VersionNumber::INITIAL;

        let document: Document = diesel::insert_into(documents::table)
            .values(NewDocument {
                id: Uuid::new_v4(),
                document_number,
                title: draft.title.trim().to_string(),
                description: draft.description,
                document_type_id: draft.document_type_id,
                document_source_id: draft.document_source_id,
                status: DocumentStatus::Draft.as_str().to_string(),
                version_major: version.major,
                version_minor: version.minor,
                author_id: author.user_id,
                reviewer_id: draft.reviewer_id,
                approver_id: draft.approver_id,
                reason_for_change: draft.reason_for_change,
                effective_date: draft.effective_date,
                supersedes_id: None,
                file_key: None,
                file_name: None,
                file_content_type: None,
                file_size: None,
                file_checksum: None,
            })
            .get_result(conn)?;

        start_workflow(conn, &document, author.user_id, WORKFLOW_REVIEW, "Document created")?;

        audit::record(
            conn,
            AuditEvent::new(
                Some(author.user_id),
                "document.create",
                RESOURCE_DOCUMENT,
                document.id,
                format!("Created document {}", document.document_number),
            )
            .new_values(json!({
                "document_number": document.document_number,
                "title": document.title,
                "version": format!("{}.{}", document.version_major, document.version_minor),
            })),
            client,
        )?;

        info!(document_id = %document.id, number = %document.document_number, "document created");
        Ok(document)
    })
}

/// Runs `action` on the document inside one transaction with the document row locked.
pub fn transition(
    conn: &mut PgConnection,
    document_id: Uuid,
    action: WorkflowAction,
    actor: &Actor,
    request: TransitionRequest,
    client: &ClientInfo,
    today: NaiveDate,
) -> AppResult<TransitionOutcome> {
    conn.transaction::<_, AppError, _>(|conn| {
        apply_locked(conn, document_id, action, actor, request, client, today)
    })
}

fn apply_locked(
    conn: &mut PgConnection,
    document_id: Uuid,
    action: WorkflowAction,
    actor: &Actor,
    request: TransitionRequest,
    client: &ClientInfo,
    today: NaiveDate,
) -> AppResult<TransitionOutcome> {
    let mut document: Document = documents::table
        .find(document_id)
        .for_update()
        .first(conn)
        .optional()?
        .ok_or(WorkflowError::NotFound)?;
    let from = parse_status(&document)?;

    if action == WorkflowAction::SubmitForReview {
        if let Some(reviewer) = request.reviewer_id {
            ensure_assignable(conn, reviewer, PermissionLevel::Review)?;
            document.reviewer_id = Some(reviewer);
        }
    }
    if action == WorkflowAction::RouteForApproval {
        if let Some(approver) = request.approver_id {
            ensure_assignable(conn, approver, PermissionLevel::Approve)?;
            document.approver_id = Some(approver);
        }
    }

    let mut ctx = context_for(conn, &document, actor, today)?;
    ctx.comment = request.comment.clone();
    ctx.reviewer_id = document.reviewer_id;
    ctx.approver_id = document.approver_id;
    if action == WorkflowAction::Approve {
        ctx.effective_date = request.effective_date.or(document.effective_date);
    }
    if action == WorkflowAction::ScheduleObsolescence {
        ctx.obsolescence_date = request.obsolescence_date;
    }

    let to = plan_transition(from, action, &ctx)?;

    let (obsolescence_date, obsolescence_reason) = match action {
        WorkflowAction::ScheduleObsolescence => (ctx.obsolescence_date, request.comment.clone()),
        WorkflowAction::CancelObsolescence => (None, None),
        _ => (document.obsolescence_date, document.obsolescence_reason.clone()),
    };

    let now = Utc::now().naive_utc();
    let updated: Document = diesel::update(documents::table.find(document_id))
        .set((
            documents::status.eq(to.as_str()),
            documents::reviewer_id.eq(document.reviewer_id),
            documents::approver_id.eq(document.approver_id),
            documents::effective_date.eq(ctx.effective_date),
            documents::obsolescence_date.eq(obsolescence_date),
            documents::obsolescence_reason.eq(obsolescence_reason),
            documents::updated_at.eq(now),
        ))
        .get_result(conn)?;

    let mut data = Map::new();
    data.insert("action".into(), json!(action.as_str()));
    match action {
        WorkflowAction::SubmitForReview => {
            data.insert("reviewer_id".into(), json!(updated.reviewer_id));
        }
        WorkflowAction::RouteForApproval => {
            data.insert("approver_id".into(), json!(updated.approver_id));
        }
        WorkflowAction::Approve | WorkflowAction::Activate => {
            data.insert("effective_date".into(), json!(updated.effective_date));
        }
        WorkflowAction::ScheduleObsolescence | WorkflowAction::Obsolete => {
            data.insert("obsolescence_date".into(), json!(updated.obsolescence_date));
        }
        _ => {}
    }

    let (workflow, transition) = record_transition(
        conn,
        &updated,
        from,
        to,
        action,
        actor.id(),
        request.comment.as_deref().unwrap_or_default(),
        Value::Object(data),
        client,
    )?;

    let mut superseded_document_id = None;
    if to == DocumentStatus::ApprovedAndEffective && from != DocumentStatus::ScheduledForObsolescence {
        if let Some(previous) = updated.supersedes_id {
            if supersede(conn, previous, &updated, actor.id(), client, today)? {
                superseded_document_id = Some(previous);
            }
        }
    }

    info!(
        document_id = %document_id,
        action = %action,
        from = %from,
        to = %to,
        "document transitioned"
    );

    Ok(TransitionOutcome {
        document: updated,
        workflow,
        transition,
        superseded_document_id,
    })
}

/// Updates the workflow row, appends the transition, audits it and notifies the next actor.
#[allow(clippy::too_many_arguments)]
fn record_transition(
    conn: &mut PgConnection,
    document: &Document,
    from: DocumentStatus,
    to: DocumentStatus,
    action: WorkflowAction,
    actor_id: Option<Uuid>,
    comment: &str,
    transition_data: Value,
    client: &ClientInfo,
) -> AppResult<(DocumentWorkflow, DocumentTransition)> {
    let now = Utc::now().naive_utc();
    let current = load_workflow(conn, document.id)?;
    let workflow_type = match action.workflow_type() {
        Some(WORKFLOW_REVIEW) if current.workflow_type == WORKFLOW_UP_VERSION => {
            current.workflow_type.clone()
        }
        Some(kind) => kind.to_string(),
        None => current.workflow_type.clone(),
    };

    let workflow: DocumentWorkflow = diesel::update(document_workflows::table.find(current.id))
        .set((
            document_workflows::workflow_type.eq(workflow_type),
            document_workflows::current_state.eq(to.as_str()),
            document_workflows::current_assignee.eq(assignee_for(
                to,
                document.author_id,
                document.reviewer_id,
                document.approver_id,
            )),
            document_workflows::is_terminated.eq(to.is_terminal()),
            document_workflows::updated_at.eq(now),
        ))
        .get_result(conn)?;

    let transition: DocumentTransition = diesel::insert_into(document_transitions::table)
        .values(NewDocumentTransition {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            from_state: from.as_str().to_string(),
            to_state: to.as_str().to_string(),
            transitioned_by: actor_id,
            comment: comment.to_string(),
            transition_data,
            transitioned_at: now,
        })
        .get_result(conn)?;

    audit::record(
        conn,
        AuditEvent::new(
            actor_id,
            format!("workflow.{action}"),
            RESOURCE_DOCUMENT,
            document.id,
            format!("{} moved from {from} to {to}", document.document_number),
        )
        .old(json!({ "status": from }))
        .new_values(json!({ "status": to, "comment": comment })),
        client,
    )?;

    if let Some((recipient, kind, subject, body)) = notifications::for_transition(document, from, to) {
        if Some(recipient) != actor_id {
            notifications::notify(conn, recipient, Some(document.id), kind, subject, body)?;
        }
    }

    Ok((workflow, transition))
}

/// Marks `previous_id` superseded by `successor` when it is still effective.
fn supersede(
    conn: &mut PgConnection,
    previous_id: Uuid,
    successor: &Document,
    actor_id: Option<Uuid>,
    client: &ClientInfo,
    today: NaiveDate,
) -> AppResult<bool> {
    let previous: Document = documents::table
        .find(previous_id)
        .for_update()
        .first(conn)?;
    let from = parse_status(&previous)?;

    let system_ctx = TransitionContext {
        actor_id: None,
        actor_level: PermissionLevel::Admin,
        author_id: previous.author_id,
        reviewer_id: previous.reviewer_id,
        approver_id: previous.approver_id,
        effective_date: previous.effective_date,
        obsolescence_date: previous.obsolescence_date,
        comment: None,
        has_effective_dependents: false,
        today,
    };
    let to = match target_status(from, WorkflowAction::Supersede, &system_ctx) {
        Ok(to) => to,
        Err(_) => {
            warn!(document_id = %previous_id, status = %from, "predecessor not effective; left as is");
            return Ok(false);
        }
    };

    let updated: Document = diesel::update(documents::table.find(previous_id))
        .set((
            documents::status.eq(to.as_str()),
            documents::updated_at.eq(Utc::now().naive_utc()),
        ))
        .get_result(conn)?;

    record_transition(
        conn,
        &updated,
        from,
        to,
        WorkflowAction::Supersede,
        actor_id,
        &format!(
            "Superseded by version {}.{}",
            successor.version_major, successor.version_minor
        ),
        json!({
            "action": WorkflowAction::Supersede.as_str(),
            "superseded_by": successor.id,
            "superseded_on": today,
        }),
        client,
    )?;

    Ok(true)
}

/// Starts a new DRAFT version of an effective document.
pub fn create_new_version(
    conn: &mut PgConnection,
    source_id: Uuid,
    actor: &UserPermissions,
    bump: VersionBump,
    reason_for_change: String,
    client: &ClientInfo,
) -> AppResult<Document> {
    if !actor.has(PermissionLevel::Write) {
        return Err(AppError::forbidden("write permission required"));
    }
    if reason_for_change.trim().is_empty() {
        return Err(AppError::bad_request("reason_for_change is required"));
    }

    conn.transaction::<_, AppError, _>(|conn| {
        let source: Document = documents::table
            .find(source_id)
            .for_update()
            .first(conn)
            .optional()?
            .ok_or(WorkflowError::NotFound)?;
        let status = parse_status(&source)?;
        if status != DocumentStatus::ApprovedAndEffective {
            return Err(AppError::conflict(format!(
                "cannot create a new version of a document in status {status}"
            ))
            .with_detail(status.as_str()));
        }

        let pending: Option<Document> = documents::table
            .filter(documents::supersedes_id.eq(source.id))
            .filter(documents::status.ne(DocumentStatus::Terminated.as_str()))
            .first(conn)
            .optional()?;
        if let Some(pending) = pending {
            return Err(AppError::conflict("a newer version is already in progress")
                .with_detail(pending.id.to_string()));
        }

        let version =
            VersionNumber::new(source.version_major, source.version_minor).bump(bump);
        let document: Document = diesel::insert_into(documents::table)
            .values(NewDocument {
                id: Uuid::new_v4(),
                document_number: source.document_number.clone(),
                title: source.title.clone(),
                description: source.description.clone(),
                document_type_id: source.document_type_id,
                document_source_id: source.document_source_id,
                status: DocumentStatus::Draft.as_str().to_string(),
                version_major: version.major,
                version_minor: version.minor,
                author_id: actor.user_id,
                reviewer_id: source.reviewer_id.filter(|id| *id != actor.user_id),
                approver_id: source.approver_id.filter(|id| *id != actor.user_id),
                reason_for_change: reason_for_change.trim().to_string(),
                effective_date: None,
                supersedes_id: Some(source.id),
                file_key: source.file_key.clone(),
                file_name: source.file_name.clone(),
                file_content_type: source.file_content_type.clone(),
                file_size: source.file_size,
                file_checksum: source.file_checksum.clone(),
            })
            .get_result(conn)?;

        let inherited: Vec<DocumentDependency> = document_dependencies::table
            .filter(document_dependencies::document_id.eq(source.id))
            .load(conn)?;
        let copies: Vec<NewDocumentDependency> = inherited
            .into_iter()
            .map(|dependency| NewDocumentDependency {
                id: Uuid::new_v4(),
                document_id: document.id,
                depends_on_id: dependency.depends_on_id,
                dependency_type: dependency.dependency_type,
                created_by: Some(actor.user_id),
            })
            .collect();
        if !copies.is_empty() {
            diesel::insert_into(document_dependencies::table)
                .values(&copies)
                .execute(conn)?;
        }

        start_workflow(
            conn,
            &document,
            actor.user_id,
            WORKFLOW_UP_VERSION,
            &format!("New version {version} of {}", source.document_number),
        )?;

        audit::record(
            conn,
            AuditEvent::new(
                Some(actor.user_id),
                "document.new_version",
                RESOURCE_DOCUMENT,
                document.id,
                format!("Created version {version} of {}", document.document_number),
            )
            .old(json!({ "source_id": source.id, "version": format!("{}.{}", source.version_major, source.version_minor) }))
            .new_values(json!({ "version": version.to_string(), "reason_for_change": document.reason_for_change })),
            client,
        )?;

        Ok(document)
    })
}

/// Documents waiting on `user_id`: reviews, approvals and reviewed drafts to route.
pub fn pending_tasks(conn: &mut PgConnection, user_id: Uuid) -> AppResult<Vec<Document>> {
    let review = [
        DocumentStatus::PendingReview.as_str(),
        DocumentStatus::UnderReview.as_str(),
    ];
    let approval = [
        DocumentStatus::PendingApproval.as_str(),
        DocumentStatus::UnderApproval.as_str(),
    ];

    let tasks = documents::table
        .filter(
            documents::reviewer_id
                .eq(user_id)
                .and(documents::status.eq_any(review))
                .or(documents::approver_id
                    .eq(user_id)
                    .and(documents::status.eq_any(approval)))
                .or(documents::author_id
                    .eq(user_id)
                    .and(documents::status.eq(DocumentStatus::Reviewed.as_str()))
                    .nullable()),
        )
        .order(documents::updated_at.asc())
        .load(conn)?;
    Ok(tasks)
}

#[derive(Debug, Default, Serialize)]
pub struct ActivationReport {
    pub activated: Vec<String>,
    pub obsoleted: Vec<String>,
    pub failed: Vec<String>,
    pub dry_run: bool,
}

fn describe(document: &Document) -> String {
    format!(
        "{} v{}.{}",
        document.document_number, document.version_major, document.version_minor
    )
}

/// Activates documents whose effective date has arrived and obsoletes those whose
/// obsolescence date has. Each document commits on its own.
pub fn activate_due_documents(
    conn: &mut PgConnection,
    today: NaiveDate,
    dry_run: bool,
) -> AppResult<ActivationReport> {
    let due_activation: Vec<Document> = documents::table
        .filter(documents::status.eq(DocumentStatus::ApprovedPendingEffective.as_str()))
        .filter(documents::effective_date.le(today))
        .order(documents::effective_date.asc())
        .load(conn)?;
    let due_obsolescence: Vec<Document> = documents::table
        .filter(documents::status.eq(DocumentStatus::ScheduledForObsolescence.as_str()))
        .filter(documents::obsolescence_date.le(today))
        .order(documents::obsolescence_date.asc())
        .load(conn)?;

    let mut report = ActivationReport {
        dry_run,
        ..ActivationReport::default()
    };
    let client = ClientInfo::default();

    for (batch, action) in [
        (due_activation, WorkflowAction::Activate),
        (due_obsolescence, WorkflowAction::Obsolete),
    ] {
        for document in batch {
            let label = describe(&document);
            let result = if dry_run {
                Ok(())
            } else {
                transition(
                    conn,
                    document.id,
                    action,
                    &Actor::System,
                    TransitionRequest::default(),
                    &client,
                    today,
                )
                .map(|_| ())
            };

            match result {
                Ok(()) if action == WorkflowAction::Activate => report.activated.push(label),
                Ok(()) => report.obsoleted.push(label),
                Err(err) => {
                    warn!(document_id = %document.id, error = %err, "scheduled transition failed");
                    report.failed.push(label);
                }
            }
        }
    }

    Ok(report)
}
