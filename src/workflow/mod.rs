//! Document lifecycle state machine.
//!
//! The rules here are pure: they take the stored status plus the facts about the actor and
//! the document, and answer with the next status or the reason the action is refused.
//! `service` applies an accepted transition to the database.

use std::{fmt, str::FromStr};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::auth::permissions::PermissionLevel;
use crate::error::AppError;

pub mod dependencies;
pub mod service;
pub mod version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Draft,
    PendingReview,
    UnderReview,
    Reviewed,
    PendingApproval,
    UnderApproval,
    ApprovedPendingEffective,
    ApprovedAndEffective,
    ScheduledForObsolescence,
    Obsolete,
    Terminated,
    Superseded,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 12] = [
        DocumentStatus::Draft,
        DocumentStatus::PendingReview,
        DocumentStatus::UnderReview,
        DocumentStatus::Reviewed,
        DocumentStatus::PendingApproval,
        DocumentStatus::UnderApproval,
        DocumentStatus::ApprovedPendingEffective,
        DocumentStatus::ApprovedAndEffective,
        DocumentStatus::ScheduledForObsolescence,
        DocumentStatus::Obsolete,
        DocumentStatus::Terminated,
        DocumentStatus::Superseded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Draft => "DRAFT",
            DocumentStatus::PendingReview => "PENDING_REVIEW",
            DocumentStatus::UnderReview => "UNDER_REVIEW",
            DocumentStatus::Reviewed => "REVIEWED",
            DocumentStatus::PendingApproval => "PENDING_APPROVAL",
            DocumentStatus::UnderApproval => "UNDER_APPROVAL",
            DocumentStatus::ApprovedPendingEffective => "APPROVED_PENDING_EFFECTIVE",
            DocumentStatus::ApprovedAndEffective => "APPROVED_AND_EFFECTIVE",
            DocumentStatus::ScheduledForObsolescence => "SCHEDULED_FOR_OBSOLESCENCE",
            DocumentStatus::Obsolete => "OBSOLETE",
            DocumentStatus::Terminated => "TERMINATED",
            DocumentStatus::Superseded => "SUPERSEDED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DocumentStatus::Obsolete | DocumentStatus::Terminated | DocumentStatus::Superseded
        )
    }

    /// Statuses that precede effectiveness and may still be terminated.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            DocumentStatus::Draft
                | DocumentStatus::PendingReview
                | DocumentStatus::UnderReview
                | DocumentStatus::Reviewed
                | DocumentStatus::PendingApproval
                | DocumentStatus::UnderApproval
                | DocumentStatus::ApprovedPendingEffective
        )
    }

    pub fn is_effective(self) -> bool {
        matches!(
            self,
            DocumentStatus::ApprovedAndEffective | DocumentStatus::ScheduledForObsolescence
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = WorkflowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase();
        DocumentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| WorkflowError::UnknownStatus(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    SubmitForReview,
    StartReview,
    ApproveReview,
    RejectReview,
    RouteForApproval,
    StartApproval,
    Approve,
    RejectApproval,
    Activate,
    ScheduleObsolescence,
    CancelObsolescence,
    Obsolete,
    Terminate,
    Supersede,
}

impl WorkflowAction {
    /// Actions a person can request; the rest are performed by the scheduler.
    pub const USER_ACTIONS: [WorkflowAction; 10] = [
        WorkflowAction::SubmitForReview,
        WorkflowAction::StartReview,
        WorkflowAction::ApproveReview,
        WorkflowAction::RejectReview,
        WorkflowAction::RouteForApproval,
        WorkflowAction::StartApproval,
        WorkflowAction::Approve,
        WorkflowAction::RejectApproval,
        WorkflowAction::ScheduleObsolescence,
        WorkflowAction::CancelObsolescence,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowAction::SubmitForReview => "submit_for_review",
            WorkflowAction::StartReview => "start_review",
            WorkflowAction::ApproveReview => "approve_review",
            WorkflowAction::RejectReview => "reject_review",
            WorkflowAction::RouteForApproval => "route_for_approval",
            WorkflowAction::StartApproval => "start_approval",
            WorkflowAction::Approve => "approve",
            WorkflowAction::RejectApproval => "reject_approval",
            WorkflowAction::Activate => "activate",
            WorkflowAction::ScheduleObsolescence => "schedule_obsolescence",
            WorkflowAction::CancelObsolescence => "cancel_obsolescence",
            WorkflowAction::Obsolete => "obsolete",
            WorkflowAction::Terminate => "terminate",
            WorkflowAction::Supersede => "supersede",
        }
    }

    pub fn is_system(self) -> bool {
        matches!(
            self,
            WorkflowAction::Activate | WorkflowAction::Obsolete | WorkflowAction::Supersede
        )
    }

    /// Workflow category recorded on the workflow row when this action starts a new phase.
    pub fn workflow_type(self) -> Option<&'static str> {
        match self {
            WorkflowAction::SubmitForReview => Some(WORKFLOW_REVIEW),
            WorkflowAction::ScheduleObsolescence => Some(WORKFLOW_OBSOLETE),
            WorkflowAction::Terminate => Some(WORKFLOW_TERMINATE),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const WORKFLOW_REVIEW: &str = "REVIEW";
pub const WORKFLOW_UP_VERSION: &str = "UP_VERSION";
pub const WORKFLOW_OBSOLETE: &str = "OBSOLETE";
pub const WORKFLOW_TERMINATE: &str = "TERMINATE";

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown document status '{0}'")]
    UnknownStatus(String),
    #[error("cannot {action} a document in status {status}")]
    InvalidTransition {
        action: WorkflowAction,
        status: DocumentStatus,
    },
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("document not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

impl From<WorkflowError> for AppError {
    fn from(value: WorkflowError) -> Self {
        match value {
            WorkflowError::InvalidTransition { action, status } => AppError::conflict(format!(
                "cannot {action} a document in status {status}"
            ))
            .with_detail(status.as_str()),
            WorkflowError::Forbidden(message) => AppError::forbidden(message),
            WorkflowError::Validation(message) => AppError::bad_request(message),
            WorkflowError::Conflict(message) => AppError::conflict(message),
            WorkflowError::NotFound => AppError::not_found(),
            WorkflowError::UnknownStatus(status) => {
                AppError::internal(format!("unknown document status '{status}'"))
            }
            WorkflowError::Database(err) => AppError::from(err),
        }
    }
}

/// Everything the rules need to know about one requested transition.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    /// `None` when the scheduler or a management command acts.
    pub actor_id: Option<Uuid>,
    pub actor_level: PermissionLevel,
    pub author_id: Uuid,
    pub reviewer_id: Option<Uuid>,
    pub approver_id: Option<Uuid>,
    pub effective_date: Option<NaiveDate>,
    pub obsolescence_date: Option<NaiveDate>,
    pub comment: Option<String>,
    pub has_effective_dependents: bool,
    pub today: NaiveDate,
}

impl TransitionContext {
    fn actor_is(&self, user_id: Option<Uuid>) -> bool {
        matches!((self.actor_id, user_id), (Some(actor), Some(expected)) if actor == expected)
    }

    fn actor_is_author(&self) -> bool {
        self.actor_id == Some(self.author_id)
    }

    fn has_comment(&self) -> bool {
        self.comment
            .as_deref()
            .map(|comment| !comment.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Resulting status of `action` from `status`, ignoring who asks.
pub fn target_status(
    status: DocumentStatus,
    action: WorkflowAction,
    ctx: &TransitionContext,
) -> Result<DocumentStatus, WorkflowError> {
    use DocumentStatus::*;
    use WorkflowAction::*;

    let next = match (status, action) {
        (Draft, SubmitForReview) => PendingReview,
        (PendingReview, StartReview) => UnderReview,
        (UnderReview, ApproveReview) => Reviewed,
        (UnderReview, RejectReview) => Draft,
        (Reviewed, RouteForApproval) => PendingApproval,
        (PendingApproval, StartApproval) => UnderApproval,
        (UnderApproval, Approve) => match ctx.effective_date {
            Some(date) if date <= ctx.today => ApprovedAndEffective,
            _ => ApprovedPendingEffective,
        },
        (UnderApproval, RejectApproval) => Draft,
        (ApprovedPendingEffective, Activate) => ApprovedAndEffective,
        (ApprovedAndEffective, ScheduleObsolescence) => ScheduledForObsolescence,
        (ScheduledForObsolescence, CancelObsolescence) => ApprovedAndEffective,
        (ScheduledForObsolescence, WorkflowAction::Obsolete) => DocumentStatus::Obsolete,
        (current, Terminate) if current.is_in_flight() => Terminated,
        (ApprovedAndEffective | ScheduledForObsolescence, Supersede) => Superseded,
        _ => return Err(WorkflowError::InvalidTransition { action, status }),
    };

    Ok(next)
}

/// Checks that the actor in `ctx` may perform `action`.
pub fn authorize(action: WorkflowAction, ctx: &TransitionContext) -> Result<(), WorkflowError> {
    use WorkflowAction::*;

    if action.is_system() {
        return if ctx.actor_id.is_none() {
            Ok(())
        } else {
            Err(WorkflowError::Forbidden(format!(
                "{action} is performed by the scheduler only"
            )))
        };
    }

    if ctx.actor_id.is_none() {
        return Err(WorkflowError::Forbidden(format!(
            "{action} requires an authenticated user"
        )));
    }

    match action {
        SubmitForReview | RouteForApproval => {
            if !ctx.actor_is_author() {
                return Err(WorkflowError::Forbidden(
                    "only the author can route this document".into(),
                ));
            }
            if ctx.actor_level < PermissionLevel::Write {
                return Err(WorkflowError::Forbidden("write permission required".into()));
            }
        }
        StartReview | ApproveReview | RejectReview => {
            if ctx.actor_is_author() {
                return Err(WorkflowError::Forbidden(
                    "authors cannot review their own documents".into(),
                ));
            }
            if !ctx.actor_is(ctx.reviewer_id) {
                return Err(WorkflowError::Forbidden(
                    "only the assigned reviewer can review this document".into(),
                ));
            }
            if ctx.actor_level < PermissionLevel::Review {
                return Err(WorkflowError::Forbidden("review permission required".into()));
            }
        }
        StartApproval | Approve | RejectApproval => {
            if ctx.actor_is_author() {
                return Err(WorkflowError::Forbidden(
                    "authors cannot approve their own documents".into(),
                ));
            }
            if !ctx.actor_is(ctx.approver_id) {
                return Err(WorkflowError::Forbidden(
                    "only the assigned approver can approve this document".into(),
                ));
            }
            if ctx.actor_level < PermissionLevel::Approve {
                return Err(WorkflowError::Forbidden("approve permission required".into()));
            }
        }
        ScheduleObsolescence => {
            if ctx.actor_is_author() {
                return Err(WorkflowError::Forbidden(
                    "authors cannot obsolete their own documents".into(),
                ));
            }
            if ctx.actor_level < PermissionLevel::Approve {
                return Err(WorkflowError::Forbidden("approve permission required".into()));
            }
        }
        CancelObsolescence => {
            if ctx.actor_level < PermissionLevel::Approve {
                return Err(WorkflowError::Forbidden("approve permission required".into()));
            }
        }
        Terminate => {
            if !ctx.actor_is_author() && ctx.actor_level < PermissionLevel::Admin {
                return Err(WorkflowError::Forbidden(
                    "only the author or an administrator can terminate this document".into(),
                ));
            }
        }
        Activate | Obsolete | Supersede => {}
    }

    Ok(())
}

/// Checks the inputs an action needs beyond who performs it.
pub fn validate_inputs(
    action: WorkflowAction,
    ctx: &TransitionContext,
) -> Result<(), WorkflowError> {
    use WorkflowAction::*;

    match action {
        SubmitForReview => match ctx.reviewer_id {
            None => {
                return Err(WorkflowError::Validation(
                    "a reviewer must be assigned before submitting for review".into(),
                ))
            }
            Some(reviewer) if reviewer == ctx.author_id => {
                return Err(WorkflowError::Validation(
                    "the reviewer must be different from the author".into(),
                ))
            }
            Some(_) => {}
        },
        RouteForApproval => match ctx.approver_id {
            None => {
                return Err(WorkflowError::Validation(
                    "an approver must be assigned before routing for approval".into(),
                ))
            }
            Some(approver) if approver == ctx.author_id => {
                return Err(WorkflowError::Validation(
                    "the approver must be different from the author".into(),
                ))
            }
            Some(_) => {}
        },
        RejectReview | RejectApproval | Terminate => {
            if !ctx.has_comment() {
                return Err(WorkflowError::Validation(format!(
                    "a comment is required to {action}"
                )));
            }
        }
        Approve => {
            if ctx.effective_date.is_none() {
                return Err(WorkflowError::Validation(
                    "an effective date is required to approve".into(),
                ));
            }
        }
        Activate => match ctx.effective_date {
            Some(date) if date <= ctx.today => {}
            _ => {
                return Err(WorkflowError::Validation(
                    "effective date has not been reached".into(),
                ))
            }
        },
        ScheduleObsolescence => {
            match ctx.obsolescence_date {
                None => {
                    return Err(WorkflowError::Validation(
                        "an obsolescence date is required".into(),
                    ))
                }
                Some(date) if date < ctx.today => {
                    return Err(WorkflowError::Validation(
                        "obsolescence date cannot be in the past".into(),
                    ))
                }
                Some(_) => {}
            }
            if !ctx.has_comment() {
                return Err(WorkflowError::Validation(
                    "a reason is required to schedule obsolescence".into(),
                ));
            }
            if ctx.has_effective_dependents {
                return Err(WorkflowError::Conflict(
                    "effective documents still depend on this document".into(),
                ));
            }
        }
        Obsolete => match ctx.obsolescence_date {
            Some(date) if date <= ctx.today => {}
            _ => {
                return Err(WorkflowError::Validation(
                    "obsolescence date has not been reached".into(),
                ))
            }
        },
        StartReview | ApproveReview | StartApproval | CancelObsolescence | Supersede => {}
    }

    Ok(())
}

/// Full check of a requested transition: graph, actor, then inputs.
pub fn plan_transition(
    status: DocumentStatus,
    action: WorkflowAction,
    ctx: &TransitionContext,
) -> Result<DocumentStatus, WorkflowError> {
    let next = target_status(status, action, ctx)?;
    authorize(action, ctx)?;
    validate_inputs(action, ctx)?;
    Ok(next)
}

/// User actions the actor could take right now, before any request body is supplied.
pub fn available_actions(status: DocumentStatus, ctx: &TransitionContext) -> Vec<WorkflowAction> {
    let mut actions: Vec<WorkflowAction> = WorkflowAction::USER_ACTIONS
        .into_iter()
        .filter(|action| {
            target_status(status, *action, ctx).is_ok() && authorize(*action, ctx).is_ok()
        })
        .collect();

    if target_status(status, WorkflowAction::Terminate, ctx).is_ok()
        && authorize(WorkflowAction::Terminate, ctx).is_ok()
    {
        actions.push(WorkflowAction::Terminate);
    }

    actions
}

/// Who is expected to act next once a document sits in `status`.
pub fn assignee_for(
    status: DocumentStatus,
    author_id: Uuid,
    reviewer_id: Option<Uuid>,
    approver_id: Option<Uuid>,
) -> Option<Uuid> {
    match status {
        DocumentStatus::Draft | DocumentStatus::Reviewed => Some(author_id),
        DocumentStatus::PendingReview | DocumentStatus::UnderReview => reviewer_id,
        DocumentStatus::PendingApproval | DocumentStatus::UnderApproval => approver_id,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    struct Cast {
        author: Uuid,
        reviewer: Uuid,
        approver: Uuid,
    }

    fn cast() -> Cast {
        Cast {
            author: Uuid::new_v4(),
            reviewer: Uuid::new_v4(),
            approver: Uuid::new_v4(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 15).unwrap()
    }

    fn ctx(cast: &Cast, actor: Option<Uuid>, level: PermissionLevel) -> TransitionContext {
        TransitionContext {
            actor_id: actor,
            actor_level: level,
            author_id: cast.author,
            reviewer_id: Some(cast.reviewer),
            approver_id: Some(cast.approver),
            effective_date: Some(today()),
            obsolescence_date: None,
            comment: None,
            has_effective_dependents: false,
            today: today(),
        }
    }

    #[test]
    fn statuses_round_trip_through_strings() {
        for status in DocumentStatus::ALL {
            assert_eq!(status.as_str().parse::<DocumentStatus>().unwrap(), status);
        }
        assert!("ARCHIVED".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn full_happy_path_reaches_effective() {
        let cast = cast();
        let author = ctx(&cast, Some(cast.author), PermissionLevel::Write);
        let reviewer = ctx(&cast, Some(cast.reviewer), PermissionLevel::Review);
        let approver = ctx(&cast, Some(cast.approver), PermissionLevel::Approve);

        let steps = [
            (DocumentStatus::Draft, WorkflowAction::SubmitForReview, &author),
            (DocumentStatus::PendingReview, WorkflowAction::StartReview, &reviewer),
            (DocumentStatus::UnderReview, WorkflowAction::ApproveReview, &reviewer),
            (DocumentStatus::Reviewed, WorkflowAction::RouteForApproval, &author),
            (DocumentStatus::PendingApproval, WorkflowAction::StartApproval, &approver),
            (DocumentStatus::UnderApproval, WorkflowAction::Approve, &approver),
        ];

        let mut status = DocumentStatus::Draft;
        for (expected_from, action, actor) in steps {
            assert_eq!(status, expected_from);
            status = plan_transition(status, action, actor).unwrap();
        }
        assert_eq!(status, DocumentStatus::ApprovedAndEffective);
    }

    #[test]
    fn future_effective_date_waits_for_activation() {
        let cast = cast();
        let mut approver = ctx(&cast, Some(cast.approver), PermissionLevel::Approve);
        approver.effective_date = Some(today() + Duration::days(10));
        let next = plan_transition(DocumentStatus::UnderApproval, WorkflowAction::Approve, &approver)
            .unwrap();
        assert_eq!(next, DocumentStatus::ApprovedPendingEffective);

        let mut system = ctx(&cast, None, PermissionLevel::Admin);
        system.effective_date = approver.effective_date;
        let err = plan_transition(next, WorkflowAction::Activate, &system).unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        system.today = today() + Duration::days(10);
        assert_eq!(
            plan_transition(next, WorkflowAction::Activate, &system).unwrap(),
            DocumentStatus::ApprovedAndEffective
        );
    }

    #[test]
    fn author_cannot_review_or_approve_own_document() {
        let cast = cast();
        let mut own = ctx(&cast, Some(cast.author), PermissionLevel::Admin);
        own.reviewer_id = Some(cast.author);
        own.approver_id = Some(cast.author);

        let err = plan_transition(DocumentStatus::PendingReview, WorkflowAction::StartReview, &own)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden(_)));

        let err = plan_transition(DocumentStatus::UnderApproval, WorkflowAction::Approve, &own)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden(_)));

        let err = plan_transition(DocumentStatus::Draft, WorkflowAction::SubmitForReview, &own)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[test]
    fn rejections_return_to_draft_and_need_a_comment() {
        let cast = cast();
        let mut reviewer = ctx(&cast, Some(cast.reviewer), PermissionLevel::Review);
        let err =
            plan_transition(DocumentStatus::UnderReview, WorkflowAction::RejectReview, &reviewer)
                .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        reviewer.comment = Some("Section 4 is incomplete".into());
        assert_eq!(
            plan_transition(DocumentStatus::UnderReview, WorkflowAction::RejectReview, &reviewer)
                .unwrap(),
            DocumentStatus::Draft
        );

        let mut approver = ctx(&cast, Some(cast.approver), PermissionLevel::Approve);
        approver.comment = Some("Wrong template".into());
        assert_eq!(
            plan_transition(
                DocumentStatus::UnderApproval,
                WorkflowAction::RejectApproval,
                &approver
            )
            .unwrap(),
            DocumentStatus::Draft
        );
    }

    #[test]
    fn only_assigned_reviewer_with_review_level_may_review() {
        let cast = cast();
        let stranger = ctx(&cast, Some(Uuid::new_v4()), PermissionLevel::Admin);
        assert!(matches!(
            plan_transition(DocumentStatus::PendingReview, WorkflowAction::StartReview, &stranger),
            Err(WorkflowError::Forbidden(_))
        ));

        let weak_reviewer = ctx(&cast, Some(cast.reviewer), PermissionLevel::Write);
        assert!(matches!(
            plan_transition(
                DocumentStatus::PendingReview,
                WorkflowAction::StartReview,
                &weak_reviewer
            ),
            Err(WorkflowError::Forbidden(_))
        ));
    }

    #[test]
    fn terminal_statuses_accept_no_actions() {
        let cast = cast();
        let admin = ctx(&cast, Some(cast.author), PermissionLevel::Admin);
        let system = ctx(&cast, None, PermissionLevel::Admin);
        for status in [
            DocumentStatus::Obsolete,
            DocumentStatus::Terminated,
            DocumentStatus::Superseded,
        ] {
            assert!(status.is_terminal());
            for action in WorkflowAction::USER_ACTIONS {
                assert!(target_status(status, action, &admin).is_err());
            }
            for action in [
                WorkflowAction::Activate,
                WorkflowAction::Obsolete,
                WorkflowAction::Supersede,
                WorkflowAction::Terminate,
            ] {
                assert!(target_status(status, action, &system).is_err());
            }
        }
    }

    #[test]
    fn terminate_requires_author_or_admin() {
        let cast = cast();
        let mut reviewer = ctx(&cast, Some(cast.reviewer), PermissionLevel::Approve);
        reviewer.comment = Some("duplicate".into());
        assert!(matches!(
            plan_transition(DocumentStatus::Draft, WorkflowAction::Terminate, &reviewer),
            Err(WorkflowError::Forbidden(_))
        ));

        let mut author = ctx(&cast, Some(cast.author), PermissionLevel::Write);
        author.comment = Some("duplicate".into());
        assert_eq!(
            plan_transition(DocumentStatus::PendingApproval, WorkflowAction::Terminate, &author)
                .unwrap(),
            DocumentStatus::Terminated
        );
        assert!(matches!(
            plan_transition(
                DocumentStatus::ApprovedAndEffective,
                WorkflowAction::Terminate,
                &author
            ),
            Err(WorkflowError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn obsolescence_is_blocked_by_effective_dependents() {
        let cast = cast();
        let mut approver = ctx(&cast, Some(cast.approver), PermissionLevel::Approve);
        approver.obsolescence_date = Some(today() + Duration::days(30));
        approver.comment = Some("replaced by new process".into());
        approver.has_effective_dependents = true;

        assert!(matches!(
            plan_transition(
                DocumentStatus::ApprovedAndEffective,
                WorkflowAction::ScheduleObsolescence,
                &approver
            ),
            Err(WorkflowError::Conflict(_))
        ));

        approver.has_effective_dependents = false;
        assert_eq!(
            plan_transition(
                DocumentStatus::ApprovedAndEffective,
                WorkflowAction::ScheduleObsolescence,
                &approver
            )
            .unwrap(),
            DocumentStatus::ScheduledForObsolescence
        );
    }

    #[test]
    fn scheduler_actions_reject_people() {
        let cast = cast();
        let admin = ctx(&cast, Some(cast.approver), PermissionLevel::Admin);
        assert!(matches!(
            plan_transition(
                DocumentStatus::ApprovedPendingEffective,
                WorkflowAction::Activate,
                &admin
            ),
            Err(WorkflowError::Forbidden(_))
        ));
    }

    #[test]
    fn available_actions_follow_role() {
        let cast = cast();
        let author = ctx(&cast, Some(cast.author), PermissionLevel::Write);
        assert_eq!(
            available_actions(DocumentStatus::Draft, &author),
            vec![WorkflowAction::SubmitForReview, WorkflowAction::Terminate]
        );

        let reviewer = ctx(&cast, Some(cast.reviewer), PermissionLevel::Review);
        assert_eq!(
            available_actions(DocumentStatus::UnderReview, &reviewer),
            vec![WorkflowAction::ApproveReview, WorkflowAction::RejectReview]
        );
        assert!(available_actions(DocumentStatus::Draft, &reviewer).is_empty());
    }

    #[test]
    fn assignee_tracks_next_actor() {
        let cast = cast();
        let assignee = |status| {
            assignee_for(
                status,
                cast.author,
                Some(cast.reviewer),
                Some(cast.approver),
            )
        };
        assert_eq!(assignee(DocumentStatus::PendingReview), Some(cast.reviewer));
        assert_eq!(assignee(DocumentStatus::Reviewed), Some(cast.author));
        assert_eq!(assignee(DocumentStatus::UnderApproval), Some(cast.approver));
        assert_eq!(assignee(DocumentStatus::ApprovedAndEffective), None);
    }
}
