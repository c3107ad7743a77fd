use chrono::Utc;
use diesel::prelude::*;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    error::AppResult,
    jobs::{enqueue_job, JOB_SEND_NOTIFICATION},
    models::{Document, NewNotification, Notification},
    schema::notifications,
    workflow::DocumentStatus,
};

pub const TYPE_REVIEW_REQUESTED: &str = "REVIEW_REQUESTED";
pub const TYPE_REVIEW_COMPLETED: &str = "REVIEW_COMPLETED";
pub const TYPE_APPROVAL_REQUESTED: &str = "APPROVAL_REQUESTED";
pub const TYPE_APPROVAL_COMPLETED: &str = "APPROVAL_COMPLETED";
pub const TYPE_REJECTED: &str = "REJECTED";
pub const TYPE_EFFECTIVE: &str = "DOCUMENT_EFFECTIVE";
pub const TYPE_TERMINATED: &str = "DOCUMENT_TERMINATED";
pub const TYPE_OBSOLETE: &str = "DOCUMENT_OBSOLETE";

/// Number of delivery attempts before a notification job is given up.
pub const MAX_DELIVERY_ATTEMPTS: i32 = 5;
pub const RETRY_DELAY_SECONDS: u64 = 60;

pub fn notify(
    conn: &mut PgConnection,
    recipient_id: Uuid,
    document_id: Option<Uuid>,
    notification_type: &str,
    subject: String,
    body: String,
) -> AppResult<Notification> {
    let notification: Notification = diesel::insert_into(notifications::table)
        .values(NewNotification {
            id: Uuid::new_v4(),
            recipient_id,
            document_id,
            notification_type: notification_type.to_string(),
            subject,
            body,
        })
        .get_result(conn)?;

    enqueue_job(
        conn,
        JOB_SEND_NOTIFICATION,
        json!({ "notification_id": notification.id }),
        None,
    )?;

    Ok(notification)
}

/// Notification owed after `document` moved from `from` to its current status.
pub fn for_transition(
    document: &Document,
    from: DocumentStatus,
    to: DocumentStatus,
) -> Option<(Uuid, &'static str, String, String)> {
    let label = format!(
        "{} v{}.{} \"{}\"",
        document.document_number, document.version_major, document.version_minor, document.title
    );

    match (from, to) {
        (_, DocumentStatus::PendingReview) => document.reviewer_id.map(|reviewer| {
            (
                reviewer,
                TYPE_REVIEW_REQUESTED,
                format!("Review requested: {}", document.document_number),
                format!("{label} has been submitted for your review."),
            )
        }),
        (_, DocumentStatus::Reviewed) => Some((
            document.author_id,
            TYPE_REVIEW_COMPLETED,
            format!("Review completed: {}", document.document_number),
            format!("{label} has been reviewed and can be routed for approval."),
        )),
        (_, DocumentStatus::PendingApproval) => document.approver_id.map(|approver| {
            (
                approver,
                TYPE_APPROVAL_REQUESTED,
                format!("Approval requested: {}", document.document_number),
                format!("{label} is awaiting your approval."),
            )
        }),
        (DocumentStatus::UnderReview | DocumentStatus::UnderApproval, DocumentStatus::Draft) => {
            Some((
                document.author_id,
                TYPE_REJECTED,
                format!("Returned to draft: {}", document.document_number),
                format!("{label} was rejected and returned to draft."),
            ))
        }
        (_, DocumentStatus::ApprovedPendingEffective) => Some((
            document.author_id,
            TYPE_APPROVAL_COMPLETED,
            format!("Approved: {}", document.document_number),
            format!("{label} has been approved and becomes effective on its effective date."),
        )),
        (_, DocumentStatus::ApprovedAndEffective)
            if from != DocumentStatus::ScheduledForObsolescence =>
        {
            Some((
                document.author_id,
                TYPE_EFFECTIVE,
                format!("Effective: {}", document.document_number),
                format!("{label} is now effective."),
            ))
        }
        (_, DocumentStatus::Terminated) => Some((
            document.author_id,
            TYPE_TERMINATED,
            format!("Terminated: {}", document.document_number),
            format!("{label} has been terminated."),
        )),
        (_, DocumentStatus::Obsolete) => Some((
            document.author_id,
            TYPE_OBSOLETE,
            format!("Obsolete: {}", document.document_number),
            format!("{label} is now obsolete."),
        )),
        _ => None,
    }
}

pub fn list_for_user(
    conn: &mut PgConnection,
    user_id: Uuid,
    unread_only: bool,
    limit: i64,
) -> AppResult<Vec<Notification>> {
    let mut query = notifications::table
        .filter(notifications::recipient_id.eq(user_id))
        .into_boxed();
    if unread_only {
        query = query.filter(notifications::is_read.eq(false));
    }
    let rows = query
        .order(notifications::created_at.desc())
        .limit(limit)
        .load(conn)?;
    Ok(rows)
}

pub fn unread_count(conn: &mut PgConnection, user_id: Uuid) -> AppResult<i64> {
    let count = notifications::table
        .filter(notifications::recipient_id.eq(user_id))
        .filter(notifications::is_read.eq(false))
        .count()
        .get_result(conn)?;
    Ok(count)
}

pub fn mark_read(conn: &mut PgConnection, user_id: Uuid, id: Uuid) -> AppResult<Notification> {
    let updated = diesel::update(
        notifications::table
            .filter(notifications::id.eq(id))
            .filter(notifications::recipient_id.eq(user_id)),
    )
    .set(notifications::is_read.eq(true))
    .get_result(conn)?;
    Ok(updated)
}

pub fn mark_all_read(conn: &mut PgConnection, user_id: Uuid) -> AppResult<usize> {
    let updated = diesel::update(
        notifications::table
            .filter(notifications::recipient_id.eq(user_id))
            .filter(notifications::is_read.eq(false)),
    )
    .set(notifications::is_read.eq(true))
    .execute(conn)?;
    Ok(updated)
}

pub fn mark_sent(conn: &mut PgConnection, id: Uuid) -> AppResult<()> {
    diesel::update(notifications::table.find(id))
        .set(notifications::sent_at.eq(Some(Utc::now().naive_utc())))
        .execute(conn)?;
    Ok(())
}

/// Body posted to the delivery webhook.
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub recipient_email: Option<&'a str>,
    pub document_id: Option<Uuid>,
    pub notification_type: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub link: Option<String>,
}

pub fn document_link(public_base_url: Option<&str>, document_id: Option<Uuid>) -> Option<String> {
    let base = public_base_url?.trim_end_matches('/');
    document_id.map(|id| format!("{base}/documents/{id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn document() -> Document {
        let now = NaiveDate::from_ymd_opt(2026, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        Document {
            id: Uuid::new_v4(),
            document_number: "SOP-2026-0001".into(),
            title: "Cleaning".into(),
            description: String::new(),
            document_type_id: Uuid::new_v4(),
            document_source_id: None,
            status: "DRAFT".into(),
            version_major: 1,
            version_minor: 0,
            author_id: Uuid::new_v4(),
            reviewer_id: Some(Uuid::new_v4()),
            approver_id: Some(Uuid::new_v4()),
            reason_for_change: String::new(),
            effective_date: None,
            obsolescence_date: None,
            obsolescence_reason: None,
            supersedes_id: None,
            file_key: None,
            file_name: None,
            file_content_type: None,
            file_size: None,
            file_checksum: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn routes_notifications_to_next_actor() {
        let doc = document();
        let (to, kind, _, _) =
            for_transition(&doc, DocumentStatus::Draft, DocumentStatus::PendingReview).unwrap();
        assert_eq!(to, doc.reviewer_id.unwrap());
        assert_eq!(kind, TYPE_REVIEW_REQUESTED);

        let (to, kind, _, _) =
            for_transition(&doc, DocumentStatus::UnderApproval, DocumentStatus::Draft).unwrap();
        assert_eq!(to, doc.author_id);
        assert_eq!(kind, TYPE_REJECTED);

        assert!(
            for_transition(&doc, DocumentStatus::PendingReview, DocumentStatus::UnderReview)
                .is_none()
        );
        assert!(for_transition(
            &doc,
            DocumentStatus::ScheduledForObsolescence,
            DocumentStatus::ApprovedAndEffective
        )
        .is_none());
    }

    #[test]
    fn builds_document_links() {
        let id = Uuid::new_v4();
        assert_eq!(
            document_link(Some("https://edms.example.com/"), Some(id)),
            Some(format!("https://edms.example.com/documents/{id}"))
        );
        assert_eq!(document_link(None, Some(id)), None);
    }
}
