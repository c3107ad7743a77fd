use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use diesel::prelude::*;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::{JobExecution, JobHandler};
use crate::{
    jobs::JOB_SEND_NOTIFICATION,
    models::{Job, Notification, User},
    notifications::{self, document_link, WebhookPayload, MAX_DELIVERY_ATTEMPTS, RETRY_DELAY_SECONDS},
    schema::{notifications as notifications_table, users},
    state::AppState,
};

#[derive(Debug, Deserialize)]
struct NotificationPayload {
    notification_id: Uuid,
}

pub struct SendNotificationJob {
    client: reqwest::Client,
}

impl SendNotificationJob {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    fn retry_or_fail(&self, job: &Job, error: String) -> JobExecution {
        if job.attempts >= MAX_DELIVERY_ATTEMPTS {
            JobExecution::Failed { error }
        } else {
            JobExecution::Retry {
                delay: Duration::from_secs(RETRY_DELAY_SECONDS),
                error,
            }
        }
    }
}

impl Default for SendNotificationJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for SendNotificationJob {
    fn job_type(&self) -> &'static str {
        JOB_SEND_NOTIFICATION
    }

    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution {
        let payload: NotificationPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid notification payload: {err}"),
                }
            }
        };

        let loaded = state.db().and_then(|mut conn| {
            let notification: Option<Notification> = notifications_table::table
                .find(payload.notification_id)
                .first(&mut conn)
                .optional()?;
            let recipient: Option<User> = match &notification {
                Some(notification) => users::table
                    .find(notification.recipient_id)
                    .first(&mut conn)
                    .optional()?,
                None => None,
            };
            Ok((notification, recipient))
        });

        let (notification, recipient) = match loaded {
            Ok((Some(notification), recipient)) => (notification, recipient),
            Ok((None, _)) => {
                warn!(notification_id = %payload.notification_id, "notification vanished before delivery");
                return JobExecution::Success;
            }
            Err(err) => return self.retry_or_fail(&job, err.to_string()),
        };

        if notification.sent_at.is_some() {
            return JobExecution::Success;
        }

        if let Some(url) = state.config.notification_webhook_url.as_deref() {
            let body = WebhookPayload {
                id: notification.id,
                recipient_id: notification.recipient_id,
                recipient_email: recipient.as_ref().map(|user| user.email.as_str()),
                document_id: notification.document_id,
                notification_type: &notification.notification_type,
                subject: &notification.subject,
                body: &notification.body,
                link: document_link(
                    state.config.public_base_url.as_deref(),
                    notification.document_id,
                ),
            };

            let response = self.client.post(url).json(&body).send().await;
            match response.and_then(|response| response.error_for_status()) {
                Ok(_) => {}
                Err(err) => {
                    return self.retry_or_fail(&job, format!("webhook delivery failed: {err}"));
                }
            }
        }

        let marked = state
            .db()
            .and_then(|mut conn| notifications::mark_sent(&mut conn, notification.id));
        match marked {
            Ok(()) => {
                info!(notification_id = %notification.id, recipient_id = %notification.recipient_id, "notification delivered");
                JobExecution::Success
            }
            Err(err) => self.retry_or_fail(&job, err.to_string()),
        }
    }
}
