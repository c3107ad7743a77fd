use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use chrono::{NaiveDateTime, Timelike, Utc};
use diesel::prelude::*;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{AuditEntry, NewLoginAudit},
    schema::{audit_trail, login_audit},
};

pub const RESOURCE_DOCUMENT: &str = "document";
pub const RESOURCE_USER: &str = "user";
pub const RESOURCE_ROLE: &str = "role";
pub const RESOURCE_DOCUMENT_TYPE: &str = "document_type";
pub const RESOURCE_DOCUMENT_SOURCE: &str = "document_source";
pub const RESOURCE_PLACEHOLDER: &str = "placeholder";
pub const RESOURCE_BACKUP: &str = "backup";
pub const RESOURCE_SETTING: &str = "setting";
pub const RESOURCE_SYSTEM: &str = "system";

/// Caller address and agent, taken from proxy headers.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        let ip_address = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|value| value.trim().to_string())
            .or_else(|| {
                headers
                    .get("x-real-ip")
                    .and_then(|value| value.to_str().ok())
                    .map(|value| value.trim().to_string())
            })
            .filter(|value| !value.is_empty());
        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        Self {
            ip_address,
            user_agent,
        }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientInfo {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientInfo::from_headers(&parts.headers))
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub user_id: Option<Uuid>,
    pub action: String,
    pub resource_type: &'static str,
    pub resource_id: Option<String>,
    pub description: String,
    pub old_values: Option<Value>,
    pub new_values: Option<Value>,
}

impl AuditEvent {
    pub fn new(
        user_id: Option<Uuid>,
        action: impl Into<String>,
        resource_type: &'static str,
        resource_id: impl ToString,
        description: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            action: action.into(),
            resource_type,
            resource_id: Some(resource_id.to_string()),
            description: description.into(),
            old_values: None,
            new_values: None,
        }
    }

    pub fn old(mut self, values: Value) -> Self {
        self.old_values = Some(values);
        self
    }

    pub fn new_values(mut self, values: Value) -> Self {
        self.new_values = Some(values);
        self
    }
}

/// Current time at the precision Postgres keeps, so checksums survive a round trip.
pub fn audit_timestamp() -> NaiveDateTime {
    let now = Utc::now().naive_utc();
    let micros = now.nanosecond() / 1_000 * 1_000;
    now.with_nanosecond(micros).unwrap_or(now)
}

fn canonical_payload(entry: &AuditEntry) -> Value {
    json!({
        "id": entry.id,
        "user_id": entry.user_id,
        "action": entry.action,
        "resource_type": entry.resource_type,
        "resource_id": entry.resource_id,
        "description": entry.description,
        "old_values": entry.old_values,
        "new_values": entry.new_values,
        "ip_address": entry.ip_address,
        "user_agent": entry.user_agent,
        "created_at": entry.created_at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
    })
}

/// SHA-256 over every field except the checksum itself. Object keys serialize sorted.
pub fn compute_checksum(entry: &AuditEntry) -> String {
    let payload = canonical_payload(entry);
    let digest = Sha256::digest(payload.to_string().as_bytes());
    hex::encode(digest)
}

pub fn checksum_matches(entry: &AuditEntry) -> bool {
    compute_checksum(entry) == entry.checksum
}

pub fn record(
    conn: &mut PgConnection,
    event: AuditEvent,
    client: &ClientInfo,
) -> AppResult<AuditEntry> {
    let mut entry = AuditEntry {
        id: Uuid::new_v4(),
        user_id: event.user_id,
        action: event.action,
        resource_type: event.resource_type.to_string(),
        resource_id: event.resource_id,
        description: event.description,
        old_values: event.old_values,
        new_values: event.new_values,
        ip_address: client.ip_address.clone(),
        user_agent: client.user_agent.clone(),
        checksum: String::new(),
        created_at: audit_timestamp(),
    };
    entry.checksum = compute_checksum(&entry);

    let stored = diesel::insert_into(audit_trail::table)
        .values(&entry)
        .get_result::<AuditEntry>(conn)?;
    Ok(stored)
}

pub fn record_login(
    conn: &mut PgConnection,
    username: &str,
    user_id: Option<Uuid>,
    failure_reason: Option<&str>,
    client: &ClientInfo,
) -> AppResult<()> {
    diesel::insert_into(login_audit::table)
        .values(NewLoginAudit {
            id: Uuid::new_v4(),
            username: username.to_string(),
            user_id,
            success: failure_reason.is_none(),
            failure_reason: failure_reason.map(str::to_string),
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        })
        .execute(conn)?;
    Ok(())
}

#[derive(Debug, serde::Serialize)]
pub struct VerifyReport {
    pub checked: usize,
    pub invalid: Vec<Uuid>,
}

const VERIFY_BATCH: i64 = 500;

pub fn verify_all(conn: &mut PgConnection) -> AppResult<VerifyReport> {
    let mut report = VerifyReport {
        checked: 0,
        invalid: Vec::new(),
    };
    let mut offset = 0;

    loop {
        let batch: Vec<AuditEntry> = audit_trail::table
            .order((audit_trail::created_at.asc(), audit_trail::id.asc()))
            .limit(VERIFY_BATCH)
            .offset(offset)
            .load(conn)?;
        if batch.is_empty() {
            break;
        }
        offset += batch.len() as i64;
        for entry in &batch {
            report.checked += 1;
            if !checksum_matches(entry) {
                report.invalid.push(entry.id);
            }
        }
    }

    if !report.invalid.is_empty() {
        tracing::warn!(invalid = report.invalid.len(), "audit checksum mismatches found");
    }

    Ok(report)
}
