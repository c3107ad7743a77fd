use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password_hash: String,
    pub is_active: bool,
    pub is_superuser: bool,
    pub last_login: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl User {
    pub fn full_name(&self) -> String {
        let full = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let trimmed = full.trim();
        if trimmed.is_empty() {
            self.username.clone()
        } else {
            trimmed.to_string()
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password_hash: String,
    pub is_superuser: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = roles)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub module: String,
    pub permission_level: String,
    pub description: String,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = roles)]
pub struct NewRole {
    pub id: Uuid,
    pub name: String,
    pub module: String,
    pub permission_level: String,
    pub description: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = user_roles)]
pub struct UserRole {
    pub id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub assigned_by: Option<Uuid>,
    pub assigned_at: NaiveDateTime,
    pub is_active: bool,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = user_roles)]
pub struct NewUserRole {
    pub id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub assigned_by: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = refresh_tokens)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub revoked_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = refresh_tokens)]
pub struct NewRefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = document_types)]
pub struct DocumentType {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub description: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_types)]
pub struct NewDocumentType {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = document_sources)]
pub struct DocumentSource {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_sources)]
pub struct NewDocumentSource {
    pub id: Uuid,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = documents)]
pub struct Document {
    pub id: Uuid,
    pub document_number: String,
    pub title: String,
    pub description: String,
    pub document_type_id: Uuid,
    pub document_source_id: Option<Uuid>,
    pub status: String,
    pub version_major: i32,
    pub version_minor: i32,
    pub author_id: Uuid,
    pub reviewer_id: Option<Uuid>,
    pub approver_id: Option<Uuid>,
    pub reason_for_change: String,
    pub effective_date: Option<NaiveDate>,
    pub obsolescence_date: Option<NaiveDate>,
    pub obsolescence_reason: Option<String>,
    pub supersedes_id: Option<Uuid>,
    pub file_key: Option<String>,
    pub file_name: Option<String>,
    pub file_content_type: Option<String>,
    pub file_size: Option<i64>,
    pub file_checksum: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub document_number: String,
    pub title: String,
    pub description: String,
    pub document_type_id: Uuid,
    pub document_source_id: Option<Uuid>,
    pub status: String,
    pub version_major: i32,
    pub version_minor: i32,
    pub author_id: Uuid,
    pub reviewer_id: Option<Uuid>,
    pub approver_id: Option<Uuid>,
    pub reason_for_change: String,
    pub effective_date: Option<NaiveDate>,
    pub supersedes_id: Option<Uuid>,
    pub file_key: Option<String>,
    pub file_name: Option<String>,
    pub file_content_type: Option<String>,
    pub file_size: Option<i64>,
    pub file_checksum: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = document_dependencies)]
pub struct DocumentDependency {
    pub id: Uuid,
    pub document_id: Uuid,
    pub depends_on_id: Uuid,
    pub dependency_type: String,
    pub created_by: Option<Uuid>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_dependencies)]
pub struct NewDocumentDependency {
    pub id: Uuid,
    pub document_id: Uuid,
    pub depends_on_id: Uuid,
    pub dependency_type: String,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = document_workflows)]
pub struct DocumentWorkflow {
    pub id: Uuid,
    pub document_id: Uuid,
    pub workflow_type: String,
    pub current_state: String,
    pub initiated_by: Uuid,
    pub current_assignee: Option<Uuid>,
    pub due_date: Option<NaiveDate>,
    pub is_terminated: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_workflows)]
pub struct NewDocumentWorkflow {
    pub id: Uuid,
    pub document_id: Uuid,
    pub workflow_type: String,
    pub current_state: String,
    pub initiated_by: Uuid,
    pub current_assignee: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = document_transitions)]
pub struct DocumentTransition {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub from_state: String,
    pub to_state: String,
    pub transitioned_by: Option<Uuid>,
    pub comment: String,
    pub transition_data: serde_json::Value,
    pub transitioned_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = document_transitions)]
pub struct NewDocumentTransition {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub from_state: String,
    pub to_state: String,
    pub transitioned_by: Option<Uuid>,
    pub comment: String,
    pub transition_data: serde_json::Value,
    pub transitioned_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = audit_trail)]
pub struct AuditEntry {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub description: String,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub checksum: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = login_audit)]
pub struct LoginAudit {
    pub id: Uuid,
    pub username: String,
    pub user_id: Option<Uuid>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = login_audit)]
pub struct NewLoginAudit {
    pub id: Uuid,
    pub username: String,
    pub user_id: Option<Uuid>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = notifications)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub document_id: Option<Uuid>,
    pub notification_type: String,
    pub subject: String,
    pub body: String,
    pub is_read: bool,
    pub created_at: NaiveDateTime,
    pub sent_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = notifications)]
pub struct NewNotification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub document_id: Option<Uuid>,
    pub notification_type: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = placeholder_definitions)]
pub struct PlaceholderDefinition {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub data_source: String,
    pub field_path: String,
    pub default_value: String,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = placeholder_definitions)]
pub struct NewPlaceholderDefinition {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub data_source: String,
    pub field_path: String,
    pub default_value: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = backup_configurations)]
pub struct BackupConfiguration {
    pub id: Uuid,
    pub name: String,
    pub backup_type: String,
    pub frequency: String,
    pub retention_days: i32,
    pub is_enabled: bool,
    pub created_by: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = backup_configurations)]
pub struct NewBackupConfiguration {
    pub id: Uuid,
    pub name: String,
    pub backup_type: String,
    pub frequency: String,
    pub retention_days: i32,
    pub is_enabled: bool,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = backup_jobs)]
pub struct BackupJob {
    pub id: Uuid,
    pub configuration_id: Option<Uuid>,
    pub job_name: String,
    pub backup_type: String,
    pub status: String,
    pub backup_file_path: Option<String>,
    pub file_size: Option<i64>,
    pub checksum: Option<String>,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub duration_seconds: Option<i32>,
    pub error_message: Option<String>,
    pub triggered_by: Option<Uuid>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = backup_jobs)]
pub struct NewBackupJob {
    pub id: Uuid,
    pub configuration_id: Option<Uuid>,
    pub job_name: String,
    pub backup_type: String,
    pub status: String,
    pub triggered_by: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = system_settings)]
#[diesel(primary_key(key))]
pub struct SystemSetting {
    pub key: String,
    pub value: serde_json::Value,
    pub description: String,
    pub updated_by: Option<Uuid>,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub run_after: NaiveDateTime,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub run_after: NaiveDateTime,
}
