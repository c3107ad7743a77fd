//! Default reference data and the destructive re-initialisation used by the CLI.

use diesel::prelude::*;
use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::{
    audit::{self, AuditEvent, ClientInfo, RESOURCE_SYSTEM},
    auth::{
        password::{hash_password, validate_password_strength},
        permissions::PermissionLevel,
    },
    backup::fixture,
    error::{AppError, AppResult},
    models::{
        NewDocumentSource, NewDocumentType, NewPlaceholderDefinition, NewRole, NewUser,
        NewUserRole, User,
    },
    placeholders::DataSource,
    schema::{
        document_sources, document_types, placeholder_definitions, roles, user_roles, users,
    },
};

const ROLE_MODULE: &str = "O1";

pub const DEFAULT_ROLES: [(&str, PermissionLevel, &str); 5] = [
    ("Document Viewer", PermissionLevel::Read, "Read effective documents"),
    ("Document Author", PermissionLevel::Write, "Create and edit drafts"),
    ("Document Reviewer", PermissionLevel::Review, "Review submitted documents"),
    ("Document Approver", PermissionLevel::Approve, "Approve reviewed documents"),
    ("Document Administrator", PermissionLevel::Admin, "Administer users and system"),
];

pub const DEFAULT_DOCUMENT_TYPES: [(&str, &str); 6] = [
    ("SOP", "Standard Operating Procedure"),
    ("WI", "Work Instruction"),
    ("POL", "Policy"),
    ("FRM", "Form"),
    ("SPEC", "Specification"),
    ("REC", "Record"),
];

pub const DEFAULT_DOCUMENT_SOURCES: [&str; 3] = [
    "Original Digital Draft",
    "Scanned Original",
    "External Supplier",
];

const DEFAULT_PLACEHOLDERS: [(&str, &str, DataSource, &str); 9] = [
    ("DOC_NUMBER", "Document number", DataSource::Document, "document_number"),
    ("DOC_TITLE", "Document title", DataSource::Document, "title"),
    ("DOC_VERSION", "Version", DataSource::Document, "version"),
    ("DOC_STATUS", "Status", DataSource::Document, "status"),
    ("EFFECTIVE_DATE", "Effective date", DataSource::Document, "effective_date"),
    ("AUTHOR_NAME", "Author", DataSource::User, "author.full_name"),
    ("REVIEWER_NAME", "Reviewer", DataSource::User, "reviewer.full_name"),
    ("APPROVER_NAME", "Approver", DataSource::User, "approver.full_name"),
    ("CURRENT_DATE", "Current date", DataSource::System, "date"),
];

#[derive(Debug, Default, Serialize)]
pub struct SeedReport {
    pub roles: usize,
    pub document_types: usize,
    pub document_sources: usize,
    pub placeholders: usize,
    pub admin_id: Option<Uuid>,
}

/// Inserts missing default roles, types, sources and placeholders.
pub fn seed_reference_data(conn: &mut PgConnection) -> AppResult<SeedReport> {
    let role_rows: Vec<NewRole> = DEFAULT_ROLES
        .iter()
        .map(|(name, level, description)| NewRole {
            id: Uuid::new_v4(),
            name: name.to_string(),
            module: ROLE_MODULE.to_string(),
            permission_level: level.as_str().to_string(),
            description: description.to_string(),
        })
        .collect();
    let roles = diesel::insert_into(roles::table)
        .values(&role_rows)
        .on_conflict(roles::name)
        .do_nothing()
        .execute(conn)?;

    let type_rows: Vec<NewDocumentType> = DEFAULT_DOCUMENT_TYPES
        .iter()
        .map(|(code, name)| NewDocumentType {
            id: Uuid::new_v4(),
            code: code.to_string(),
            name: name.to_string(),
            description: String::new(),
        })
        .collect();
    let document_types = diesel::insert_into(document_types::table)
        .values(&type_rows)
        .on_conflict(document_types::code)
        .do_nothing()
        .execute(conn)?;

    let source_rows: Vec<NewDocumentSource> = DEFAULT_DOCUMENT_SOURCES
        .iter()
        .map(|name| NewDocumentSource {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
        })
        .collect();
    let document_sources = diesel::insert_into(document_sources::table)
        .values(&source_rows)
        .on_conflict(document_sources::name)
        .do_nothing()
        .execute(conn)?;

    let placeholder_rows: Vec<NewPlaceholderDefinition> = DEFAULT_PLACEHOLDERS
        .iter()
        .map(|(name, display_name, source, path)| NewPlaceholderDefinition {
            id: Uuid::new_v4(),
            name: name.to_string(),
            display_name: display_name.to_string(),
            description: String::new(),
            data_source: source.as_str().to_string(),
            field_path: path.to_string(),
            default_value: String::new(),
        })
        .collect();
    let placeholders = diesel::insert_into(placeholder_definitions::table)
        .values(&placeholder_rows)
        .on_conflict(placeholder_definitions::name)
        .do_nothing()
        .execute(conn)?;

    Ok(SeedReport {
        roles,
        document_types,
        document_sources,
        placeholders,
        admin_id: None,
    })
}

/// Creates an active superuser holding the administrator role.
pub fn create_admin(conn: &mut PgConnection, username: &str, password: &str) -> AppResult<User> {
    let username = username.trim();
    if username.is_empty() {
        return Err(AppError::bad_request("admin username is required"));
    }
    validate_password_strength(password).map_err(AppError::bad_request)?;
    let password_hash = hash_password(password)?;

    let admin: User = diesel::insert_into(users::table)
        .values(NewUser {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            password_hash,
            is_superuser: true,
        })
        .get_result(conn)?;

    let admin_role: Option<Uuid> = roles::table
        .filter(roles::permission_level.eq(PermissionLevel::Admin.as_str()))
        .select(roles::id)
        .first(conn)
        .optional()?;
    if let Some(role_id) = admin_role {
        diesel::insert_into(user_roles::table)
            .values(NewUserRole {
                id: Uuid::new_v4(),
                user_id: admin.id,
                role_id,
                assigned_by: None,
            })
            .execute(conn)?;
    }

    Ok(admin)
}

/// Wipes every domain table and seeds defaults plus a fresh administrator.
pub fn system_reinit(
    conn: &mut PgConnection,
    admin_username: &str,
    admin_password: &str,
) -> AppResult<SeedReport> {
    conn.transaction::<_, AppError, _>(|conn| {
        fixture::truncate_domain_tables(conn)?;
        let mut report = seed_reference_data(conn)?;
        let admin = create_admin(conn, admin_username, admin_password)?;
        report.admin_id = Some(admin.id);

        audit::record(
            conn,
            AuditEvent::new(
                Some(admin.id),
                "system.reinit",
                RESOURCE_SYSTEM,
                "system",
                "System data wiped and re-seeded",
            )
            .new_values(json!({
                "admin_username": admin.username,
                "roles": report.roles,
                "document_types": report.document_types,
                "document_sources": report.document_sources,
                "placeholders": report.placeholders,
            })),
            &ClientInfo::default(),
        )?;

        info!(admin = %admin.username, "system re-initialised");
        Ok(report)
    })
}
