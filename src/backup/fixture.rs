use std::collections::BTreeMap;

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::BackupResult;
use crate::{
    models::{
        AuditEntry, BackupConfiguration, Document, DocumentDependency, DocumentSource,
        DocumentTransition, DocumentType, DocumentWorkflow, LoginAudit, Notification,
        PlaceholderDefinition, Role, SystemSetting, User, UserRole,
    },
    schema::{
        audit_trail, backup_configurations, document_dependencies, document_sources,
        document_transitions, document_types, document_workflows, documents, login_audit,
        notifications, placeholder_definitions, roles, system_settings, user_roles, users,
    },
};

/// Rows per insert statement; keeps the widest table under the bind parameter limit.
const INSERT_CHUNK: usize = 500;

/// Tables in foreign-key order. Restores insert in this order.
pub const DOMAIN_TABLES: [&str; 15] = [
    "users",
    "roles",
    "user_roles",
    "document_types",
    "document_sources",
    "documents",
    "document_dependencies",
    "document_workflows",
    "document_transitions",
    "audit_trail",
    "login_audit",
    "notifications",
    "placeholder_definitions",
    "backup_configurations",
    "system_settings",
];

/// Every domain table's rows. Refresh tokens, queued jobs and backup history stay out.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Fixture {
    pub users: Vec<User>,
    pub roles: Vec<Role>,
    pub user_roles: Vec<UserRole>,
    pub document_types: Vec<DocumentType>,
    pub document_sources: Vec<DocumentSource>,
    pub documents: Vec<Document>,
    pub document_dependencies: Vec<DocumentDependency>,
    pub document_workflows: Vec<DocumentWorkflow>,
    pub document_transitions: Vec<DocumentTransition>,
    pub audit_trail: Vec<AuditEntry>,
    pub login_audit: Vec<LoginAudit>,
    pub notifications: Vec<Notification>,
    pub placeholder_definitions: Vec<PlaceholderDefinition>,
    pub backup_configurations: Vec<BackupConfiguration>,
    pub system_settings: Vec<SystemSetting>,
}

impl Fixture {
    pub fn counts(&self) -> BTreeMap<String, usize> {
        let sizes = [
            self.users.len(),
            self.roles.len(),
            self.user_roles.len(),
            self.document_types.len(),
            self.document_sources.len(),
            self.documents.len(),
            self.document_dependencies.len(),
            self.document_workflows.len(),
            self.document_transitions.len(),
            self.audit_trail.len(),
            self.login_audit.len(),
            self.notifications.len(),
            self.placeholder_definitions.len(),
            self.backup_configurations.len(),
            self.system_settings.len(),
        ];
        DOMAIN_TABLES
            .iter()
            .zip(sizes)
            .map(|(table, size)| (table.to_string(), size))
            .collect()
    }

    /// Distinct storage keys referenced by documents.
    pub fn storage_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .documents
            .iter()
            .filter_map(|document| document.file_key.clone())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

pub fn export(conn: &mut PgConnection) -> BackupResult<Fixture> {
    Ok(Fixture {
        users: users::table.order(users::created_at.asc()).load(conn)?,
        roles: roles::table.order(roles::created_at.asc()).load(conn)?,
        user_roles: user_roles::table.order(user_roles::assigned_at.asc()).load(conn)?,
        document_types: document_types::table.order(document_types::code.asc()).load(conn)?,
        document_sources: document_sources::table
            .order(document_sources::name.asc())
            .load(conn)?,
        documents: documents::table.order(documents::created_at.asc()).load(conn)?,
        document_dependencies: document_dependencies::table
            .order(document_dependencies::created_at.asc())
            .load(conn)?,
        document_workflows: document_workflows::table
            .order(document_workflows::created_at.asc())
            .load(conn)?,
        document_transitions: document_transitions::table
            .order(document_transitions::transitioned_at.asc())
            .load(conn)?,
        audit_trail: audit_trail::table.order(audit_trail::created_at.asc()).load(conn)?,
        login_audit: login_audit::table.order(login_audit::created_at.asc()).load(conn)?,
        notifications: notifications::table
            .order(notifications::created_at.asc())
            .load(conn)?,
        placeholder_definitions: placeholder_definitions::table
            .order(placeholder_definitions::name.asc())
            .load(conn)?,
        backup_configurations: backup_configurations::table
            .order(backup_configurations::name.asc())
            .load(conn)?,
        system_settings: system_settings::table
            .order(system_settings::key.asc())
            .load(conn)?,
    })
}

/// Empties every domain table. Tables referencing users (refresh tokens) go with them.
pub fn truncate_domain_tables(conn: &mut PgConnection) -> BackupResult<()> {
    let statement = format!("TRUNCATE TABLE {} CASCADE", DOMAIN_TABLES.join(", "));
    diesel::sql_query(statement).execute(conn)?;
    Ok(())
}

macro_rules! insert_rows {
    ($conn:expr, $table:path, $rows:expr) => {
        for chunk in $rows.chunks(INSERT_CHUNK) {
            diesel::insert_into($table).values(chunk).execute($conn)?;
        }
    };
}

/// Inserts the fixture into empty tables. Callers wrap this in a transaction.
pub fn import(conn: &mut PgConnection, fixture: &Fixture) -> BackupResult<()> {
    insert_rows!(conn, users::table, fixture.users);
    insert_rows!(conn, roles::table, fixture.roles);
    insert_rows!(conn, user_roles::table, fixture.user_roles);
    insert_rows!(conn, document_types::table, fixture.document_types);
    insert_rows!(conn, document_sources::table, fixture.document_sources);
    insert_rows!(conn, documents::table, fixture.documents);
    insert_rows!(conn, document_dependencies::table, fixture.document_dependencies);
    insert_rows!(conn, document_workflows::table, fixture.document_workflows);
    insert_rows!(conn, document_transitions::table, fixture.document_transitions);
    insert_rows!(conn, audit_trail::table, fixture.audit_trail);
    insert_rows!(conn, login_audit::table, fixture.login_audit);
    insert_rows!(conn, notifications::table, fixture.notifications);
    insert_rows!(conn, placeholder_definitions::table, fixture.placeholder_definitions);
    insert_rows!(conn, backup_configurations::table, fixture.backup_configurations);
    insert_rows!(conn, system_settings::table, fixture.system_settings);
    Ok(())
}

pub fn table_counts(conn: &mut PgConnection) -> BackupResult<BTreeMap<String, usize>> {
    let counts: [i64; 15] = [
        users::table.count().get_result(conn)?,
        roles::table.count().get_result(conn)?,
        user_roles::table.count().get_result(conn)?,
        document_types::table.count().get_result(conn)?,
        document_sources::table.count().get_result(conn)?,
        documents::table.count().get_result(conn)?,
        document_dependencies::table.count().get_result(conn)?,
        document_workflows::table.count().get_result(conn)?,
        document_transitions::table.count().get_result(conn)?,
        audit_trail::table.count().get_result(conn)?,
        login_audit::table.count().get_result(conn)?,
        notifications::table.count().get_result(conn)?,
        placeholder_definitions::table.count().get_result(conn)?,
        backup_configurations::table.count().get_result(conn)?,
        system_settings::table.count().get_result(conn)?,
    ];
    Ok(DOMAIN_TABLES
        .iter()
        .zip(counts)
        .map(|(table, count)| (table.to_string(), count.max(0) as usize))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_cover_every_domain_table() {
        let fixture = Fixture::default();
        let counts = fixture.counts();
        assert_eq!(counts.len(), DOMAIN_TABLES.len());
        assert!(counts.values().all(|count| *count == 0));
    }

    #[test]
    fn fixture_json_has_one_array_per_table() {
        let value = serde_json::to_value(Fixture::default()).unwrap();
        let object = value.as_object().unwrap();
        for table in DOMAIN_TABLES {
            assert!(object[table].is_array(), "{table}");
        }
        assert!(!object.contains_key("refresh_tokens"));
        assert!(!object.contains_key("jobs"));
    }
}
