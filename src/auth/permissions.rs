use std::{fmt, str::FromStr};

use diesel::{prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AuthenticatedUser;
use crate::{
    error::{AppError, AppResult},
    models::User,
    schema::{roles, user_roles, users},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Read,
    Write,
    Review,
    Approve,
    Admin,
}

impl PermissionLevel {
    pub const ALL: [PermissionLevel; 5] = [
        PermissionLevel::Read,
        PermissionLevel::Write,
        PermissionLevel::Review,
        PermissionLevel::Approve,
        PermissionLevel::Admin,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PermissionLevel::Read => "read",
            PermissionLevel::Write => "write",
            PermissionLevel::Review => "review",
            PermissionLevel::Approve => "approve",
            PermissionLevel::Admin => "admin",
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        PermissionLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "invalid permission level '{value}'. Allowed levels: read, write, review, approve, admin"
                )
            })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserPermissions {
    pub user_id: Uuid,
    pub is_superuser: bool,
    pub level: PermissionLevel,
    pub roles: Vec<String>,
}

impl UserPermissions {
    pub fn is_admin(&self) -> bool {
        self.level >= PermissionLevel::Admin
    }

    pub fn has(&self, level: PermissionLevel) -> bool {
        self.level >= level
    }
}

/// Highest level granted by a set of role levels; superusers are always admins.
pub fn effective_level(is_superuser: bool, role_levels: &[PermissionLevel]) -> PermissionLevel {
    if is_superuser {
        return PermissionLevel::Admin;
    }
    role_levels
        .iter()
        .copied()
        .max()
        .unwrap_or(PermissionLevel::Read)
}

pub fn load_permissions(conn: &mut PgConnection, user_id: Uuid) -> AppResult<UserPermissions> {
    let user: User = users::table
        .find(user_id)
        .first(conn)
        .optional()?
        .ok_or_else(AppError::unauthorized)?;

    if !user.is_active {
        return Err(AppError::unauthorized());
    }

    let granted: Vec<(String, String)> = user_roles::table
        .inner_join(roles::table)
        .filter(user_roles::user_id.eq(user_id))
        .filter(user_roles::is_active.eq(true))
        .filter(roles::is_active.eq(true))
        .select((roles::name, roles::permission_level))
        .order(roles::name.asc())
        .load(conn)?;

    let levels: Vec<PermissionLevel> = granted
        .iter()
        .filter_map(|(_, level)| level.parse().ok())
        .collect();

    Ok(UserPermissions {
        user_id,
        is_superuser: user.is_superuser,
        level: effective_level(user.is_superuser, &levels),
        roles: granted.into_iter().map(|(name, _)| name).collect(),
    })
}

pub fn require_level(
    conn: &mut PgConnection,
    user: &AuthenticatedUser,
    level: PermissionLevel,
) -> AppResult<UserPermissions> {
    let permissions = load_permissions(conn, user.user_id)?;
    if !permissions.has(level) {
        return Err(AppError::forbidden(format!(
            "{level} permission required"
        )));
    }
    Ok(permissions)
}

pub fn require_admin(
    conn: &mut PgConnection,
    user: &AuthenticatedUser,
) -> AppResult<UserPermissions> {
    require_level(conn, user, PermissionLevel::Admin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(PermissionLevel::Read < PermissionLevel::Write);
        assert!(PermissionLevel::Write < PermissionLevel::Review);
        assert!(PermissionLevel::Review < PermissionLevel::Approve);
        assert!(PermissionLevel::Approve < PermissionLevel::Admin);
    }

    #[test]
    fn effective_level_takes_highest_role() {
        let levels = [PermissionLevel::Write, PermissionLevel::Approve, PermissionLevel::Review];
        assert_eq!(effective_level(false, &levels), PermissionLevel::Approve);
        assert_eq!(effective_level(false, &[]), PermissionLevel::Read);
        assert_eq!(effective_level(true, &[]), PermissionLevel::Admin);
    }

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!("Approve".parse::<PermissionLevel>(), Ok(PermissionLevel::Approve));
        assert!("owner".parse::<PermissionLevel>().is_err());
    }
}
