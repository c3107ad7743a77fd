use chrono::Utc;
use diesel::{pg::upsert::excluded, prelude::*};
use serde_json::Value;
use uuid::Uuid;

use crate::{error::AppResult, models::SystemSetting, schema::system_settings};

pub const LAST_HEALTH_CHECK: &str = "scheduler.last_health_check";
pub const LAST_DAILY_RUN: &str = "scheduler.last_daily_run";

pub fn list(conn: &mut PgConnection) -> AppResult<Vec<SystemSetting>> {
    let settings = system_settings::table
        .order(system_settings::key.asc())
        .load(conn)?;
    Ok(settings)
}

pub fn get(conn: &mut PgConnection, key: &str) -> AppResult<Option<SystemSetting>> {
    let setting = system_settings::table
        .find(key)
        .first(conn)
        .optional()?;
    Ok(setting)
}

/// Inserts or replaces `key`. Without a description the stored one is kept.
pub fn upsert(
    conn: &mut PgConnection,
    key: &str,
    value: Value,
    description: Option<&str>,
    updated_by: Option<Uuid>,
) -> AppResult<SystemSetting> {
    let now = Utc::now().naive_utc();
    let existing = get(conn, key)?;
    let description = description
        .map(str::to_string)
        .or_else(|| existing.map(|setting| setting.description))
        .unwrap_or_default();

    let row = SystemSetting {
        key: key.to_string(),
        value,
        description,
        updated_by,
        updated_at: now,
    };

    let stored = diesel::insert_into(system_settings::table)
        .values(&row)
        .on_conflict(system_settings::key)
        .do_update()
        .set((
            system_settings::value.eq(excluded(system_settings::value)),
            system_settings::description.eq(excluded(system_settings::description)),
            system_settings::updated_by.eq(excluded(system_settings::updated_by)),
            system_settings::updated_at.eq(excluded(system_settings::updated_at)),
        ))
        .get_result(conn)?;
    Ok(stored)
}
