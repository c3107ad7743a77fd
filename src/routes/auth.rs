use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode},
    Json,
};
use axum_extra::{headers::Cookie, typed_header::TypedHeader};
use chrono::{Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    audit::{self, AuditEvent, ClientInfo, RESOURCE_USER},
    auth::{
        password,
        permissions::{load_permissions, PermissionLevel},
        AuthenticatedUser,
    },
    error::{AppError, AppResult},
    models::{NewRefreshToken, RefreshToken, User},
    schema::{refresh_tokens, users::dsl},
    state::AppState,
};

use crate::schema::refresh_tokens::dsl as refresh_dsl;

const REFRESH_COOKIE_NAME: &str = "refresh_token";

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

pub async fn login(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(payload): Json<LoginRequest>,
) -> AppResult<(HeaderMap, Json<LoginResponse>)> {
    let mut conn = state.db()?;
    let username = payload.username.trim();

    let user: Option<User> = dsl::users
        .filter(dsl::username.eq(username))
        .first(&mut conn)
        .optional()?;

    let user = match user {
        Some(user) => user,
        None => {
            audit::record_login(&mut conn, username, None, Some("unknown user"), &client)?;
            warn!(username = %username, "login failed: unknown user");
            return Err(AppError::unauthorized());
        }
    };

    let valid = password::verify_password(&payload.password, &user.password_hash)
        .map_err(|_| AppError::unauthorized())?;
    if !valid {
        audit::record_login(&mut conn, username, Some(user.id), Some("invalid password"), &client)?;
        warn!(username = %username, "login failed: invalid password");
        return Err(AppError::unauthorized());
    }
    if !user.is_active {
        audit::record_login(&mut conn, username, Some(user.id), Some("account inactive"), &client)?;
        warn!(username = %username, "login failed: account inactive");
        return Err(AppError::unauthorized());
    }

    let access_token = state
        .jwt
        .generate_token(user.id, &user.username, user.is_superuser)
        .map_err(AppError::from)?;

    let now = Utc::now();
    let refresh_value = generate_refresh_token();
    let refresh_expires_at = now + ChronoDuration::days(state.config.refresh_token_expiry_days);
    store_refresh_token(&mut conn, user.id, &refresh_value, now, refresh_expires_at)?;

    diesel::update(dsl::users.find(user.id))
        .set(dsl::last_login.eq(Some(now.naive_utc())))
        .execute(&mut conn)?;
    audit::record_login(&mut conn, username, Some(user.id), None, &client)?;
    info!(user_id = %user.id, "user logged in");

    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        build_refresh_cookie(&state, &refresh_value, refresh_expires_at)?,
    );

    Ok((
        headers,
        Json(LoginResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: state.config.jwt_expiry_minutes * 60,
        }),
    ))
}

pub async fn refresh(
    State(state): State<AppState>,
    jar: Option<TypedHeader<Cookie>>,
) -> AppResult<(HeaderMap, Json<LoginResponse>)> {
    let cookies = jar.ok_or_else(AppError::unauthorized)?;
    let refresh_value = cookies
        .get(REFRESH_COOKIE_NAME)
        .ok_or_else(AppError::unauthorized)?;

    let hashed = hash_refresh_token(refresh_value);
    let mut conn = state.db()?;
    let now = Utc::now();
    let now_naive = now.naive_utc();

    let token = match refresh_dsl::refresh_tokens
        .filter(refresh_dsl::token_hash.eq(&hashed))
        .filter(refresh_dsl::revoked_at.is_null())
        .filter(refresh_dsl::expires_at.gt(now_naive))
        .first::<RefreshToken>(&mut conn)
    {
        Ok(token) => token,
        Err(diesel::result::Error::NotFound) => return Err(AppError::unauthorized()),
        Err(err) => return Err(AppError::from(err)),
    };

    diesel::update(refresh_dsl::refresh_tokens.filter(refresh_dsl::id.eq(token.id)))
        .set((
            refresh_dsl::revoked_at.eq(now_naive),
            refresh_dsl::updated_at.eq(now_naive),
        ))
        .execute(&mut conn)?;

    let user: User = dsl::users
        .find(token.user_id)
        .first(&mut conn)
        .map_err(AppError::from)?;
    if !user.is_active {
        return Err(AppError::unauthorized());
    }

    let access_token = state
        .jwt
        .generate_token(user.id, &user.username, user.is_superuser)
        .map_err(AppError::from)?;

    let new_refresh_value = generate_refresh_token();
    let new_refresh_expires = now + ChronoDuration::days(state.config.refresh_token_expiry_days);
    store_refresh_token(&mut conn, user.id, &new_refresh_value, now, new_refresh_expires)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        build_refresh_cookie(&state, &new_refresh_value, new_refresh_expires)?,
    );

    Ok((
        headers,
        Json(LoginResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: state.config.jwt_expiry_minutes * 60,
        }),
    ))
}

pub async fn logout(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    jar: Option<TypedHeader<Cookie>>,
) -> AppResult<(HeaderMap, StatusCode)> {
    let mut conn = state.db()?;
    let now = Utc::now().naive_utc();
    let mut rows_affected = 0;

    if let Some(cookies) = jar {
        if let Some(value) = cookies.get(REFRESH_COOKIE_NAME) {
            let hashed = hash_refresh_token(value);
            rows_affected = diesel::update(
                refresh_dsl::refresh_tokens
                    .filter(refresh_dsl::token_hash.eq(hashed))
                    .filter(refresh_dsl::user_id.eq(user.user_id))
                    .filter(refresh_dsl::revoked_at.is_null()),
            )
            .set((
                refresh_dsl::revoked_at.eq(now),
                refresh_dsl::updated_at.eq(now),
            ))
            .execute(&mut conn)?;
        }
    }

    if rows_affected == 0 {
        revoke_all_refresh_tokens(&mut conn, user.user_id)?;
    }

    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, build_clear_refresh_cookie(&state)?);
    Ok((headers, StatusCode::NO_CONTENT))
}

#[derive(Serialize)]
pub struct MeResponse {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub is_superuser: bool,
    pub permission_level: PermissionLevel,
    pub roles: Vec<String>,
}

pub async fn me(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<MeResponse>> {
    let mut conn = state.db()?;
    let permissions = load_permissions(&mut conn, user.user_id)?;
    let record: User = dsl::users.find(user.user_id).first(&mut conn)?;

    Ok(Json(MeResponse {
        user_id: record.id,
        full_name: record.full_name(),
        username: record.username,
        email: record.email,
        is_superuser: record.is_superuser,
        permission_level: permissions.level,
        roles: permissions.roles,
    }))
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

pub async fn change_password(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<ChangePasswordRequest>,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    let record: User = dsl::users.find(user.user_id).first(&mut conn)?;

    let valid = password::verify_password(&payload.current_password, &record.password_hash)
        .map_err(|_| AppError::unauthorized())?;
    if !valid {
        return Err(AppError::bad_request("current password is incorrect"));
    }
    password::validate_password_strength(&payload.new_password).map_err(AppError::bad_request)?;
    let password_hash = password::hash_password(&payload.new_password)?;

    conn.transaction::<_, AppError, _>(|conn| {
        diesel::update(dsl::users.find(record.id))
            .set((
                dsl::password_hash.eq(password_hash),
                dsl::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        revoke_all_refresh_tokens(conn, record.id)?;
        audit::record(
            conn,
            AuditEvent::new(
                Some(record.id),
                "user.change_password",
                RESOURCE_USER,
                record.id,
                format!("{} changed their password", record.username),
            )
            .new_values(json!({ "password_changed": true })),
            &client,
        )?;
        Ok(())
    })?;

    Ok(StatusCode::NO_CONTENT)
}

pub(crate) fn revoke_all_refresh_tokens(conn: &mut PgConnection, user_id: Uuid) -> AppResult<usize> {
    let now = Utc::now().naive_utc();
    let revoked = diesel::update(
        refresh_dsl::refresh_tokens
            .filter(refresh_dsl::user_id.eq(user_id))
            .filter(refresh_dsl::revoked_at.is_null()),
    )
    .set((
        refresh_dsl::revoked_at.eq(now),
        refresh_dsl::updated_at.eq(now),
    ))
    .execute(conn)?;
    Ok(revoked)
}

fn store_refresh_token(
    conn: &mut PgConnection,
    user_id: Uuid,
    value: &str,
    issued_at: chrono::DateTime<Utc>,
    expires_at: chrono::DateTime<Utc>,
) -> AppResult<()> {
    diesel::insert_into(refresh_tokens::table)
        .values(NewRefreshToken {
            id: Uuid::new_v4(),
            user_id,
            token_hash: hash_refresh_token(value),
            issued_at: issued_at.naive_utc(),
            expires_at: expires_at.naive_utc(),
        })
        .execute(conn)?;
    Ok(())
}

fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn cookie_attributes(state: &AppState, parts: &mut Vec<String>) {
    parts.push("Path=/".into());
    parts.push("HttpOnly".into());
    parts.push("SameSite=Strict".into());
    if state.config.refresh_cookie_secure {
        parts.push("Secure".into());
    }
    if let Some(domain) = &state.config.refresh_cookie_domain {
        parts.push(format!("Domain={}", domain));
    }
}

fn build_refresh_cookie(
    state: &AppState,
    token: &str,
    expires_at: chrono::DateTime<Utc>,
) -> AppResult<HeaderValue> {
    let max_age = ChronoDuration::days(state.config.refresh_token_expiry_days).num_seconds();

    let mut parts = vec![format!("{}={}", REFRESH_COOKIE_NAME, token)];
    cookie_attributes(state, &mut parts);
    parts.push(format!("Max-Age={}", max_age));
    parts.push(format!("Expires={}", expires_at.to_rfc2822()));

    HeaderValue::from_str(&parts.join("; ")).map_err(AppError::internal)
}

fn build_clear_refresh_cookie(state: &AppState) -> AppResult<HeaderValue> {
    let mut parts = vec![format!("{}=", REFRESH_COOKIE_NAME)];
    cookie_attributes(state, &mut parts);
    parts.push("Max-Age=0".into());
    parts.push("Expires=Thu, 01 Jan 1970 00:00:00 GMT".into());

    HeaderValue::from_str(&parts.join("; ")).map_err(AppError::internal)
}
