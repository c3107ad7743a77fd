mod common;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use common::{acquire_db_lock, expect_json, TestApp, PASSWORD};
use edms::auth::permissions::PermissionLevel;
use edms::seed;
use serde_json::{json, Value};
use uuid::Uuid;

fn id_of(value: &Value) -> Result<Uuid> {
    Ok(value["id"].as_str().context("id missing")?.parse()?)
}

#[tokio::test]
async fn admin_creates_users_and_grants_roles() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, admin) = app.user_with_token("admin", PermissionLevel::Admin).await?;

    let created = expect_json(
        app.post_json(
            "/api/v1/users",
            &json!({
                "username": "dana",
                "email": "dana@example.com",
                "first_name": "Dana",
                "last_name": "Quality",
                "password": "long-enough-password",
            }),
            Some(&admin),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    let dana = id_of(&created)?;
    assert_eq!(created["permission_level"], json!("read"));
    assert_eq!(created["full_name"], json!("Dana Quality"));

    let duplicate = app
        .post_json(
            "/api/v1/users",
            &json!({ "username": "dana", "password": "long-enough-password" }),
            Some(&admin),
        )
        .await?;
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let weak = app
        .post_json(
            "/api/v1/users",
            &json!({ "username": "erin", "password": "short" }),
            Some(&admin),
        )
        .await?;
    assert_eq!(weak.status(), StatusCode::BAD_REQUEST);

    let roles = expect_json(app.get("/api/v1/roles", Some(&admin)).await?, StatusCode::OK).await?;
    let approver_role = roles
        .as_array()
        .and_then(|rows| {
            rows.iter()
                .find(|row| row["permission_level"] == json!("approve"))
        })
        .context("approver role not seeded")?;
    let approver_role_id = id_of(approver_role)?;

    let granted = expect_json(
        app.post_json(
            &format!("/api/v1/users/{dana}/roles"),
            &json!({ "role_id": approver_role_id }),
            Some(&admin),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(granted["permission_level"], json!("approve"));

    let assignable = expect_json(
        app.get("/api/v1/users/assignable?level=approve", Some(&admin))
            .await?,
        StatusCode::OK,
    )
    .await?;
    let names: Vec<&str> = assignable
        .as_array()
        .map(|rows| rows.iter().filter_map(|row| row["username"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(names, vec!["admin", "dana"]);

    let revoked = expect_json(
        app.delete(
            &format!("/api/v1/users/{dana}/roles/{approver_role_id}"),
            Some(&admin),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(revoked["permission_level"], json!("read"));

    let again = app
        .delete(
            &format!("/api/v1/users/{dana}/roles/{approver_role_id}"),
            Some(&admin),
        )
        .await?;
    assert_eq!(again.status(), StatusCode::NOT_FOUND);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn non_admins_cannot_manage_users() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (approver_id, approver) = app.user_with_token("approver", PermissionLevel::Approve).await?;
    let other = app.insert_user("other", PermissionLevel::Read).await?;

    let listing = app.get("/api/v1/users", Some(&approver)).await?;
    assert_eq!(listing.status(), StatusCode::FORBIDDEN);

    let create = app
        .post_json(
            "/api/v1/users",
            &json!({ "username": "mallory", "password": "long-enough-password" }),
            Some(&approver),
        )
        .await?;
    assert_eq!(create.status(), StatusCode::FORBIDDEN);

    let own = app
        .get(&format!("/api/v1/users/{approver_id}"), Some(&approver))
        .await?;
    assert_eq!(own.status(), StatusCode::OK);

    let someone_else = app
        .get(&format!("/api/v1/users/{other}"), Some(&approver))
        .await?;
    assert_eq!(someone_else.status(), StatusCode::FORBIDDEN);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn deactivation_and_password_reset() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (admin_id, admin) = app.user_with_token("admin", PermissionLevel::Admin).await?;
    let (frank_id, frank) = app.user_with_token("frank", PermissionLevel::Write).await?;

    let self_deactivate = app
        .patch_json(
            &format!("/api/v1/users/{admin_id}"),
            &json!({ "is_active": false }),
            Some(&admin),
        )
        .await?;
    assert_eq!(self_deactivate.status(), StatusCode::BAD_REQUEST);

    let reset = app
        .post_json(
            &format!("/api/v1/users/{frank_id}/reset-password"),
            &json!({ "new_password": "reset-by-admin-1" }),
            Some(&admin),
        )
        .await?;
    assert_eq!(reset.status(), StatusCode::NO_CONTENT);
    assert!(app.login_token("frank", PASSWORD).await.is_err());
    app.login_token("frank", "reset-by-admin-1").await?;

    let deactivated = expect_json(
        app.patch_json(
            &format!("/api/v1/users/{frank_id}"),
            &json!({ "is_active": false }),
            Some(&admin),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(deactivated["is_active"], json!(false));

    let me = app.get("/api/v1/auth/me", Some(&frank)).await?;
    assert_eq!(me.status(), StatusCode::UNAUTHORIZED);
    assert!(app.login_token("frank", "reset-by-admin-1").await.is_err());

    let trail = expect_json(
        app.get(
            &format!("/api/v1/audit/trail?resource_id={frank_id}"),
            Some(&admin),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    let actions: Vec<&str> = trail
        .as_array()
        .map(|rows| rows.iter().filter_map(|row| row["action"].as_str()).collect())
        .unwrap_or_default();
    assert!(actions.contains(&"user.reset_password"));
    assert!(actions.contains(&"user.update"));

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn system_reinit_wipes_data_and_installs_a_new_admin() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, admin) = app.user_with_token("admin", PermissionLevel::Admin).await?;
    let sop = app.document_type_id("SOP").await?;
    expect_json(
        app.post_json(
            "/api/v1/documents",
            &json!({ "title": "Soon gone", "document_type_id": sop }),
            Some(&admin),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;

    let weak = app
        .with_conn(|conn| Ok(seed::system_reinit(conn, "root", "short").is_err()))
        .await?;
    assert!(weak);
    app.login_token("admin", PASSWORD).await?;

    let report = app
        .with_conn(|conn| Ok(seed::system_reinit(conn, "root", "reinit-password-1")?))
        .await?;
    let root_id = report.admin_id.context("admin not created")?;
    assert!(report.roles > 0);
    assert!(report.document_types > 0);

    assert!(app.login_token("admin", PASSWORD).await.is_err());
    let root = app.login_token("root", "reinit-password-1").await?;

    let documents = expect_json(app.get("/api/v1/documents", Some(&root)).await?, StatusCode::OK).await?;
    assert_eq!(documents, json!([]));
    app.document_type_id("SOP").await?;

    let trail = expect_json(
        app.get("/api/v1/audit/trail?action=system.reinit", Some(&root))
            .await?,
        StatusCode::OK,
    )
    .await?;
    let rows = trail.as_array().context("audit rows expected")?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["user_id"], json!(root_id));

    app.cleanup().await?;
    Ok(())
}
