mod common;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use chrono::Utc;
use common::{acquire_db_lock, expect_json, TestApp};
use diesel::prelude::*;
use edms::auth::permissions::PermissionLevel;
use edms::schema::audit_trail;
use serde_json::{json, Value};
use uuid::Uuid;

fn actions(rows: &Value) -> Vec<String> {
    rows.as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row["action"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn trail_records_changes_and_detects_tampering() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, admin) = app.user_with_token("admin", PermissionLevel::Admin).await?;
    let (_, reader) = app.user_with_token("reader", PermissionLevel::Read).await?;

    expect_json(
        app.put_json(
            "/api/v1/settings/site_name",
            &json!({ "value": "Plant 1", "description": "Shown in page headers" }),
            Some(&admin),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    let updated = expect_json(
        app.put_json(
            "/api/v1/settings/site_name",
            &json!({ "value": "Plant 2" }),
            Some(&admin),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(updated["value"], json!("Plant 2"));

    let forbidden = app.get("/api/v1/audit/trail", Some(&reader)).await?;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let trail = expect_json(
        app.get(
            "/api/v1/audit/trail?resource_type=setting&resource_id=site_name",
            Some(&admin),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(actions(&trail), vec!["setting.update", "setting.update"]);
    assert_eq!(trail[0]["old_values"]["value"], json!("Plant 1"));
    assert_eq!(trail[0]["new_values"]["value"], json!("Plant 2"));

    let today = Utc::now().date_naive();
    let dated = expect_json(
        app.get(
            &format!("/api/v1/audit/trail?action=setting.update&from={today}&to={today}"),
            Some(&admin),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(dated.as_array().map(Vec::len), Some(2));

    let inverted = app
        .get(
            "/api/v1/audit/trail?from=2025-02-01&to=2025-01-01",
            Some(&admin),
        )
        .await?;
    assert_eq!(inverted.status(), StatusCode::BAD_REQUEST);

    let clean = expect_json(
        app.get("/api/v1/audit/verify", Some(&admin)).await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(clean["invalid"], json!([]));
    assert!(clean["checked"].as_u64().unwrap_or_default() >= 2);

    let tampered: Uuid = trail[0]["id"]
        .as_str()
        .context("audit id missing")?
        .parse()?;
    app.with_conn(move |conn| {
        diesel::update(audit_trail::table.find(tampered))
            .set(audit_trail::description.eq("nothing to see here"))
            .execute(conn)?;
        Ok(())
    })
    .await?;

    let report = expect_json(
        app.get("/api/v1/audit/verify", Some(&admin)).await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(report["invalid"], json!([tampered]));

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn placeholders_resolve_against_a_document() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let (_, admin) = app.user_with_token("admin", PermissionLevel::Admin).await?;
    let (_, author) = app.user_with_token("author", PermissionLevel::Write).await?;
    let sop = app.document_type_id("SOP").await?;

    let created = expect_json(
        app.post_json(
            "/api/v1/documents",
            &json!({ "title": "Hand washing", "document_type_id": sop }),
            Some(&author),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    let document_id = created["document"]["id"].clone();
    let number = created["document"]["document_number"]
        .as_str()
        .context("number missing")?
        .to_string();

    let invalid_name = app
        .post_json(
            "/api/v1/placeholders",
            &json!({ "name": "site name", "display_name": "Site", "data_source": "STATIC" }),
            Some(&admin),
        )
        .await?;
    assert_eq!(invalid_name.status(), StatusCode::BAD_REQUEST);

    let not_admin = app
        .post_json(
            "/api/v1/placeholders",
            &json!({ "name": "SITE", "display_name": "Site", "data_source": "STATIC" }),
            Some(&author),
        )
        .await?;
    assert_eq!(not_admin.status(), StatusCode::FORBIDDEN);

    expect_json(
        app.post_json(
            "/api/v1/placeholders",
            &json!({
                "name": "SITE",
                "display_name": "Site",
                "data_source": "static",
                "default_value": "Plant 1",
            }),
            Some(&admin),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;

    let rendered = expect_json(
        app.post_json(
            "/api/v1/placeholders/render",
            &json!({
                "document_id": document_id,
                "template": "{{DOC_NUMBER}} v{{DOC_VERSION}} by {{AUTHOR_NAME}} at {{SITE}} {{UNKNOWN}}",
            }),
            Some(&author),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(
        rendered["rendered"],
        json!(format!("{number} v1.0 by author Tester at Plant 1 {{{{UNKNOWN}}}}"))
    );

    app.cleanup().await?;
    Ok(())
}
