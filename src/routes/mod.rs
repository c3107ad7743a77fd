use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, patch, post, put},
    Router,
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::{auth::AuthenticatedUser, state::AppState};

pub mod audit;
pub mod auth;
pub mod backup;
pub mod documents;
pub mod health;
pub mod notifications;
pub mod placeholders;
pub mod reference;
pub mod scheduler;
pub mod settings;
pub mod users;
pub mod workflow;

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 500;
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 512;

/// Clamps list paging to `1..=MAX_PAGE_SIZE` rows from a non-negative offset.
pub fn page_bounds(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = offset.unwrap_or(0).max(0);
    (limit, offset)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let allow_origin = match state.config.cors_allowed_origin.as_ref() {
        Some(origins) => {
            let headers: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .filter_map(|value| match value.parse::<HeaderValue>() {
                    Ok(header) => Some(header),
                    Err(err) => {
                        warn!(origin = %value, error = %err, "ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            AllowOrigin::list(headers)
        }
        None => AllowOrigin::mirror_request(),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn create_router(state: AppState) -> Router<()> {
    let cors = cors_layer(&state);

    let public_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh));

    let auth_routes = Router::new()
        .route("/logout", post(auth::logout))
        .route("/me", get(auth::me))
        .route("/change-password", post(auth::change_password));

    let users_routes = Router::new()
        .route("/", get(users::list_users).post(users::create_user))
        .route("/assignable", get(users::assignable_users))
        .route("/:id", get(users::get_user).patch(users::update_user))
        .route("/:id/reset-password", post(users::reset_password))
        .route("/:id/roles", post(users::assign_role))
        .route("/:id/roles/:role_id", delete(users::revoke_role));

    let roles_routes = Router::new().route("/", get(users::list_roles).post(users::create_role));

    let documents_routes = Router::new()
        .route(
            "/",
            get(documents::list_documents).post(documents::create_document),
        )
        .route(
            "/:id",
            get(documents::get_document)
                .patch(documents::update_document)
                .delete(documents::delete_document),
        )
        .route("/:id/file", post(documents::upload_file))
        .route("/:id/download", get(documents::download_document))
        .route(
            "/:id/dependencies",
            get(documents::list_dependencies).post(documents::add_dependency),
        )
        .route(
            "/:id/dependencies/:dep_id",
            delete(documents::remove_dependency),
        )
        .route("/:id/dependents", get(documents::list_dependents))
        .route("/:id/versions", get(documents::list_versions))
        .route("/:id/workflow", get(workflow::get_workflow))
        .route("/:id/workflow/actions", get(workflow::list_actions))
        .route("/:id/workflow/:action", post(workflow::perform_action));

    let workflows_routes = Router::new()
        .route("/my-tasks", get(workflow::my_tasks))
        .route("/my-tasks/count", get(workflow::my_task_count));

    let audit_routes = Router::new()
        .route("/trail", get(audit::list_trail))
        .route("/logins", get(audit::list_logins))
        .route("/verify", get(audit::verify_trail));

    let notifications_routes = Router::new()
        .route("/", get(notifications::list_notifications))
        .route("/unread-count", get(notifications::unread_count))
        .route("/read-all", post(notifications::mark_all_read))
        .route("/:id/read", post(notifications::mark_read));

    let placeholders_routes = Router::new()
        .route(
            "/",
            get(placeholders::list_placeholders).post(placeholders::create_placeholder),
        )
        .route("/render", post(placeholders::render_template))
        .route(
            "/resolve/:document_id",
            get(placeholders::resolve_placeholders),
        )
        .route("/:id", patch(placeholders::update_placeholder));

    let backup_routes = Router::new()
        .route(
            "/configurations",
            get(backup::list_configurations).post(backup::create_configuration),
        )
        .route(
            "/configurations/:id",
            patch(backup::update_configuration),
        )
        .route("/jobs", get(backup::list_jobs).post(backup::queue_job))
        .route("/jobs/:id", get(backup::get_job))
        .route("/jobs/:id/download", get(backup::download_job))
        .route("/restore", post(backup::restore))
        .route("/prune", post(backup::prune));

    let scheduler_routes = Router::new()
        .route("/status", get(scheduler::scheduler_status))
        .route("/trigger/:task", post(scheduler::trigger_task));

    let settings_routes = Router::new()
        .route("/", get(settings::list_settings))
        .route("/:key", put(settings::put_setting));

    let protected_state = state.clone();
    let protected_routes = Router::new()
        .nest("/auth", auth_routes)
        .nest("/users", users_routes)
        .nest("/roles", roles_routes)
        .route(
            "/document-types",
            get(reference::list_document_types).post(reference::create_document_type),
        )
        .route(
            "/document-sources",
            get(reference::list_document_sources).post(reference::create_document_source),
        )
        .nest("/documents", documents_routes)
        .nest("/workflows", workflows_routes)
        .nest("/audit", audit_routes)
        .nest("/notifications", notifications_routes)
        .nest("/placeholders", placeholders_routes)
        .nest("/backup", backup_routes)
        .nest("/scheduler", scheduler_routes)
        .nest("/settings", settings_routes)
        .layer(middleware::from_extractor_with_state::<AuthenticatedUser, _>(protected_state));

    let api = Router::new().merge(public_routes).merge(protected_routes);

    Router::new()
        .nest("/api/v1", api)
        .with_state(state)
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_bounds_defaults_and_clamps() {
        assert_eq!(page_bounds(None, None), (DEFAULT_PAGE_SIZE, 0));
        assert_eq!(page_bounds(Some(0), Some(-5)), (1, 0));
        assert_eq!(page_bounds(Some(10_000), Some(20)), (MAX_PAGE_SIZE, 20));
    }
}
