use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use permalink_pin_api::{
    AssignRequest, PermalinkPinApi, PostAddRequest, SavePreferenceRequest, TermAddRequest,
    API_CONTRACT_VERSION,
};
use permalink_pin_core::{PermalinkStructure, PostId};
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: PermalinkPinApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Body of the preference save route, mirroring the admin form submission:
/// the field may be absent entirely, and the host-asserted autosave and
/// permission state ride along.
#[derive(Debug, Clone, Deserialize)]
struct SavePreferenceBody {
    category_in_permalink: Option<String>,
    #[serde(default)]
    autosave: bool,
    #[serde(default = "default_can_edit")]
    can_edit: bool,
}

fn default_can_edit() -> bool {
    true
}

#[derive(Debug, Parser)]
#[command(name = "permalink-pin-service")]
#[command(about = "Local HTTP service for permalink category pinning")]
struct Args {
    #[arg(long, default_value = "./permalink_pin.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value = "/%category%/%postname%/")]
    structure: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/terms", get(term_list))
        .route("/v1/terms/add", post(term_add))
        .route("/v1/posts/add", post(post_add))
        .route("/v1/posts/assign", post(post_assign))
        .route("/v1/posts/:post_id", get(post_show))
        .route("/v1/posts/:post_id/preference", post(preference_save).get(preference_show))
        .route("/v1/posts/:post_id/preference/options", get(preference_options))
        .route("/v1/posts/:post_id/permalink-category", get(permalink_category))
        .route("/v1/posts/:post_id/permalink", get(permalink))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let api = PermalinkPinApi::new(args.db, PermalinkStructure::new(args.structure.as_str()));
    let state = ServiceState { api };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "permalink-pin service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<permalink_pin_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<permalink_pin_api::MigrateResult>>, ServiceError> {
    let result =
        state.api.migrate(request.dry_run).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn term_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<permalink_pin_core::Category>>>, ServiceError> {
    let terms = state.api.term_list().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(terms)))
}

async fn term_add(
    State(state): State<ServiceState>,
    Json(request): Json<TermAddRequest>,
) -> Result<Json<ServiceEnvelope<permalink_pin_core::Category>>, ServiceError> {
    let category =
        state.api.term_add(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(category)))
}

async fn post_add(
    State(state): State<ServiceState>,
    Json(request): Json<PostAddRequest>,
) -> Result<Json<ServiceEnvelope<permalink_pin_core::Post>>, ServiceError> {
    let created = state.api.post_add(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(created)))
}

async fn post_assign(
    State(state): State<ServiceState>,
    Json(request): Json<AssignRequest>,
) -> Result<Json<ServiceEnvelope<permalink_pin_api::PostDetails>>, ServiceError> {
    let details =
        state.api.post_assign(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(details)))
}

async fn post_show(
    State(state): State<ServiceState>,
    Path(post_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<permalink_pin_api::PostDetails>>, ServiceError> {
    let details = state
        .api
        .post_show(PostId(post_id))
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(details)))
}

async fn preference_save(
    State(state): State<ServiceState>,
    Path(post_id): Path<i64>,
    Json(body): Json<SavePreferenceBody>,
) -> Result<Json<ServiceEnvelope<permalink_pin_api::SavePreferenceResult>>, ServiceError> {
    let result = state
        .api
        .save_preference(SavePreferenceRequest {
            post_id: PostId(post_id),
            submitted: body.category_in_permalink,
            autosave: body.autosave,
            can_edit: body.can_edit,
        })
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn preference_show(
    State(state): State<ServiceState>,
    Path(post_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<permalink_pin_api::PreferenceStatus>>, ServiceError> {
    let status = state
        .api
        .preference_show(PostId(post_id))
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn preference_options(
    State(state): State<ServiceState>,
    Path(post_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<permalink_pin_api::PreferenceOptions>>, ServiceError> {
    let options = state
        .api
        .preference_options(PostId(post_id))
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(options)))
}

async fn permalink_category(
    State(state): State<ServiceState>,
    Path(post_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<permalink_pin_core::Selection>>, ServiceError> {
    let selection = state
        .api
        .resolve_category(PostId(post_id))
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(selection)))
}

async fn permalink(
    State(state): State<ServiceState>,
    Path(post_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<permalink_pin_api::PermalinkResult>>, ServiceError> {
    let rendered = state
        .api
        .permalink(PostId(post_id))
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(rendered)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("permalink-pin-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_state(db_path: &std::path::Path) -> ServiceState {
        ServiceState {
            api: PermalinkPinApi::new(
                db_path.to_path_buf(),
                PermalinkStructure::new("/%category%/%postname%/"),
            ),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn post_json(router: Router, uri: &str, payload: &serde_json::Value) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build request for {uri}: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("request to {uri} failed: {err}"),
        }
    }

    async fn get_response(router: Router, uri: &str) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request for {uri}: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("request to {uri} failed: {err}"),
        }
    }

    fn data_field<'a>(value: &'a serde_json::Value, pointer: &str) -> &'a serde_json::Value {
        value
            .pointer(pointer)
            .unwrap_or_else(|| panic!("missing {pointer} in response: {value}"))
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let state = test_state(&unique_temp_db_path());
        let router = app(state);

        let response = get_response(router, "/v1/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let state = test_state(&unique_temp_db_path());
        let router = app(state);

        let response = get_response(router, "/v1/openapi").await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/posts/{post_id}/preference"));
        assert!(body.contains("/v1/posts/{post_id}/permalink-category"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn save_and_resolution_flow_round_trips() {
        let db_path = unique_temp_db_path();
        let state = test_state(&db_path);
        let router = app(state);

        let migrate = post_json(
            router.clone(),
            "/v1/db/migrate",
            &serde_json::json!({ "dry_run": false }),
        )
        .await;
        assert_eq!(migrate.status(), StatusCode::OK);

        for name in ["News", "Sports"] {
            let response = post_json(
                router.clone(),
                "/v1/terms/add",
                &serde_json::json!({ "name": name, "slug": null }),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let created = post_json(
            router.clone(),
            "/v1/posts/add",
            &serde_json::json!({
                "title": "Launch Day",
                "slug": null,
                "term_ids": [1, 2]
            }),
        )
        .await;
        assert_eq!(created.status(), StatusCode::OK);

        let saved = post_json(
            router.clone(),
            "/v1/posts/1/preference",
            &serde_json::json!({ "category_in_permalink": "2" }),
        )
        .await;
        assert_eq!(saved.status(), StatusCode::OK);
        let saved_value = response_json(saved).await;
        assert_eq!(
            data_field(&saved_value, "/data/outcome").as_str(),
            Some("stored")
        );

        let resolved = get_response(router.clone(), "/v1/posts/1/permalink-category").await;
        assert_eq!(resolved.status(), StatusCode::OK);
        let resolved_value = response_json(resolved).await;
        assert_eq!(
            data_field(&resolved_value, "/data/category/slug").as_str(),
            Some("sports")
        );
        assert_eq!(data_field(&resolved_value, "/data/source").as_str(), Some("pinned"));

        let rendered = get_response(router, "/v1/posts/1/permalink").await;
        assert_eq!(rendered.status(), StatusCode::OK);
        let rendered_value = response_json(rendered).await;
        assert_eq!(
            data_field(&rendered_value, "/data/permalink").as_str(),
            Some("/sports/launch-day/")
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn save_without_the_form_field_is_a_reported_no_op() {
        let db_path = unique_temp_db_path();
        let state = test_state(&db_path);
        let router = app(state);

        for name in ["News", "Sports"] {
            let response = post_json(
                router.clone(),
                "/v1/terms/add",
                &serde_json::json!({ "name": name, "slug": null }),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        let created = post_json(
            router.clone(),
            "/v1/posts/add",
            &serde_json::json!({ "title": "Launch Day", "slug": null, "term_ids": [1, 2] }),
        )
        .await;
        assert_eq!(created.status(), StatusCode::OK);

        let saved = post_json(router.clone(), "/v1/posts/1/preference", &serde_json::json!({}))
            .await;
        assert_eq!(saved.status(), StatusCode::OK);
        let saved_value = response_json(saved).await;
        assert_eq!(
            data_field(&saved_value, "/data/outcome").as_str(),
            Some("skipped_missing_field")
        );

        let status = get_response(router, "/v1/posts/1/preference").await;
        let status_value = response_json(status).await;
        assert!(data_field(&status_value, "/data/stored").is_null());

        let _ = std::fs::remove_file(&db_path);
    }
}
