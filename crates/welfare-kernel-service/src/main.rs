use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use welfare_kernel_api::{
    generate_name_key, RegisterUserRequest, SubmitAnswerRequest, WelfareApi, API_CONTRACT_VERSION,
};
use welfare_kernel_core::SurveyQuestion;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Clone)]
struct ServiceState {
    api: WelfareApi,
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

#[derive(Debug, Clone, Deserialize)]
struct GenerateRequest {
    user_key: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "welfare-kernel-service")]
#[command(about = "Local HTTP service for the welfare recommendation kernel")]
struct Args {
    #[arg(long, default_value = "./welfare_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Hex-encoded 32-byte key for at-rest name encryption. When omitted a
    /// fresh key is generated, so stored names stay unrecoverable across runs.
    #[arg(long)]
    name_key_file: Option<PathBuf>,
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
        .route("/v1/users", post(users_register))
        .route("/v1/survey/questions", get(survey_questions))
        .route("/v1/survey/answer", post(survey_answer))
        .route("/v1/recommendations", post(recommendations_generate))
        .route("/v1/recommendations/:user_key", get(recommendations_latest))
        .with_state(state)
}

fn load_name_key(path: Option<&PathBuf>) -> Result<[u8; 32]> {
    let Some(path) = path else {
        return Ok(generate_name_key());
    };

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read name key file {}", path.display()))?;
    let bytes = hex::decode(text.trim())
        .with_context(|| format!("name key file {} is not valid hex", path.display()))?;
    if bytes.len() != 32 {
        return Err(anyhow!(
            "name key file {} must contain exactly 32 hex-encoded bytes",
            path.display()
        ));
    }

    let mut key = [0_u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let name_key = load_name_key(args.name_key_file.as_ref())?;
    let state = ServiceState { api: WelfareApi::new(args.db, name_key) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
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
) -> Result<Json<ServiceEnvelope<welfare_kernel_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<welfare_kernel_api::MigrateResult>>, ServiceError> {
    let result =
        state.api.migrate(request.dry_run).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn users_register(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterUserRequest>,
) -> Result<Json<ServiceEnvelope<welfare_kernel_api::RegisterUserResult>>, ServiceError> {
    let result =
        state.api.register_user(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn survey_questions(
    State(state): State<ServiceState>,
) -> Json<ServiceEnvelope<&'static [SurveyQuestion]>> {
    Json(envelope(state.api.survey_questions()))
}

async fn survey_answer(
    State(state): State<ServiceState>,
    Json(request): Json<SubmitAnswerRequest>,
) -> Result<Json<ServiceEnvelope<welfare_kernel_api::SubmitAnswerResult>>, ServiceError> {
    let result =
        state.api.submit_answer(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn recommendations_generate(
    State(state): State<ServiceState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<ServiceEnvelope<welfare_kernel_core::EvaluationReport>>, ServiceError> {
    let report = state
        .api
        .generate(&request.user_key)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(report)))
}

async fn recommendations_latest(
    State(state): State<ServiceState>,
    Path(user_key): Path<String>,
) -> Result<Json<ServiceEnvelope<Option<welfare_kernel_core::EvaluationReport>>>, ServiceError> {
    let report =
        state.api.latest(&user_key).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("welfarekernel-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_state(db_path: PathBuf) -> ServiceState {
        ServiceState { api: WelfareApi::new(db_path, [9_u8; 32]) }
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

    async fn send_json(router: Router, uri: &str, payload: &serde_json::Value) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("request to {uri} failed: {err}"),
        }
    }

    async fn send_get(router: Router, uri: &str) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("request to {uri} failed: {err}"),
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(test_state(unique_temp_db_path()));
        let response = send_get(router, "/v1/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = app(test_state(unique_temp_db_path()));
        let response = send_get(router, "/v1/openapi").await;
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
        assert!(body.contains("/v1/survey/answer"));
        assert!(body.contains("/v1/recommendations"));
    }

    #[tokio::test]
    async fn survey_questions_endpoint_lists_fixed_schema() {
        let router = app(test_state(unique_temp_db_path()));
        let response = send_get(router, "/v1/survey/questions").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        let questions = value
            .get("data")
            .and_then(serde_json::Value::as_array)
            .unwrap_or_else(|| panic!("missing data array in response: {value}"));
        assert_eq!(questions.len(), 5);
        assert_eq!(
            questions[0].get("id").and_then(serde_json::Value::as_u64),
            Some(1)
        );
    }

    #[tokio::test]
    async fn register_answer_and_recommend_flow_round_trip() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let register_payload = serde_json::json!({
            "name": "김영희",
            "birth_year": 1950,
            "region": "서울"
        });
        let register_response =
            send_json(router.clone(), "/v1/users", &register_payload).await;
        assert_eq!(register_response.status(), StatusCode::OK);
        let register_value = response_json(register_response).await;
        let user_key = register_value
            .get("data")
            .and_then(|data| data.get("anonymous_key"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.anonymous_key in response: {register_value}"))
            .to_string();

        let answer_payload = serde_json::json!({
            "user_key": user_key,
            "question_id": 1,
            "values": ["기초생활수급자"]
        });
        let answer_response =
            send_json(router.clone(), "/v1/survey/answer", &answer_payload).await;
        assert_eq!(answer_response.status(), StatusCode::OK);

        let generate_payload = serde_json::json!({ "user_key": user_key });
        let generate_response =
            send_json(router.clone(), "/v1/recommendations", &generate_payload).await;
        assert_eq!(generate_response.status(), StatusCode::OK);
        let generate_value = response_json(generate_response).await;
        let evaluation_id = generate_value
            .get("data")
            .and_then(|data| data.get("evaluation_id"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.evaluation_id in response: {generate_value}"))
            .to_string();
        assert!(evaluation_id.starts_with("eval_"));

        let latest_response =
            send_get(router, &format!("/v1/recommendations/{user_key}")).await;
        assert_eq!(latest_response.status(), StatusCode::OK);
        let latest_value = response_json(latest_response).await;
        assert_eq!(
            latest_value
                .get("data")
                .and_then(|data| data.get("evaluation_id"))
                .and_then(serde_json::Value::as_str),
            Some(evaluation_id.as_str())
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn invalid_registration_is_a_bad_request() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let payload = serde_json::json!({
            "name": "  ",
            "birth_year": 1950,
            "region": "서울"
        });
        let response = send_json(router, "/v1/users", &payload).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert!(value.get("error").and_then(serde_json::Value::as_str).is_some());

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn latest_for_fresh_user_is_null() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let register_payload = serde_json::json!({
            "name": "박철수",
            "birth_year": 1990,
            "region": "부산"
        });
        let register_response =
            send_json(router.clone(), "/v1/users", &register_payload).await;
        let register_value = response_json(register_response).await;
        let user_key = register_value
            .get("data")
            .and_then(|data| data.get("anonymous_key"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.anonymous_key in response: {register_value}"))
            .to_string();

        let latest_response =
            send_get(router, &format!("/v1/recommendations/{user_key}")).await;
        assert_eq!(latest_response.status(), StatusCode::OK);
        let latest_value = response_json(latest_response).await;
        assert!(latest_value
            .get("data")
            .map(serde_json::Value::is_null)
            .unwrap_or_else(|| panic!("missing data field in response: {latest_value}")));

        let _ = std::fs::remove_file(&db_path);
    }
}
