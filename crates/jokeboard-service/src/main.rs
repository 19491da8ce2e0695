use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use jokeboard_core::{BoardConfig, ScoringError, UserId, VoteOutcome};
use jokeboard_engine::{
    LeaderboardEntry, MigrateResult, RankCommand, ReactionEvent, ScoringEngine,
    ENGINE_CONTRACT_VERSION,
};
use jokeboard_store_sqlite::{JokeAggregate, SchemaStatus, UserAggregate};
use serde::{Deserialize, Serialize};
use tracing::error;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    engine: ScoringEngine,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    engine_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct LeaderboardParams {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// `outcome` is absent when the reaction was filtered at the boundary
/// and never became a vote.
#[derive(Debug, Clone, Serialize)]
struct ReactionResponse {
    applied: bool,
    outcome: Option<VoteOutcome>,
}

#[derive(Debug, Parser)]
#[command(name = "jokeboard-service")]
#[command(about = "Local HTTP service for the joke scoring board")]
struct Args {
    #[arg(long, default_value = "./jokeboard.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Optional JSON file overriding reaction weights and vote policy.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn unavailable() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: "scoring is temporarily unavailable, retry shortly".to_string(),
        }
    }
}

// Validation failures carry their message to the caller; everything
// else is a store-side fault and gets the generic retry body.
fn map_engine_error(err: &anyhow::Error) -> ServiceError {
    match err.downcast_ref::<ScoringError>() {
        Some(ScoringError::Validation(_)) => ServiceError::bad_request(err.to_string()),
        _ => {
            error!(error = %err, "engine operation failed");
            ServiceError::unavailable()
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        engine_contract_version: ENGINE_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/votes", post(submit_vote))
        .route("/v1/reactions", post(submit_reaction))
        .route("/v1/leaderboard", get(leaderboard))
        .route("/v1/jokes/random", get(random_joke))
        .route("/v1/jokes/best", get(best_joke))
        .route("/v1/users/:user_id", get(user_rank))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => BoardConfig::load(path)?,
        None => BoardConfig::default(),
    };
    let state = ServiceState { engine: ScoringEngine::new(args.db, config) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn submit_vote(
    State(state): State<ServiceState>,
    Json(request): Json<RankCommand>,
) -> Result<Json<ServiceEnvelope<VoteOutcome>>, ServiceError> {
    let outcome = state.engine.rank_command(&request).map_err(|err| map_engine_error(&err))?;
    Ok(Json(envelope(outcome)))
}

async fn submit_reaction(
    State(state): State<ServiceState>,
    Json(request): Json<ReactionEvent>,
) -> Result<Json<ServiceEnvelope<ReactionResponse>>, ServiceError> {
    let outcome = state.engine.rank_reaction(&request).map_err(|err| map_engine_error(&err))?;
    Ok(Json(envelope(ReactionResponse { applied: outcome.is_some(), outcome })))
}

async fn leaderboard(
    State(state): State<ServiceState>,
    Query(params): Query<LeaderboardParams>,
) -> Result<Json<ServiceEnvelope<Vec<LeaderboardEntry>>>, ServiceError> {
    let entries =
        state.engine.leaderboard(params.limit).map_err(|err| map_engine_error(&err))?;
    Ok(Json(envelope(entries)))
}

async fn random_joke(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<JokeAggregate>>, ServiceError> {
    let joke = state
        .engine
        .random_joke()
        .map_err(|err| map_engine_error(&err))?
        .ok_or_else(|| ServiceError::not_found("no jokes recorded yet"))?;
    Ok(Json(envelope(joke)))
}

async fn best_joke(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<JokeAggregate>>, ServiceError> {
    let joke = state
        .engine
        .best_joke()
        .map_err(|err| map_engine_error(&err))?
        .ok_or_else(|| ServiceError::not_found("no jokes recorded yet"))?;
    Ok(Json(envelope(joke)))
}

async fn user_rank(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<ServiceEnvelope<UserAggregate>>, ServiceError> {
    let user = state
        .engine
        .user_rank(&UserId::new(user_id.clone()))
        .map_err(|err| map_engine_error(&err))?
        .ok_or_else(|| ServiceError::not_found(format!("user {user_id} has no jokes yet")))?;
    Ok(Json(envelope(user)))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.engine.schema_status().map_err(|err| map_engine_error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.engine.migrate(request.dry_run).map_err(|err| map_engine_error(&err))?;
    Ok(Json(envelope(result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("jokeboard-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_state(db_path: &std::path::Path) -> ServiceState {
        ServiceState { engine: ScoringEngine::new(db_path.to_path_buf(), BoardConfig::default()) }
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

    async fn get(router: Router, uri: &str) -> Response {
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
            Err(err) => panic!("router request failed: {err}"),
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
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn vote_payload(voter: &str, points: i64) -> serde_json::Value {
        serde_json::json!({
            "message_id": "msg-1",
            "author_id": "alice",
            "author_name": "Alice",
            "content": "a joke about ducks",
            "voter_id": voter,
            "points": points
        })
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path));

        let response = get(router, "/v1/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(
            value.get("engine_contract_version").and_then(serde_json::Value::as_str),
            Some(ENGINE_CONTRACT_VERSION)
        );
    }

    #[tokio::test]
    async fn vote_then_duplicate_then_lookup_flow() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path));

        let first = post_json(router.clone(), "/v1/votes", &vote_payload("bob", 40)).await;
        assert_eq!(first.status(), StatusCode::OK);
        let first_value = response_json(first).await;
        assert_eq!(
            first_value
                .get("data")
                .and_then(|data| data.get("result"))
                .and_then(serde_json::Value::as_str),
            Some("accepted")
        );
        assert_eq!(
            first_value
                .get("data")
                .and_then(|data| data.get("receipt"))
                .and_then(|receipt| receipt.get("joke_score"))
                .and_then(serde_json::Value::as_i64),
            Some(40)
        );

        let duplicate = post_json(router.clone(), "/v1/votes", &vote_payload("bob", 40)).await;
        assert_eq!(duplicate.status(), StatusCode::OK);
        let duplicate_value = response_json(duplicate).await;
        assert_eq!(
            duplicate_value
                .get("data")
                .and_then(|data| data.get("result"))
                .and_then(serde_json::Value::as_str),
            Some("already_voted")
        );

        let user = get(router.clone(), "/v1/users/alice").await;
        assert_eq!(user.status(), StatusCode::OK);
        let user_value = response_json(user).await;
        assert_eq!(
            user_value
                .get("data")
                .and_then(|data| data.get("score"))
                .and_then(serde_json::Value::as_i64),
            Some(40)
        );
        assert_eq!(
            user_value
                .get("data")
                .and_then(|data| data.get("rank"))
                .and_then(serde_json::Value::as_str),
            Some("bronze")
        );

        let best = get(router, "/v1/jokes/best").await;
        assert_eq!(best.status(), StatusCode::OK);
        let best_value = response_json(best).await;
        assert_eq!(
            best_value
                .get("data")
                .and_then(|data| data.get("score"))
                .and_then(serde_json::Value::as_i64),
            Some(40)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn invalid_delta_and_self_vote_are_bad_requests() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path));

        let zero = post_json(router.clone(), "/v1/votes", &vote_payload("bob", 0)).await;
        assert_eq!(zero.status(), StatusCode::BAD_REQUEST);
        let zero_value = response_json(zero).await;
        assert!(zero_value.get("error").and_then(serde_json::Value::as_str).is_some());

        let own = post_json(router, "/v1/votes", &vote_payload("alice", 10)).await;
        assert_eq!(own.status(), StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn known_reaction_applies_and_unknown_is_filtered() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path));

        let known = serde_json::json!({
            "message_id": "msg-1",
            "author_id": "alice",
            "author_name": "Alice",
            "content": "a joke about ducks",
            "voter_id": "bob",
            "reaction": "\u{1f602}"
        });
        let applied = post_json(router.clone(), "/v1/reactions", &known).await;
        assert_eq!(applied.status(), StatusCode::OK);
        let applied_value = response_json(applied).await;
        assert_eq!(
            applied_value
                .get("data")
                .and_then(|data| data.get("applied"))
                .and_then(serde_json::Value::as_bool),
            Some(true)
        );
        assert_eq!(
            applied_value
                .get("data")
                .and_then(|data| data.get("outcome"))
                .and_then(|outcome| outcome.get("receipt"))
                .and_then(|receipt| receipt.get("joke_score"))
                .and_then(serde_json::Value::as_i64),
            Some(40)
        );

        let unknown = serde_json::json!({
            "message_id": "msg-1",
            "author_id": "alice",
            "author_name": "Alice",
            "content": "a joke about ducks",
            "voter_id": "carol",
            "reaction": "shrug"
        });
        let filtered = post_json(router, "/v1/reactions", &unknown).await;
        assert_eq!(filtered.status(), StatusCode::OK);
        let filtered_value = response_json(filtered).await;
        assert_eq!(
            filtered_value
                .get("data")
                .and_then(|data| data.get("applied"))
                .and_then(serde_json::Value::as_bool),
            Some(false)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn leaderboard_honors_limit_parameter() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path));

        for index in 0..4 {
            let payload = serde_json::json!({
                "message_id": format!("msg-{index}"),
                "author_id": format!("author-{index}"),
                "author_name": format!("Author {index}"),
                "content": format!("joke {index}"),
                "voter_id": "voter",
                "points": 10 + index
            });
            let response = post_json(router.clone(), "/v1/votes", &payload).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = get(router, "/v1/leaderboard?limit=2").await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        let entries = match value.get("data").and_then(serde_json::Value::as_array) {
            Some(entries) => entries,
            None => panic!("leaderboard data should be an array: {value}"),
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].get("user_id").and_then(serde_json::Value::as_str),
            Some("author-3")
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn empty_board_lookups_are_not_found() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path));

        let random = get(router.clone(), "/v1/jokes/random").await;
        assert_eq!(random.status(), StatusCode::NOT_FOUND);

        let user = get(router, "/v1/users/nobody").await;
        assert_eq!(user.status(), StatusCode::NOT_FOUND);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn migrate_dry_run_then_apply() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path));

        let dry = post_json(router.clone(), "/v1/db/migrate", &serde_json::json!({"dry_run": true}))
            .await;
        assert_eq!(dry.status(), StatusCode::OK);
        let dry_value = response_json(dry).await;
        assert_eq!(
            dry_value
                .get("data")
                .and_then(|data| data.get("would_apply_versions"))
                .and_then(serde_json::Value::as_array)
                .map(Vec::len),
            Some(1)
        );

        let apply =
            post_json(router.clone(), "/v1/db/migrate", &serde_json::json!({"dry_run": false}))
                .await;
        assert_eq!(apply.status(), StatusCode::OK);
        let apply_value = response_json(apply).await;
        assert_eq!(
            apply_value
                .get("data")
                .and_then(|data| data.get("after_version"))
                .and_then(serde_json::Value::as_i64),
            Some(1)
        );

        let status = post_json(router, "/v1/db/schema-version", &serde_json::json!({})).await;
        assert_eq!(status.status(), StatusCode::OK);
        let status_value = response_json(status).await;
        assert_eq!(
            status_value
                .get("data")
                .and_then(|data| data.get("current_version"))
                .and_then(serde_json::Value::as_i64),
            Some(1)
        );

        let _ = std::fs::remove_file(&db_path);
    }
}
