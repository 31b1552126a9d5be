use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use helpdesk_core::{ThreadActivity, ThreadCreated};
use helpdesk_engine::{dispatch, CommandResponse, SessionEngine, TroubleshootCommand};
use helpdesk_lifecycle::{CreatedOutcome, LifecycleError, ThreadLifecycleMonitor};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SessionEngine>,
    pub monitor: Arc<ThreadLifecycleMonitor>,
    pub triage_delay: Duration,
}

#[derive(Debug, Deserialize)]
pub struct OpenSessionRequest {
    pub user_id: String,
    pub context_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ChooseRequest {
    pub session_id: String,
    pub label: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TemplateRequest {
    pub template: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/troubleshoot/start", post(troubleshoot_start))
        .route("/troubleshoot/choose", post(troubleshoot_choose))
        .route("/troubleshoot/abandon", post(troubleshoot_abandon))
        .route("/troubleshoot/restart", post(troubleshoot_restart))
        .route("/troubleshoot/follow-up", post(troubleshoot_follow_up))
        .route("/troubleshoot/stats", get(troubleshoot_stats))
        .route("/threads/created", post(thread_created))
        .route("/threads/activity", post(thread_activity))
        .route(
            "/triage-template",
            get(get_template).put(put_template).delete(delete_template),
        )
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

async fn troubleshoot_start(
    State(state): State<AppState>,
    Json(body): Json<OpenSessionRequest>,
) -> Response {
    run_command(
        &state,
        TroubleshootCommand::Start {
            user_id: body.user_id,
            context_id: body.context_id,
        },
    )
    .await
}

async fn troubleshoot_choose(
    State(state): State<AppState>,
    Json(body): Json<ChooseRequest>,
) -> Response {
    run_command(
        &state,
        TroubleshootCommand::Choose {
            session_id: body.session_id,
            label: body.label,
        },
    )
    .await
}

async fn troubleshoot_abandon(
    State(state): State<AppState>,
    Json(body): Json<SessionRequest>,
) -> Response {
    run_command(
        &state,
        TroubleshootCommand::Abandon {
            session_id: body.session_id,
        },
    )
    .await
}

async fn troubleshoot_follow_up(
    State(state): State<AppState>,
    Json(body): Json<SessionRequest>,
) -> Response {
    run_command(
        &state,
        TroubleshootCommand::FollowUp {
            session_id: body.session_id,
        },
    )
    .await
}

async fn troubleshoot_restart(
    State(state): State<AppState>,
    Json(body): Json<OpenSessionRequest>,
) -> Response {
    run_command(
        &state,
        TroubleshootCommand::Restart {
            user_id: body.user_id,
            context_id: body.context_id,
        },
    )
    .await
}

async fn troubleshoot_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(helpdesk_engine::DEFAULT_STATS_LIMIT)
        .clamp(1, 100);
    run_command(&state, TroubleshootCommand::Stats { limit }).await
}

async fn run_command(state: &AppState, command: TroubleshootCommand) -> Response {
    let engine = Arc::clone(&state.engine);
    match blocking(move || dispatch(&engine, command, Utc::now())).await {
        Ok(response) => (status_for(&response), Json(response)).into_response(),
        Err(response) => response,
    }
}

async fn thread_created(
    State(state): State<AppState>,
    Json(event): Json<ThreadCreated>,
) -> Response {
    let monitor = Arc::clone(&state.monitor);
    let thread_id = event.thread_id.clone();
    let outcome = match blocking(move || monitor.register(&event)).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => return lifecycle_error(err),
        Err(response) => return response,
    };

    if outcome == CreatedOutcome::Registered {
        schedule_triage(&state, thread_id);
        return (StatusCode::ACCEPTED, Json(json!({ "outcome": outcome }))).into_response();
    }
    Json(json!({ "outcome": outcome })).into_response()
}

/// The post goes out after a short delay so it lands below the opening message.
fn schedule_triage(state: &AppState, thread_id: String) {
    let monitor = Arc::clone(&state.monitor);
    let delay = state.triage_delay;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let id = thread_id.clone();
        match tokio::task::spawn_blocking(move || monitor.request_triage(&id, Utc::now())).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                error!(event = "triage_failed", thread_id = %thread_id, error = %err);
            }
            Err(err) => {
                error!(event = "triage_join_failed", thread_id = %thread_id, error = %err);
            }
        }
    });
}

async fn thread_activity(
    State(state): State<AppState>,
    Json(event): Json<ThreadActivity>,
) -> Response {
    let monitor = Arc::clone(&state.monitor);
    match blocking(move || monitor.on_thread_activity(&event)).await {
        Ok(Ok(moved)) => Json(json!({ "moved": moved })).into_response(),
        Ok(Err(err)) => lifecycle_error(err),
        Err(response) => response,
    }
}

async fn get_template(State(state): State<AppState>) -> Response {
    let monitor = Arc::clone(&state.monitor);
    match blocking(move || monitor.triage_template()).await {
        Ok(Ok(template)) => Json(json!({ "template": template })).into_response(),
        Ok(Err(err)) => lifecycle_error(err),
        Err(response) => response,
    }
}

async fn put_template(
    State(state): State<AppState>,
    Json(body): Json<TemplateRequest>,
) -> Response {
    let monitor = Arc::clone(&state.monitor);
    match blocking(move || monitor.set_triage_template(&body.template)).await {
        Ok(Ok(template)) => Json(json!({ "template": template })).into_response(),
        Ok(Err(err)) => lifecycle_error(err),
        Err(response) => response,
    }
}

async fn delete_template(State(state): State<AppState>) -> Response {
    let monitor = Arc::clone(&state.monitor);
    match blocking(move || monitor.reset_triage_template()).await {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(err)) => lifecycle_error(err),
        Err(response) => response,
    }
}

/// Runs store-touching work off the async workers.
async fn blocking<T, F>(work: F) -> Result<T, Response>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|err| {
        error!(event = "blocking_join_failed", error = %err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal error" })),
        )
            .into_response()
    })
}

fn lifecycle_error(err: LifecycleError) -> Response {
    let status = match err {
        LifecycleError::EmptyTemplate => StatusCode::BAD_REQUEST,
        LifecycleError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(event = "lifecycle_request_failed", error = %err);
    }
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

pub fn status_for(response: &CommandResponse) -> StatusCode {
    match response {
        CommandResponse::Error { code, .. } => match code.as_str() {
            "not_found" => StatusCode::NOT_FOUND,
            "invalid_choice" | "no_follow_up" => StatusCode::UNPROCESSABLE_ENTITY,
            "session_closed" | "loop_detected" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        _ => StatusCode::OK,
    }
}
