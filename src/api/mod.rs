//! Minimal operational HTTP surface (C13, partial): health check, a plain
//! case view, and a token-gated history-bootstrap intake endpoint.
//! Grounded on the teacher's `api::system` health/status handler shapes,
//! trimmed to the much smaller surface this domain needs.

use crate::domain::Case;
use crate::history::{HistoryBootstrap, TranscriptMessage};
use crate::storage::Storage;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct ApiState {
    pub storage: Storage,
    pub history_bootstrap: Arc<HistoryBootstrap>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/case/{id}", get(view_case))
        .route("/history/bootstrap", post(history_bootstrap))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn view_case(State(state): State<ApiState>, Path(case_id): Path<String>) -> impl IntoResponse {
    match state.storage.get_case(&case_id).await {
        Ok(Some(case)) => Html(render_case_html(&case)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "case not found").into_response(),
        Err(err) => {
            tracing::error!(error = %err, case_id, "failed to load case");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

fn render_case_html(case: &Case) -> String {
    let template = r#"
<!doctype html>
<html>
<head><title>{{ title }}</title></head>
<body>
  <h1>{{ title }}</h1>
  <p><strong>Status:</strong> {{ status }}</p>
  <h2>Problem</h2>
  <p>{{ problem }}</p>
  <h2>Solution</h2>
  <p>{{ solution }}</p>
  <p><strong>Tags:</strong> {{ tags }}</p>
</body>
</html>
"#;
    let mut env = minijinja::Environment::new();
    env.add_template("case", template).expect("static template parses");
    env.get_template("case")
        .expect("template was just added")
        .render(minijinja::context! {
            title => case.problem_title,
            status => case.status.as_str(),
            problem => case.problem_summary,
            solution => case.solution_summary,
            tags => case.tags.join(", "),
        })
        .unwrap_or_else(|err| format!("<p>template error: {err}</p>"))
}

#[derive(serde::Deserialize)]
struct HistoryBootstrapRequest {
    token: String,
    group_id: String,
    messages: Vec<HistoryBootstrapMessage>,
}

#[derive(serde::Deserialize)]
struct HistoryBootstrapMessage {
    sender: String,
    ts: i64,
    text: String,
}

async fn history_bootstrap(
    State(state): State<ApiState>,
    Json(request): Json<HistoryBootstrapRequest>,
) -> impl IntoResponse {
    let group_id = match state.storage.consume_history_token(&request.token).await {
        Ok(Some(group_id)) => group_id,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid or expired history token").into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to validate history token");
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        }
    };

    if group_id != request.group_id {
        return (StatusCode::UNAUTHORIZED, "token does not authorize this group").into_response();
    }

    let transcript: Vec<TranscriptMessage> = request
        .messages
        .into_iter()
        .map(|m| TranscriptMessage { sender: m.sender, ts: m.ts, text: m.text })
        .collect();

    match state.history_bootstrap.run(&group_id, &transcript).await {
        Ok(report) => Json(serde_json::json!({
            "chunks_total": report.chunks_total,
            "partial_success": report.partial_success(),
            "failed_chunks": report.failed_chunks,
            "cases_written": report.cases_written,
            "duplicates_dropped": report.duplicates_dropped,
        }))
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "history bootstrap failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "bootstrap failed").into_response()
        }
    }
}
