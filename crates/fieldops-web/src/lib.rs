//! Axum trigger endpoint for the reconciliation engine.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fieldops_core::{RunSummary, SyncRun};
use fieldops_db::{PgStore, SyncStore};
use fieldops_sync::SyncService;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "fieldops-web";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Owner,
    Manager,
    Dispatcher,
}

/// Maps an interactive session token to a role. The session store itself is
/// an external collaborator; this is only the seam it plugs into.
pub trait SessionAuthorizer: Send + Sync {
    fn role_for(&self, token: &str) -> Option<SessionRole>;
}

/// Default when no session backend is wired; automated callers authenticate
/// with the shared secret instead.
pub struct DenyAllSessions;

impl SessionAuthorizer for DenyAllSessions {
    fn role_for(&self, _token: &str) -> Option<SessionRole> {
        None
    }
}

/// Run-history read used by the endpoint.
#[async_trait]
pub trait RunHistory: Send + Sync {
    async fn recent_runs(&self, limit: i64) -> anyhow::Result<Vec<SyncRun>>;
}

#[async_trait]
impl RunHistory for PgStore {
    async fn recent_runs(&self, limit: i64) -> anyhow::Result<Vec<SyncRun>> {
        SyncStore::recent_runs(self, limit).await
    }
}

#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<dyn SyncService>,
    pub runs: Arc<dyn RunHistory>,
    pub shared_secret: Option<String>,
    pub sessions: Arc<dyn SessionAuthorizer>,
}

enum TriggerAuth {
    SharedSecret,
    Session(SessionRole),
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Option<TriggerAuth> {
    if let (Some(secret), Some(value)) = (&state.shared_secret, headers.get("x-sync-secret")) {
        if !secret.is_empty() && value.to_str().map(|v| v == secret).unwrap_or(false) {
            return Some(TriggerAuth::SharedSecret);
        }
    }
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))?;
    match state.sessions.role_for(token) {
        Some(role @ (SessionRole::Owner | SessionRole::Manager)) => {
            Some(TriggerAuth::Session(role))
        }
        _ => None,
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/sync", post(trigger_sync_handler))
        .route("/api/sync/runs", get(recent_runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "sync trigger endpoint listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn trigger_sync_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let Some(auth) = authenticate(&state, &headers) else {
        return unauthorized();
    };
    let run_type = match auth {
        TriggerAuth::SharedSecret => "scheduled",
        TriggerAuth::Session(_) => "manual",
    };

    match state.sync.trigger(run_type).await {
        Ok(summary) => Json(summary_body(&summary)).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "error": format!("{err:#}")})),
        )
            .into_response(),
    }
}

/// Per-job errors ride along on a successful response; the run completed.
fn summary_body(summary: &RunSummary) -> serde_json::Value {
    let mut body = json!({
        "success": true,
        "jobs_processed": summary.jobs_processed,
        "jobs_created": summary.jobs_created,
        "jobs_updated": summary.jobs_updated,
    });
    if !summary.errors.is_empty() {
        body["errors"] = json!(summary.errors);
    }
    body
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<i64>,
}

async fn recent_runs_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RunsQuery>,
) -> Response {
    if authenticate(&state, &headers).is_none() {
        return unauthorized();
    }
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    match state.runs.recent_runs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "error": format!("{err:#}")})),
        )
            .into_response(),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"success": false, "error": "unauthorized"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use axum::body::Body;
    use chrono::Utc;
    use fieldops_core::RunStatus;
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct StubSync {
        summary: RunSummary,
    }

    #[async_trait]
    impl SyncService for StubSync {
        async fn trigger(&self, _run_type: &str) -> anyhow::Result<RunSummary> {
            Ok(self.summary.clone())
        }
    }

    struct FailingSync;

    #[async_trait]
    impl SyncService for FailingSync {
        async fn trigger(&self, _run_type: &str) -> anyhow::Result<RunSummary> {
            Err(anyhow!("missing required environment variable FS_CLIENT_ID"))
        }
    }

    struct StubRuns {
        runs: Vec<SyncRun>,
    }

    #[async_trait]
    impl RunHistory for StubRuns {
        async fn recent_runs(&self, limit: i64) -> anyhow::Result<Vec<SyncRun>> {
            Ok(self.runs.iter().take(limit as usize).cloned().collect())
        }
    }

    struct FixedSessions(HashMap<String, SessionRole>);

    impl SessionAuthorizer for FixedSessions {
        fn role_for(&self, token: &str) -> Option<SessionRole> {
            self.0.get(token).copied()
        }
    }

    fn summary(errors: Vec<String>) -> RunSummary {
        RunSummary {
            run_id: Uuid::new_v4(),
            jobs_processed: 12,
            jobs_created: 3,
            jobs_updated: 9,
            errors,
        }
    }

    fn state_with(sync: Arc<dyn SyncService>) -> AppState {
        let sessions = FixedSessions(HashMap::from([
            ("mgr-token".to_string(), SessionRole::Manager),
            ("dispatch-token".to_string(), SessionRole::Dispatcher),
        ]));
        AppState {
            sync,
            runs: Arc::new(StubRuns {
                runs: vec![SyncRun {
                    id: Uuid::new_v4(),
                    run_type: "manual".to_string(),
                    status: RunStatus::Completed,
                    started_at: Utc::now(),
                    completed_at: Some(Utc::now()),
                    jobs_processed: 5,
                    jobs_created: 1,
                    jobs_updated: 4,
                    errors: None,
                }],
            }),
            shared_secret: Some("topsecret".to_string()),
            sessions: Arc::new(sessions),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_sync(headers: &[(&str, &str)]) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().method("POST").uri("/api/sync");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn rejects_unauthenticated_triggers() {
        let app = app(state_with(Arc::new(StubSync {
            summary: summary(vec![]),
        })));
        let response = app.oneshot(post_sync(&[])).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_wrong_secret_and_insufficient_role() {
        let state = state_with(Arc::new(StubSync {
            summary: summary(vec![]),
        }));

        let wrong_secret = app(state.clone())
            .oneshot(post_sync(&[("x-sync-secret", "nope")]))
            .await
            .unwrap();
        assert_eq!(wrong_secret.status(), StatusCode::UNAUTHORIZED);

        let dispatcher = app(state)
            .oneshot(post_sync(&[("authorization", "Bearer dispatch-token")]))
            .await
            .unwrap();
        assert_eq!(dispatcher.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn shared_secret_triggers_a_run() {
        let app = app(state_with(Arc::new(StubSync {
            summary: summary(vec![]),
        })));
        let response = app
            .oneshot(post_sync(&[("x-sync-secret", "topsecret")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["jobs_processed"], 12);
        assert_eq!(body["jobs_created"], 3);
        assert_eq!(body["jobs_updated"], 9);
        assert!(body.get("errors").is_none());
    }

    #[tokio::test]
    async fn manager_session_triggers_a_run_with_errors_reported() {
        let app = app(state_with(Arc::new(StubSync {
            summary: summary(vec!["job 5: upstream status 500".to_string()]),
        })));
        let response = app
            .oneshot(post_sync(&[("authorization", "Bearer mgr-token")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["errors"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fatal_failures_return_500() {
        let app = app(state_with(Arc::new(FailingSync)));
        let response = app
            .oneshot(post_sync(&[("x-sync-secret", "topsecret")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("FS_CLIENT_ID"));
    }

    #[tokio::test]
    async fn run_history_requires_auth_and_lists_runs() {
        let state = state_with(Arc::new(StubSync {
            summary: summary(vec![]),
        }));

        let denied = app(state.clone())
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/sync/runs")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/sync/runs?limit=5")
                    .header("x-sync-secret", "topsecret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], "completed");
        assert_eq!(rows[0]["jobs_processed"], 5);
    }
}
