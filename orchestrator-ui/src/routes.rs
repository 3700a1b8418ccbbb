//! HTTP route handlers for the orchestrator API.
//!
//! Handlers are thin: parse ids, call the orchestrator on the blocking pool,
//! serialize the result. Jobs are observed by polling `GET /api/jobs/{id}`.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::middleware;
use axum::response::Json;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};

use codex_orchestrator::apply::ApplyOutcome;
use codex_orchestrator::core::ids::{ArtifactId, JobId, ProposalId, SessionId};
use codex_orchestrator::core::insight::{InsightArtifact, InsightSummary};
use codex_orchestrator::core::proposal::Proposal;
use codex_orchestrator::core::run::{RunEntry, RunMode};
use codex_orchestrator::insights::InsightsRequest;
use codex_orchestrator::io::sessions::{SessionDetail, SessionQuery, SessionSummary};
use codex_orchestrator::orchestrator::{JobView, Orchestrator};
use codex_orchestrator::proposals::ProposalRequest;

use crate::error::ApiError;
use crate::guard::enforce_local_origin;
use crate::state::AppState;

const DEFAULT_TAIL: usize = 200;
const DEFAULT_SESSION_LIMIT: usize = 100;

/// Build the API router.
fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{session_id}", get(get_session))
        .route("/insights/run", post(run_insights))
        .route("/insights/{session_id}", get(list_insights))
        .route("/insights/{session_id}/{artifact_id}", get(get_insight))
        .route("/proposals/run", post(run_proposal))
        .route("/proposals/{proposal_id}", get(get_proposal))
        .route("/proposals/{proposal_id}/apply", post(apply_proposal))
        .route("/jobs/{job_id}", get(get_job).delete(cancel_job))
        .route("/runs/{job_id}", get(get_run))
}

/// The API router behind the local-origin guard. Preflights from foreign
/// origins are refused too, so no CORS headers are ever sent.
pub fn guarded_api_router(state: &AppState) -> Router<AppState> {
    api_router().layer(middleware::from_fn_with_state(
        state.clone(),
        enforce_local_origin,
    ))
}

async fn health() -> &'static str {
    "ok"
}

/// Run `f` against the orchestrator on the blocking pool.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Orchestrator) -> Result<T, ApiError> + Send + 'static,
{
    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::task::spawn_blocking(move || f(&orchestrator))
        .await
        .map_err(|err| ApiError::internal(format!("handler task failed: {err}")))?
}

fn parse<T>(raw: &str, parser: fn(&str) -> anyhow::Result<T>) -> Result<T, ApiError> {
    parser(raw).map_err(|err| ApiError::bad_request(format!("{err:#}")))
}

fn parse_mode(raw: Option<&str>) -> Result<RunMode, ApiError> {
    match raw {
        Some(raw) => raw
            .parse()
            .map_err(|err: anyhow::Error| ApiError::bad_request(err.to_string())),
        None => Ok(RunMode::default()),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct SessionsParams {
    #[serde(default)]
    all: bool,
    limit: Option<usize>,
}

/// GET /api/sessions?all=true&limit=N - sessions for this repository, newest first.
pub(crate) async fn list_sessions(
    State(state): State<AppState>,
    Query(params): Query<SessionsParams>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    blocking(&state, move |orchestrator| {
        let query = SessionQuery {
            repo_root: Some(orchestrator.repo_root().to_path_buf()),
            include_all_repos: params.all,
            limit: params.limit.unwrap_or(DEFAULT_SESSION_LIMIT),
        };
        Ok(orchestrator.sessions().list_sessions(&query)?)
    })
    .await
    .map(Json)
}

/// GET /api/sessions/{session_id}
pub(crate) async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDetail>, ApiError> {
    let session_id = parse(&session_id, SessionId::parse)?;
    blocking(&state, move |orchestrator| {
        Ok(orchestrator.sessions().get_session(&session_id)?)
    })
    .await
    .map(Json)
}

#[derive(Debug, Deserialize)]
pub(crate) struct RunInsightsBody {
    session_id: String,
    prompt: String,
    mode: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct InsightsStarted {
    job_id: JobId,
    artifact_id: ArtifactId,
}

/// POST /api/insights/run - start an insights job; poll `/api/jobs/{job_id}`.
pub(crate) async fn run_insights(
    State(state): State<AppState>,
    Json(body): Json<RunInsightsBody>,
) -> Result<Json<InsightsStarted>, ApiError> {
    let request = InsightsRequest {
        session_id: parse(&body.session_id, SessionId::parse)?,
        prompt: body.prompt,
        mode: parse_mode(body.mode.as_deref())?,
        model: body.model,
    };
    blocking(&state, move |orchestrator| {
        let handle = orchestrator.start_insights(request)?;
        Ok(InsightsStarted {
            job_id: handle.job_id,
            artifact_id: handle.artifact_id,
        })
    })
    .await
    .map(Json)
}

/// GET /api/insights/{session_id} - stored artifacts, newest first.
pub(crate) async fn list_insights(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<InsightSummary>>, ApiError> {
    let session_id = parse(&session_id, SessionId::parse)?;
    blocking(&state, move |orchestrator| {
        Ok(orchestrator.store().list_insights(&session_id)?)
    })
    .await
    .map(Json)
}

/// GET /api/insights/{session_id}/{artifact_id}
pub(crate) async fn get_insight(
    State(state): State<AppState>,
    Path((session_id, artifact_id)): Path<(String, String)>,
) -> Result<Json<InsightArtifact>, ApiError> {
    let session_id = parse(&session_id, SessionId::parse)?;
    let artifact_id = parse(&artifact_id, ArtifactId::parse)?;
    blocking(&state, move |orchestrator| {
        Ok(orchestrator.store().get_insight(&session_id, &artifact_id)?)
    })
    .await
    .map(Json)
}

#[derive(Debug, Deserialize)]
pub(crate) struct RunProposalBody {
    session_id: String,
    insight_artifact_id: String,
    prompt: Option<String>,
    mode: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ProposalStarted {
    job_id: JobId,
    proposal_id: ProposalId,
}

/// POST /api/proposals/run - start a proposal job from an existing insight.
pub(crate) async fn run_proposal(
    State(state): State<AppState>,
    Json(body): Json<RunProposalBody>,
) -> Result<Json<ProposalStarted>, ApiError> {
    let request = ProposalRequest {
        session_id: parse(&body.session_id, SessionId::parse)?,
        insight_artifact_id: parse(&body.insight_artifact_id, ArtifactId::parse)?,
        prompt: body.prompt.filter(|p| !p.trim().is_empty()),
        mode: parse_mode(body.mode.as_deref())?,
        model: body.model,
    };
    blocking(&state, move |orchestrator| {
        let handle = orchestrator.start_proposal(request)?;
        Ok(ProposalStarted {
            job_id: handle.job_id,
            proposal_id: handle.proposal_id,
        })
    })
    .await
    .map(Json)
}

/// GET /api/proposals/{proposal_id}
pub(crate) async fn get_proposal(
    State(state): State<AppState>,
    Path(proposal_id): Path<String>,
) -> Result<Json<Proposal>, ApiError> {
    let proposal_id = parse(&proposal_id, ProposalId::parse)?;
    blocking(&state, move |orchestrator| {
        Ok(orchestrator.get_proposal(&proposal_id)?)
    })
    .await
    .map(Json)
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApplyBody {
    #[serde(default)]
    confirm: bool,
}

/// POST /api/proposals/{proposal_id}/apply - body `{"confirm": true}`.
///
/// Blocked applies are `200` with `applied: false`; unconfirmed or not-ready
/// proposals are `400 precondition_failed`.
pub(crate) async fn apply_proposal(
    State(state): State<AppState>,
    Path(proposal_id): Path<String>,
    body: Bytes,
) -> Result<Json<ApplyOutcome>, ApiError> {
    let proposal_id = parse(&proposal_id, ProposalId::parse)?;
    let confirm = if body.is_empty() {
        false
    } else {
        serde_json::from_slice::<ApplyBody>(&body)
            .map_err(|err| ApiError::bad_request(format!("invalid apply body: {err}")))?
            .confirm
    };
    blocking(&state, move |orchestrator| {
        Ok(orchestrator.apply_proposal(&proposal_id, confirm)?)
    })
    .await
    .map(Json)
}

#[derive(Debug, Deserialize)]
pub(crate) struct TailParams {
    tail: Option<usize>,
}

/// GET /api/jobs/{job_id}?tail=N
pub(crate) async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(params): Query<TailParams>,
) -> Result<Json<JobView>, ApiError> {
    let job_id = parse(&job_id, JobId::parse)?;
    let tail = params.tail.unwrap_or(DEFAULT_TAIL);
    blocking(&state, move |orchestrator| {
        Ok(orchestrator.poll_job(&job_id, tail)?)
    })
    .await
    .map(Json)
}

#[derive(Debug, Serialize)]
pub(crate) struct CancelResponse {
    canceled: bool,
}

/// DELETE /api/jobs/{job_id} - request cancellation (idempotent).
pub(crate) async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let job_id = parse(&job_id, JobId::parse)?;
    let canceled = state.orchestrator.cancel_job(&job_id);
    Ok(Json(CancelResponse { canceled }))
}

/// GET /api/runs/{job_id} - the job's audit record.
pub(crate) async fn get_run(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Vec<RunEntry>>, ApiError> {
    let job_id = parse(&job_id, JobId::parse)?;
    blocking(&state, move |orchestrator| Ok(orchestrator.store().get_run(&job_id)?))
        .await
        .map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::OriginPolicy;
    use axum::http::StatusCode;
    use codex_orchestrator::core::job::JobStatus;
    use codex_orchestrator::core::proposal::ProposalStatus;
    use codex_orchestrator::core::run::RunOutcome;
    use codex_orchestrator::test_support::{
        ScriptedInvoker, TestWorkspace, insights_message, proposal_message,
    };
    use std::time::Duration;

    const DIFF: &str = "--- a/AGENTS.md\n+++ b/AGENTS.md\n@@ -1,3 +1,4 @@\n # Agent rules\n \n - Run tests before committing.\n+- Keep diffs small.\n";

    fn app(ws: &TestWorkspace, reply: &str) -> AppState {
        AppState::new(
            ws.orchestrator(Arc::new(ScriptedInvoker::replying(reply))),
            OriginPolicy::local(3001, &[]).expect("policy"),
        )
    }

    async fn wait_for_outcome(state: &AppState, job_id: &str) -> JobView {
        for _ in 0..300 {
            let Json(view) = get_job(
                State(state.clone()),
                Path(job_id.to_string()),
                Query(TailParams { tail: Some(10) }),
            )
            .await
            .expect("poll");
            if view.outcome.is_some() {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {job_id} did not finish");
    }

    #[tokio::test]
    async fn health_is_ok() {
        assert_eq!(health().await, "ok");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn insights_run_then_fetch_artifact() {
        let ws = TestWorkspace::new();
        let state = app(&ws, &insights_message("Use the replica."));

        let Json(started) = run_insights(
            State(state.clone()),
            Json(RunInsightsBody {
                session_id: "abc".to_string(),
                prompt: "What went wrong?".to_string(),
                mode: None,
                model: None,
            }),
        )
        .await
        .expect("start");

        let view = wait_for_outcome(&state, started.job_id.as_str()).await;
        assert_eq!(view.job.status(), JobStatus::Succeeded);
        assert_eq!(view.outcome, Some(RunOutcome::Stored));

        let Json(artifact) = get_insight(
            State(state.clone()),
            Path(("abc".to_string(), started.artifact_id.to_string())),
        )
        .await
        .expect("artifact");
        assert_eq!(artifact.markdown.as_deref(), Some("Use the replica.\n"));

        let Json(listed) = list_insights(State(state), Path("abc".to_string()))
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn proposal_apply_requires_confirm() {
        let ws = TestWorkspace::new();
        let state = app(&ws, &proposal_message("keep diffs small", DIFF, &["AGENTS.md"]));
        let artifact_id = state
            .orchestrator
            .store()
            .put_insight(
                &SessionId::parse("abc").expect("id"),
                codex_orchestrator::core::insight::InsightDraft {
                    artifact_id: None,
                    markdown: Some("diffs too big\n".to_string()),
                    json: None,
                },
            )
            .expect("seed");

        let Json(started) = run_proposal(
            State(state.clone()),
            Json(RunProposalBody {
                session_id: "abc".to_string(),
                insight_artifact_id: artifact_id.to_string(),
                prompt: None,
                mode: Some("fork".to_string()),
                model: None,
            }),
        )
        .await
        .expect("start");
        wait_for_outcome(&state, started.job_id.as_str()).await;

        let proposal_id = started.proposal_id.to_string();
        let err = apply_proposal(State(state.clone()), Path(proposal_id.clone()), Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "precondition_failed");
        assert_eq!(ws.read("AGENTS.md"), codex_orchestrator::test_support::AGENTS_MD);

        let Json(outcome) = apply_proposal(
            State(state.clone()),
            Path(proposal_id.clone()),
            Bytes::from_static(br#"{"confirm": true}"#),
        )
        .await
        .expect("apply");
        assert!(outcome.applied);
        assert!(ws.read("AGENTS.md").ends_with("- Keep diffs small.\n"));

        let Json(proposal) = get_proposal(State(state), Path(proposal_id))
            .await
            .expect("proposal");
        assert_eq!(proposal.status(), ProposalStatus::Applied);
    }

    #[tokio::test]
    async fn proposal_without_insight_is_precondition_failed() {
        let ws = TestWorkspace::new();
        let state = app(&ws, "{}");
        let err = run_proposal(
            State(state),
            Json(RunProposalBody {
                session_id: "abc".to_string(),
                insight_artifact_id: "0123abcd".to_string(),
                prompt: None,
                mode: None,
                model: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "precondition_failed");
    }

    #[tokio::test]
    async fn unknown_job_is_404_and_cancel_is_false() {
        let ws = TestWorkspace::new();
        let state = app(&ws, "{}");
        let err = get_job(
            State(state.clone()),
            Path("feedface".to_string()),
            Query(TailParams { tail: None }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let Json(cancel) = cancel_job(State(state), Path("feedface".to_string()))
            .await
            .expect("cancel");
        assert!(!cancel.canceled);
    }

    #[tokio::test]
    async fn path_ids_are_validated() {
        let ws = TestWorkspace::new();
        let state = app(&ws, "{}");
        let err = get_insight(
            State(state),
            Path(("..".to_string(), "x".to_string())),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "invalid_request");
    }

    async fn serve(ws: &TestWorkspace) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let state = AppState::new(
            ws.orchestrator(Arc::new(ScriptedInvoker::replying("{}"))),
            OriginPolicy::local(addr.port(), &[]).expect("policy"),
        );
        let app = Router::new()
            .nest("/api", guarded_api_router(&state))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        addr
    }

    async fn send(addr: std::net::SocketAddr, head: &str, body: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        let request = format!(
            "{head}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.expect("read");
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn cross_origin_requests_are_refused() {
        let ws = TestWorkspace::new();
        let before = ws.snapshot();
        let addr = serve(&ws).await;
        let host = format!("127.0.0.1:{}", addr.port());

        let response = send(
            addr,
            &format!(
                "POST /api/proposals/feedface/apply HTTP/1.1\r\nHost: {host}\r\nOrigin: https://evil.example\r\nContent-Type: text/plain"
            ),
            "{}",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 403"), "{response}");
        assert!(response.contains("\"forbidden\""), "{response}");

        let preflight = send(
            addr,
            &format!(
                "OPTIONS /api/insights/run HTTP/1.1\r\nHost: {host}\r\nOrigin: https://evil.example\r\nAccess-Control-Request-Method: POST"
            ),
            "",
        )
        .await;
        assert!(preflight.starts_with("HTTP/1.1 403"), "{preflight}");
        assert!(
            !preflight.to_ascii_lowercase().contains("access-control-allow-origin"),
            "{preflight}"
        );

        let rebound = send(
            addr,
            "POST /api/insights/run HTTP/1.1\r\nHost: attacker.example\r\nContent-Type: application/json",
            "{}",
        )
        .await;
        assert!(rebound.starts_with("HTTP/1.1 403"), "{rebound}");

        assert_eq!(ws.snapshot(), before);
    }

    #[tokio::test]
    async fn same_origin_requests_reach_the_handlers() {
        let ws = TestWorkspace::new();
        let addr = serve(&ws).await;
        let host = format!("127.0.0.1:{}", addr.port());

        let response = send(
            addr,
            &format!("GET /api/health HTTP/1.1\r\nHost: {host}\r\nOrigin: http://{host}"),
            "",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("ok"), "{response}");
    }

    #[tokio::test]
    async fn bad_mode_is_rejected() {
        assert!(parse_mode(Some("branch")).is_err());
        assert_eq!(parse_mode(None).expect("default"), RunMode::Fork);
    }
}
