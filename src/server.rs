use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::{
    parser,
    probe::ProbeExecutor,
    scheduler::{self, RunEvent, RunReport},
    types::{CheckResponse, ProbeTarget, Progress, WorkingEntry},
};

/// Large pasted lists are accepted on the API.
const API_BODY_LIMIT: usize = 50 * 1024 * 1024;

pub const GENERIC_FAILURE: &str = "An error occurred. Check the logs.";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>, // run bookkeeping; progress itself flows through `live`
    executor: ProbeExecutor,
    window: usize,
}

impl AppState {
    pub fn new(executor: ProbeExecutor, window: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServerState::default())),
            executor,
            window: window.max(1),
        }
    }
}

#[derive(Debug, Default)]
struct ServerState {
    run_id: u64,
    phase: RunPhase,
    progress: Progress,
    message: Option<String>,
    live: Option<watch::Receiver<Snapshot>>,
    report: Option<RunReport>,
    cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    progress: Progress,
    entries: Vec<WorkingEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Done,
    Cancelled,
    NoValidInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub state: RunPhase,
    #[serde(flatten)]
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub input: String,
    #[serde(default)]
    pub dedup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsResponse {
    pub state: RunPhase,
    pub entries: Vec<WorkingEntry>,
    pub text: String,
}

impl ServerState {
    fn status(&self) -> Status {
        let progress = match (&self.live, self.phase) {
            (Some(live), RunPhase::Running) => live.borrow().progress,
            _ => self.progress,
        };
        Status {
            state: self.phase,
            progress,
            message: self.message.clone(),
        }
    }
}

/// Build the HTTP router. `/api/*` carries the boundary operation and
/// server-side runs; `ui_dir`, when given, is served as static files.
pub fn router(state: AppState, ui_dir: Option<PathBuf>) -> Router {
    let api = Router::new()
        .route("/check", post(post_check))
        .route("/run", post(post_run).delete(delete_run))
        .route("/status", get(get_status))
        .route("/results", get(get_results))
        .layer(DefaultBodyLimit::max(API_BODY_LIMIT))
        .with_state(state);

    let mut app = Router::new().nest("/api", api);
    if let Some(dir) = ui_dir {
        let static_svc = ServiceBuilder::new()
            .layer(SetResponseHeaderLayer::if_not_present(
                header::CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=86400"),
            ))
            .service(ServeDir::new(dir).append_index_html_on_directories(true));
        app = app.fallback_service(static_svc);
    }
    app.layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState, ui_dir: Option<PathBuf>) -> Result<()> {
    let app = router(state, ui_dir);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!("Server running at http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

/// The boundary operation. A failed probe is a normal `200 {"ok":false}`.
async fn post_check(
    State(app): State<AppState>,
    Json(target): Json<ProbeTarget>,
) -> Json<CheckResponse> {
    let result = app.executor.probe(&target).await;
    Json(result.into())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    (StatusCode::OK, Json(s.status()))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    let entries = match (&s.live, &s.report) {
        (Some(live), _) => live.borrow().entries.clone(),
        (None, Some(report)) => report.entries.clone(),
        (None, None) => return StatusCode::NO_CONTENT.into_response(),
    };
    let text = crate::aggregator::render_entries(&entries);
    (
        StatusCode::OK,
        Json(ResultsResponse {
            state: s.phase,
            entries,
            text,
        }),
    )
        .into_response()
}

async fn delete_run(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    if let Some(c) = s.cancel.as_ref() {
        c.cancel();
        return (StatusCode::ACCEPTED, Json(s.status()));
    }
    (StatusCode::OK, Json(s.status()))
}

async fn post_run(State(app): State<AppState>, Json(req): Json<RunRequest>) -> impl IntoResponse {
    if req.input.trim().is_empty() {
        let status = Status {
            state: RunPhase::Idle,
            progress: Progress::default(),
            message: Some("List is empty!".into()),
        };
        return (StatusCode::BAD_REQUEST, Json(status)).into_response();
    }

    let mut parsed = parser::parse_input(&req.input);
    if req.dedup {
        parsed = parsed.dedup();
    }

    let mut s = app.inner.write().await;
    if parsed.is_empty() {
        // A running run keeps going; only an idle or finished server reflects the rejection.
        let status = Status {
            state: RunPhase::NoValidInput,
            progress: Progress {
                skipped: parsed.skipped as u64,
                ..Progress::default()
            },
            message: Some("No valid links found!".into()),
        };
        if s.phase != RunPhase::Running {
            s.phase = status.state;
            s.progress = status.progress;
            s.message = status.message.clone();
            s.report = None;
        }
        return (StatusCode::UNPROCESSABLE_ENTITY, Json(status)).into_response();
    }

    info!(
        "Parsed {} valid links. Skipped {} bad links.",
        parsed.descriptors.len(),
        parsed.skipped
    );

    // Cancel any existing run
    if let Some(c) = s.cancel.take() {
        c.cancel();
    }

    let progress = Progress {
        total: parsed.descriptors.len() as u64,
        skipped: parsed.skipped as u64,
        ..Progress::default()
    };
    let cancel = CancellationToken::new();
    let (tx, rx) = watch::channel(Snapshot {
        progress,
        entries: Vec::new(),
    });

    s.run_id += 1;
    let run_id = s.run_id;
    s.phase = RunPhase::Running;
    s.progress = progress;
    s.message = None;
    s.live = Some(rx);
    s.report = None;
    s.cancel = Some(cancel.clone());
    let status = s.status();
    drop(s);

    let executor = app.executor.clone();
    let window = app.window;
    let driver = tokio::spawn(async move {
        scheduler::run_batch(
            parsed.descriptors,
            parsed.skipped,
            &executor,
            window,
            cancel,
            |event| {
                if let RunEvent::ProbeFinished {
                    progress, entries, ..
                } = event
                {
                    tx.send_replace(Snapshot {
                        progress,
                        entries: entries.to_vec(),
                    });
                }
            },
        )
        .await
    });

    // Supervise the driver so a crashed run leaves the server re-runnable.
    let app2 = app.clone();
    tokio::spawn(async move {
        let outcome = driver.await;
        let mut s = app2.inner.write().await;
        if s.run_id != run_id {
            return;
        }
        s.live = None;
        s.cancel = None;
        match outcome {
            Ok(report) => {
                s.phase = if report.cancelled {
                    RunPhase::Cancelled
                } else {
                    RunPhase::Done
                };
                s.progress = report.progress;
                s.message = Some(report.summary());
                s.report = Some(report);
            }
            Err(e) => {
                error!("run driver failed: {e}");
                s.phase = RunPhase::Idle;
                s.message = Some(GENERIC_FAILURE.into());
                s.report = None;
            }
        }
    });

    (StatusCode::ACCEPTED, Json(status)).into_response()
}
