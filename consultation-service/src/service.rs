use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
};
use consult_flow::{
    ConsultationClient, DecisionBuilder, DecisionPersistence, QuickPrompt, SessionConfig,
    SessionController, SessionError, SessionSnapshot, SessionStatus, ValidationError,
};
use dashmap::DashMap;
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::ServiceConfig,
    models::{
        OpenConsultationRequest, QuickPromptView, SendMessageRequest, SubmitDecisionResponse,
        UpdateDecisionRequest,
    },
};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found_error(message: &str, id: &Uuid) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": message,
            "session_id": id
        })),
    )
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

fn session_error(session_id: &Uuid, e: SessionError) -> ApiError {
    let status = match &e {
        SessionError::EmptyMessage | SessionError::Validation(_) => StatusCode::BAD_REQUEST,
        SessionError::Busy | SessionError::InvalidState(_) => StatusCode::CONFLICT,
        SessionError::Closed => StatusCode::GONE,
        SessionError::Service(_) => StatusCode::BAD_GATEWAY,
    };

    if status.is_server_error() {
        error!(%session_id, error = %e, "Consultation request failed");
    } else {
        warn!(%session_id, error = %e, "Consultation request rejected");
    }

    (
        status,
        Json(json!({
            "error": e.to_string(),
            "session_id": session_id,
            "retryable": e.is_retryable()
        })),
    )
}

/// A live session and the last time a request touched it.
#[derive(Clone)]
pub struct SessionEntry {
    pub session: SessionController,
    pub last_activity: Instant,
}

impl SessionEntry {
    fn new(session: SessionController) -> Self {
        Self {
            session,
            last_activity: Instant::now(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<DashMap<Uuid, SessionEntry>>,
    pub ai: Arc<dyn ConsultationClient>,
    pub persistence: Arc<dyn DecisionPersistence>,
    pub session_config: SessionConfig,
}

impl AppState {
    pub fn new(
        ai: Arc<dyn ConsultationClient>,
        persistence: Arc<dyn DecisionPersistence>,
        session_config: SessionConfig,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ai,
            persistence,
            session_config,
        }
    }

    fn session(&self, session_id: &Uuid) -> Result<SessionController, ApiError> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found_error("Consultation not found", session_id))?;
        entry.last_activity = Instant::now();
        Ok(entry.session.clone())
    }

    /// Cancel and drop every session untouched for at least `max_idle`.
    ///
    /// Sessions waiting on the AI or in the middle of a save are left alone.
    /// Returns how many sessions were evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        self.sessions.retain(|session_id, entry| {
            if now.duration_since(entry.last_activity) < max_idle
                || entry.session.status() == SessionStatus::WaitingForAI
            {
                return true;
            }
            match entry.session.cancel() {
                Ok(()) => {
                    info!(
                        %session_id,
                        patient = %entry.session.patient_ref(),
                        "Evicted idle consultation"
                    );
                    evicted += 1;
                    false
                }
                Err(e) => {
                    debug!(%session_id, error = %e, "Idle consultation busy, keeping it");
                    true
                }
            }
        });
        evicted
    }
}

/// Periodically evict sessions idle for longer than `max_idle`.
pub fn spawn_idle_sweeper(state: AppState, max_idle: Duration) -> JoinHandle<()> {
    let period = (max_idle / 4).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        ticker.tick().await;

        info!(
            max_idle_secs = max_idle.as_secs(),
            period_secs = period.as_secs(),
            "Idle session sweeper started"
        );

        loop {
            ticker.tick().await;
            let evicted = state.evict_idle(max_idle);
            if evicted > 0 {
                debug!(evicted, remaining = state.sessions.len(), "Idle sweep finished");
            }
        }
    })
}

/// Build the router and start the idle sweeper. Must run inside a Tokio runtime.
pub fn create_app(config: &ServiceConfig) -> anyhow::Result<Router> {
    let (ai, persistence) = config.build_clients()?;
    let state = AppState::new(ai, persistence, config.session.clone());
    spawn_idle_sweeper(state.clone(), config.session_idle_timeout);
    Ok(build_router(state))
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/quick-prompts", get(quick_prompts))
        .route("/consultations", post(open_consultation))
        .route(
            "/consultations/{session_id}",
            get(get_consultation).delete(cancel_consultation),
        )
        .route("/consultations/{session_id}/messages", post(send_message))
        .route("/consultations/{session_id}/finalize", post(finalize))
        .route("/consultations/{session_id}/resume", post(resume_chat))
        .route("/consultations/{session_id}/decision", put(update_decision))
        .route(
            "/consultations/{session_id}/decision/submit",
            post(submit_decision),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Consultation Service",
        "version": "1.0.0",
        "description": "Collaborative clinician/AI decision sessions",
        "endpoints": {
            "POST /consultations": "Open a consultation for a patient",
            "GET /consultations/{session_id}": "Current session snapshot",
            "POST /consultations/{session_id}/messages": "Send a doctor message",
            "POST /consultations/{session_id}/finalize": "Freeze the chat and start the decision",
            "POST /consultations/{session_id}/resume": "Return from the decision form to the chat",
            "PUT /consultations/{session_id}/decision": "Edit the decision draft",
            "POST /consultations/{session_id}/decision/submit": "Save the decision and close",
            "DELETE /consultations/{session_id}": "Cancel without saving",
            "GET /quick-prompts": "Canned doctor questions",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn quick_prompts() -> Json<Vec<QuickPromptView>> {
    Json(QuickPrompt::ALL.into_iter().map(QuickPromptView::from).collect())
}

async fn open_consultation(
    State(state): State<AppState>,
    Json(request): Json<OpenConsultationRequest>,
) -> ApiResult<SessionSnapshot> {
    let patient_id = request.patient_id.trim();
    if patient_id.is_empty() {
        return Err(bad_request_error("patient_id is required"));
    }

    let session = SessionController::open(
        patient_id,
        state.ai.clone(),
        state.persistence.clone(),
        state.session_config.clone(),
    )
    .await
    .map_err(|e| {
        error!(patient = patient_id, error = %e, "Failed to open consultation");
        internal_error("Failed to open consultation", &e.to_string())
    })?;

    info!(session_id = %session.id(), patient = patient_id, "Consultation opened");
    state
        .sessions
        .insert(session.id(), SessionEntry::new(session.clone()));
    Ok(Json(session.snapshot()))
}

async fn get_consultation(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<SessionSnapshot> {
    Ok(Json(state.session(&session_id)?.snapshot()))
}

async fn send_message(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<SessionSnapshot> {
    let session = state.session(&session_id)?;
    let text = request
        .text()
        .ok_or_else(|| bad_request_error("message or quick_prompt is required"))?;

    session
        .send_message(text)
        .await
        .map_err(|e| session_error(&session_id, e))?;
    Ok(Json(session.snapshot()))
}

async fn finalize(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<SessionSnapshot> {
    let session = state.session(&session_id)?;
    session
        .request_finalize()
        .map_err(|e| session_error(&session_id, e))?;
    Ok(Json(session.snapshot()))
}

async fn resume_chat(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<SessionSnapshot> {
    let session = state.session(&session_id)?;
    session
        .resume_chat()
        .map_err(|e| session_error(&session_id, e))?;
    Ok(Json(session.snapshot()))
}

async fn update_decision(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<UpdateDecisionRequest>,
) -> ApiResult<DecisionBuilder> {
    let session = state.session(&session_id)?;

    session
        .update_decision(|draft| {
            let mut next = draft.clone();
            for edit in request.edits {
                next.apply(edit)?;
            }
            *draft = next;
            Ok::<(), ValidationError>(())
        })
        .and_then(|applied| applied.map_err(SessionError::from))
        .map_err(|e| session_error(&session_id, e))?;

    Ok(Json(session.decision_draft()))
}

async fn submit_decision(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<SubmitDecisionResponse> {
    let session = state.session(&session_id)?;
    let contributions = session.decision_draft().contribution_split();
    let decision_id = session
        .submit_decision()
        .await
        .map_err(|e| session_error(&session_id, e))?;

    state.sessions.remove(&session_id);
    info!(%session_id, %decision_id, "Consultation completed");

    Ok(Json(SubmitDecisionResponse {
        decision_id,
        status: session.status(),
        contributions,
    }))
}

async fn cancel_consultation(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<SessionSnapshot> {
    let session = state.session(&session_id)?;
    session
        .cancel()
        .map_err(|e| session_error(&session_id, e))?;

    state.sessions.remove(&session_id);
    Ok(Json(session.snapshot()))
}
