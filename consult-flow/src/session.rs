//! Session controller: the state machine behind one clinician/AI consultation.
//!
//! ```text
//! Initializing ──analyze──▶ AwaitingInput ──send_message──▶ WaitingForAI
//!                               ▲   │  ▲                         │
//!                               │   │  └──────reply / apology────┘
//!                  resume_chat  │   ▼ request_finalize
//!                               Finalizing ──submit_decision──▶ Closed
//! ```
//!
//! `cancel` moves any open session to `Closed`. Boundary failures never end a session:
//! a failed analysis becomes a fallback greeting, a failed chat turn becomes an apology
//! turn, and a failed save leaves the session in `Finalizing` so it can be retried.
//!
//! The controller is a cheap `Clone` handle. State is never locked across an `.await`,
//! so snapshots stay readable while a call is in flight, and a reply that arrives after
//! the session closed is dropped instead of being appended.

use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    analysis::{AnalysisResult, format_analysis},
    client::{ConsultationClient, DecisionPersistence},
    decision::{
        DEFAULT_AI_CONTRIBUTIONS, DEFAULT_DECISION_CONFIDENCE, DEFAULT_DOCTOR_CONTRIBUTIONS,
        DecisionBuilder, DecisionEdit,
    },
    error::{Result, ServiceError, SessionError},
    transcript::{ConversationStore, SessionStatus, Speaker, Turn},
    types::{DecisionId, PatientRef},
};

pub const FALLBACK_GREETING: &str =
    "Hello! I'm ready to discuss this patient's care. What would you like to know?";

pub const APOLOGY_MESSAGE: &str =
    "I apologize, but I'm having trouble responding right now. Please try again.";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound for `analyze` and `chat` calls. `None` waits indefinitely.
    pub ai_timeout: Option<Duration>,
    pub decision_confidence: f64,
    pub ai_contributions: Vec<String>,
    pub doctor_contributions: Vec<String>,
}

impl SessionConfig {
    pub fn with_ai_timeout(mut self, timeout: Duration) -> Self {
        self.ai_timeout = Some(timeout);
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ai_timeout: None,
            decision_confidence: DEFAULT_DECISION_CONFIDENCE,
            ai_contributions: DEFAULT_AI_CONTRIBUTIONS.map(String::from).to_vec(),
            doctor_contributions: DEFAULT_DOCTOR_CONTRIBUTIONS.map(String::from).to_vec(),
        }
    }
}

/// Canned doctor questions offered next to the message box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickPrompt {
    Assessment,
    MedicationOptions,
    Concerns,
}

impl QuickPrompt {
    pub const ALL: [QuickPrompt; 3] = [
        QuickPrompt::Assessment,
        QuickPrompt::MedicationOptions,
        QuickPrompt::Concerns,
    ];

    pub fn label(self) -> &'static str {
        match self {
            QuickPrompt::Assessment => "What's your assessment?",
            QuickPrompt::MedicationOptions => "Medication options?",
            QuickPrompt::Concerns => "Any concerns?",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            QuickPrompt::Assessment => "What's your overall assessment of this patient?",
            QuickPrompt::MedicationOptions => "What medication options do you recommend?",
            QuickPrompt::Concerns => "Do you have any specific concerns I should address?",
        }
    }
}

/// Point-in-time view of a session, published on every change.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub patient_ref: PatientRef,
    pub status: SessionStatus,
    pub transcript: Vec<Turn>,
    pub analysis: Option<AnalysisResult>,
    pub decision: DecisionBuilder,
    pub submitting: bool,
    /// Most recent decision submission failure, cleared by the next attempt.
    pub last_error: Option<String>,
}

struct SessionState {
    store: ConversationStore,
    decision: DecisionBuilder,
    analysis: Option<AnalysisResult>,
    analysis_requested: bool,
    submitting: bool,
    last_error: Option<String>,
}

struct SessionInner {
    id: Uuid,
    patient_ref: PatientRef,
    config: SessionConfig,
    ai: Arc<dyn ConsultationClient>,
    persistence: Arc<dyn DecisionPersistence>,
    state: Mutex<SessionState>,
    updates: watch::Sender<SessionSnapshot>,
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<SessionInner>,
}

impl SessionController {
    /// Create a session in `Initializing` without contacting the AI service yet.
    pub fn new(
        patient_ref: impl Into<PatientRef>,
        ai: Arc<dyn ConsultationClient>,
        persistence: Arc<dyn DecisionPersistence>,
        config: SessionConfig,
    ) -> Self {
        let patient_ref = patient_ref.into();
        let decision = DecisionBuilder::new(patient_ref.clone())
            .with_confidence(config.decision_confidence)
            .with_contributions(
                config.ai_contributions.clone(),
                config.doctor_contributions.clone(),
            );
        let state = SessionState {
            store: ConversationStore::new(),
            decision,
            analysis: None,
            analysis_requested: false,
            submitting: false,
            last_error: None,
        };

        let id = Uuid::new_v4();
        let (updates, _) = watch::channel(SessionSnapshot {
            session_id: id,
            patient_ref: patient_ref.clone(),
            status: state.store.status(),
            transcript: Vec::new(),
            analysis: None,
            decision: state.decision.clone(),
            submitting: false,
            last_error: None,
        });

        Self {
            inner: Arc::new(SessionInner {
                id,
                patient_ref,
                config,
                ai,
                persistence,
                state: Mutex::new(state),
                updates,
            }),
        }
    }

    /// Create a session and seed its transcript from the initial analysis.
    pub async fn open(
        patient_ref: impl Into<PatientRef>,
        ai: Arc<dyn ConsultationClient>,
        persistence: Arc<dyn DecisionPersistence>,
        config: SessionConfig,
    ) -> Result<Self> {
        let controller = Self::new(patient_ref, ai, persistence, config);
        controller.initialize().await?;
        Ok(controller)
    }

    /// Request the initial analysis and seed the transcript with it, or with the
    /// fallback greeting when the call fails.
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut state = self.lock();
            match state.store.status() {
                SessionStatus::Initializing if !state.analysis_requested => {}
                SessionStatus::Closed => return Err(SessionError::Closed),
                other => return Err(SessionError::InvalidState(other)),
            }
            state.analysis_requested = true;
        }

        info!(
            session_id = %self.inner.id,
            patient = %self.inner.patient_ref,
            "Requesting initial analysis"
        );
        let outcome = self
            .bounded(self.inner.ai.analyze(&self.inner.patient_ref))
            .await;

        let mut state = self.lock();
        if state.store.status().is_closed() {
            debug!(
                session_id = %self.inner.id,
                "Session closed before analysis arrived, discarding it"
            );
            return Ok(());
        }

        let opening = match outcome {
            Ok(analysis) => {
                let text = format_analysis(&analysis);
                state.analysis = Some(analysis);
                text
            }
            Err(e) => {
                warn!(
                    session_id = %self.inner.id,
                    error = %e,
                    "Initial analysis failed, using fallback greeting"
                );
                FALLBACK_GREETING.to_string()
            }
        };

        state.store.append(Speaker::Ai, opening)?;
        state.store.transition(SessionStatus::AwaitingInput)?;
        self.publish(&state);
        Ok(())
    }

    /// Append a doctor turn, ask the AI, and append its reply (or the apology turn).
    ///
    /// Returns the AI turn. Rejected without any change when the text is blank or a
    /// previous reply is still pending.
    pub async fn send_message(&self, text: &str) -> Result<Turn> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let history = {
            let mut state = self.lock();
            match state.store.status() {
                SessionStatus::AwaitingInput => {}
                SessionStatus::WaitingForAI => return Err(SessionError::Busy),
                SessionStatus::Closed => return Err(SessionError::Closed),
                other => return Err(SessionError::InvalidState(other)),
            }
            let history = state.store.turns().to_vec();
            state.store.append(Speaker::Doctor, text)?;
            state.store.transition(SessionStatus::WaitingForAI)?;
            self.publish(&state);
            history
        };

        debug!(session_id = %self.inner.id, history_len = history.len(), "Doctor message sent");
        let outcome = self.bounded(self.inner.ai.chat(&history, text)).await;

        let mut state = self.lock();
        if state.store.status() != SessionStatus::WaitingForAI {
            debug!(session_id = %self.inner.id, "Session closed while waiting, dropping reply");
            return Err(SessionError::Closed);
        }

        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    session_id = %self.inner.id,
                    error = %e,
                    "Chat call failed, replying with apology"
                );
                APOLOGY_MESSAGE.to_string()
            }
        };

        let turn = state.store.append(Speaker::Ai, reply)?.clone();
        state.store.transition(SessionStatus::AwaitingInput)?;
        self.publish(&state);
        Ok(turn)
    }

    pub async fn send_quick_prompt(&self, prompt: QuickPrompt) -> Result<Turn> {
        self.send_message(prompt.message()).await
    }

    /// Freeze the transcript and hand over to the decision form.
    pub fn request_finalize(&self) -> Result<()> {
        let mut state = self.lock();
        match state.store.status() {
            SessionStatus::AwaitingInput => {}
            SessionStatus::WaitingForAI => return Err(SessionError::Busy),
            SessionStatus::Closed => return Err(SessionError::Closed),
            other => return Err(SessionError::InvalidState(other)),
        }
        state.store.transition(SessionStatus::Finalizing)?;
        info!(session_id = %self.inner.id, turns = state.store.len(), "Finalizing decision");
        self.publish(&state);
        Ok(())
    }

    /// Leave the decision form and continue chatting. The draft is kept.
    pub fn resume_chat(&self) -> Result<()> {
        let mut state = self.lock();
        if state.submitting {
            return Err(SessionError::Busy);
        }
        match state.store.status() {
            SessionStatus::Finalizing => {}
            SessionStatus::Closed => return Err(SessionError::Closed),
            other => return Err(SessionError::InvalidState(other)),
        }
        state.store.transition(SessionStatus::AwaitingInput)?;
        state.last_error = None;
        self.publish(&state);
        Ok(())
    }

    /// Mutate the decision draft. Allowed in any open state except while a
    /// submission is in flight.
    pub fn update_decision<R>(&self, edit: impl FnOnce(&mut DecisionBuilder) -> R) -> Result<R> {
        let mut state = self.lock();
        if state.store.status().is_closed() {
            return Err(SessionError::Closed);
        }
        if state.submitting {
            return Err(SessionError::Busy);
        }
        let result = edit(&mut state.decision);
        self.publish(&state);
        Ok(result)
    }

    pub fn apply_decision_edit(&self, edit: DecisionEdit) -> Result<()> {
        self.update_decision(|draft| draft.apply(edit))?
            .map_err(SessionError::from)
    }

    pub fn decision_draft(&self) -> DecisionBuilder {
        self.lock().decision.clone()
    }

    /// Validate the draft and hand it to the persistence service.
    ///
    /// Validation failures never reach the network. A failed save keeps the session
    /// in `Finalizing`; a successful one closes it.
    pub async fn submit_decision(&self) -> Result<DecisionId> {
        let decision = {
            let mut state = self.lock();
            match state.store.status() {
                SessionStatus::Finalizing => {}
                SessionStatus::Closed => return Err(SessionError::Closed),
                other => return Err(SessionError::InvalidState(other)),
            }
            if state.submitting {
                return Err(SessionError::Busy);
            }

            match state.decision.build() {
                Ok(decision) => {
                    state.submitting = true;
                    state.last_error = None;
                    self.publish(&state);
                    decision
                }
                Err(e) => {
                    state.last_error = Some(e.to_string());
                    self.publish(&state);
                    return Err(e.into());
                }
            }
        };

        info!(
            session_id = %self.inner.id,
            patient = %self.inner.patient_ref,
            medications = decision.medications().len(),
            "Submitting decision"
        );
        let outcome = self.inner.persistence.save(&decision).await;

        let mut state = self.lock();
        state.submitting = false;
        match outcome {
            Ok(decision_id) => {
                state.store.transition(SessionStatus::Closed)?;
                info!(session_id = %self.inner.id, %decision_id, "Decision saved, session closed");
                self.publish(&state);
                Ok(decision_id)
            }
            Err(e) => {
                warn!(session_id = %self.inner.id, error = %e, "Decision save failed");
                state.last_error = Some(e.to_string());
                self.publish(&state);
                Err(e.into())
            }
        }
    }

    /// Close the session without persisting anything. Closing twice is a no-op.
    pub fn cancel(&self) -> Result<()> {
        let mut state = self.lock();
        if state.store.status().is_closed() {
            return Ok(());
        }
        if state.submitting {
            return Err(SessionError::Busy);
        }
        state.store.transition(SessionStatus::Closed)?;
        info!(session_id = %self.inner.id, "Session cancelled");
        self.publish(&state);
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn patient_ref(&self) -> &PatientRef {
        &self.inner.patient_ref
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().store.status()
    }

    pub fn transcript(&self) -> Vec<Turn> {
        self.lock().store.turns().to_vec()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        self.snapshot_of(&state)
    }

    /// Receiver that observes a new snapshot after every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.updates.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot_of(&self, state: &SessionState) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.inner.id,
            patient_ref: self.inner.patient_ref.clone(),
            status: state.store.status(),
            transcript: state.store.turns().to_vec(),
            analysis: state.analysis.clone(),
            decision: state.decision.clone(),
            submitting: state.submitting,
            last_error: state.last_error.clone(),
        }
    }

    fn publish(&self, state: &SessionState) {
        self.inner.updates.send_replace(self.snapshot_of(state));
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, ServiceError>>,
    ) -> std::result::Result<T, ServiceError> {
        match self.inner.config.ai_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(ServiceError::Timeout(limit))),
            None => call.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decision::{Decision, Medication},
        error::ValidationError,
        storage::InMemoryDecisionStore,
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct ScriptedClient {
        analysis: Option<AnalysisResult>,
        replies: Mutex<VecDeque<std::result::Result<String, ServiceError>>>,
        chat_calls: Mutex<Vec<(Vec<Turn>, String)>>,
        entered: Notify,
        hold_analysis: Option<Notify>,
        hold_chat: Option<Notify>,
    }

    impl ScriptedClient {
        fn failing_analysis() -> Self {
            Self::default()
        }

        fn with_analysis(analysis: AnalysisResult) -> Self {
            Self {
                analysis: Some(analysis),
                ..Self::default()
            }
        }

        fn reply(self, reply: std::result::Result<&str, ServiceError>) -> Self {
            self.replies
                .lock()
                .unwrap()
                .push_back(reply.map(str::to_string));
            self
        }

        fn holding_chat(mut self) -> Self {
            self.hold_chat = Some(Notify::new());
            self
        }

        fn holding_analysis(mut self) -> Self {
            self.hold_analysis = Some(Notify::new());
            self
        }

        fn chat_call_count(&self) -> usize {
            self.chat_calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ConsultationClient for ScriptedClient {
        async fn analyze(
            &self,
            _patient: &PatientRef,
        ) -> std::result::Result<AnalysisResult, ServiceError> {
            self.entered.notify_one();
            if let Some(hold) = &self.hold_analysis {
                hold.notified().await;
            }
            self.analysis
                .clone()
                .ok_or_else(|| ServiceError::Transport("connection refused".to_string()))
        }

        async fn chat(
            &self,
            history: &[Turn],
            message: &str,
        ) -> std::result::Result<String, ServiceError> {
            self.chat_calls
                .lock()
                .unwrap()
                .push((history.to_vec(), message.to_string()));
            self.entered.notify_one();
            if let Some(hold) = &self.hold_chat {
                hold.notified().await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("Noted.".to_string()))
        }
    }

    #[derive(Default)]
    struct FlakyPersistence {
        failures_left: Mutex<usize>,
        saved: Mutex<Vec<Decision>>,
        attempts: Mutex<usize>,
    }

    #[async_trait]
    impl DecisionPersistence for FlakyPersistence {
        async fn save(&self, decision: &Decision) -> std::result::Result<DecisionId, ServiceError> {
            *self.attempts.lock().unwrap() += 1;
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ServiceError::Status {
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            let mut saved = self.saved.lock().unwrap();
            saved.push(decision.clone());
            Ok(DecisionId::new(format!("decision-{}", saved.len())))
        }
    }

    fn analysis() -> AnalysisResult {
        AnalysisResult {
            findings: Some("Resting heart rate trending up.".to_string()),
            concerns: Some(vec!["Poor sleep".to_string()]),
            risk_level: Some("moderate".to_string()),
            recommendations: Some("Sleep study".to_string()),
            confidence_score: Some(0.853),
        }
    }

    async fn open_with(
        client: Arc<ScriptedClient>,
        persistence: Arc<dyn DecisionPersistence>,
    ) -> SessionController {
        SessionController::open("patient-42", client, persistence, SessionConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn analysis_failure_seeds_fallback_greeting() {
        let client = Arc::new(ScriptedClient::failing_analysis());
        let session = open_with(client, Arc::new(InMemoryDecisionStore::new())).await;

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].speaker, Speaker::Ai);
        assert_eq!(transcript[0].content, FALLBACK_GREETING);
        assert_eq!(session.status(), SessionStatus::AwaitingInput);
        assert!(session.snapshot().analysis.is_none());
    }

    #[tokio::test]
    async fn analysis_success_seeds_formatted_analysis() {
        let client = Arc::new(ScriptedClient::with_analysis(analysis()));
        let session = open_with(client, Arc::new(InMemoryDecisionStore::new())).await;

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].speaker, Speaker::Ai);
        assert_eq!(transcript[0].content, format_analysis(&analysis()));
        assert!(transcript[0].content.contains("**Confidence:** 85%"));
        assert_eq!(session.status(), SessionStatus::AwaitingInput);
    }

    #[tokio::test]
    async fn initialize_runs_once() {
        let client = Arc::new(ScriptedClient::with_analysis(analysis()));
        let session = open_with(client, Arc::new(InMemoryDecisionStore::new())).await;

        assert!(matches!(
            session.initialize().await,
            Err(SessionError::InvalidState(SessionStatus::AwaitingInput))
        ));
        assert_eq!(session.transcript().len(), 1);
    }

    #[tokio::test]
    async fn round_trip_appends_doctor_then_ai() {
        let client = Arc::new(
            ScriptedClient::with_analysis(analysis()).reply(Ok("Patient shows stable vitals.")),
        );
        let session = open_with(client.clone(), Arc::new(InMemoryDecisionStore::new())).await;

        let turn = session.send_message("What's your assessment?").await.unwrap();
        assert_eq!(turn.content, "Patient shows stable vitals.");

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript[1].speaker, Speaker::Doctor);
        assert_eq!(transcript[1].content, "What's your assessment?");
        assert_eq!(transcript[2].speaker, Speaker::Ai);
        assert_eq!(transcript[2].content, "Patient shows stable vitals.");
        assert_eq!(session.status(), SessionStatus::AwaitingInput);

        let calls = client.chat_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.len(), 1, "history excludes the new doctor message");
        assert_eq!(calls[0].1, "What's your assessment?");
    }

    #[tokio::test]
    async fn chat_failure_appends_apology_and_session_continues() {
        let client = Arc::new(
            ScriptedClient::failing_analysis()
                .reply(Err(ServiceError::Transport("reset".to_string())))
                .reply(Ok("Second try worked.")),
        );
        let session = open_with(client, Arc::new(InMemoryDecisionStore::new())).await;

        let turn = session.send_message("Any concerns?").await.unwrap();
        assert_eq!(turn.content, APOLOGY_MESSAGE);
        assert_eq!(session.status(), SessionStatus::AwaitingInput);
        assert_eq!(session.transcript().len(), 3);

        let turn = session.send_message("Any concerns?").await.unwrap();
        assert_eq!(turn.content, "Second try worked.");
        assert_eq!(session.transcript().len(), 5);
    }

    #[tokio::test]
    async fn duplicate_messages_are_not_deduplicated() {
        let client = Arc::new(ScriptedClient::with_analysis(analysis()));
        let session = open_with(client.clone(), Arc::new(InMemoryDecisionStore::new())).await;

        session.send_quick_prompt(QuickPrompt::Concerns).await.unwrap();
        session.send_quick_prompt(QuickPrompt::Concerns).await.unwrap();

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 5);
        assert_eq!(transcript[1].content, transcript[3].content);
        assert_eq!(client.chat_call_count(), 2);
        assert_eq!(client.chat_calls.lock().unwrap()[1].0.len(), 3);
    }

    #[tokio::test]
    async fn blank_message_is_rejected_without_change() {
        let client = Arc::new(ScriptedClient::with_analysis(analysis()));
        let session = open_with(client.clone(), Arc::new(InMemoryDecisionStore::new())).await;

        assert!(matches!(
            session.send_message("  \n ").await,
            Err(SessionError::EmptyMessage)
        ));
        assert_eq!(session.transcript().len(), 1);
        assert_eq!(session.status(), SessionStatus::AwaitingInput);
        assert_eq!(client.chat_call_count(), 0);
    }

    #[tokio::test]
    async fn sending_while_waiting_is_rejected() {
        let client = Arc::new(ScriptedClient::with_analysis(analysis()).holding_chat());
        let session = open_with(client.clone(), Arc::new(InMemoryDecisionStore::new())).await;
        let mut updates = session.subscribe();

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.send_message("First question").await }
        });
        updates
            .wait_for(|snapshot| snapshot.status == SessionStatus::WaitingForAI)
            .await
            .unwrap();

        assert!(matches!(
            session.send_message("Second question").await,
            Err(SessionError::Busy)
        ));
        assert!(matches!(session.request_finalize(), Err(SessionError::Busy)));
        assert_eq!(session.transcript().len(), 2);

        client.hold_chat.as_ref().unwrap().notify_one();
        pending.await.unwrap().unwrap();

        assert_eq!(client.chat_call_count(), 1);
        assert_eq!(session.transcript().len(), 3);
        assert_eq!(session.status(), SessionStatus::AwaitingInput);
    }

    #[tokio::test]
    async fn reply_arriving_after_cancel_is_discarded() {
        let client = Arc::new(ScriptedClient::with_analysis(analysis()).holding_chat());
        let session = open_with(client.clone(), Arc::new(InMemoryDecisionStore::new())).await;
        let mut updates = session.subscribe();

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.send_message("Medication options?").await }
        });
        updates
            .wait_for(|snapshot| snapshot.status == SessionStatus::WaitingForAI)
            .await
            .unwrap();

        session.cancel().unwrap();
        client.hold_chat.as_ref().unwrap().notify_one();

        assert!(matches!(pending.await.unwrap(), Err(SessionError::Closed)));
        assert_eq!(session.status(), SessionStatus::Closed);
        let transcript = session.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].speaker, Speaker::Doctor);
    }

    #[tokio::test]
    async fn analysis_arriving_after_cancel_is_discarded() {
        let client = Arc::new(ScriptedClient::with_analysis(analysis()).holding_analysis());
        let session = SessionController::new(
            "patient-42",
            client.clone(),
            Arc::new(InMemoryDecisionStore::new()),
            SessionConfig::default(),
        );

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.initialize().await }
        });
        client.entered.notified().await;
        assert_eq!(session.status(), SessionStatus::Initializing);

        session.cancel().unwrap();
        client.hold_analysis.as_ref().unwrap().notify_one();
        pending.await.unwrap().unwrap();

        assert!(session.transcript().is_empty());
        assert_eq!(session.status(), SessionStatus::Closed);
    }

    #[tokio::test]
    async fn timed_out_chat_becomes_apology() {
        let client = Arc::new(ScriptedClient::with_analysis(analysis()).holding_chat());
        let session = SessionController::open(
            "patient-42",
            client,
            Arc::new(InMemoryDecisionStore::new()),
            SessionConfig::default().with_ai_timeout(Duration::from_millis(20)),
        )
        .await
        .unwrap();

        let turn = session.send_message("Still there?").await.unwrap();
        assert_eq!(turn.content, APOLOGY_MESSAGE);
        assert_eq!(session.status(), SessionStatus::AwaitingInput);
    }

    #[tokio::test]
    async fn timed_out_analysis_seeds_fallback_greeting() {
        let client = Arc::new(ScriptedClient::with_analysis(analysis()).holding_analysis());
        let session = SessionController::open(
            "patient-42",
            client,
            Arc::new(InMemoryDecisionStore::new()),
            SessionConfig::default().with_ai_timeout(Duration::from_millis(20)),
        )
        .await
        .unwrap();

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].speaker, Speaker::Ai);
        assert_eq!(transcript[0].content, FALLBACK_GREETING);
        assert_eq!(session.status(), SessionStatus::AwaitingInput);
        assert!(session.snapshot().analysis.is_none());
    }

    #[tokio::test]
    async fn finalize_and_submit_closes_session() {
        let client = Arc::new(ScriptedClient::with_analysis(analysis()));
        let persistence = Arc::new(FlakyPersistence::default());
        let session = open_with(client, persistence.clone()).await;

        session.request_finalize().unwrap();
        assert_eq!(session.status(), SessionStatus::Finalizing);
        session
            .update_decision(|draft| draft.set_treatment_plan("Start low-dose ACE inhibitor"))
            .unwrap();

        let id = session.submit_decision().await.unwrap();
        assert_eq!(id.as_str(), "decision-1");
        assert_eq!(session.status(), SessionStatus::Closed);

        let saved = persistence.saved.lock().unwrap();
        assert_eq!(*persistence.attempts.lock().unwrap(), 1);
        assert_eq!(saved.len(), 1);
        assert!(saved[0].medications().is_empty());
        assert_eq!(saved[0].treatment_plan_summary(), "Start low-dose ACE inhibitor");
        assert_eq!(saved[0].patient_ref().as_str(), "patient-42");
        assert_eq!(saved[0].confidence(), DEFAULT_DECISION_CONFIDENCE);
    }

    #[tokio::test]
    async fn validation_failure_never_reaches_persistence() {
        let client = Arc::new(ScriptedClient::with_analysis(analysis()));
        let persistence = Arc::new(FlakyPersistence::default());
        let session = open_with(client, persistence.clone()).await;
        session.request_finalize().unwrap();

        let err = session.submit_decision().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Validation(ValidationError::MissingTreatmentPlan)
        ));
        assert!(!err.is_retryable());
        assert_eq!(*persistence.attempts.lock().unwrap(), 0);
        assert_eq!(session.status(), SessionStatus::Finalizing);
        assert_eq!(
            session.snapshot().last_error.as_deref(),
            Some("Treatment plan summary is required")
        );
    }

    #[tokio::test]
    async fn failed_save_stays_finalizing_and_can_be_retried() {
        let client = Arc::new(ScriptedClient::with_analysis(analysis()));
        let persistence = Arc::new(FlakyPersistence {
            failures_left: Mutex::new(1),
            ..FlakyPersistence::default()
        });
        let session = open_with(client, persistence.clone()).await;
        session.request_finalize().unwrap();
        session
            .apply_decision_edit(DecisionEdit::SetTreatmentPlan {
                text: "Lifestyle first, recheck in 3 months".to_string(),
            })
            .unwrap();
        session
            .apply_decision_edit(DecisionEdit::AddMedication(Medication::new("Metformin", "500mg")))
            .unwrap();

        let err = session.submit_decision().await.unwrap_err();
        assert!(matches!(err, SessionError::Service(_)));
        assert!(err.is_retryable());
        assert_eq!(session.status(), SessionStatus::Finalizing);
        assert!(session.snapshot().last_error.is_some());

        session.submit_decision().await.unwrap();
        assert_eq!(session.status(), SessionStatus::Closed);
        assert_eq!(*persistence.attempts.lock().unwrap(), 2);
        assert_eq!(persistence.saved.lock().unwrap()[0].medications().len(), 1);
    }

    #[tokio::test]
    async fn finalizing_freezes_chat_until_resumed() {
        let client = Arc::new(ScriptedClient::with_analysis(analysis()));
        let session = open_with(client, Arc::new(InMemoryDecisionStore::new())).await;
        session.request_finalize().unwrap();

        assert!(matches!(
            session.send_message("One more thing").await,
            Err(SessionError::InvalidState(SessionStatus::Finalizing))
        ));
        assert!(matches!(
            session.request_finalize(),
            Err(SessionError::InvalidState(SessionStatus::Finalizing))
        ));

        session
            .update_decision(|draft| draft.add_lifestyle_change("Daily walks"))
            .unwrap()
            .unwrap();
        session.resume_chat().unwrap();
        session.send_message("One more thing").await.unwrap();

        assert_eq!(session.transcript().len(), 3);
        assert_eq!(session.decision_draft().lifestyle_changes().len(), 1);
    }

    #[tokio::test]
    async fn cancel_closes_without_persisting() {
        let client = Arc::new(ScriptedClient::with_analysis(analysis()));
        let persistence = Arc::new(FlakyPersistence::default());
        let session = open_with(client, persistence.clone()).await;
        session.request_finalize().unwrap();
        session
            .update_decision(|draft| draft.set_treatment_plan("Never saved"))
            .unwrap();

        session.cancel().unwrap();
        session.cancel().unwrap();

        assert_eq!(session.status(), SessionStatus::Closed);
        assert!(matches!(session.submit_decision().await, Err(SessionError::Closed)));
        assert!(matches!(session.send_message("hello").await, Err(SessionError::Closed)));
        assert!(matches!(
            session.update_decision(|_| ()),
            Err(SessionError::Closed)
        ));
        assert_eq!(*persistence.attempts.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn subscribers_see_each_transition() {
        let client = Arc::new(ScriptedClient::with_analysis(analysis()));
        let session = SessionController::new(
            "patient-42",
            client,
            Arc::new(InMemoryDecisionStore::new()),
            SessionConfig::default(),
        );
        let mut updates = session.subscribe();
        assert_eq!(updates.borrow().status, SessionStatus::Initializing);

        session.initialize().await.unwrap();
        assert!(updates.has_changed().unwrap());
        let snapshot = updates.borrow_and_update().clone();
        assert_eq!(snapshot.status, SessionStatus::AwaitingInput);
        assert_eq!(snapshot.transcript.len(), 1);
        assert_eq!(snapshot.session_id, session.id());
    }

    #[test]
    fn quick_prompts_carry_full_questions() {
        assert_eq!(QuickPrompt::ALL.len(), 3);
        assert_eq!(QuickPrompt::Assessment.label(), "What's your assessment?");
        assert_eq!(
            QuickPrompt::MedicationOptions.message(),
            "What medication options do you recommend?"
        );
    }
}
