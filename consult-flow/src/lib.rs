//! # consult-flow
//!
//! Building blocks for a collaborative decision session between a clinician and an AI
//! assistant about one patient.
//!
//! A [`SessionController`] opens with an AI analysis of the patient, runs a turn-based
//! conversation, and ends by submitting a structured [`Decision`] through a
//! [`DecisionPersistence`] backend. The AI side is any [`ConsultationClient`]: the
//! bundled HTTP client (feature `http`, on by default) talks to a consultation backend,
//! and the `rig` feature adds a client that prompts an LLM directly.
//!
//! ```rust,no_run
//! use consult_flow::{
//!     ClientContext, HttpConsultationClient, HttpDecisionPersistence, SessionConfig,
//!     SessionController,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> consult_flow::Result<()> {
//! let context = ClientContext::new("http://localhost:5000/api").with_bearer_token("token");
//! let session = SessionController::open(
//!     "patient-42",
//!     Arc::new(HttpConsultationClient::new(context.clone())),
//!     Arc::new(HttpDecisionPersistence::new(context)),
//!     SessionConfig::default(),
//! )
//! .await?;
//!
//! session.send_message("What medication options do you recommend?").await?;
//! session.request_finalize()?;
//! session.update_decision(|draft| draft.set_treatment_plan("Start metformin 500mg"))?;
//! let decision_id = session.submit_decision().await?;
//! println!("saved {decision_id}");
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod client;
pub mod context;
pub mod decision;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "rig")]
pub mod llm;
pub mod records;
pub mod session;
pub mod storage;
pub mod transcript;
pub mod types;

// Re-export commonly used types
pub use analysis::{AnalysisResult, format_analysis};
pub use client::{ConsultationClient, DecisionPersistence};
pub use context::ClientContext;
pub use decision::{ContributionSplit, Decision, DecisionBuilder, DecisionEdit, Medication};
pub use error::{Result, ServiceError, SessionError, ValidationError};
#[cfg(feature = "http")]
pub use http::{HttpConsultationClient, HttpDecisionPersistence};
#[cfg(feature = "rig")]
pub use llm::RigConsultationClient;
pub use records::{
    HealthLog, InMemoryPatientRecords, PatientRecord, PatientRecordSource, VitalSign,
};
pub use session::{
    APOLOGY_MESSAGE, FALLBACK_GREETING, QuickPrompt, SessionConfig, SessionController,
    SessionSnapshot,
};
pub use storage::InMemoryDecisionStore;
pub use transcript::{ConversationStore, SessionStatus, Speaker, Turn};
pub use types::{DecisionId, PatientRef};
