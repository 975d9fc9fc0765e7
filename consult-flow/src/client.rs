use async_trait::async_trait;

use crate::{
    analysis::AnalysisResult,
    decision::Decision,
    error::ServiceError,
    transcript::Turn,
    types::{DecisionId, PatientRef},
};

/// Boundary to the AI inference service.
///
/// Implementations issue a single request per call and never retry on their own.
#[async_trait]
pub trait ConsultationClient: Send + Sync {
    /// Initial structured analysis of a patient.
    async fn analyze(&self, patient: &PatientRef) -> Result<AnalysisResult, ServiceError>;

    /// Reply to `message`, given every turn that preceded it.
    async fn chat(&self, history: &[Turn], message: &str) -> Result<String, ServiceError>;
}

/// Boundary to the service that durably stores finalized decisions
#[async_trait]
pub trait DecisionPersistence: Send + Sync {
    async fn save(&self, decision: &Decision) -> Result<DecisionId, ServiceError>;
}
