//! HTTP adapters for the consultation backend.
//!
//! Endpoints, relative to the configured base URL:
//! * `POST ai/analyze/{patient_id}` → `{ "analysis": { findings, concerns, risk_level,
//!   recommendations, confidence_score } }`
//! * `POST ai/chat` with `{ conversation_history, message }` → `{ "ai_response": "..." }`
//! * `POST decisions/create` with the decision payload → `{ "decision": { "id": ... } }`

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    analysis::AnalysisResult,
    client::{ConsultationClient, DecisionPersistence},
    context::ClientContext,
    decision::{Decision, Medication},
    error::ServiceError,
    transcript::Turn,
    types::{DecisionId, PatientRef},
};

#[derive(Clone)]
struct ApiTransport {
    http: Client,
    context: ClientContext,
}

impl ApiTransport {
    fn new(context: ClientContext) -> Self {
        Self {
            http: Client::new(),
            context,
        }
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let request = self.http.post(self.context.endpoint(path));
        match self.context.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<R: DeserializeOwned>(&self, request: RequestBuilder) -> Result<R, ServiceError> {
        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(&body)
                .or_else(|| status.canonical_reason().map(str::to_string))
                .unwrap_or_default();
            warn!(status = status.as_u16(), %message, "Backend request failed");
            return Err(ServiceError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))
    }
}

fn error_message(body: &str) -> Option<String> {
    match serde_json::from_str::<Value>(body) {
        Ok(json) => json["error"].as_str().map(str::to_string),
        Err(_) => Some(body.trim().to_string()).filter(|text| !text.is_empty()),
    }
}

#[derive(Deserialize)]
struct AnalyzeResponse {
    analysis: AnalysisResult,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    conversation_history: &'a [Turn],
    message: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    ai_response: String,
}

#[derive(Serialize)]
struct TreatmentPlan<'a> {
    summary: &'a str,
}

#[derive(Serialize)]
struct SaveDecisionRequest<'a> {
    patient_id: &'a str,
    treatment_plan: TreatmentPlan<'a>,
    medications: &'a [Medication],
    lifestyle_recommendations: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    follow_up_date: Option<NaiveDate>,
    ai_contributions: &'a [String],
    doctor_contributions: &'a [String],
    confidence: f64,
}

impl<'a> From<&'a Decision> for SaveDecisionRequest<'a> {
    fn from(decision: &'a Decision) -> Self {
        Self {
            patient_id: decision.patient_ref().as_str(),
            treatment_plan: TreatmentPlan {
                summary: decision.treatment_plan_summary(),
            },
            medications: decision.medications(),
            lifestyle_recommendations: decision.lifestyle_changes(),
            follow_up_date: decision.follow_up_date(),
            ai_contributions: decision.ai_contributions(),
            doctor_contributions: decision.doctor_contributions(),
            confidence: decision.confidence(),
        }
    }
}

#[derive(Deserialize)]
struct StoredDecision {
    id: Value,
}

#[derive(Deserialize)]
struct SaveDecisionResponse {
    #[serde(default)]
    decision_id: Option<Value>,
    #[serde(default)]
    decision: Option<StoredDecision>,
}

impl SaveDecisionResponse {
    fn into_id(self) -> Option<DecisionId> {
        let raw = self.decision_id.or(self.decision.map(|d| d.id))?;
        match raw {
            Value::String(id) if !id.is_empty() => Some(DecisionId::new(id)),
            Value::Number(id) => Some(DecisionId::new(id.to_string())),
            _ => None,
        }
    }
}

/// ConsultationClient backed by the consultation REST backend
#[derive(Clone)]
pub struct HttpConsultationClient {
    transport: ApiTransport,
}

impl HttpConsultationClient {
    pub fn new(context: ClientContext) -> Self {
        Self {
            transport: ApiTransport::new(context),
        }
    }
}

#[async_trait]
impl ConsultationClient for HttpConsultationClient {
    async fn analyze(&self, patient: &PatientRef) -> Result<AnalysisResult, ServiceError> {
        let path = format!("ai/analyze/{}", urlencoding::encode(patient.as_str()));
        debug!(%patient, "Requesting patient analysis");

        let response: AnalyzeResponse = self.transport.send(self.transport.post(&path)).await?;
        Ok(response.analysis)
    }

    async fn chat(&self, history: &[Turn], message: &str) -> Result<String, ServiceError> {
        debug!(history_len = history.len(), "Sending chat turn");

        let body = ChatRequest {
            conversation_history: history,
            message,
        };
        let response: ChatResponse = self
            .transport
            .send(self.transport.post("ai/chat").json(&body))
            .await?;
        Ok(response.ai_response)
    }
}

/// DecisionPersistence backed by the consultation REST backend
#[derive(Clone)]
pub struct HttpDecisionPersistence {
    transport: ApiTransport,
}

impl HttpDecisionPersistence {
    pub fn new(context: ClientContext) -> Self {
        Self {
            transport: ApiTransport::new(context),
        }
    }
}

#[async_trait]
impl DecisionPersistence for HttpDecisionPersistence {
    async fn save(&self, decision: &Decision) -> Result<DecisionId, ServiceError> {
        let body = SaveDecisionRequest::from(decision);
        let response: SaveDecisionResponse = self
            .transport
            .send(self.transport.post("decisions/create").json(&body))
            .await?;

        response
            .into_id()
            .ok_or_else(|| ServiceError::InvalidResponse("missing decision id".to_string()))
    }
}
