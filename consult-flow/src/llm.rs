use async_trait::async_trait;
use rig::{
    agent::Agent,
    client::CompletionClient,
    completion::{Chat, Message, Prompt},
    providers::openrouter,
};
use std::{fmt::Display, sync::Arc};
use tracing::{info, warn};

use crate::{
    analysis::AnalysisResult,
    client::ConsultationClient,
    error::ServiceError,
    records::{PatientRecord, PatientRecordSource},
    transcript::{Speaker, Turn},
    types::PatientRef,
};

pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";
pub const MODEL_ENV: &str = "CONSULT_MODEL";

/// Applied when the model leaves the score out of its analysis.
pub const DEFAULT_ANALYSIS_CONFIDENCE: f64 = 0.85;

const ANALYSIS_PREAMBLE: &str = "\
You are a medical AI assistant helping doctors analyze patient health data.
You provide evidence-based analysis, identify concerning patterns, and suggest treatment
options. Always cite medical guidelines when relevant. Be clear about confidence levels.
Format your response as JSON with these fields:
findings, concerns, risk_level, recommendations, confidence_score.";

const VITAL_SIGNS_WINDOW: usize = 7;
const HEALTH_LOGS_WINDOW: usize = 5;

const COLLABORATION_PREAMBLE: &str = "\
You are a medical AI collaborating with a doctor on patient care.
Engage in professional dialogue, consider the doctor's input seriously,
adjust your recommendations based on their feedback, and acknowledge when they
raise valid concerns or provide information you didn't have access to.
Maintain a collaborative, not confrontational, tone.";

/// ConsultationClient that talks to an OpenRouter model directly instead of going
/// through the consultation backend.
///
/// Analyses are grounded in the record returned by the configured
/// [`PatientRecordSource`]; a patient without a record is refused rather than
/// analyzed from the id alone.
pub struct RigConsultationClient {
    client: openrouter::Client,
    model: String,
    records: Arc<dyn PatientRecordSource>,
}

impl RigConsultationClient {
    pub fn new(
        api_key: &str,
        model: impl Into<String>,
        records: Arc<dyn PatientRecordSource>,
    ) -> Self {
        Self {
            client: openrouter::Client::new(api_key),
            model: model.into(),
            records,
        }
    }

    pub fn from_env(records: Arc<dyn PatientRecordSource>) -> Result<Self, ServiceError> {
        let api_key = std::env::var(API_KEY_ENV)
            .map_err(|_| ServiceError::Config(format!("{API_KEY_ENV} not set")))?;
        let model = std::env::var(MODEL_ENV).unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self::new(&api_key, model, records))
    }

    fn agent(
        &self,
        preamble: &str,
        temperature: f64,
        max_tokens: u64,
    ) -> Agent<openrouter::CompletionModel> {
        self.client
            .agent(&self.model)
            .preamble(preamble)
            .temperature(temperature)
            .max_tokens(max_tokens)
            .build()
    }
}

fn to_rig_message(turn: &Turn) -> Message {
    match turn.speaker {
        Speaker::Ai => Message::assistant(turn.content.clone()),
        Speaker::Doctor => Message::user(turn.content.clone()),
    }
}

/// Slice out the outermost JSON object of a model reply that may wrap it in prose
/// or code fences.
fn extract_json_object(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    (start < end).then(|| &response[start..=end])
}

fn or_unknown<T: Display>(value: Option<T>, unknown: &str) -> String {
    value.map_or_else(|| unknown.to_string(), |v| v.to_string())
}

fn listed(items: &[String]) -> String {
    if items.is_empty() {
        "None reported".to_string()
    } else {
        items.join(", ")
    }
}

fn recent<T>(items: &[T], window: usize) -> &[T] {
    &items[items.len().saturating_sub(window)..]
}

fn format_vital_signs(record: &PatientRecord) -> String {
    if record.vital_signs.is_empty() {
        return "No recent vital signs data available".to_string();
    }
    recent(&record.vital_signs, VITAL_SIGNS_WINDOW)
        .iter()
        .map(|vs| {
            format!(
                "- {}: HR {} bpm, SpO2 {}%, Sleep {}/100",
                vs.date,
                or_unknown(vs.heart_rate, "n/a"),
                or_unknown(vs.spo2, "n/a"),
                or_unknown(vs.sleep_score, "n/a"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_health_logs(record: &PatientRecord) -> String {
    if record.health_logs.is_empty() {
        return "No recent health logs".to_string();
    }
    recent(&record.health_logs, HEALTH_LOGS_WINDOW)
        .iter()
        .map(|log| {
            format!(
                "- {}: BP {}, Glucose {} mg/dL, Notes: {}",
                log.date,
                or_unknown(log.blood_pressure.as_deref(), "n/a"),
                or_unknown(log.glucose, "n/a"),
                or_unknown(log.notes.as_deref(), "None"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a patient record into the analysis request sent to the model.
fn analysis_prompt(record: &PatientRecord) -> String {
    format!(
        "Analyze this patient's health data and provide medical insights:

PATIENT INFORMATION:
- Name: {name}
- Age: {age}
- Gender: {gender}
- Medical History: {history}
- Current Medications: {medications}

RECENT VITAL SIGNS (from wearable device):
{vitals}

RECENT HEALTH LOGS (patient reported):
{logs}

Please provide:
1. Key findings from the data
2. Any concerning patterns or anomalies
3. Overall risk level (low/moderate/high/critical)
4. Evidence-based treatment recommendations
5. Your confidence in this analysis as a number between 0 and 1

Return only a JSON object with fields: findings, concerns, risk_level, recommendations, \
confidence_score.",
        name = or_unknown(record.name.as_deref(), "Unknown"),
        age = or_unknown(record.age, "Unknown"),
        gender = or_unknown(record.gender.as_deref(), "Unknown"),
        history = listed(&record.chronic_conditions),
        medications = listed(&record.medications),
        vitals = format_vital_signs(record),
        logs = format_health_logs(record),
    )
}

fn parse_analysis(response: &str) -> Result<AnalysisResult, ServiceError> {
    let json = extract_json_object(response).ok_or_else(|| {
        ServiceError::InvalidResponse("no JSON object in model reply".to_string())
    })?;
    let mut analysis: AnalysisResult = serde_json::from_str(json)
        .map_err(|e| ServiceError::InvalidResponse(format!("Failed to parse analysis: {e}")))?;
    analysis
        .confidence_score
        .get_or_insert(DEFAULT_ANALYSIS_CONFIDENCE);
    Ok(analysis)
}

#[async_trait]
impl ConsultationClient for RigConsultationClient {
    async fn analyze(&self, patient: &PatientRef) -> Result<AnalysisResult, ServiceError> {
        let record = self.records.fetch(patient).await?.ok_or_else(|| {
            ServiceError::Config(format!("No patient record available for {patient}"))
        })?;

        let response = self
            .agent(ANALYSIS_PREAMBLE, 0.7, 1000)
            .prompt(analysis_prompt(&record))
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        info!(%patient, "Model analysis received ({} characters)", response.len());
        parse_analysis(&response)
            .inspect_err(|e| warn!(%patient, "Unusable analysis reply: {}", e))
    }

    async fn chat(&self, history: &[Turn], message: &str) -> Result<String, ServiceError> {
        let chat_history: Vec<Message> = history.iter().map(to_rig_message).collect();

        self.agent(COLLABORATION_PREAMBLE, 0.8, 800)
            .chat(message.to_string(), chat_history)
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))
    }
}
