use consult_flow::{ContributionSplit, DecisionEdit, DecisionId, QuickPrompt, SessionStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenConsultationRequest {
    pub patient_id: String,
}

/// Either free text or one of the canned quick prompts.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub quick_prompt: Option<QuickPrompt>,
}

impl SendMessageRequest {
    pub fn text(&self) -> Option<&str> {
        match (&self.message, self.quick_prompt) {
            (Some(message), _) => Some(message.as_str()),
            (None, Some(prompt)) => Some(prompt.message()),
            (None, None) => None,
        }
    }
}

/// Edits applied to the decision draft in order, all or nothing.
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateDecisionRequest {
    pub edits: Vec<DecisionEdit>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitDecisionResponse {
    pub decision_id: DecisionId,
    pub status: SessionStatus,
    pub contributions: ContributionSplit,
}

#[derive(Debug, Serialize)]
pub struct QuickPromptView {
    pub id: QuickPrompt,
    pub label: &'static str,
    pub message: &'static str,
}

impl From<QuickPrompt> for QuickPromptView {
    fn from(prompt: QuickPrompt) -> Self {
        Self {
            id: prompt,
            label: prompt.label(),
            message: prompt.message(),
        }
    }
}
