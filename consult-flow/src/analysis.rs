use serde::{Deserialize, Deserializer, Serialize};

pub const ANALYSIS_HEADING: &str = "**Patient Analysis Complete**";
pub const CLOSING_PROMPT: &str = "What are your thoughts on these findings, Doctor?";

/// Structured analysis returned by the AI service.
///
/// Every field may be missing; `risk_level` is free-form display text and is never
/// matched against a closed set of levels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default, deserialize_with = "text_or_lines")]
    pub findings: Option<String>,
    #[serde(default, deserialize_with = "list_or_single")]
    pub concerns: Option<Vec<String>>,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default, deserialize_with = "text_or_lines")]
    pub recommendations: Option<String>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
}

// The model is asked for text but sometimes answers with a list.
#[derive(Deserialize)]
#[serde(untagged)]
enum TextOrList {
    Text(String),
    List(Vec<String>),
}

fn text_or_lines<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<TextOrList>::deserialize(deserializer)?.map(|value| match value {
            TextOrList::Text(text) => text,
            TextOrList::List(items) => items.join("\n"),
        }),
    )
}

fn list_or_single<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<TextOrList>::deserialize(deserializer)?.map(|value| match value {
            TextOrList::Text(text) => vec![text],
            TextOrList::List(items) => items,
        }),
    )
}

/// Render an analysis as the opening AI message of a consultation.
pub fn format_analysis(analysis: &AnalysisResult) -> String {
    let findings = analysis.findings.as_deref().unwrap_or_default();
    let concerns = analysis
        .concerns
        .as_deref()
        .unwrap_or_default()
        .iter()
        .enumerate()
        .map(|(index, concern)| format!("{}. {}", index + 1, concern))
        .collect::<Vec<_>>()
        .join("\n");
    let risk_level = analysis
        .risk_level
        .as_deref()
        .map(str::to_uppercase)
        .unwrap_or_default();
    let recommendations = analysis.recommendations.as_deref().unwrap_or_default();
    let confidence = analysis
        .confidence_score
        .map(format_confidence)
        .unwrap_or_default();

    format!(
        "{ANALYSIS_HEADING}

**Key Findings:**
{findings}

**Concerns Identified:**
{concerns}

**Risk Level:** {risk_level}

**Recommendations:**
{recommendations}

**Confidence:** {confidence}

{CLOSING_PROMPT}"
    )
}

/// `round(score * 100)` as a whole percentage, halves rounded away from zero.
pub fn format_confidence(score: f64) -> String {
    format!("{}%", (score * 100.0).round() as i64)
}
