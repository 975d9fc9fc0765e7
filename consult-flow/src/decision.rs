use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{error::ValidationError, types::PatientRef};

pub const DEFAULT_DECISION_CONFIDENCE: f64 = 0.85;

pub const DEFAULT_AI_CONTRIBUTIONS: [&str; 4] = [
    "Initial patient data analysis",
    "Evidence-based recommendations",
    "Risk assessment and stratification",
    "Medical literature citations",
];

pub const DEFAULT_DOCTOR_CONTRIBUTIONS: [&str; 4] = [
    "Clinical examination findings",
    "Patient-specific context",
    "Final treatment selection",
    "Safety considerations",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medication {
    pub name: String,
    pub dosage: String,
    #[serde(default)]
    pub frequency: Option<String>,
}

impl Medication {
    pub fn new(name: impl Into<String>, dosage: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dosage: dosage.into(),
            frequency: None,
        }
    }

    pub fn with_frequency(mut self, frequency: impl Into<String>) -> Self {
        self.frequency = Some(frequency.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingMedicationName);
        }
        if self.dosage.trim().is_empty() {
            return Err(ValidationError::MissingMedicationDosage);
        }
        Ok(())
    }
}

/// Percentage split of the decision between AI and doctor input
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContributionSplit {
    pub ai_percent: f64,
    pub doctor_percent: f64,
}

impl ContributionSplit {
    /// Each attribution label scores 10 points; percentages keep two decimals.
    /// With no labels at all the split is even.
    pub fn from_counts(ai: usize, doctor: usize) -> Self {
        let ai_score = ai as f64 * 10.0;
        let doctor_score = doctor as f64 * 10.0;
        let total = ai_score + doctor_score;

        if total == 0.0 {
            return Self {
                ai_percent: 50.0,
                doctor_percent: 50.0,
            };
        }

        Self {
            ai_percent: round_two(ai_score / total * 100.0),
            doctor_percent: round_two(doctor_score / total * 100.0),
        }
    }
}

fn round_two(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// A finalized, attributable treatment decision. Only [`DecisionBuilder::build`]
/// produces one, so the treatment plan summary is never blank.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    patient_ref: PatientRef,
    treatment_plan_summary: String,
    medications: Vec<Medication>,
    lifestyle_changes: Vec<String>,
    follow_up_date: Option<NaiveDate>,
    ai_contributions: Vec<String>,
    doctor_contributions: Vec<String>,
    confidence: f64,
}

impl Decision {
    pub fn patient_ref(&self) -> &PatientRef {
        &self.patient_ref
    }

    pub fn treatment_plan_summary(&self) -> &str {
        &self.treatment_plan_summary
    }

    pub fn medications(&self) -> &[Medication] {
        &self.medications
    }

    pub fn lifestyle_changes(&self) -> &[String] {
        &self.lifestyle_changes
    }

    pub fn follow_up_date(&self) -> Option<NaiveDate> {
        self.follow_up_date
    }

    pub fn ai_contributions(&self) -> &[String] {
        &self.ai_contributions
    }

    pub fn doctor_contributions(&self) -> &[String] {
        &self.doctor_contributions
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn contribution_split(&self) -> ContributionSplit {
        ContributionSplit::from_counts(self.ai_contributions.len(), self.doctor_contributions.len())
    }
}

/// A single edit to a decision draft, as sent by a UI form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DecisionEdit {
    SetTreatmentPlan { text: String },
    AddMedication(Medication),
    RemoveMedication { index: usize },
    AddLifestyleChange { text: String },
    RemoveLifestyleChange { index: usize },
    SetFollowUpDate { date: Option<NaiveDate> },
}

/// Mutable draft of a [`Decision`].
#[derive(Debug, Clone, Serialize)]
pub struct DecisionBuilder {
    patient_ref: PatientRef,
    treatment_plan: String,
    medications: Vec<Medication>,
    lifestyle_changes: Vec<String>,
    follow_up_date: Option<NaiveDate>,
    ai_contributions: Vec<String>,
    doctor_contributions: Vec<String>,
    confidence: f64,
}

impl DecisionBuilder {
    pub fn new(patient_ref: PatientRef) -> Self {
        Self {
            patient_ref,
            treatment_plan: String::new(),
            medications: Vec::new(),
            lifestyle_changes: Vec::new(),
            follow_up_date: None,
            ai_contributions: DEFAULT_AI_CONTRIBUTIONS.map(String::from).to_vec(),
            doctor_contributions: DEFAULT_DOCTOR_CONTRIBUTIONS.map(String::from).to_vec(),
            confidence: DEFAULT_DECISION_CONFIDENCE,
        }
    }

    /// Confidence is clamped into `[0, 1]`.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_nan() {
            DEFAULT_DECISION_CONFIDENCE
        } else {
            confidence.clamp(0.0, 1.0)
        };
        self
    }

    pub fn with_contributions(mut self, ai: Vec<String>, doctor: Vec<String>) -> Self {
        self.ai_contributions = ai;
        self.doctor_contributions = doctor;
        self
    }

    pub fn set_treatment_plan(&mut self, text: impl Into<String>) {
        self.treatment_plan = text.into();
    }

    pub fn treatment_plan(&self) -> &str {
        &self.treatment_plan
    }

    /// Rejected without change when the name or dosage is blank.
    pub fn add_medication(&mut self, mut medication: Medication) -> Result<(), ValidationError> {
        medication.validate()?;
        if medication
            .frequency
            .as_deref()
            .is_some_and(|f| f.trim().is_empty())
        {
            medication.frequency = None;
        }
        self.medications.push(medication);
        Ok(())
    }

    pub fn remove_medication(&mut self, index: usize) -> Option<Medication> {
        (index < self.medications.len()).then(|| self.medications.remove(index))
    }

    pub fn medications(&self) -> &[Medication] {
        &self.medications
    }

    pub fn add_lifestyle_change(&mut self, text: impl Into<String>) -> Result<(), ValidationError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ValidationError::BlankLifestyleChange);
        }
        self.lifestyle_changes.push(text);
        Ok(())
    }

    pub fn remove_lifestyle_change(&mut self, index: usize) -> Option<String> {
        (index < self.lifestyle_changes.len()).then(|| self.lifestyle_changes.remove(index))
    }

    pub fn lifestyle_changes(&self) -> &[String] {
        &self.lifestyle_changes
    }

    pub fn set_follow_up_date(&mut self, date: Option<NaiveDate>) {
        self.follow_up_date = date;
    }

    pub fn follow_up_date(&self) -> Option<NaiveDate> {
        self.follow_up_date
    }

    pub fn contribution_split(&self) -> ContributionSplit {
        ContributionSplit::from_counts(self.ai_contributions.len(), self.doctor_contributions.len())
    }

    /// Apply a form edit. Out-of-range removals are ignored.
    pub fn apply(&mut self, edit: DecisionEdit) -> Result<(), ValidationError> {
        match edit {
            DecisionEdit::SetTreatmentPlan { text } => self.set_treatment_plan(text),
            DecisionEdit::AddMedication(medication) => self.add_medication(medication)?,
            DecisionEdit::RemoveMedication { index } => {
                self.remove_medication(index);
            }
            DecisionEdit::AddLifestyleChange { text } => self.add_lifestyle_change(text)?,
            DecisionEdit::RemoveLifestyleChange { index } => {
                self.remove_lifestyle_change(index);
            }
            DecisionEdit::SetFollowUpDate { date } => self.set_follow_up_date(date),
        }
        Ok(())
    }

    pub fn build(&self) -> Result<Decision, ValidationError> {
        if self.treatment_plan.trim().is_empty() {
            return Err(ValidationError::MissingTreatmentPlan);
        }

        Ok(Decision {
            patient_ref: self.patient_ref.clone(),
            treatment_plan_summary: self.treatment_plan.clone(),
            medications: self.medications.clone(),
            lifestyle_changes: self.lifestyle_changes.clone(),
            follow_up_date: self.follow_up_date,
            ai_contributions: self.ai_contributions.clone(),
            doctor_contributions: self.doctor_contributions.clone(),
            confidence: self.confidence,
        })
    }
}
