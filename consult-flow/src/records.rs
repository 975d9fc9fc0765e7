use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

use crate::{error::ServiceError, types::PatientRef};

/// One day of wearable readings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalSign {
    pub date: String,
    #[serde(default)]
    pub heart_rate: Option<u32>,
    #[serde(default)]
    pub spo2: Option<u32>,
    #[serde(default)]
    pub sleep_score: Option<u32>,
}

/// Patient-reported log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthLog {
    pub date: String,
    #[serde(default)]
    pub blood_pressure: Option<String>,
    #[serde(default)]
    pub glucose: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Clinical context handed to a model when it analyzes a patient.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub chronic_conditions: Vec<String>,
    #[serde(default)]
    pub medications: Vec<String>,
    #[serde(default)]
    pub vital_signs: Vec<VitalSign>,
    #[serde(default)]
    pub health_logs: Vec<HealthLog>,
}

/// Where patient records come from
#[async_trait]
pub trait PatientRecordSource: Send + Sync {
    /// `Ok(None)` when the patient is unknown to this source.
    async fn fetch(&self, patient: &PatientRef) -> Result<Option<PatientRecord>, ServiceError>;
}

/// In-memory implementation of PatientRecordSource
#[derive(Clone, Default)]
pub struct InMemoryPatientRecords {
    records: Arc<DashMap<PatientRef, PatientRecord>>,
}

impl InMemoryPatientRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load records from a JSON object keyed by patient id.
    pub fn from_json(json: &str) -> Result<Self, ServiceError> {
        let parsed: HashMap<String, PatientRecord> = serde_json::from_str(json)
            .map_err(|e| ServiceError::Config(format!("Invalid patient records: {e}")))?;

        let store = Self::new();
        for (id, record) in parsed {
            store.insert(PatientRef::new(id), record);
        }
        Ok(store)
    }

    pub fn insert(&self, patient: PatientRef, record: PatientRecord) {
        self.records.insert(patient, record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl PatientRecordSource for InMemoryPatientRecords {
    async fn fetch(&self, patient: &PatientRef) -> Result<Option<PatientRecord>, ServiceError> {
        Ok(self.records.get(patient).map(|entry| entry.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_records_keyed_by_patient_id() {
        let store = InMemoryPatientRecords::from_json(
            r#"{
                "patient-7": {
                    "name": "Dana Levi",
                    "age": 52,
                    "chronic_conditions": ["Type 2 Diabetes"],
                    "vital_signs": [{ "date": "2025-10-20", "heart_rate": 78 }]
                }
            }"#,
        )
        .unwrap();

        let record = store
            .fetch(&PatientRef::new("patient-7"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.age, Some(52));
        assert_eq!(record.vital_signs[0].heart_rate, Some(78));
        assert!(record.health_logs.is_empty());

        assert!(store.fetch(&PatientRef::new("other")).await.unwrap().is_none());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            InMemoryPatientRecords::from_json("[1, 2]"),
            Err(ServiceError::Config(_))
        ));
    }
}
