use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    client::DecisionPersistence, decision::Decision, error::ServiceError, types::DecisionId,
};

/// In-memory implementation of DecisionPersistence
#[derive(Clone, Default)]
pub struct InMemoryDecisionStore {
    decisions: Arc<DashMap<DecisionId, Decision>>,
}

impl InMemoryDecisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &DecisionId) -> Option<Decision> {
        self.decisions.get(id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }
}

#[async_trait]
impl DecisionPersistence for InMemoryDecisionStore {
    async fn save(&self, decision: &Decision) -> Result<DecisionId, ServiceError> {
        let id = DecisionId::new(Uuid::new_v4().to_string());
        self.decisions.insert(id.clone(), decision.clone());
        Ok(id)
    }
}
