use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SessionError};

/// Author of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Doctor,
    Ai,
}

/// One message in the consultation transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle state of a consultation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Initial analysis has not resolved yet
    Initializing,
    AwaitingInput,
    /// A chat call is in flight; doctor input is refused
    #[serde(rename = "waiting_for_ai")]
    WaitingForAI,
    /// Kept for clients that render it; the controller never parks a session here
    Error,
    /// Transcript is frozen, the decision form is active
    Finalizing,
    Closed,
}

impl SessionStatus {
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Initializing, AwaitingInput) => true,
            (AwaitingInput, WaitingForAI | Finalizing) => true,
            (WaitingForAI, AwaitingInput) => true,
            (Finalizing, AwaitingInput) => true,
            (Error, AwaitingInput) => true,
            _ => false,
        }
    }

    /// Whether turns may still be appended in this state.
    pub fn accepts_turns(self) -> bool {
        !matches!(self, SessionStatus::Finalizing | SessionStatus::Closed)
    }

    pub fn is_closed(self) -> bool {
        self == SessionStatus::Closed
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::AwaitingInput => "awaiting_input",
            SessionStatus::WaitingForAI => "waiting_for_ai",
            SessionStatus::Error => "error",
            SessionStatus::Finalizing => "finalizing",
            SessionStatus::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Append-only transcript plus the status of the session that owns it.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    turns: Vec<Turn>,
    status: SessionStatus,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            turns: Vec::new(),
            status: SessionStatus::Initializing,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Append a turn stamped with the current time.
    ///
    /// Timestamps never go backwards: if the wall clock reads earlier than the
    /// previous turn, the previous timestamp is reused.
    pub fn append(&mut self, speaker: Speaker, content: impl Into<String>) -> Result<&Turn> {
        if !self.status.accepts_turns() {
            return Err(self.rejection());
        }

        let now = Utc::now();
        let timestamp = match self.turns.last() {
            Some(previous) if previous.timestamp > now => previous.timestamp,
            _ => now,
        };

        self.turns.push(Turn {
            speaker,
            content: content.into(),
            timestamp,
        });
        Ok(&self.turns[self.turns.len() - 1])
    }

    pub fn transition(&mut self, next: SessionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(self.rejection());
        }
        self.status = next;
        Ok(())
    }

    fn rejection(&self) -> SessionError {
        match self.status {
            SessionStatus::Closed => SessionError::Closed,
            other => SessionError::InvalidState(other),
        }
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}
