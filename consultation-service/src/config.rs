use anyhow::{Context, Result, bail};
use consult_flow::{
    ClientContext, ConsultationClient, DecisionPersistence, HttpConsultationClient,
    HttpDecisionPersistence, InMemoryDecisionStore, InMemoryPatientRecords,
    RigConsultationClient, SessionConfig, context::BASE_URL_ENV,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};

pub const BACKEND_ENV: &str = "CONSULT_BACKEND";
pub const AI_TIMEOUT_ENV: &str = "CONSULT_AI_TIMEOUT_SECS";
pub const SESSION_IDLE_ENV: &str = "CONSULT_SESSION_IDLE_SECS";
/// JSON file of patient records keyed by patient id, read by the `rig` backend
pub const PATIENT_RECORDS_ENV: &str = "CONSULT_PATIENT_RECORDS";

pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(30 * 60);

/// Which implementation answers `analyze` and `chat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiBackend {
    /// The consultation REST backend at `CONSULT_API_BASE_URL`
    Http,
    /// An OpenRouter model prompted directly
    Rig,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub backend: AiBackend,
    pub session: SessionConfig,
    /// Sessions untouched for this long are cancelled and dropped
    pub session_idle_timeout: Duration,
    pub patient_records: Option<PathBuf>,
}

/// Parse an optional, strictly positive number of seconds.
fn positive_secs(name: &str, raw: Option<&str>) -> Result<Option<Duration>> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };
    let secs: u64 = raw
        .parse()
        .with_context(|| format!("{name} must be a whole number of seconds"))?;
    if secs == 0 {
        bail!("{name} must be greater than zero");
    }
    Ok(Some(Duration::from_secs(secs)))
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any name-to-value lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let backend = match lookup(BACKEND_ENV).as_deref().map(str::trim) {
            None | Some("") | Some("http") => AiBackend::Http,
            Some("rig") => AiBackend::Rig,
            Some(other) => bail!("{BACKEND_ENV} must be 'http' or 'rig', got '{other}'"),
        };

        let mut session = SessionConfig::default();
        if let Some(limit) = positive_secs(AI_TIMEOUT_ENV, lookup(AI_TIMEOUT_ENV).as_deref())? {
            session = session.with_ai_timeout(limit);
        }

        let session_idle_timeout =
            positive_secs(SESSION_IDLE_ENV, lookup(SESSION_IDLE_ENV).as_deref())?
                .unwrap_or(DEFAULT_SESSION_IDLE);

        let patient_records = lookup(PATIENT_RECORDS_ENV)
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            backend,
            session,
            session_idle_timeout,
            patient_records,
        })
    }

    /// Read the patient records file, or start empty when none is configured.
    pub fn load_patient_records(&self) -> Result<InMemoryPatientRecords> {
        let Some(path) = &self.patient_records else {
            warn!("{PATIENT_RECORDS_ENV} not set, analyses fall back to the greeting");
            return Ok(InMemoryPatientRecords::new());
        };

        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read patient records from {}", path.display()))?;
        let records = InMemoryPatientRecords::from_json(&json)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!(path = %path.display(), patients = records.len(), "Loaded patient records");
        Ok(records)
    }

    /// Build the AI client and the decision store for this configuration.
    ///
    /// Decisions go to the REST backend whenever its base URL is configured and are
    /// kept in memory otherwise.
    pub fn build_clients(
        &self,
    ) -> Result<(Arc<dyn ConsultationClient>, Arc<dyn DecisionPersistence>)> {
        let context = ClientContext::from_env().ok();

        let persistence: Arc<dyn DecisionPersistence> = match &context {
            Some(context) => {
                info!(base_url = context.base_url(), "Saving decisions to backend");
                Arc::new(HttpDecisionPersistence::new(context.clone()))
            }
            None => {
                warn!("{BASE_URL_ENV} not set, decisions are kept in memory");
                Arc::new(InMemoryDecisionStore::new())
            }
        };

        let ai: Arc<dyn ConsultationClient> = match self.backend {
            AiBackend::Http => {
                let context = context.with_context(|| {
                    format!("{BASE_URL_ENV} is required when {BACKEND_ENV}=http")
                })?;
                Arc::new(HttpConsultationClient::new(context))
            }
            AiBackend::Rig => {
                let records = Arc::new(self.load_patient_records()?);
                Arc::new(RigConsultationClient::from_env(records)?)
            }
        };

        Ok((ai, persistence))
    }
}
