use crate::error::ServiceError;

pub const BASE_URL_ENV: &str = "CONSULT_API_BASE_URL";
pub const TOKEN_ENV: &str = "CONSULT_API_TOKEN";

/// Connection context handed to the service clients at construction time.
///
/// Credentials live here rather than in any process-wide store, so two clients with
/// different tokens can coexist.
#[derive(Clone, Debug)]
pub struct ClientContext {
    base_url: String,
    bearer_token: Option<String>,
}

impl ClientContext {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            bearer_token: None,
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn from_env() -> Result<Self, ServiceError> {
        let base_url = std::env::var(BASE_URL_ENV)
            .map_err(|_| ServiceError::Config(format!("{BASE_URL_ENV} not set")))?;
        let context = Self::new(base_url);

        Ok(match std::env::var(TOKEN_ENV) {
            Ok(token) if !token.trim().is_empty() => context.with_bearer_token(token),
            _ => context,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }

    /// Absolute URL for a path relative to the base URL.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}
