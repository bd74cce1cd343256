/// Session context: tenant id, bearer token and the cached user profile.
///
/// Built once at startup and handed to the API client, instead of every
/// request reading ambient storage.
use crate::error::{InboxError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const TENANT_ENV: &str = "INBOX_TENANT_ID";
const TOKEN_ENV: &str = "INBOX_TOKEN";

/// Cached operator profile (display only)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub tenant_id: String,
    pub token: String,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

// Keep the token out of logs
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tenant_id", &self.tenant_id)
            .field("token", &"<redacted>")
            .field("user", &self.user)
            .finish()
    }
}

impl Session {
    pub fn new(tenant_id: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let session = Self {
            tenant_id: tenant_id.into(),
            token: token.into(),
            user: None,
        };
        session.validate()?;
        Ok(session)
    }

    /// Load a session from a JSON file `{ "tenant_id": ..., "token": ..., "user": {...} }`
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(InboxError::Io)?;
        let session: Session = serde_json::from_str(&raw).map_err(InboxError::Serialization)?;
        session.validate()?;
        Ok(session)
    }

    /// Load a session from `INBOX_TENANT_ID` / `INBOX_TOKEN`
    pub fn from_env() -> Result<Self> {
        let tenant_id = std::env::var(TENANT_ENV)
            .map_err(|_| InboxError::Session(format!("{} is not set", TENANT_ENV)))?;
        let token = std::env::var(TOKEN_ENV)
            .map_err(|_| InboxError::Session(format!("{} is not set", TOKEN_ENV)))?;
        Self::new(tenant_id, token)
    }

    /// File when given, environment otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Self::from_env(),
        }
    }

    /// Missing credentials are a caller error and are never retried
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(InboxError::Session("tenant id is missing".to_string()));
        }
        if self.token.trim().is_empty() {
            return Err(InboxError::Session("auth token is missing".to_string()));
        }
        Ok(())
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}
