use std::fmt;

use shared::domain::UserId;

/// Bearer token used for both the event channel and the REST API.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Who is signed in and where. Passed explicitly to every component that
/// needs it instead of living in a global.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user_id: UserId,
    pub display_name: String,
    pub credential: Credential,
    pub server_url: String,
}

impl SessionContext {
    pub fn new(
        user_id: UserId,
        display_name: impl Into<String>,
        credential: Credential,
        server_url: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            credential,
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }
}
