use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Default, PartialEq)]
pub struct AuthState {
    pub token: Option<String>,
    pub user: Option<AuthUser>,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty()) && self.user.is_some()
    }

    /// The bearer token, only when fully signed in.
    pub fn bearer(&self) -> Option<&str> {
        if self.is_authenticated() {
            self.token.as_deref()
        } else {
            None
        }
    }
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("user", &self.user)
            .finish()
    }
}
