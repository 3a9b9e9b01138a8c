use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserClaims {
    pub sub: String, // User ID (Subject)
    pub name: Option<String>,
    pub roles: Option<Vec<String>>,
    pub workspace: Option<String>,
    pub exp: usize, // Expiration time (UNIX timestamp)
}

/// Identity attached to every request that reaches the tool routes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: String,
    pub name: Option<String>,
    pub roles: Vec<String>,
    pub workspace: Option<String>,
}

impl CallerIdentity {
    /// Identity used when authentication is not required and no token was sent.
    pub fn anonymous() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            name: None,
            roles: Vec::new(),
            workspace: None,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

impl From<UserClaims> for CallerIdentity {
    fn from(claims: UserClaims) -> Self {
        Self {
            user_id: claims.sub,
            name: claims.name,
            roles: claims.roles.unwrap_or_default(),
            workspace: claims.workspace,
        }
    }
}
