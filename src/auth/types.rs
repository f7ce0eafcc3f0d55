//! Types for authentication and user management

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::session::Session;

/// User data as returned by the identity service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// The user ID
    pub id: String,

    /// The user's email address
    #[serde(default)]
    pub email: Option<String>,

    /// The user's phone number
    #[serde(default)]
    pub phone: Option<String>,

    /// The app metadata (provider information)
    #[serde(default)]
    pub app_metadata: HashMap<String, Value>,

    /// The user metadata (sign-up data, OAuth profile)
    #[serde(default)]
    pub user_metadata: HashMap<String, Value>,

    /// The creation time
    #[serde(default)]
    pub created_at: Option<String>,

    /// The update time
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl User {
    fn metadata_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|key| self.user_metadata.get(*key))
            .filter_map(Value::as_str)
            .map(str::trim)
            .find(|value| !value.is_empty())
    }

    /// Display name from sign-up data or the OAuth profile
    pub fn full_name(&self) -> Option<&str> {
        self.metadata_str(&["full_name", "name"])
    }

    /// The role the user declared at sign-up, if any
    pub fn declared_user_type(&self) -> Option<&str> {
        self.metadata_str(&["user_type"])
    }

    /// Avatar from the OAuth profile
    pub fn avatar_url(&self) -> Option<&str> {
        self.metadata_str(&["avatar_url", "picture"])
    }

    /// Provider the account was created with
    pub fn provider(&self) -> Option<&str> {
        self.app_metadata.get("provider").and_then(Value::as_str)
    }
}

/// Result of a sign-up request
///
/// When the project requires email confirmation the identity service returns
/// the user without a session.
#[derive(Debug, Clone)]
pub struct SignUpOutcome {
    pub user: User,
    pub session: Option<Session>,
}

/// Kinds of auth state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// An auth state change together with the session it produced
#[derive(Debug, Clone)]
pub struct AuthChange {
    pub event: AuthEvent,
    pub session: Option<Session>,
}

/// OAuth providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    Google,
    Github,
    Apple,
    Azure,
    Facebook,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Github => "github",
            Self::Apple => "apple",
            Self::Azure => "azure",
            Self::Facebook => "facebook",
        }
    }
}

impl std::str::FromStr for OAuthProvider {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "github" => Ok(Self::Github),
            "apple" => Ok(Self::Apple),
            "azure" => Ok(Self::Azure),
            "facebook" => Ok(Self::Facebook),
            other => Err(crate::error::Error::validation(format!(
                "Unsupported OAuth provider: {}",
                other
            ))),
        }
    }
}
