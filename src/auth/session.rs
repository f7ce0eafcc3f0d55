//! Session management for authentication

use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::types::User;
use crate::error::{Error, Result};

/// Session data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// The access token
    pub access_token: String,

    /// The refresh token
    pub refresh_token: String,

    /// The expiry time in seconds
    pub expires_in: i64,

    /// The expiry timestamp (unix seconds)
    #[serde(default)]
    pub expires_at: Option<i64>,

    /// The token type
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// The signed-in user
    pub user: User,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// Claims carried by an access token
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl Session {
    /// Create a new session expiring `expires_in` seconds from now
    pub fn new(access_token: String, refresh_token: String, expires_in: i64, user: User) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_in,
            expires_at: Some(Utc::now().timestamp() + expires_in),
            token_type: default_token_type(),
            user,
        }
    }

    /// Build a session from the parameters of an OAuth redirect fragment.
    pub fn from_redirect_params(params: &HashMap<String, String>, user: User) -> Result<Self> {
        let access_token = params
            .get("access_token")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::auth("Redirect is missing access_token"))?;
        let expires_in = params
            .get("expires_in")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(3600);

        let mut session = Session::new(
            access_token.clone(),
            params.get("refresh_token").cloned().unwrap_or_default(),
            expires_in,
            user,
        );
        if let Some(expires_at) = params.get("expires_at").and_then(|v| v.parse::<i64>().ok()) {
            session.expires_at = Some(expires_at);
        }
        if let Some(token_type) = params.get("token_type") {
            session.token_type = token_type.clone();
        }
        Ok(session)
    }

    /// Check if the session has expired
    pub fn is_expired(&self) -> bool {
        self.expires_within(0)
    }

    /// Check if the session expires within `margin_secs`
    pub fn expires_within(&self, margin_secs: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now().timestamp() + margin_secs >= expires_at,
            None => false,
        }
    }

    /// Decode the access token claims.
    ///
    /// The signature is not checked; only the identity service can do that.
    pub fn claims(&self) -> Result<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = decode::<TokenClaims>(
            &self.access_token,
            &DecodingKey::from_secret(&[]),
            &validation,
        )?;
        Ok(data.claims)
    }
}
