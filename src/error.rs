//! Error handling for the portal client

use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Unified error type for the portal client
#[derive(Error, Debug)]
pub enum Error {
    /// Network or HTTP related errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// JWT decoding errors
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Local persistence errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication errors returned by the identity service
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Wrong email or password
    #[error("Invalid login credentials")]
    InvalidCredentials,

    /// The identity service throttled the caller
    #[error("Too many requests")]
    RateLimited,

    /// Sign-up for an email that already has an account
    #[error("User already registered")]
    AlreadyRegistered,

    /// Password rejected by the identity service
    #[error("Weak password: {0}")]
    WeakPassword(String),

    /// An operation needed a session but none is present
    #[error("Missing session")]
    MissingSession,

    /// Database query errors
    #[error("Database error: {0}")]
    Database(String),

    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// The backend answered with a server error
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// A remote call did not finish in time
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Local input validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new authentication error
    pub fn auth<T: fmt::Display>(msg: T) -> Self {
        Error::Auth(msg.to_string())
    }

    /// Create a new database error
    pub fn database<T: fmt::Display>(msg: T) -> Self {
        Error::Database(msg.to_string())
    }

    /// Create a new storage error
    pub fn storage<T: fmt::Display>(msg: T) -> Self {
        Error::Storage(msg.to_string())
    }

    /// Create a new validation error
    pub fn validation<T: fmt::Display>(msg: T) -> Self {
        Error::Validation(msg.to_string())
    }

    /// Create a new configuration error
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().map_or(false, |s| s.is_server_error())
            }
            Error::Timeout { .. } | Error::Unavailable(_) => true,
            _ => false,
        }
    }

    /// Text suitable for a toast or an inline form message.
    pub fn user_message(&self) -> String {
        match self {
            Error::InvalidCredentials => "Invalid email or password".to_string(),
            Error::RateLimited => "Too many login attempts. Please try again later.".to_string(),
            Error::AlreadyRegistered => {
                "This email is already registered. Please try signing in instead.".to_string()
            }
            Error::WeakPassword(_) => {
                "Password is too weak. Please use at least 6 characters.".to_string()
            }
            Error::MissingSession => "Please sign in to continue.".to_string(),
            Error::Validation(msg) => msg.clone(),
            Error::Timeout { .. } | Error::Http(_) | Error::Unavailable(_) => {
                "Network error. Please check your connection.".to_string()
            }
            Error::Auth(msg) if !msg.is_empty() => msg.clone(),
            other => other.to_string(),
        }
    }

    /// Classify a non-success response from the identity service.
    pub(crate) fn from_auth_response(status: StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<AuthApiErrorBody>(body)
            .ok()
            .and_then(|b| b.message())
            .unwrap_or_else(|| body.trim().to_string());
        let lower = message.to_lowercase();

        if status == StatusCode::TOO_MANY_REQUESTS || lower.contains("too many requests") {
            Error::RateLimited
        } else if lower.contains("invalid login credentials")
            || lower.contains("invalid_credentials")
            || (lower.contains("invalid_grant") && lower.contains("password"))
        {
            Error::InvalidCredentials
        } else if lower.contains("already registered") || lower.contains("user_already_exists") {
            Error::AlreadyRegistered
        } else if lower.contains("password") && status == StatusCode::UNPROCESSABLE_ENTITY {
            Error::WeakPassword(message)
        } else if status.is_server_error() {
            Error::Unavailable(format!("{} (Status: {})", message, status))
        } else {
            Error::Auth(message)
        }
    }
}

/// Run `fut`, failing with [`Error::Timeout`] if it takes longer than `after`.
///
/// The future is dropped on expiry, so a late response is never observed.
pub(crate) async fn with_timeout<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => {
            log::warn!("{} timed out after {:?}", operation, after);
            Err(Error::Timeout { operation, after })
        }
    }
}

/// Error body shapes returned by the identity service
#[derive(Debug, Default, Deserialize)]
struct AuthApiErrorBody {
    error: Option<String>,
    error_description: Option<String>,
    error_code: Option<String>,
    msg: Option<String>,
    message: Option<String>,
}

impl AuthApiErrorBody {
    fn message(self) -> Option<String> {
        let text = self
            .error_description
            .or(self.msg)
            .or(self.message)
            .or(self.error)?;
        match self.error_code {
            Some(code) => Some(format!("{} ({})", text, code)),
            None => Some(text),
        }
    }
}
