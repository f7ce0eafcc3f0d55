//! Identity client for the Supabase auth service

mod persist;
mod session;
mod types;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use url::Url;

use crate::config::PortalConfig;
use crate::error::{Error, Result};
use crate::fetch::Fetch;

pub use persist::*;
pub use session::*;
pub use types::*;

/// Refresh a stored session this many seconds before it actually expires
const EXPIRY_MARGIN_SECS: i64 = 10;

/// The identity operations the session bootstrap depends on.
///
/// [`AuthClient`] talks to the real service; tests substitute in-memory fakes.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Current session, restoring or refreshing a persisted one if needed
    async fn get_session(&self) -> Result<Option<Session>>;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session>;

    /// Register a user; `metadata` ends up in `user_metadata`
    async fn sign_up(&self, email: &str, password: &str, metadata: Value)
        -> Result<SignUpOutcome>;

    /// Invalidate the session. Local state is cleared even when the remote call fails.
    async fn sign_out(&self) -> Result<()>;

    /// Pick up a session delivered in an OAuth redirect URL
    async fn session_from_url(&self, location: &Url) -> Result<Option<Session>>;

    fn oauth_sign_in_url(&self, provider: OAuthProvider, redirect_to: Option<&str>) -> String;

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthChange>;
}

/// Whether a URL carries an implicit-grant OAuth result in its fragment
pub fn has_auth_fragment(location: &Url) -> bool {
    location
        .fragment()
        .map_or(false, |f| f.contains("access_token") || f.contains("error_description"))
}

/// Client for the auth service
#[derive(Clone)]
pub struct AuthClient {
    url: String,
    key: String,
    http_client: Client,
    request_timeout: Duration,
    persist_session: bool,
    auto_refresh_token: bool,
    storage_key: String,
    session: Arc<RwLock<Option<Session>>>,
    storage: Arc<dyn SessionStorage>,
    events: broadcast::Sender<AuthChange>,
}

impl AuthClient {
    /// Create a new auth client
    pub fn new(config: &PortalConfig, http_client: Client, storage: Arc<dyn SessionStorage>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            url: config.base_url().to_string(),
            key: config.anon_key.clone(),
            http_client,
            request_timeout: config.request_timeout,
            persist_session: config.persist_session,
            auto_refresh_token: config.auto_refresh_token,
            storage_key: config.storage_key.clone(),
            session: Arc::new(RwLock::new(None)),
            storage,
            events,
        }
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1{}", self.url, path)
    }

    fn current(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: AuthEvent, session: Option<Session>) {
        log::debug!("Auth state changed: {:?}", event);
        if self.events.send(AuthChange { event, session }).is_err() {
            log::trace!("No listeners for auth event {:?}", event);
        }
    }

    /// Replace the in-memory session and mirror it to storage
    fn store_session(&self, session: Option<Session>) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session.clone();

        if !self.persist_session {
            return;
        }
        let outcome = match &session {
            Some(s) => serde_json::to_string(s)
                .map_err(Error::from)
                .and_then(|json| self.storage.set_item(&self.storage_key, &json)),
            None => self.storage.remove_item(&self.storage_key),
        };
        if let Err(e) = outcome {
            log::warn!("Failed to persist session under {}: {}", self.storage_key, e);
        }
    }

    /// Load a persisted session into memory if none is present yet
    fn restore(&self) -> Option<Session> {
        if let Some(session) = self.current() {
            return Some(session);
        }
        if !self.persist_session {
            return None;
        }
        let raw = match self.storage.get_item(&self.storage_key) {
            Ok(raw) => raw?,
            Err(e) => {
                log::warn!("Failed to read persisted session: {}", e);
                return None;
            }
        };
        match serde_json::from_str::<Session>(&raw) {
            Ok(session) => {
                log::debug!("Restored persisted session for user {}", session.user.id);
                *self.session.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(session.clone());
                Some(session)
            }
            Err(e) => {
                log::warn!("Discarding unreadable persisted session: {}", e);
                self.store_session(None);
                None
            }
        }
    }

    /// Install a session obtained elsewhere
    pub fn set_session(&self, session: Session) {
        self.store_session(Some(session.clone()));
        self.emit(AuthEvent::SignedIn, Some(session));
    }

    /// Session currently held in memory, without touching storage or the network
    pub fn cached_session(&self) -> Option<Session> {
        self.current()
    }

    /// Exchange the refresh token for a new session
    pub async fn refresh_session(&self) -> Result<Session> {
        let session = self.restore().ok_or(Error::MissingSession)?;
        let refreshed = self.refresh_with_token(&session.refresh_token).await?;
        self.store_session(Some(refreshed.clone()));
        self.emit(AuthEvent::TokenRefreshed, Some(refreshed.clone()));
        Ok(refreshed)
    }

    async fn refresh_with_token(&self, refresh_token: &str) -> Result<Session> {
        let url = self.auth_url("/token");
        let body = serde_json::json!({ "refresh_token": refresh_token });

        Fetch::post(&self.http_client, &url)
            .query("grant_type", "refresh_token")
            .apikey(&self.key)
            .timeout(self.request_timeout)
            .classify(Error::from_auth_response)
            .json(&body)?
            .execute::<Session>()
            .await
    }

    /// Get the user data for the currently authenticated user
    pub async fn get_user(&self) -> Result<User> {
        let session = self.restore().ok_or(Error::MissingSession)?;
        self.get_user_by_token(&session.access_token).await
    }

    async fn get_user_by_token(&self, token: &str) -> Result<User> {
        let url = self.auth_url("/user");

        Fetch::get(&self.http_client, &url)
            .apikey(&self.key)
            .bearer_auth(token)
            .timeout(self.request_timeout)
            .classify(Error::from_auth_response)
            .execute::<User>()
            .await
    }

    /// Ask the service to email a password reset link
    pub async fn reset_password_for_email(&self, email: &str) -> Result<()> {
        let url = self.auth_url("/recover");
        let body = serde_json::json!({ "email": email });

        Fetch::post(&self.http_client, &url)
            .apikey(&self.key)
            .timeout(self.request_timeout)
            .classify(Error::from_auth_response)
            .json(&body)?
            .execute_empty()
            .await
    }
}

#[async_trait]
impl IdentityProvider for AuthClient {
    async fn get_session(&self) -> Result<Option<Session>> {
        let session = match self.restore() {
            Some(session) => session,
            None => return Ok(None),
        };
        if !session.expires_within(EXPIRY_MARGIN_SECS) {
            return Ok(Some(session));
        }

        if !self.auto_refresh_token || session.refresh_token.is_empty() {
            log::info!("Stored session for {} is stale, clearing it", session.user.id);
            self.store_session(None);
            self.emit(AuthEvent::SignedOut, None);
            return Ok(None);
        }

        match self.refresh_with_token(&session.refresh_token).await {
            Ok(refreshed) => {
                self.store_session(Some(refreshed.clone()));
                self.emit(AuthEvent::TokenRefreshed, Some(refreshed.clone()));
                Ok(Some(refreshed))
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                log::info!("Refresh token rejected ({}), clearing stale session", e);
                self.store_session(None);
                self.emit(AuthEvent::SignedOut, None);
                Ok(None)
            }
        }
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let url = self.auth_url("/token");
        let body = serde_json::json!({
            "email": email,
            "password": password,
        });

        let session = Fetch::post(&self.http_client, &url)
            .query("grant_type", "password")
            .apikey(&self.key)
            .timeout(self.request_timeout)
            .classify(Error::from_auth_response)
            .json(&body)?
            .execute::<Session>()
            .await?;

        self.store_session(Some(session.clone()));
        self.emit(AuthEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Value,
    ) -> Result<SignUpOutcome> {
        let url = self.auth_url("/signup");
        let body = serde_json::json!({
            "email": email,
            "password": password,
            "data": metadata,
        });

        let response = Fetch::post(&self.http_client, &url)
            .apikey(&self.key)
            .timeout(self.request_timeout)
            .classify(Error::from_auth_response)
            .json(&body)?
            .execute::<Value>()
            .await?;

        if response.get("access_token").is_some() {
            let session: Session = serde_json::from_value(response)?;
            self.store_session(Some(session.clone()));
            self.emit(AuthEvent::SignedIn, Some(session.clone()));
            return Ok(SignUpOutcome {
                user: session.user.clone(),
                session: Some(session),
            });
        }

        // Email confirmation pending: the body is the user itself
        let user: User = match response.get("user") {
            Some(user) => serde_json::from_value(user.clone())?,
            None => serde_json::from_value(response)?,
        };
        Ok(SignUpOutcome {
            user,
            session: None,
        })
    }

    async fn sign_out(&self) -> Result<()> {
        let session = self.restore();
        self.store_session(None);

        let session = match session {
            Some(session) => session,
            None => return Ok(()),
        };
        self.emit(AuthEvent::SignedOut, None);

        let url = self.auth_url("/logout");
        Fetch::post(&self.http_client, &url)
            .apikey(&self.key)
            .bearer_auth(&session.access_token)
            .timeout(self.request_timeout)
            .classify(Error::from_auth_response)
            .execute_empty()
            .await
    }

    async fn session_from_url(&self, location: &Url) -> Result<Option<Session>> {
        let fragment = match location.fragment() {
            Some(f) if has_auth_fragment(location) => f,
            _ => return Ok(None),
        };
        let params: HashMap<String, String> = url::form_urlencoded::parse(fragment.as_bytes())
            .into_owned()
            .collect();

        if let Some(description) = params.get("error_description") {
            return Err(Error::auth(description));
        }
        let token = params
            .get("access_token")
            .ok_or_else(|| Error::auth("Redirect is missing access_token"))?;

        let user = self.get_user_by_token(token).await?;
        let session = Session::from_redirect_params(&params, user)?;
        self.store_session(Some(session.clone()));
        self.emit(AuthEvent::SignedIn, Some(session.clone()));
        Ok(Some(session))
    }

    fn oauth_sign_in_url(&self, provider: OAuthProvider, redirect_to: Option<&str>) -> String {
        let mut url = format!("{}?provider={}", self.auth_url("/authorize"), provider.as_str());
        if let Some(redirect_to) = redirect_to {
            url.push_str(&format!("&redirect_to={}", urlencoding::encode(redirect_to)));
        }
        url
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthChange> {
        self.events.subscribe()
    }
}
