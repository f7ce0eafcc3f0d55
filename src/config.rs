//! Configuration for the portal client

use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};

/// Backoff schedule for session lookups
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_backoff: Duration,

    /// Multiplier applied to the delay after each failure
    pub backoff_factor: f64,

    /// Upper bound for a single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `failures` consecutive failed attempts.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let factor = self.backoff_factor.powi(exponent);
        let millis = (self.initial_backoff.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_backoff)
    }
}

/// Configuration for the portal client
#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// The base URL of the Supabase project
    pub url: Url,

    /// The public (anon) API key
    pub anon_key: String,

    /// Timeout for a single remote call
    pub request_timeout: Duration,

    /// Hard deadline for a whole bootstrap pass
    pub bootstrap_timeout: Duration,

    /// Retry schedule for session lookups
    pub retry: RetryPolicy,

    /// Whether to keep the session in [`SessionStorage`](crate::auth::SessionStorage)
    pub persist_session: bool,

    /// Whether an expired stored session is refreshed on lookup
    pub auto_refresh_token: bool,

    /// Key the session is persisted under
    pub storage_key: String,

    /// Where the OAuth provider sends the browser back to
    pub oauth_redirect_to: Option<String>,
}

impl PortalConfig {
    /// Creates a new configuration, validating the URL and key.
    pub fn new(url: &str, anon_key: &str) -> Result<Self> {
        let url = Url::parse(url.trim_end_matches('/'))?;
        if anon_key.is_empty() {
            return Err(Error::config("anon_key cannot be empty"));
        }
        let storage_key = default_storage_key(&url);

        Ok(Self {
            url,
            anon_key: anon_key.to_string(),
            request_timeout: Duration::from_secs(5),
            bootstrap_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            persist_session: true,
            auto_refresh_token: true,
            storage_key,
            oauth_redirect_to: None,
        })
    }

    /// Reads the configuration from the environment.
    ///
    /// `SUPABASE_URL` and `SUPABASE_ANON_KEY` are required. The optional
    /// `MEDCONNECT_REQUEST_TIMEOUT_MS`, `MEDCONNECT_BOOTSTRAP_TIMEOUT_MS` and
    /// `MEDCONNECT_OAUTH_REDIRECT` override the defaults.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("SUPABASE_URL")
            .map_err(|_| Error::config("SUPABASE_URL environment variable not found"))?;
        let key = std::env::var("SUPABASE_ANON_KEY")
            .map_err(|_| Error::config("SUPABASE_ANON_KEY environment variable not found"))?;

        let mut config = Self::new(&url, &key)?;
        if let Some(ms) = env_millis("MEDCONNECT_REQUEST_TIMEOUT_MS")? {
            config = config.with_request_timeout(ms);
        }
        if let Some(ms) = env_millis("MEDCONNECT_BOOTSTRAP_TIMEOUT_MS")? {
            config = config.with_bootstrap_timeout(ms);
        }
        if let Ok(redirect) = std::env::var("MEDCONNECT_OAUTH_REDIRECT") {
            config = config.with_oauth_redirect_to(&redirect);
        }
        Ok(config)
    }

    /// Base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.url.as_str().trim_end_matches('/')
    }

    /// Set the timeout for a single remote call
    pub fn with_request_timeout(mut self, value: Duration) -> Self {
        self.request_timeout = value;
        self
    }

    /// Set the hard deadline for a bootstrap pass
    pub fn with_bootstrap_timeout(mut self, value: Duration) -> Self {
        self.bootstrap_timeout = value;
        self
    }

    /// Set the retry schedule
    pub fn with_retry(mut self, value: RetryPolicy) -> Self {
        self.retry = value;
        self
    }

    /// Set whether to persist the session
    pub fn with_persist_session(mut self, value: bool) -> Self {
        self.persist_session = value;
        self
    }

    /// Set whether to automatically refresh the token
    pub fn with_auto_refresh_token(mut self, value: bool) -> Self {
        self.auto_refresh_token = value;
        self
    }

    /// Set the key the session is persisted under
    pub fn with_storage_key(mut self, value: &str) -> Self {
        self.storage_key = value.to_string();
        self
    }

    /// Set the OAuth redirect target
    pub fn with_oauth_redirect_to(mut self, value: &str) -> Self {
        self.oauth_redirect_to = Some(value.to_string());
        self
    }
}

fn default_storage_key(url: &Url) -> String {
    let project_ref = url
        .host_str()
        .and_then(|host| host.split('.').next())
        .filter(|label| !label.is_empty())
        .unwrap_or("local");
    format!("sb-{}-auth-token", project_ref)
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| Error::config(format!("{} must be a number of milliseconds", name))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_new_valid() {
        let config = PortalConfig::new("https://abcd.supabase.co/", "anon").unwrap();
        assert_eq!(config.base_url(), "https://abcd.supabase.co");
        assert_eq!(config.storage_key, "sb-abcd-auth-token");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(config.persist_session);
    }

    #[test]
    fn config_new_invalid_url() {
        match PortalConfig::new("not a valid url", "key") {
            Err(Error::Url(_)) => {}
            other => panic!("Expected Url error, got {:?}", other),
        }
    }

    #[test]
    fn config_new_empty_key() {
        match PortalConfig::new("http://localhost:54321", "") {
            Err(Error::Config(msg)) => assert!(msg.contains("anon_key cannot be empty")),
            other => panic!("Expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn localhost_storage_key_uses_host() {
        let config = PortalConfig::new("http://127.0.0.1:54321", "key").unwrap();
        assert_eq!(config.storage_key, "sb-127-auth-token");
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
        assert_eq!(policy.delay(10), Duration::from_secs(4));
    }

    #[test]
    fn huge_failure_counts_stay_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(4));
        assert_eq!(policy.delay(i32::MAX as u32 + 2), Duration::from_secs(4));
    }
}
