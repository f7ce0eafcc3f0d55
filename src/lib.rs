//! MedConnect portal client core
//!
//! Client side of the MedConnect patient/provider portal on Supabase: the
//! identity client, the session/profile bootstrap, role-based routing, the
//! report and organization services, and the page view models.

pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod fetch;
pub mod notify;
pub mod postgrest;
pub mod profile;
pub mod routes;
pub mod services;
pub mod storage;
pub mod views;

use reqwest::Client;
use std::sync::Arc;

use crate::auth::{AuthClient, MemoryStorage, SessionStorage};
use crate::bootstrap::AuthService;
use crate::config::PortalConfig;
use crate::error::Result;
use crate::notify::Notifications;
use crate::postgrest::PostgrestClient;
use crate::profile::RestProfileStore;
use crate::routes::RouteGuard;
use crate::services::{OrganizationService, ReportService, ServiceContext};
use crate::storage::StorageClient;

/// The main entry point of the portal client
///
/// Owns one HTTP client, one identity client and one [`AuthService`]; every
/// service handed out shares them.
pub struct Portal {
    config: PortalConfig,
    http_client: Client,
    auth: AuthClient,
    auth_service: AuthService,
    notifications: Notifications,
    guard: RouteGuard,
}

impl Portal {
    /// Create a portal whose session lives only in memory
    ///
    /// # Example
    ///
    /// ```
    /// use medconnect_portal::{config::PortalConfig, Portal};
    ///
    /// let config = PortalConfig::new("https://your-project-url.supabase.co", "your-anon-key")?;
    /// let portal = Portal::new(config)?;
    /// assert!(portal.auth().cached_session().is_none());
    /// # Ok::<(), medconnect_portal::error::Error>(())
    /// ```
    pub fn new(config: PortalConfig) -> Result<Self> {
        Self::with_session_storage(config, Arc::new(MemoryStorage::new()))
    }

    /// Create a portal that persists the session in `storage`
    pub fn with_session_storage(
        config: PortalConfig,
        storage: Arc<dyn SessionStorage>,
    ) -> Result<Self> {
        let http_client = Client::builder().timeout(config.request_timeout).build()?;
        let auth = AuthClient::new(&config, http_client.clone(), storage);
        let notifications = Notifications::new();
        let profiles = RestProfileStore::new(&config, http_client.clone(), auth.clone());
        let auth_service = AuthService::new(
            &config,
            Arc::new(auth.clone()),
            Arc::new(profiles),
            notifications.clone(),
        );

        Ok(Self {
            config,
            http_client,
            auth,
            auth_service,
            notifications,
            guard: RouteGuard::default(),
        })
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    /// The identity client
    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    /// Session/profile state and the sign-in flows
    pub fn auth_service(&self) -> &AuthService {
        &self.auth_service
    }

    pub fn notifications(&self) -> &Notifications {
        &self.notifications
    }

    pub fn guard(&self) -> &RouteGuard {
        &self.guard
    }

    /// Table client, authenticated as the signed-in user when there is one
    pub fn from(&self, table: &str) -> PostgrestClient {
        self.context().table(table)
    }

    /// Storage client, authenticated as the signed-in user when there is one
    pub fn storage(&self) -> StorageClient {
        self.context().storage()
    }

    pub fn reports(&self) -> ReportService {
        ReportService::new(self.context())
    }

    pub fn organizations(&self) -> OrganizationService {
        OrganizationService::new(self.context())
    }

    fn context(&self) -> ServiceContext {
        ServiceContext::new(
            &self.config,
            self.http_client.clone(),
            self.auth.clone(),
            self.notifications.clone(),
        )
    }
}

/// A convenience module for common imports
pub mod prelude {
    pub use crate::auth::{IdentityProvider, OAuthProvider, Session, User};
    pub use crate::bootstrap::{AuthService, AuthSnapshot, BootstrapPhase, SignUpForm};
    pub use crate::config::PortalConfig;
    pub use crate::error::{Error, Result};
    pub use crate::profile::{Organization, Profile, UserType};
    pub use crate::routes::{GuardDecision, Route, RouteGuard};
    pub use crate::Portal;
}
