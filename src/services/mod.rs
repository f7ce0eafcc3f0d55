//! Remote data services used by the portal pages

mod organizations;
mod reports;

use reqwest::Client;
use std::time::Duration;

use crate::auth::AuthClient;
use crate::config::PortalConfig;
use crate::notify::Notifications;
use crate::postgrest::PostgrestClient;
use crate::storage::StorageClient;

pub use organizations::*;
pub use reports::*;

/// What every service needs to reach the backend as the signed-in user
#[derive(Clone)]
pub struct ServiceContext {
    url: String,
    key: String,
    http_client: Client,
    auth: AuthClient,
    timeout: Duration,
    notifications: Notifications,
}

impl ServiceContext {
    pub fn new(
        config: &PortalConfig,
        http_client: Client,
        auth: AuthClient,
        notifications: Notifications,
    ) -> Self {
        Self {
            url: config.base_url().to_string(),
            key: config.anon_key.clone(),
            http_client,
            auth,
            timeout: config.request_timeout,
            notifications,
        }
    }

    fn access_token(&self) -> Option<String> {
        self.auth.cached_session().map(|s| s.access_token)
    }

    pub(crate) fn user_id(&self) -> Option<String> {
        self.auth.cached_session().map(|s| s.user.id)
    }

    pub(crate) fn table(&self, table: &str) -> PostgrestClient {
        let client = PostgrestClient::new(&self.url, &self.key, table, self.http_client.clone())
            .with_timeout(self.timeout);
        match self.access_token() {
            Some(token) => client.with_auth(&token),
            None => client,
        }
    }

    pub(crate) fn storage(&self) -> StorageClient {
        let client = StorageClient::new(&self.url, &self.key, self.http_client.clone())
            .with_timeout(self.timeout);
        match self.access_token() {
            Some(token) => client.with_auth(&token),
            None => client,
        }
    }

    pub(crate) fn notifications(&self) -> &Notifications {
        &self.notifications
    }
}
