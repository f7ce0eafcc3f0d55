//! Profiles and organizations, and lazy profile creation on first sign-in

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::auth::{AuthClient, User};
use crate::config::PortalConfig;
use crate::error::{with_timeout, Error, Result};
use crate::postgrest::PostgrestClient;

/// Path of the patient home
pub const PATIENT_HOME: &str = "/dashboard";

/// Path of the organization home
pub const ORGANIZATION_HOME: &str = "/organization-dashboard";

/// Role of a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Patient,
    Doctor,
    Clinic,
    Pharmacy,
    Laboratory,
}

impl UserType {
    pub const ALL: [UserType; 5] = [
        UserType::Patient,
        UserType::Doctor,
        UserType::Clinic,
        UserType::Pharmacy,
        UserType::Laboratory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Patient => "patient",
            UserType::Doctor => "doctor",
            UserType::Clinic => "clinic",
            UserType::Pharmacy => "pharmacy",
            UserType::Laboratory => "laboratory",
        }
    }

    /// Every role except patient
    pub fn is_professional(&self) -> bool {
        !matches!(self, UserType::Patient)
    }

    /// Dashboard the role lands on
    pub fn home_path(&self) -> &'static str {
        if self.is_professional() {
            ORGANIZATION_HOME
        } else {
            PATIENT_HOME
        }
    }
}

impl Default for UserType {
    fn default() -> Self {
        UserType::Patient
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        UserType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::validation(format!("Unknown user type: {}", s)))
    }
}

/// Row of the `profiles` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Same as the user id
    pub id: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub user_type: UserType,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Profile {
    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or("User")
    }
}

/// Profile synthesised from identity metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewProfile {
    pub id: String,
    pub full_name: String,
    pub user_type: UserType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl NewProfile {
    /// Build the initial profile for a user.
    ///
    /// Missing or unrecognised roles default to patient.
    pub fn from_user(user: &User) -> Self {
        let user_type = match user.declared_user_type() {
            Some(declared) => declared.parse().unwrap_or_else(|_| {
                log::warn!("Ignoring unknown user_type {:?} for {}", declared, user.id);
                UserType::Patient
            }),
            None => UserType::Patient,
        };

        Self {
            id: user.id.clone(),
            full_name: user.full_name().unwrap_or("User").to_string(),
            user_type,
            email: user.email.clone(),
            avatar_url: user.avatar_url().map(str::to_string),
        }
    }
}

/// Fields a user may change from the settings form
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none() && self.avatar_url.is_none()
    }

    /// Stamp the update time
    pub fn touched(mut self) -> Self {
        self.updated_at = Some(Utc::now().to_rfc3339());
        self
    }
}

/// Row of the `organizations` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub owner_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub org_type: UserType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_number: Option<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Organization {
    /// Check the settings form before saving
    pub fn validate(&self) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            return Err(Error::validation("Organization owner is required"));
        }
        if self.name.trim().is_empty() {
            return Err(Error::validation("Organization name is required"));
        }
        if !self.org_type.is_professional() {
            return Err(Error::validation(
                "Only professional accounts can have an organization",
            ));
        }
        Ok(())
    }
}

/// Persistence for profiles
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find_profile(&self, user_id: &str) -> Result<Option<Profile>>;

    async fn insert_profile(&self, profile: &NewProfile) -> Result<Profile>;

    async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<Profile>;
}

/// [`ProfileStore`] backed by the `profiles` table
#[derive(Clone)]
pub struct RestProfileStore {
    url: String,
    key: String,
    http_client: Client,
    auth: AuthClient,
    timeout: Duration,
}

impl RestProfileStore {
    pub fn new(config: &PortalConfig, http_client: Client, auth: AuthClient) -> Self {
        Self {
            url: config.base_url().to_string(),
            key: config.anon_key.clone(),
            http_client,
            auth,
            timeout: config.request_timeout,
        }
    }

    fn profiles(&self) -> PostgrestClient {
        let client = PostgrestClient::new(&self.url, &self.key, "profiles", self.http_client.clone())
            .with_timeout(self.timeout);
        match self.auth.cached_session() {
            Some(session) => client.with_auth(&session.access_token),
            None => client,
        }
    }
}

#[async_trait]
impl ProfileStore for RestProfileStore {
    async fn find_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        self.profiles()
            .select("*")
            .eq("id", user_id)
            .maybe_single()
            .await
    }

    async fn insert_profile(&self, profile: &NewProfile) -> Result<Profile> {
        let rows: Vec<Profile> = self.profiles().insert(&[profile]).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::database("Insert returned no profile"))
    }

    async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<Profile> {
        let rows: Vec<Profile> = self.profiles().eq("id", user_id).update(update).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::database(format!("No profile with id {}", user_id)))
    }
}

/// [`ProfileStore`] kept in memory
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    rows: StdMutex<HashMap<String, Profile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(self, profile: Profile) -> Self {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile.id.clone(), profile);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn find_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(user_id).cloned())
    }

    async fn insert_profile(&self, profile: &NewProfile) -> Result<Profile> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        if rows.contains_key(&profile.id) {
            return Err(Error::database(
                "duplicate key value violates unique constraint \"profiles_pkey\"",
            ));
        }
        let now = Utc::now().to_rfc3339();
        let row = Profile {
            id: profile.id.clone(),
            full_name: Some(profile.full_name.clone()),
            user_type: profile.user_type,
            email: profile.email.clone(),
            avatar_url: profile.avatar_url.clone(),
            created_at: Some(now.clone()),
            updated_at: Some(now),
        };
        rows.insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<Profile> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let row = rows
            .get_mut(user_id)
            .ok_or_else(|| Error::database(format!("No profile with id {}", user_id)))?;
        if let Some(full_name) = &update.full_name {
            row.full_name = Some(full_name.clone());
        }
        if let Some(avatar_url) = &update.avatar_url {
            row.avatar_url = Some(avatar_url.clone());
        }
        if let Some(updated_at) = &update.updated_at {
            row.updated_at = Some(updated_at.clone());
        }
        Ok(row.clone())
    }
}

/// Outcome of resolving the profile for a signed-in user
#[derive(Debug)]
pub enum ProfileResolution {
    /// The profile already existed
    Found(Profile),
    /// No profile existed and one was created from identity metadata
    Created(Profile),
    /// Lookup or creation failed; callers treat the user as a patient
    Failed(Error),
}

impl ProfileResolution {
    pub fn profile(&self) -> Option<&Profile> {
        match self {
            ProfileResolution::Found(p) | ProfileResolution::Created(p) => Some(p),
            ProfileResolution::Failed(_) => None,
        }
    }

    pub fn into_result(self) -> Result<Profile> {
        match self {
            ProfileResolution::Found(p) | ProfileResolution::Created(p) => Ok(p),
            ProfileResolution::Failed(e) => Err(e),
        }
    }
}

/// Finds the profile of a user, creating it on first sign-in.
///
/// Resolutions run one at a time so two overlapping auth events for the same
/// user cannot both insert a row.
pub struct ProfileResolver {
    store: Arc<dyn ProfileStore>,
    timeout: Duration,
    lock: Mutex<()>,
}

impl ProfileResolver {
    pub fn new(store: Arc<dyn ProfileStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ProfileStore> {
        &self.store
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        with_timeout(operation, self.timeout, fut).await
    }

    pub async fn resolve(&self, user: &User) -> ProfileResolution {
        let _guard = self.lock.lock().await;

        log::debug!("Fetching profile for user {}", user.id);
        match self.bounded("find_profile", self.store.find_profile(&user.id)).await {
            Ok(Some(profile)) => return ProfileResolution::Found(profile),
            Ok(None) => {}
            Err(e) => {
                log::error!("Error fetching profile for {}: {}", user.id, e);
                return ProfileResolution::Failed(e);
            }
        }

        let draft = NewProfile::from_user(user);
        log::info!(
            "Creating {} profile for user {}",
            draft.user_type,
            user.id
        );
        match self.bounded("insert_profile", self.store.insert_profile(&draft)).await {
            Ok(profile) => ProfileResolution::Created(profile),
            Err(insert_err) => {
                // Another client may have created the row in the meantime
                match self.bounded("find_profile", self.store.find_profile(&user.id)).await {
                    Ok(Some(profile)) => ProfileResolution::Found(profile),
                    _ => {
                        log::error!("Error creating profile for {}: {}", user.id, insert_err);
                        ProfileResolution::Failed(insert_err)
                    }
                }
            }
        }
    }

    pub async fn update(&self, user_id: &str, update: ProfileUpdate) -> Result<Profile> {
        if update.is_empty() {
            return Err(Error::validation("Nothing to update"));
        }
        if let Some(name) = &update.full_name {
            if name.trim().is_empty() {
                return Err(Error::validation("Full name cannot be empty"));
            }
        }
        let _guard = self.lock.lock().await;
        self.bounded("update_profile", self.store.update_profile(user_id, &update.touched()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(metadata: serde_json::Value) -> User {
        serde_json::from_value(json!({
            "id": "user-1",
            "email": "jane@example.com",
            "user_metadata": metadata,
        }))
        .unwrap()
    }

    struct FailingStore;

    #[async_trait]
    impl ProfileStore for FailingStore {
        async fn find_profile(&self, _: &str) -> Result<Option<Profile>> {
            Ok(None)
        }
        async fn insert_profile(&self, _: &NewProfile) -> Result<Profile> {
            Err(Error::database("permission denied for table profiles"))
        }
        async fn update_profile(&self, _: &str, _: &ProfileUpdate) -> Result<Profile> {
            Err(Error::database("permission denied for table profiles"))
        }
    }

    #[test]
    fn user_type_parses_case_insensitively() {
        assert_eq!("Clinic".parse::<UserType>().unwrap(), UserType::Clinic);
        assert!("nurse".parse::<UserType>().is_err());
        assert_eq!(UserType::Pharmacy.home_path(), ORGANIZATION_HOME);
        assert_eq!(UserType::Patient.home_path(), PATIENT_HOME);
    }

    #[test]
    fn new_profile_defaults_to_patient() {
        let draft = NewProfile::from_user(&user(json!({})));
        assert_eq!(draft.user_type, UserType::Patient);
        assert_eq!(draft.full_name, "User");

        let draft = NewProfile::from_user(&user(json!({"user_type": "wizard"})));
        assert_eq!(draft.user_type, UserType::Patient);
    }

    #[test]
    fn new_profile_reads_oauth_metadata() {
        let draft = NewProfile::from_user(&user(json!({
            "name": "Dr. House",
            "picture": "https://example.com/a.png",
            "user_type": "doctor",
        })));
        assert_eq!(draft.full_name, "Dr. House");
        assert_eq!(draft.user_type, UserType::Doctor);
        assert_eq!(draft.avatar_url.as_deref(), Some("https://example.com/a.png"));
    }

    #[test]
    fn organization_serialises_type_field() {
        let org = Organization {
            id: None,
            owner_id: "user-1".into(),
            name: "Downtown Clinic".into(),
            org_type: UserType::Clinic,
            address: None,
            phone: None,
            email: None,
            license_number: Some("LIC-1".into()),
            verified: false,
            created_at: None,
            updated_at: None,
        };
        let value = serde_json::to_value(&org).unwrap();
        assert_eq!(value["type"], "clinic");
        assert!(value.get("id").is_none());
        org.validate().unwrap();

        let patient_org = Organization {
            org_type: UserType::Patient,
            ..org.clone()
        };
        assert!(patient_org.validate().is_err());

        let unnamed = Organization {
            name: "  ".into(),
            ..org
        };
        assert!(unnamed.validate().is_err());
    }

    #[tokio::test]
    async fn resolve_creates_once() {
        let store = Arc::new(MemoryProfileStore::new());
        let resolver = ProfileResolver::new(store.clone(), Duration::from_secs(5));
        let user = user(json!({"full_name": "Jane Roe"}));

        let first = resolver.resolve(&user).await;
        assert!(matches!(first, ProfileResolution::Created(_)));
        let second = resolver.resolve(&user).await;
        assert!(matches!(second, ProfileResolution::Found(_)));
        assert_eq!(store.len(), 1);
        assert_eq!(second.profile().unwrap().display_name(), "Jane Roe");
    }

    #[tokio::test]
    async fn concurrent_resolves_insert_one_row() {
        let store = Arc::new(MemoryProfileStore::new());
        let resolver = Arc::new(ProfileResolver::new(store.clone(), Duration::from_secs(5)));
        let user = user(json!({}));

        let (a, b) = tokio::join!(resolver.resolve(&user), resolver.resolve(&user));
        assert!(a.profile().is_some());
        assert!(b.profile().is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn insert_failure_is_reported() {
        let resolver = ProfileResolver::new(Arc::new(FailingStore), Duration::from_secs(5));
        match resolver.resolve(&user(json!({}))).await {
            ProfileResolution::Failed(Error::Database(msg)) => {
                assert!(msg.contains("permission denied"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn update_rejects_blank_name() {
        let resolver = ProfileResolver::new(Arc::new(MemoryProfileStore::new()), Duration::from_secs(5));
        let update = ProfileUpdate {
            full_name: Some(" ".into()),
            ..Default::default()
        };
        assert!(matches!(
            resolver.update("user-1", update).await,
            Err(Error::Validation(_))
        ));
    }
}
