//! Session and profile bootstrap
//!
//! [`AuthService`] keeps the (user, session, profile) triple in an
//! [`AuthStore`] consistent with the identity service. Every operation that
//! writes the store first takes a generation token; a result is applied only
//! while its token is still the newest, so a slow response can never
//! overwrite the outcome of a later operation.

use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use url::Url;

use crate::auth::{
    has_auth_fragment, AuthChange, AuthEvent, IdentityProvider, OAuthProvider, Session, User,
};
use crate::config::{PortalConfig, RetryPolicy};
use crate::error::{with_timeout, Error, Result};
use crate::notify::Notifications;
use crate::profile::{
    Profile, ProfileResolution, ProfileResolver, ProfileStore, ProfileUpdate, UserType,
};

/// Where the bootstrap currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootstrapPhase {
    #[default]
    Uninitialized,
    CheckingSession,
    FetchingProfile,
    Ready,
    /// The retry budget ran out without a usable session
    NetworkError,
}

/// Point-in-time copy of the auth state
#[derive(Debug, Clone, Default)]
pub struct AuthSnapshot {
    pub phase: BootstrapPhase,
    pub session: Option<Session>,
    pub user: Option<User>,
    pub profile: Option<Profile>,
    /// Set when the profile could not be loaded or created
    pub profile_error: Option<String>,
    /// Set when the session could not be checked
    pub network_error: Option<String>,
    pub failed_attempts: u32,
    pub generation: u64,
}

impl AuthSnapshot {
    pub fn is_loading(&self) -> bool {
        matches!(
            self.phase,
            BootstrapPhase::Uninitialized
                | BootstrapPhase::CheckingSession
                | BootstrapPhase::FetchingProfile
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    /// Role used for routing.
    ///
    /// A signed-in user whose profile failed to resolve counts as a patient.
    pub fn effective_user_type(&self) -> Option<UserType> {
        self.user.as_ref()?;
        Some(
            self.profile
                .as_ref()
                .map(|p| p.user_type)
                .unwrap_or(UserType::Patient),
        )
    }

    fn clear_identity(&mut self) {
        self.session = None;
        self.user = None;
        self.profile = None;
        self.profile_error = None;
    }
}

/// Single-writer container for [`AuthSnapshot`]
pub struct AuthStore {
    state: RwLock<AuthSnapshot>,
    generation: AtomicU64,
    changes: broadcast::Sender<AuthSnapshot>,
}

impl Default for AuthStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(32);
        Self {
            state: RwLock::new(AuthSnapshot::default()),
            generation: AtomicU64::new(0),
            changes,
        }
    }

    /// Start a new operation, invalidating every older token
    pub fn begin(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> AuthSnapshot {
        self.state.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthSnapshot> {
        self.changes.subscribe()
    }

    /// Apply `f` if `token` is still current. Returns whether it was applied.
    pub async fn apply<F>(&self, token: u64, f: F) -> bool
    where
        F: FnOnce(&mut AuthSnapshot),
    {
        let mut state = self.state.write().await;
        if self.current_generation() != token {
            log::debug!(
                "Discarding stale auth update (token {}, current {})",
                token,
                self.current_generation()
            );
            return false;
        }
        f(&mut state);
        state.generation = token;
        let _ = self.changes.send(state.clone());
        true
    }

    /// Apply `f` without invalidating running operations
    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut AuthSnapshot),
    {
        let mut state = self.state.write().await;
        f(&mut state);
        let _ = self.changes.send(state.clone());
    }
}

/// Input of the sign-up form
#[derive(Debug, Clone)]
pub struct SignUpForm {
    pub email: String,
    pub password: String,
    pub full_name: String,
    pub user_type: UserType,
}

/// Result of handling an OAuth redirect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectOutcome {
    /// The landing URL with the token fragment removed
    pub location: Url,
    /// Where to navigate next
    pub navigate_to: String,
}

const MIN_PASSWORD_LEN: usize = 6;

fn validate_email(email: &str) -> Result<()> {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(Error::validation("Please enter a valid email address")),
    }
}

struct Inner {
    identity: Arc<dyn IdentityProvider>,
    profiles: ProfileResolver,
    store: AuthStore,
    notifications: Notifications,
    request_timeout: Duration,
    bootstrap_timeout: Duration,
    retry: RetryPolicy,
    oauth_redirect_to: Option<String>,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Handle to the auth state of one portal instance.
///
/// Cheap to clone; every clone shares the same store.
#[derive(Clone)]
pub struct AuthService {
    inner: Arc<Inner>,
}

impl AuthService {
    pub fn new(
        config: &PortalConfig,
        identity: Arc<dyn IdentityProvider>,
        profile_store: Arc<dyn ProfileStore>,
        notifications: Notifications,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity,
                profiles: ProfileResolver::new(profile_store, config.request_timeout),
                store: AuthStore::new(),
                notifications,
                request_timeout: config.request_timeout,
                bootstrap_timeout: config.bootstrap_timeout,
                retry: config.retry.clone(),
                oauth_redirect_to: config.oauth_redirect_to.clone(),
                listener: StdMutex::new(None),
            }),
        }
    }

    pub async fn snapshot(&self) -> AuthSnapshot {
        self.inner.store.snapshot().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthSnapshot> {
        self.inner.store.subscribe()
    }

    pub fn notifications(&self) -> &Notifications {
        &self.inner.notifications
    }

    /// Wait until no operation is loading, bounded by the bootstrap timeout
    pub async fn settled(&self) -> AuthSnapshot {
        let mut changes = self.inner.store.subscribe();
        let current = self.snapshot().await;
        if !current.is_loading() {
            return current;
        }

        let wait = async {
            loop {
                match changes.recv().await {
                    Ok(snapshot) if !snapshot.is_loading() => return snapshot,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return self.snapshot().await,
                }
            }
        };
        match tokio::time::timeout(self.inner.bootstrap_timeout, wait).await {
            Ok(snapshot) => snapshot,
            Err(_) => self.snapshot().await,
        }
    }

    /// Run the bootstrap for a page load.
    ///
    /// Starts the auth event listener, then either consumes an OAuth redirect
    /// in `location` or checks for an existing session.
    pub async fn initialize(&self, location: Option<&Url>) -> Option<RedirectOutcome> {
        self.spawn_event_listener();
        if let Some(location) = location {
            if has_auth_fragment(location) {
                return self.handle_redirect(location).await;
            }
        }
        self.refresh_session().await;
        None
    }

    /// Check the identity service for a session and resolve its profile.
    ///
    /// Always finishes within the bootstrap timeout.
    pub async fn refresh_session(&self) -> AuthSnapshot {
        let store = &self.inner.store;
        let token = store.begin();
        store
            .apply(token, |s| {
                s.phase = BootstrapPhase::CheckingSession;
                s.network_error = None;
            })
            .await;

        self.within_deadline(token, "Session bootstrap", self.run_refresh(token))
            .await;
        self.snapshot().await
    }

    /// Run a store-writing step of operation `token` under the bootstrap
    /// deadline.
    ///
    /// On expiry the step is dropped and, if `token` is still current and
    /// loading, the state is forced to ready with a network error. Returns
    /// `None` on expiry.
    async fn within_deadline<T, F>(&self, token: u64, operation: &str, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let deadline = self.inner.bootstrap_timeout;
        if let Ok(value) = tokio::time::timeout(deadline, fut).await {
            return Some(value);
        }

        log::warn!("{} did not finish within {:?}", operation, deadline);
        let mut forced = false;
        self.inner
            .store
            .apply(token, |s| {
                if s.is_loading() {
                    forced = true;
                    s.phase = BootstrapPhase::Ready;
                    s.network_error = Some("Timed out while checking your session".into());
                }
            })
            .await;
        if forced {
            self.inner
                .notifications
                .warning("Loading took too long. Please check your connection.");
        }
        None
    }

    async fn run_refresh(&self, token: u64) {
        let inner = &self.inner;
        let mut failures = 0;
        loop {
            let result = with_timeout(
                "get_session",
                inner.request_timeout,
                inner.identity.get_session(),
            )
            .await;

            match result {
                Ok(session) => {
                    inner
                        .store
                        .apply(token, |s| {
                            s.failed_attempts = 0;
                            s.network_error = None;
                        })
                        .await;
                    self.apply_session(token, session).await;
                    return;
                }
                Err(e) => {
                    failures += 1;
                    log::warn!("Session check failed (attempt {}): {}", failures, e);
                    let still_current = inner
                        .store
                        .apply(token, |s| s.failed_attempts = failures)
                        .await;
                    if !still_current {
                        return;
                    }
                    if !e.is_transient() || failures >= inner.retry.max_attempts {
                        self.retries_exhausted(token, e).await;
                        return;
                    }
                    tokio::time::sleep(inner.retry.delay(failures)).await;
                }
            }
        }
    }

    async fn retries_exhausted(&self, token: u64, error: Error) {
        let message = error.user_message();
        let mut kept_session = false;
        self.inner
            .store
            .apply(token, |s| {
                s.network_error = Some(message.clone());
                if s.user.is_some() {
                    kept_session = true;
                    s.phase = BootstrapPhase::Ready;
                } else {
                    s.clear_identity();
                    s.phase = BootstrapPhase::NetworkError;
                }
            })
            .await;

        if kept_session {
            log::info!("Network issues detected, keeping the existing session");
            self.inner
                .notifications
                .warning("Connection problems. Showing your last known session.");
        } else {
            self.inner.notifications.error(message);
        }
    }

    /// Store `session` (or its absence) and resolve the profile
    async fn apply_session(&self, token: u64, session: Option<Session>) {
        let session = match session {
            Some(session) => session,
            None => {
                log::debug!("No session present");
                self.inner
                    .store
                    .apply(token, |s| {
                        s.clear_identity();
                        s.phase = BootstrapPhase::Ready;
                    })
                    .await;
                return;
            }
        };

        let user = session.user.clone();
        let applied = self
            .inner
            .store
            .apply(token, |s| {
                if s.user.as_ref().map(|u| &u.id) != Some(&user.id) {
                    s.profile = None;
                    s.profile_error = None;
                }
                s.user = Some(user.clone());
                s.session = Some(session);
                s.phase = BootstrapPhase::FetchingProfile;
            })
            .await;
        if applied {
            self.resolve_profile(token, &user).await;
        }
    }

    async fn resolve_profile(&self, token: u64, user: &User) -> ProfileResolution {
        let resolution = self.inner.profiles.resolve(user).await;
        match &resolution {
            ProfileResolution::Found(profile) | ProfileResolution::Created(profile) => {
                self.inner
                    .store
                    .apply(token, |s| {
                        s.profile = Some(profile.clone());
                        s.profile_error = None;
                        s.phase = BootstrapPhase::Ready;
                    })
                    .await;
            }
            ProfileResolution::Failed(e) => {
                let message = e.user_message();
                let applied = self
                    .inner
                    .store
                    .apply(token, |s| {
                        s.profile = None;
                        s.profile_error = Some(message);
                        s.phase = BootstrapPhase::Ready;
                    })
                    .await;
                if applied {
                    self.inner
                        .notifications
                        .error("Could not load your profile. Continuing with patient access.");
                }
            }
        }
        resolution
    }

    /// Resolve the profile of `user`, creating it if it does not exist yet
    pub async fn fetch_profile(&self, user: &User) -> ProfileResolution {
        let token = self.inner.store.current_generation();
        self.resolve_profile(token, user).await
    }

    /// Consume an OAuth redirect.
    ///
    /// Returns `None` if `location` carries no auth fragment. Otherwise the
    /// session in the fragment is installed, the session is refreshed, and
    /// the returned location has its fragment stripped.
    pub async fn handle_redirect(&self, location: &Url) -> Option<RedirectOutcome> {
        if !has_auth_fragment(location) {
            return None;
        }
        let mut clean = location.clone();
        clean.set_fragment(None);

        log::info!("Processing OAuth redirect on {}", clean.path());
        if let Err(e) = with_timeout(
            "session_from_url",
            self.inner.request_timeout,
            self.inner.identity.session_from_url(location),
        )
        .await
        {
            self.inner.notifications.error(e.user_message());
        }

        self.refresh_session().await;
        // An auth event for the same session may have taken over the refresh
        let snapshot = self.settled().await;
        let navigate_to = match snapshot.effective_user_type() {
            Some(user_type) => user_type.home_path(),
            None => "/login",
        };
        Some(RedirectOutcome {
            location: clean,
            navigate_to: navigate_to.to_string(),
        })
    }

    /// React to an event from the identity service
    pub async fn handle_auth_change(&self, change: AuthChange) {
        log::debug!("Handling auth event {:?}", change.event);
        let current = self.snapshot().await;

        if let (Some(new), Some(old)) = (&change.session, &current.session) {
            if new.access_token == old.access_token && !current.is_loading() {
                return;
            }
        }

        let token = self.inner.store.begin();
        let handle = async move {
            match change.event {
                AuthEvent::SignedOut => self.apply_session(token, None).await,
                AuthEvent::TokenRefreshed
                    if current.profile.is_some()
                        && change.session.as_ref().map(|s| &s.user.id)
                            == current.user.as_ref().map(|u| &u.id) =>
                {
                    self.inner
                        .store
                        .apply(token, |s| s.session = change.session)
                        .await;
                }
                AuthEvent::SignedIn | AuthEvent::TokenRefreshed | AuthEvent::UserUpdated => {
                    self.apply_session(token, change.session).await
                }
            }
        };
        self.within_deadline(token, "Auth event handling", handle)
            .await;
    }

    pub async fn sign_in_with_email(&self, email: &str, password: &str) -> Result<AuthSnapshot> {
        let inner = &self.inner;
        let checked = validate_email(email).and_then(|_| {
            if password.is_empty() {
                Err(Error::validation("Please enter your password"))
            } else {
                Ok(())
            }
        });
        if let Err(e) = checked {
            inner.notifications.error(e.user_message());
            return Err(e);
        }

        let token = inner.store.begin();
        inner
            .store
            .apply(token, |s| s.phase = BootstrapPhase::CheckingSession)
            .await;

        log::info!("Signing in {}", email.trim());
        let result = with_timeout(
            "sign_in",
            inner.request_timeout,
            inner.identity.sign_in_with_password(email.trim(), password),
        )
        .await;

        match result {
            Ok(session) => {
                let user_id = session.user.id.clone();
                self.within_deadline(token, "Sign-in", self.apply_session(token, Some(session)))
                    .await;
                let snapshot = self.settled().await;
                // A concurrent sign-out may have discarded this session
                if snapshot.user.as_ref().map(|u| &u.id) == Some(&user_id) {
                    inner.notifications.success("Signed in successfully");
                } else {
                    log::info!("Sign-in of {} was superseded", user_id);
                }
                Ok(snapshot)
            }
            Err(e) => {
                inner
                    .store
                    .apply(token, |s| s.phase = BootstrapPhase::Ready)
                    .await;
                inner.notifications.error(e.user_message());
                Err(e)
            }
        }
    }

    pub async fn sign_up_with_email(&self, form: SignUpForm) -> Result<AuthSnapshot> {
        let inner = &self.inner;
        let checked = validate_email(&form.email).and_then(|_| {
            if form.password.chars().count() < MIN_PASSWORD_LEN {
                Err(Error::WeakPassword(format!(
                    "Password must be at least {} characters",
                    MIN_PASSWORD_LEN
                )))
            } else if form.full_name.trim().is_empty() {
                Err(Error::validation("Please enter your full name"))
            } else {
                Ok(())
            }
        });
        if let Err(e) = checked {
            inner.notifications.error(e.user_message());
            return Err(e);
        }

        let metadata = json!({
            "full_name": form.full_name.trim(),
            "user_type": form.user_type,
        });
        log::info!("Signing up {} as {}", form.email.trim(), form.user_type);
        let result = with_timeout(
            "sign_up",
            inner.request_timeout,
            inner
                .identity
                .sign_up(form.email.trim(), &form.password, metadata),
        )
        .await;

        match result {
            Ok(outcome) => {
                if let Some(session) = outcome.session {
                    let token = inner.store.begin();
                    self.within_deadline(token, "Sign-up", self.apply_session(token, Some(session)))
                        .await;
                }
                inner.notifications.success(
                    "Account created successfully! Please check your email for verification.",
                );
                Ok(self.settled().await)
            }
            Err(e) => {
                inner.notifications.error(e.user_message());
                Err(e)
            }
        }
    }

    /// URL to send the browser to for an OAuth sign-in.
    ///
    /// The provider redirects back to the configured target, or to
    /// `/dashboard` on `origin`.
    pub fn sign_in_with_oauth(&self, provider: OAuthProvider, origin: &Url) -> Result<String> {
        let redirect_to = match &self.inner.oauth_redirect_to {
            Some(target) => target.clone(),
            None => origin.join(crate::profile::PATIENT_HOME)?.to_string(),
        };
        Ok(self
            .inner
            .identity
            .oauth_sign_in_url(provider, Some(&redirect_to)))
    }

    /// Sign out. Local state is cleared even if the remote call fails.
    pub async fn sign_out(&self) -> AuthSnapshot {
        let inner = &self.inner;
        let token = inner.store.begin();
        let was_signed_in = self.snapshot().await.is_authenticated();
        inner
            .store
            .apply(token, |s| {
                s.clear_identity();
                s.network_error = None;
                s.failed_attempts = 0;
                s.phase = BootstrapPhase::Ready;
            })
            .await;

        let result = with_timeout(
            "sign_out",
            inner.request_timeout,
            inner.identity.sign_out(),
        )
        .await;
        match result {
            Ok(()) if was_signed_in => inner.notifications.success("Signed out successfully"),
            Ok(()) => log::debug!("Sign-out without a session"),
            Err(e) => {
                log::warn!("Remote sign-out failed: {}", e);
                if was_signed_in {
                    inner.notifications.error(e.user_message());
                }
            }
        }
        self.snapshot().await
    }

    /// Save changes from the settings form
    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<Profile> {
        let user_id = match self.snapshot().await.user {
            Some(user) => user.id,
            None => return Err(Error::MissingSession),
        };

        match self.inner.profiles.update(&user_id, update).await {
            Ok(profile) => {
                let saved = profile.clone();
                self.inner
                    .store
                    .update(|s| {
                        if s.user.as_ref().map(|u| &u.id) == Some(&saved.id) {
                            s.profile = Some(saved);
                            s.profile_error = None;
                        }
                    })
                    .await;
                self.inner.notifications.success("Profile updated");
                Ok(profile)
            }
            Err(e) => {
                self.inner.notifications.error(e.user_message());
                Err(e)
            }
        }
    }

    /// Action of the connection-error screen
    pub async fn retry(&self) -> AuthSnapshot {
        self.inner
            .store
            .update(|s| {
                s.failed_attempts = 0;
                s.network_error = None;
            })
            .await;
        self.refresh_session().await
    }

    /// Forward identity events to [`handle_auth_change`](Self::handle_auth_change).
    ///
    /// Only one listener runs per service; later calls are no-ops.
    pub fn spawn_event_listener(&self) {
        let mut slot = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }

        let mut events = self.inner.identity.on_auth_state_change();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            loop {
                let change = match events.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Auth listener skipped {} events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let service = match weak.upgrade() {
                    Some(inner) => AuthService { inner },
                    None => break,
                };
                service.handle_auth_change(change).await;
            }
            log::debug!("Auth listener stopped");
        }));
    }
}
