use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use url::Url;

use medconnect_portal::auth::{
    AuthChange, AuthEvent, IdentityProvider, OAuthProvider, Session, SignUpOutcome, User,
};
use medconnect_portal::bootstrap::{AuthService, BootstrapPhase, SignUpForm};
use medconnect_portal::config::PortalConfig;
use medconnect_portal::error::{Error, Result};
use medconnect_portal::notify::{Level, Notification, Notifications};
use medconnect_portal::profile::{
    MemoryProfileStore, NewProfile, Profile, ProfileStore, ProfileUpdate, UserType,
};
use medconnect_portal::routes::{GuardDecision, Route, RouteGuard};

#[derive(Clone, Copy, PartialEq)]
enum Backend {
    Online,
    Down,
    Hanging,
}

/// In-memory identity service
struct FakeIdentity {
    backend: Mutex<Backend>,
    accounts: Mutex<HashMap<String, (String, User)>>,
    session: Mutex<Option<Session>>,
    events: broadcast::Sender<AuthChange>,
}

impl FakeIdentity {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            backend: Mutex::new(Backend::Online),
            accounts: Mutex::new(HashMap::new()),
            session: Mutex::new(None),
            events,
        })
    }

    fn set_backend(&self, backend: Backend) {
        *self.backend.lock().unwrap() = backend;
    }

    fn add_account(&self, email: &str, password: &str, metadata: Value) -> User {
        let user: User = serde_json::from_value(json!({
            "id": format!("user-{}", email),
            "email": email,
            "user_metadata": metadata,
        }))
        .unwrap();
        self.accounts
            .lock()
            .unwrap()
            .insert(email.to_string(), (password.to_string(), user.clone()));
        user
    }

    fn install(&self, user: User, token: &str) -> Session {
        let session = Session::new(token.to_string(), format!("refresh-{}", token), 3600, user);
        *self.session.lock().unwrap() = Some(session.clone());
        let _ = self.events.send(AuthChange {
            event: AuthEvent::SignedIn,
            session: Some(session.clone()),
        });
        session
    }

    async fn gate(&self) -> Result<()> {
        let backend = *self.backend.lock().unwrap();
        match backend {
            Backend::Online => Ok(()),
            Backend::Down => Err(Error::Unavailable("503 Service Unavailable".into())),
            Backend::Hanging => std::future::pending().await,
        }
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn get_session(&self) -> Result<Option<Session>> {
        self.gate().await?;
        Ok(self.session.lock().unwrap().clone())
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        self.gate().await?;
        let account = self.accounts.lock().unwrap().get(email).cloned();
        match account {
            Some((expected, user)) if expected == password => Ok(self.install(user, "signed-in")),
            _ => Err(Error::InvalidCredentials),
        }
    }

    async fn sign_up(&self, email: &str, password: &str, metadata: Value) -> Result<SignUpOutcome> {
        self.gate().await?;
        if self.accounts.lock().unwrap().contains_key(email) {
            return Err(Error::AlreadyRegistered);
        }
        let user = self.add_account(email, password, metadata);
        let session = self.install(user.clone(), "signed-up");
        Ok(SignUpOutcome {
            user,
            session: Some(session),
        })
    }

    async fn sign_out(&self) -> Result<()> {
        let had_session = self.session.lock().unwrap().take().is_some();
        if had_session {
            let _ = self.events.send(AuthChange {
                event: AuthEvent::SignedOut,
                session: None,
            });
        }
        Ok(())
    }

    async fn session_from_url(&self, location: &Url) -> Result<Option<Session>> {
        let token = location
            .fragment()
            .and_then(|f| f.split('&').find_map(|kv| kv.strip_prefix("access_token=")))
            .ok_or_else(|| Error::auth("Redirect is missing access_token"))?;
        let user: User = serde_json::from_value(json!({
            "id": "oauth-user",
            "email": "oauth@example.com",
            "user_metadata": {"full_name": "Olive Auth"},
        }))
        .unwrap();
        Ok(Some(self.install(user, token)))
    }

    fn oauth_sign_in_url(&self, provider: OAuthProvider, redirect_to: Option<&str>) -> String {
        format!(
            "https://auth.example.com/authorize?provider={}&redirect_to={}",
            provider.as_str(),
            redirect_to.unwrap_or_default()
        )
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthChange> {
        self.events.subscribe()
    }
}

struct Harness {
    identity: Arc<FakeIdentity>,
    profiles: Arc<MemoryProfileStore>,
    service: AuthService,
    toasts: broadcast::Receiver<Notification>,
}

impl Harness {
    fn new() -> Self {
        let profiles = Arc::new(MemoryProfileStore::new());
        Self::with_store(profiles.clone(), profiles)
    }

    /// `store` backs the service; `profiles` is what the test inspects
    fn with_store(profiles: Arc<MemoryProfileStore>, store: Arc<dyn ProfileStore>) -> Self {
        let config = PortalConfig::new("https://example.supabase.co", "anon-key").unwrap();
        let identity = FakeIdentity::new();
        let notifications = Notifications::new();
        let toasts = notifications.subscribe();
        let service = AuthService::new(&config, identity.clone(), store, notifications);
        Self {
            identity,
            profiles,
            service,
            toasts,
        }
    }

    fn drain(&mut self) -> Vec<(Level, String)> {
        let mut seen = Vec::new();
        while let Ok(toast) = self.toasts.try_recv() {
            seen.push((toast.level, toast.message));
        }
        seen
    }
}

#[tokio::test]
async fn anonymous_bootstrap_settles_ready() {
    let h = Harness::new();
    h.service.initialize(None).await;

    let snapshot = h.service.snapshot().await;
    assert_eq!(snapshot.phase, BootstrapPhase::Ready);
    assert!(!snapshot.is_authenticated());
    assert_eq!(
        RouteGuard::default().evaluate("/reports", &snapshot),
        GuardDecision::Redirect {
            to: "/login".into(),
            from: Some("/reports".into())
        }
    );
}

#[tokio::test]
async fn invalid_credentials_keep_user_signed_out() {
    let mut h = Harness::new();
    h.identity.add_account("jane@example.com", "secret1", json!({}));
    h.service.initialize(None).await;

    let err = h
        .service
        .sign_in_with_email("jane@example.com", "wrong")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidCredentials));

    let snapshot = h.service.snapshot().await;
    assert_eq!(snapshot.phase, BootstrapPhase::Ready);
    assert!(snapshot.user.is_none());
    assert!(h
        .drain()
        .contains(&(Level::Error, "Invalid email or password".to_string())));
}

#[tokio::test]
async fn first_sign_in_creates_one_patient_profile() {
    let mut h = Harness::new();
    h.identity
        .add_account("jane@example.com", "secret1", json!({"full_name": "Jane Doe"}));
    h.service.initialize(None).await;

    let snapshot = h
        .service
        .sign_in_with_email("jane@example.com", "secret1")
        .await
        .unwrap();
    // Let the listener observe the sign-in event as well
    // let the listener see the sign-in event
    tokio::task::yield_now().await;

    assert_eq!(h.profiles.len(), 1);
    let profile = snapshot.profile.clone().expect("profile resolved");
    assert_eq!(profile.user_type, UserType::Patient);
    assert_eq!(profile.display_name(), "Jane Doe");
    assert_eq!(
        RouteGuard::default().post_login_target(None, &snapshot),
        "/dashboard"
    );

    let toasts = h.drain();
    assert!(toasts.contains(&(Level::Success, "Signed in successfully".to_string())));
    assert!(toasts.iter().all(|(level, _)| *level != Level::Error));
}

#[tokio::test]
async fn professional_is_kept_on_organization_pages() {
    let h = Harness::new();
    h.service.initialize(None).await;

    let snapshot = h
        .service
        .sign_up_with_email(SignUpForm {
            email: "dr.house@example.com".into(),
            password: "vicodin".into(),
            full_name: "Gregory House".into(),
            user_type: UserType::Doctor,
        })
        .await
        .unwrap();
    assert_eq!(snapshot.effective_user_type(), Some(UserType::Doctor));

    let guard = RouteGuard::default();
    assert_eq!(
        guard.evaluate("/dashboard", &snapshot),
        GuardDecision::Redirect {
            to: "/organization-dashboard".into(),
            from: None
        }
    );
    assert_eq!(
        guard.evaluate("/organization-profile", &snapshot),
        GuardDecision::Allow(Route::OrganizationProfile)
    );
    assert_eq!(
        guard.evaluate("/login", &snapshot),
        GuardDecision::Redirect {
            to: "/organization-dashboard".into(),
            from: None
        }
    );
}

#[tokio::test]
async fn short_password_is_rejected_before_any_request() {
    let mut h = Harness::new();
    let err = h
        .service
        .sign_up_with_email(SignUpForm {
            email: "pat@example.com".into(),
            password: "12345".into(),
            full_name: "Pat".into(),
            user_type: UserType::Patient,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WeakPassword(_)));
    assert!(h.identity.accounts.lock().unwrap().is_empty());
    assert_eq!(
        h.drain(),
        vec![(
            Level::Error,
            "Password is too weak. Please use at least 6 characters.".to_string()
        )]
    );
}

#[tokio::test]
async fn sign_out_twice_is_harmless() {
    let mut h = Harness::new();
    h.identity.add_account("jane@example.com", "secret1", json!({}));
    h.service.initialize(None).await;
    h.service
        .sign_in_with_email("jane@example.com", "secret1")
        .await
        .unwrap();
    h.drain();

    let first = h.service.sign_out().await;
    let second = h.service.sign_out().await;
    for snapshot in [&first, &second] {
        assert_eq!(snapshot.phase, BootstrapPhase::Ready);
        assert!(snapshot.user.is_none());
        assert!(snapshot.profile.is_none());
    }
    assert_eq!(
        h.drain(),
        vec![(Level::Success, "Signed out successfully".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn unresponsive_backend_stops_loading_within_deadline() {
    let mut h = Harness::new();
    h.identity.set_backend(Backend::Hanging);

    let started = tokio::time::Instant::now();
    h.service.initialize(None).await;
    let elapsed = started.elapsed();

    let snapshot = h.service.snapshot().await;
    assert!(!snapshot.is_loading());
    assert!(elapsed <= Duration::from_secs(10), "took {:?}", elapsed);
    assert!(snapshot.network_error.is_some());
    assert!(h.drain().contains(&(
        Level::Warning,
        "Loading took too long. Please check your connection.".to_string()
    )));
}

#[tokio::test(start_paused = true)]
async fn network_error_recovers_on_retry() {
    let mut h = Harness::new();
    let user = h
        .identity
        .add_account("jane@example.com", "secret1", json!({"full_name": "Jane"}));
    h.identity.install(user, "restored");
    h.identity.set_backend(Backend::Down);

    // The session was never loaded locally, so there is nothing to fall back to
    let snapshot = h.service.refresh_session().await;
    assert_eq!(snapshot.phase, BootstrapPhase::NetworkError);
    assert_eq!(snapshot.failed_attempts, 3);
    assert_eq!(
        RouteGuard::default().evaluate("/dashboard", &snapshot),
        GuardDecision::ConnectionError
    );
    assert!(h.drain().contains(&(
        Level::Error,
        "Network error. Please check your connection.".to_string()
    )));

    h.identity.set_backend(Backend::Online);
    let snapshot = h.service.retry().await;
    assert_eq!(snapshot.phase, BootstrapPhase::Ready);
    assert_eq!(snapshot.failed_attempts, 0);
    assert!(snapshot.network_error.is_none());
    assert_eq!(
        snapshot.user.map(|u| u.id),
        Some("user-jane@example.com".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn outage_keeps_known_session() {
    let mut h = Harness::new();
    h.identity.add_account("jane@example.com", "secret1", json!({}));
    h.service.initialize(None).await;
    h.service
        .sign_in_with_email("jane@example.com", "secret1")
        .await
        .unwrap();
    h.drain();

    h.identity.set_backend(Backend::Down);
    let snapshot = h.service.refresh_session().await;
    assert_eq!(snapshot.phase, BootstrapPhase::Ready);
    assert!(snapshot.is_authenticated());
    assert!(snapshot.network_error.is_some());
    assert!(h.drain().contains(&(
        Level::Warning,
        "Connection problems. Showing your last known session.".to_string()
    )));
}

#[tokio::test]
async fn oauth_redirect_lands_on_dashboard_without_fragment() {
    let h = Harness::new();
    let landing = Url::parse(
        "https://portal.example.com/dashboard#access_token=oauth-token&expires_in=3600&token_type=bearer",
    )
    .unwrap();

    let outcome = h.service.initialize(Some(&landing)).await.expect("redirect handled");
    assert_eq!(outcome.location.as_str(), "https://portal.example.com/dashboard");
    assert!(outcome.location.fragment().is_none());
    assert_eq!(outcome.navigate_to, "/dashboard");

    let snapshot = h.service.settled().await;
    assert_eq!(snapshot.phase, BootstrapPhase::Ready);
    assert_eq!(
        snapshot.profile.map(|p| p.display_name().to_string()),
        Some("Olive Auth".to_string())
    );
    assert_eq!(h.profiles.len(), 1);
}

#[tokio::test]
async fn oauth_url_points_back_to_dashboard() {
    let h = Harness::new();
    let origin = Url::parse("https://portal.example.com/login").unwrap();
    let url = h
        .service
        .sign_in_with_oauth(OAuthProvider::Google, &origin)
        .unwrap();
    assert!(url.contains("provider=google"));
    assert!(url.ends_with("redirect_to=https://portal.example.com/dashboard"));
}

#[tokio::test]
async fn profile_update_requires_session() {
    let h = Harness::new();
    h.service.initialize(None).await;
    let err = h
        .service
        .update_profile(ProfileUpdate {
            full_name: Some("New Name".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingSession));
}

/// Delays every call before delegating to the wrapped store
struct SlowStore {
    inner: Arc<MemoryProfileStore>,
    delay: Duration,
}

#[async_trait]
impl ProfileStore for SlowStore {
    async fn find_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_profile(user_id).await
    }

    async fn insert_profile(&self, profile: &NewProfile) -> Result<Profile> {
        tokio::time::sleep(self.delay).await;
        self.inner.insert_profile(profile).await
    }

    async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<Profile> {
        tokio::time::sleep(self.delay).await;
        self.inner.update_profile(user_id, update).await
    }
}

/// Finds nothing once, then never answers again; inserts never answer
#[derive(Default)]
struct StalledStore {
    finds: AtomicUsize,
}

#[async_trait]
impl ProfileStore for StalledStore {
    async fn find_profile(&self, _: &str) -> Result<Option<Profile>> {
        if self.finds.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(None);
        }
        std::future::pending().await
    }

    async fn insert_profile(&self, _: &NewProfile) -> Result<Profile> {
        std::future::pending().await
    }

    async fn update_profile(&self, _: &str, _: &ProfileUpdate) -> Result<Profile> {
        std::future::pending().await
    }
}

/// Has no rows and rejects every write
struct RejectingStore;

#[async_trait]
impl ProfileStore for RejectingStore {
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

fn doctor_profile(id: &str) -> Profile {
    Profile {
        id: id.into(),
        full_name: Some("Dr. Olive Auth".into()),
        user_type: UserType::Doctor,
        email: None,
        avatar_url: None,
        created_at: None,
        updated_at: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oauth_redirect_sends_professional_to_organization_home() {
    let profiles = Arc::new(MemoryProfileStore::new().with_profile(doctor_profile("oauth-user")));
    let store = Arc::new(SlowStore {
        inner: profiles.clone(),
        delay: Duration::from_millis(50),
    });
    let h = Harness::with_store(profiles.clone(), store);
    let landing = Url::parse(
        "https://portal.example.com/dashboard#access_token=t1&expires_in=3600&token_type=bearer",
    )
    .unwrap();

    let outcome = h.service.initialize(Some(&landing)).await.expect("redirect handled");
    assert_eq!(outcome.navigate_to, "/organization-dashboard");

    let snapshot = h.service.snapshot().await;
    assert_eq!(snapshot.phase, BootstrapPhase::Ready);
    assert_eq!(snapshot.effective_user_type(), Some(UserType::Doctor));
    assert_eq!(profiles.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stalled_profile_store_cannot_keep_sign_in_loading() {
    let profiles = Arc::new(MemoryProfileStore::new());
    let mut h = Harness::with_store(profiles, Arc::new(StalledStore::default()));
    h.identity.add_account("jane@example.com", "secret1", json!({}));

    let started = tokio::time::Instant::now();
    let snapshot = h
        .service
        .sign_in_with_email("jane@example.com", "secret1")
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(!snapshot.is_loading());
    assert!(elapsed <= Duration::from_secs(10), "took {:?}", elapsed);
    assert!(snapshot.is_authenticated());
    assert!(snapshot.network_error.is_some());
    assert_eq!(
        RouteGuard::default().evaluate("/records", &snapshot),
        GuardDecision::Allow(Route::Records)
    );
    assert!(h.drain().contains(&(
        Level::Warning,
        "Loading took too long. Please check your connection.".to_string()
    )));
}

#[tokio::test]
async fn profile_store_failure_falls_back_to_patient_access() {
    let profiles = Arc::new(MemoryProfileStore::new());
    let mut h = Harness::with_store(profiles, Arc::new(RejectingStore));
    h.identity.add_account(
        "lab@example.com",
        "secret1",
        json!({"full_name": "Lab Tech", "user_type": "laboratory"}),
    );
    h.service.initialize(None).await;

    let snapshot = h
        .service
        .sign_in_with_email("lab@example.com", "secret1")
        .await
        .unwrap();
    // let the listener see the sign-in event
    tokio::task::yield_now().await;

    assert_eq!(snapshot.phase, BootstrapPhase::Ready);
    assert!(snapshot.profile.is_none());
    assert!(snapshot.profile_error.is_some());
    assert_eq!(snapshot.effective_user_type(), Some(UserType::Patient));

    let errors: Vec<_> = h
        .drain()
        .into_iter()
        .filter(|(level, _)| *level == Level::Error)
        .collect();
    assert_eq!(
        errors,
        vec![(
            Level::Error,
            "Could not load your profile. Continuing with patient access.".to_string()
        )]
    );

    let guard = RouteGuard::default();
    assert_eq!(
        guard.evaluate("/records", &snapshot),
        GuardDecision::Allow(Route::Records)
    );
    assert_eq!(
        guard.evaluate("/organization-profile", &snapshot),
        GuardDecision::Redirect {
            to: "/dashboard".into(),
            from: None
        }
    );
}

#[tokio::test(start_paused = true)]
async fn sign_out_during_sign_in_suppresses_success_toast() {
    let profiles = Arc::new(MemoryProfileStore::new());
    let store = Arc::new(SlowStore {
        inner: profiles.clone(),
        delay: Duration::from_millis(50),
    });
    let mut h = Harness::with_store(profiles, store);
    h.identity.add_account("jane@example.com", "secret1", json!({}));
    h.service.initialize(None).await;

    let service = h.service.clone();
    let sign_in = tokio::spawn(async move {
        service
            .sign_in_with_email("jane@example.com", "secret1")
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.service.sign_out().await;

    let snapshot = sign_in.await.unwrap().unwrap();
    assert!(snapshot.user.is_none());
    assert!(!h.service.snapshot().await.is_authenticated());
    let toasts = h.drain();
    assert!(
        !toasts.contains(&(Level::Success, "Signed in successfully".to_string())),
        "{:?}",
        toasts
    );
}
