//! Routing surface and role-based route guard

use std::fmt;

use crate::bootstrap::{AuthSnapshot, BootstrapPhase};
use crate::profile::{UserType, PATIENT_HOME};

pub const LOGIN_PATH: &str = "/login";

/// Pages of the portal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Landing,
    Login,
    Dashboard,
    Reports,
    Consultations,
    Providers,
    Medications,
    Appointments,
    Records,
    OrganizationDashboard,
    OrganizationProfile,
}

impl Route {
    pub const ALL: [Route; 11] = [
        Route::Landing,
        Route::Login,
        Route::Dashboard,
        Route::Reports,
        Route::Consultations,
        Route::Providers,
        Route::Medications,
        Route::Appointments,
        Route::Records,
        Route::OrganizationDashboard,
        Route::OrganizationProfile,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            Route::Landing => "/",
            Route::Login => LOGIN_PATH,
            Route::Dashboard => PATIENT_HOME,
            Route::Reports => "/reports",
            Route::Consultations => "/consultations",
            Route::Providers => "/providers",
            Route::Medications => "/medications",
            Route::Appointments => "/appointments",
            Route::Records => "/records",
            Route::OrganizationDashboard => "/organization-dashboard",
            Route::OrganizationProfile => "/organization-profile",
        }
    }

    /// Match a location path, ignoring query, fragment and a trailing slash
    pub fn from_path(path: &str) -> Option<Route> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let path = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };
        Route::ALL.iter().copied().find(|r| r.path() == path)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Who may open a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Public,
    Roles(Vec<UserType>),
}

impl Access {
    pub fn patients() -> Self {
        Access::Roles(vec![UserType::Patient])
    }

    pub fn professionals() -> Self {
        Access::Roles(
            UserType::ALL
                .iter()
                .copied()
                .filter(UserType::is_professional)
                .collect(),
        )
    }

    pub fn allows(&self, user_type: UserType) -> bool {
        match self {
            Access::Public => true,
            Access::Roles(roles) => roles.contains(&user_type),
        }
    }
}

/// Path → access mapping
#[derive(Debug, Clone)]
pub struct RouteTable {
    entries: Vec<(Route, Access)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn with_route(mut self, route: Route, access: Access) -> Self {
        self.entries.retain(|(r, _)| *r != route);
        self.entries.push((route, access));
        self
    }

    /// The portal's routes
    pub fn standard() -> Self {
        Self::new()
            .with_route(Route::Landing, Access::Public)
            .with_route(Route::Login, Access::Public)
            .with_route(Route::Dashboard, Access::patients())
            .with_route(Route::Reports, Access::patients())
            .with_route(Route::Consultations, Access::patients())
            .with_route(Route::Providers, Access::patients())
            .with_route(Route::Medications, Access::patients())
            .with_route(Route::Appointments, Access::patients())
            .with_route(Route::Records, Access::patients())
            .with_route(Route::OrganizationDashboard, Access::professionals())
            .with_route(Route::OrganizationProfile, Access::professionals())
    }

    pub fn access(&self, route: Route) -> Option<&Access> {
        self.entries
            .iter()
            .find(|(r, _)| *r == route)
            .map(|(_, access)| access)
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// What to do with a navigation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Bootstrap still running; show the loading screen
    Loading,
    /// Session could not be checked; show retry and sign-out actions
    ConnectionError,
    Allow(Route),
    /// `from` is the requested location when it should be restored after login
    Redirect { to: String, from: Option<String> },
    NotFound,
}

/// Evaluates navigations against a [`RouteTable`]
#[derive(Debug, Clone, Default)]
pub struct RouteGuard {
    table: RouteTable,
}

impl RouteGuard {
    pub fn new(table: RouteTable) -> Self {
        Self { table }
    }

    pub fn evaluate(&self, path: &str, auth: &AuthSnapshot) -> GuardDecision {
        let route = match Route::from_path(path) {
            Some(route) => route,
            None => return GuardDecision::NotFound,
        };
        let access = match self.table.access(route) {
            Some(access) => access,
            None => return GuardDecision::NotFound,
        };

        if let Access::Public = access {
            if route == Route::Login && !auth.is_loading() {
                if let Some(user_type) = auth.effective_user_type() {
                    return GuardDecision::Redirect {
                        to: user_type.home_path().to_string(),
                        from: None,
                    };
                }
            }
            return GuardDecision::Allow(route);
        }

        if auth.is_loading() {
            return GuardDecision::Loading;
        }
        if auth.phase == BootstrapPhase::NetworkError {
            return GuardDecision::ConnectionError;
        }

        let user_type = match auth.effective_user_type() {
            Some(user_type) => user_type,
            None => {
                return GuardDecision::Redirect {
                    to: LOGIN_PATH.to_string(),
                    from: Some(path.to_string()),
                }
            }
        };

        if access.allows(user_type) {
            GuardDecision::Allow(route)
        } else {
            log::debug!("{} may not open {}, redirecting", user_type, route);
            GuardDecision::Redirect {
                to: user_type.home_path().to_string(),
                from: None,
            }
        }
    }

    /// Where to go after signing in: the remembered location if the user may
    /// open it, otherwise their dashboard.
    pub fn post_login_target(&self, from: Option<&str>, auth: &AuthSnapshot) -> String {
        let home = auth
            .effective_user_type()
            .map_or(LOGIN_PATH, |t| t.home_path());
        match from {
            Some(from) => match self.evaluate(from, auth) {
                GuardDecision::Allow(Route::Landing) | GuardDecision::Allow(Route::Login) => {
                    home.to_string()
                }
                GuardDecision::Allow(_) => from.to_string(),
                _ => home.to_string(),
            },
            None => home.to_string(),
        }
    }
}
