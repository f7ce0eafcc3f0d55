use super::{AppointmentStatus, Catalog, ConnectionStatus, ConsultationStatus};
use crate::profile::{Organization, Profile, UserType};
use crate::routes::Route;

/// Summary cards of the patient home
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientDashboard {
    pub greeting: String,
    pub upcoming_appointments: usize,
    pub recent_reports: usize,
    pub pending_consultations: usize,
    pub connected_providers: usize,
}

impl PatientDashboard {
    /// `reports` is the number of stored reports when known; otherwise the
    /// sample records are counted.
    pub fn build(profile: Option<&Profile>, catalog: &Catalog, reports: Option<usize>) -> Self {
        let name = profile.map_or("User", Profile::display_name);
        Self {
            greeting: format!("Welcome back, {}", name),
            upcoming_appointments: catalog
                .appointments
                .iter()
                .filter(|a| a.status == AppointmentStatus::Upcoming)
                .count(),
            recent_reports: reports.unwrap_or(catalog.records.len()),
            pending_consultations: catalog
                .consultations
                .iter()
                .filter(|c| c.status == ConsultationStatus::Scheduled)
                .count(),
            connected_providers: catalog
                .providers
                .iter()
                .filter(|p| p.status == ConnectionStatus::Connected)
                .count(),
        }
    }
}

/// Header and setup state of the organization home
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationDashboard {
    pub title: &'static str,
    pub greeting: String,
    /// Shown until an organization record exists
    pub needs_setup: bool,
    pub setup_route: Route,
}

impl OrganizationDashboard {
    pub fn build(profile: Option<&Profile>, organization: Option<&Organization>) -> Self {
        let title = match profile.map(|p| p.user_type) {
            Some(UserType::Doctor) => "Doctor Dashboard",
            Some(UserType::Clinic) => "Clinic Dashboard",
            Some(UserType::Pharmacy) => "Pharmacy Dashboard",
            Some(UserType::Laboratory) => "Laboratory Dashboard",
            _ => "Professional Dashboard",
        };
        let greeting = match organization.map(|o| o.name.trim()).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => {
                let name = profile
                    .and_then(|p| p.full_name.as_deref())
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or("Professional");
                format!("Welcome, {}", name)
            }
        };

        Self {
            title,
            greeting,
            needs_setup: organization.is_none(),
            setup_route: Route::OrganizationProfile,
        }
    }
}
