//! View models for the portal pages
//!
//! List pages are backed by the sample [`Catalog`] shipped with the crate;
//! dashboards combine it with the signed-in profile.

mod dashboard;

use serde::Deserialize;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::profile::UserType;

pub use dashboard::*;

const CATALOG_JSON: &str = include_str!("../../data/catalog.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MedicationStatus {
    Active,
    RefillNeeded,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Medication {
    pub id: u32,
    pub name: String,
    pub dosage: String,
    pub frequency: String,
    pub refill_date: String,
    pub status: MedicationStatus,
    pub instructions: String,
    pub prescribed_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Upcoming,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: u32,
    pub doctor_name: String,
    pub specialty: String,
    pub date: String,
    pub time: String,
    pub location: String,
    pub status: AppointmentStatus,
    #[serde(rename = "virtual")]
    pub is_virtual: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Verified,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicalRecord {
    pub id: u32,
    pub title: String,
    pub category: String,
    pub date: String,
    pub provider: String,
    pub status: RecordStatus,
    pub file_type: String,
    pub file_size: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsultationStatus {
    Scheduled,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consultation {
    pub id: String,
    pub doctor_name: String,
    pub doctor_specialty: String,
    pub date: String,
    pub time: String,
    pub duration: String,
    pub status: ConsultationStatus,
    pub is_video: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Connected,
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: UserType,
    #[serde(default)]
    pub specialty: Option<String>,
    pub address: String,
    pub phone: String,
    pub distance: String,
    pub status: ConnectionStatus,
}

/// Filter of the medications page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MedicationFilter {
    #[default]
    All,
    Active,
    Refill,
    Completed,
}

impl FromStr for MedicationFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "active" => Ok(Self::Active),
            "refill" => Ok(Self::Refill),
            "completed" => Ok(Self::Completed),
            other => Err(Error::validation(format!("Unknown medication filter: {}", other))),
        }
    }
}

/// Filter of the appointments page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppointmentFilter {
    #[default]
    All,
    Upcoming,
    Completed,
    Cancelled,
}

impl FromStr for AppointmentFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "upcoming" => Ok(Self::Upcoming),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::validation(format!("Unknown appointment filter: {}", other))),
        }
    }
}

/// Filter of the records page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordFilter {
    #[default]
    All,
    Verified,
    Pending,
}

impl FromStr for RecordFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "verified" => Ok(Self::Verified),
            "pending" => Ok(Self::Pending),
            other => Err(Error::validation(format!("Unknown record filter: {}", other))),
        }
    }
}

/// Tab of the consultations page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsultationTab {
    #[default]
    Upcoming,
    Past,
}

impl FromStr for ConsultationTab {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upcoming" => Ok(Self::Upcoming),
            "past" => Ok(Self::Past),
            other => Err(Error::validation(format!("Unknown consultation tab: {}", other))),
        }
    }
}

/// Tab of the providers page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderTab {
    #[default]
    All,
    Doctors,
    Clinics,
    Pharmacies,
    Laboratories,
}

impl ProviderTab {
    fn admits(&self, provider_type: UserType) -> bool {
        match self {
            ProviderTab::All => true,
            ProviderTab::Doctors => provider_type == UserType::Doctor,
            ProviderTab::Clinics => provider_type == UserType::Clinic,
            ProviderTab::Pharmacies => provider_type == UserType::Pharmacy,
            ProviderTab::Laboratories => provider_type == UserType::Laboratory,
        }
    }
}

impl FromStr for ProviderTab {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "doctors" => Ok(Self::Doctors),
            "clinics" => Ok(Self::Clinics),
            "pharmacies" => Ok(Self::Pharmacies),
            "laboratories" => Ok(Self::Laboratories),
            other => Err(Error::validation(format!("Unknown provider tab: {}", other))),
        }
    }
}

/// Case-insensitive substring match over `fields`; a blank query matches everything
fn matches_query(fields: &[&str], query: &str) -> bool {
    let query = query.trim().to_lowercase();
    query.is_empty() || fields.iter().any(|f| f.to_lowercase().contains(&query))
}

/// Sample data behind the list pages
#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    pub medications: Vec<Medication>,
    pub appointments: Vec<Appointment>,
    pub records: Vec<MedicalRecord>,
    pub consultations: Vec<Consultation>,
    pub providers: Vec<Provider>,
}

impl Catalog {
    /// The catalog bundled with the crate
    pub fn bundled() -> Result<Self> {
        Self::from_json(CATALOG_JSON)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn medications(&self, filter: MedicationFilter) -> Vec<&Medication> {
        self.medications
            .iter()
            .filter(|m| match filter {
                MedicationFilter::All => true,
                MedicationFilter::Active => m.status == MedicationStatus::Active,
                MedicationFilter::Refill => m.status == MedicationStatus::RefillNeeded,
                MedicationFilter::Completed => m.status == MedicationStatus::Completed,
            })
            .collect()
    }

    pub fn appointments(&self, filter: AppointmentFilter) -> Vec<&Appointment> {
        self.appointments
            .iter()
            .filter(|a| match filter {
                AppointmentFilter::All => true,
                AppointmentFilter::Upcoming => a.status == AppointmentStatus::Upcoming,
                AppointmentFilter::Completed => a.status == AppointmentStatus::Completed,
                AppointmentFilter::Cancelled => a.status == AppointmentStatus::Cancelled,
            })
            .collect()
    }

    /// Records by status, then by a search over title, category and provider
    pub fn records(&self, filter: RecordFilter, query: &str) -> Vec<&MedicalRecord> {
        self.records
            .iter()
            .filter(|r| match filter {
                RecordFilter::All => true,
                RecordFilter::Verified => r.status == RecordStatus::Verified,
                RecordFilter::Pending => r.status == RecordStatus::Pending,
            })
            .filter(|r| matches_query(&[r.title.as_str(), r.category.as_str(), r.provider.as_str()], query))
            .collect()
    }

    /// Scheduled consultations are upcoming; everything else is past
    pub fn consultations(&self, tab: ConsultationTab) -> Vec<&Consultation> {
        self.consultations
            .iter()
            .filter(|c| {
                let upcoming = c.status == ConsultationStatus::Scheduled;
                match tab {
                    ConsultationTab::Upcoming => upcoming,
                    ConsultationTab::Past => !upcoming,
                }
            })
            .collect()
    }

    /// Providers by tab, then by a search over name, specialty and address
    pub fn providers(&self, tab: ProviderTab, query: &str) -> Vec<&Provider> {
        self.providers
            .iter()
            .filter(|p| tab.admits(p.provider_type))
            .filter(|p| {
                matches_query(
                    &[
                        p.name.as_str(),
                        p.specialty.as_deref().unwrap_or_default(),
                        p.address.as_str(),
                    ],
                    query,
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog::bundled().unwrap()
    }

    #[test]
    fn medication_filters() {
        let catalog = catalog();
        assert_eq!(catalog.medications(MedicationFilter::All).len(), 4);
        assert_eq!(catalog.medications(MedicationFilter::Active).len(), 2);
        let refill = catalog.medications(MedicationFilter::Refill);
        assert_eq!(refill.len(), 1);
        assert_eq!(refill[0].name, "Atorvastatin");
        assert_eq!(catalog.medications(MedicationFilter::Completed).len(), 1);
    }

    #[test]
    fn appointment_filters() {
        let catalog = catalog();
        assert_eq!(catalog.appointments(AppointmentFilter::Upcoming).len(), 2);
        let cancelled = catalog.appointments(AppointmentFilter::Cancelled);
        assert_eq!(cancelled[0].doctor_name, "Dr. James Wilson");
        assert!(catalog.appointments(AppointmentFilter::All)[1].is_virtual);
    }

    #[test]
    fn record_search_is_case_insensitive() {
        let catalog = catalog();
        let hits = catalog.records(RecordFilter::All, "  LAB report ");
        assert_eq!(hits.len(), 2);

        let hits = catalog.records(RecordFilter::Pending, "heart");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Cardiac Stress Test");

        assert_eq!(catalog.records(RecordFilter::Verified, "").len(), 3);
        assert!(catalog.records(RecordFilter::All, "xray").is_empty());
    }

    #[test]
    fn consultation_tabs() {
        let catalog = catalog();
        assert_eq!(catalog.consultations(ConsultationTab::Upcoming).len(), 2);
        assert_eq!(catalog.consultations(ConsultationTab::Past).len(), 3);
    }

    #[test]
    fn provider_tabs_and_search() {
        let catalog = catalog();
        assert_eq!(catalog.providers(ProviderTab::All, "").len(), 5);
        assert_eq!(catalog.providers(ProviderTab::Doctors, "").len(), 2);
        assert_eq!(catalog.providers(ProviderTab::Doctors, "derm").len(), 1);

        // The pharmacy has no specialty but still matches on address
        let hits = catalog.providers(ProviderTab::All, "medicine ave");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].provider_type, UserType::Pharmacy);
    }

    #[test]
    fn filters_parse_from_cli_names() {
        assert_eq!("refill".parse::<MedicationFilter>().unwrap(), MedicationFilter::Refill);
        assert_eq!("past".parse::<ConsultationTab>().unwrap(), ConsultationTab::Past);
        assert!("archived".parse::<RecordFilter>().is_err());
    }
}
