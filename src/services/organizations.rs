use super::ServiceContext;
use crate::error::{Error, Result};
use crate::profile::{Organization, Profile};

pub const ORGANIZATIONS_TABLE: &str = "organizations";

/// The organization record of professional accounts
#[derive(Clone)]
pub struct OrganizationService {
    ctx: ServiceContext,
}

impl OrganizationService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub async fn for_owner(&self, owner_id: &str) -> Result<Option<Organization>> {
        let result = self
            .ctx
            .table(ORGANIZATIONS_TABLE)
            .select("*")
            .eq("owner_id", owner_id)
            .maybe_single::<Organization>()
            .await;
        result.map_err(|e| {
            log::error!("Error fetching organization for {}: {}", owner_id, e);
            self.ctx.notifications().error("Failed to load organization");
            e
        })
    }

    /// Create or update the organization owned by `profile`.
    ///
    /// Owner and type always come from the profile.
    pub async fn save(&self, mut draft: Organization, profile: &Profile) -> Result<Organization> {
        draft.owner_id = profile.id.clone();
        draft.org_type = profile.user_type;

        let result = match draft.validate() {
            Ok(()) => self.upsert(&draft).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(saved) => {
                self.ctx
                    .notifications()
                    .success("Organization profile updated successfully");
                Ok(saved)
            }
            Err(e) => {
                log::error!("Error saving organization profile: {}", e);
                let message = match &e {
                    Error::Validation(msg) => msg.clone(),
                    _ => "Failed to save organization profile".to_string(),
                };
                self.ctx.notifications().error(message);
                Err(e)
            }
        }
    }

    async fn upsert(&self, draft: &Organization) -> Result<Organization> {
        let rows: Vec<Organization> = self
            .ctx
            .table(ORGANIZATIONS_TABLE)
            .upsert(&[draft], "owner_id")
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::database("Upsert returned no organization"))
    }
}
