//! Durable store interface for campaigns, steps, and enrollments.
//!
//! Every method is one atomic unit. `InMemoryStore` keeps all tables behind a
//! single lock; a relational implementation maps each method onto one
//! transaction and the live-enrollment index onto a partial unique
//! constraint over (campaign, account) where status is active or paused.

use std::collections::HashMap;

use async_trait::async_trait;
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{
    Campaign, CampaignEnrollment, CampaignStatus, CampaignStep, CascadeDeletion,
};

/// In-place campaign mutation applied inside the store's atomic unit.
pub type CampaignPatch = Box<dyn FnOnce(&mut Campaign) -> CampaignResult<()> + Send>;

/// Result of the dedup-check-then-create unit.
#[derive(Debug, Clone)]
pub enum EnrollOutcome {
    Created(CampaignEnrollment),
    /// A live enrollment already exists for the pair; it is returned as is.
    Skipped(CampaignEnrollment),
}

/// Keyset position for paging through due enrollments in
/// (`next_step_due`, `id`) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueCursor {
    pub due: DateTime<Utc>,
    pub id: Uuid,
}

impl DueCursor {
    pub fn after(enrollment: &CampaignEnrollment) -> Option<Self> {
        enrollment.next_step_due.map(|due| Self {
            due,
            id: enrollment.id,
        })
    }
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Insert a campaign together with its steps.
    async fn insert_campaign(&self, campaign: Campaign, steps: Vec<CampaignStep>)
        -> CampaignResult<()>;

    async fn get_campaign(&self, id: Uuid) -> CampaignResult<Option<Campaign>>;

    async fn list_campaigns(&self) -> CampaignResult<Vec<Campaign>>;

    /// Apply `patch` to the stored campaign. The write is discarded if the
    /// patch fails.
    async fn update_campaign(&self, id: Uuid, patch: CampaignPatch) -> CampaignResult<Campaign>;

    /// `draft -> active` compare-and-set. Returns whether the status changed.
    async fn activate_if_draft(&self, id: Uuid, now: DateTime<Utc>) -> CampaignResult<bool>;

    /// Remove all enrollments, then all steps, then the campaign.
    async fn delete_campaign_cascade(&self, id: Uuid) -> CampaignResult<CascadeDeletion>;

    /// Steps of a campaign ordered by `step_order`.
    async fn list_steps(&self, campaign_id: Uuid) -> CampaignResult<Vec<CampaignStep>>;

    /// Append a step at the end of the sequence. Fails with `StepsLocked`
    /// while the campaign has live enrollments.
    async fn append_step(&self, step: CampaignStep) -> CampaignResult<()>;

    /// Insert `enrollment` unless a live one exists for the same
    /// (campaign, account) pair.
    async fn enroll_or_skip(&self, enrollment: CampaignEnrollment)
        -> CampaignResult<EnrollOutcome>;

    async fn get_enrollment(&self, id: Uuid) -> CampaignResult<Option<CampaignEnrollment>>;

    async fn list_enrollments(&self, campaign_id: Uuid) -> CampaignResult<Vec<CampaignEnrollment>>;

    /// Active enrollments with `next_step_due <= now`, strictly after
    /// `after` in (due, id) order.
    async fn due_enrollments(
        &self,
        now: DateTime<Utc>,
        after: Option<DueCursor>,
        limit: usize,
    ) -> CampaignResult<Vec<CampaignEnrollment>>;

    /// Replace the stored enrollment if its version still equals
    /// `expected_version`. Returns the committed record (with its bumped
    /// version), or `None` when another writer got there first.
    async fn compare_and_swap_enrollment(
        &self,
        expected_version: u64,
        updated: CampaignEnrollment,
    ) -> CampaignResult<Option<CampaignEnrollment>>;
}

#[derive(Default)]
struct Tables {
    campaigns: HashMap<Uuid, Campaign>,
    steps: HashMap<Uuid, CampaignStep>,
    enrollments: HashMap<Uuid, CampaignEnrollment>,
    /// Unique index: (campaign, account) -> live enrollment id.
    live: HashMap<(Uuid, String), Uuid>,
}

impl Tables {
    fn has_live_enrollments(&self, campaign_id: Uuid) -> bool {
        self.live.keys().any(|(cid, _)| *cid == campaign_id)
    }

    fn step_count(&self, campaign_id: Uuid) -> usize {
        self.steps
            .values()
            .filter(|s| s.campaign_id == campaign_id)
            .count()
    }
}

/// Thread-safe in-memory store. All tables share one lock, so every trait
/// method is serializable against every other.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        info!("Campaign store initialized (in-memory)");
        Self::default()
    }
}

#[async_trait]
impl CampaignStore for InMemoryStore {
    async fn insert_campaign(
        &self,
        campaign: Campaign,
        steps: Vec<CampaignStep>,
    ) -> CampaignResult<()> {
        let mut tables = self.tables.write();
        if tables.campaigns.contains_key(&campaign.id) {
            return Err(CampaignError::Persistence(format!(
                "campaign {} already exists",
                campaign.id
            )));
        }
        if let Some(stray) = steps.iter().find(|s| s.campaign_id != campaign.id) {
            return Err(CampaignError::Persistence(format!(
                "step {} belongs to campaign {}",
                stray.id, stray.campaign_id
            )));
        }
        for step in steps {
            tables.steps.insert(step.id, step);
        }
        tables.campaigns.insert(campaign.id, campaign);
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> CampaignResult<Option<Campaign>> {
        Ok(self.tables.read().campaigns.get(&id).cloned())
    }

    async fn list_campaigns(&self) -> CampaignResult<Vec<Campaign>> {
        let mut campaigns: Vec<Campaign> =
            self.tables.read().campaigns.values().cloned().collect();
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(campaigns)
    }

    async fn update_campaign(&self, id: Uuid, patch: CampaignPatch) -> CampaignResult<Campaign> {
        let mut tables = self.tables.write();
        let stored = tables
            .campaigns
            .get_mut(&id)
            .ok_or(CampaignError::CampaignNotFound(id))?;
        let mut draft = stored.clone();
        patch(&mut draft)?;
        *stored = draft.clone();
        Ok(draft)
    }

    async fn activate_if_draft(&self, id: Uuid, now: DateTime<Utc>) -> CampaignResult<bool> {
        let mut tables = self.tables.write();
        let campaign = tables
            .campaigns
            .get_mut(&id)
            .ok_or(CampaignError::CampaignNotFound(id))?;
        if campaign.status != CampaignStatus::Draft {
            return Ok(false);
        }
        campaign.status = CampaignStatus::Active;
        campaign.updated_at = now;
        Ok(true)
    }

    async fn delete_campaign_cascade(&self, id: Uuid) -> CampaignResult<CascadeDeletion> {
        let mut tables = self.tables.write();
        if !tables.campaigns.contains_key(&id) {
            return Err(CampaignError::CampaignNotFound(id));
        }

        let before = tables.enrollments.len();
        tables.enrollments.retain(|_, e| e.campaign_id != id);
        tables.live.retain(|(cid, _), _| *cid != id);
        let enrollments = before - tables.enrollments.len();

        let before = tables.steps.len();
        tables.steps.retain(|_, s| s.campaign_id != id);
        let steps = before - tables.steps.len();

        tables.campaigns.remove(&id);
        debug!(campaign_id = %id, enrollments, steps, "Cascade delete committed");
        Ok(CascadeDeletion { enrollments, steps })
    }

    async fn list_steps(&self, campaign_id: Uuid) -> CampaignResult<Vec<CampaignStep>> {
        let mut steps: Vec<CampaignStep> = self
            .tables
            .read()
            .steps
            .values()
            .filter(|s| s.campaign_id == campaign_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_order);
        Ok(steps)
    }

    async fn append_step(&self, step: CampaignStep) -> CampaignResult<()> {
        let mut tables = self.tables.write();
        if !tables.campaigns.contains_key(&step.campaign_id) {
            return Err(CampaignError::CampaignNotFound(step.campaign_id));
        }
        if tables.has_live_enrollments(step.campaign_id) {
            return Err(CampaignError::StepsLocked(step.campaign_id));
        }
        let expected = tables.step_count(step.campaign_id) as u32 + 1;
        if step.step_order != expected {
            return Err(CampaignError::Validation(format!(
                "step order {} is not contiguous, expected {}",
                step.step_order, expected
            )));
        }
        tables.steps.insert(step.id, step);
        Ok(())
    }

    async fn enroll_or_skip(
        &self,
        enrollment: CampaignEnrollment,
    ) -> CampaignResult<EnrollOutcome> {
        let mut tables = self.tables.write();
        if !tables.campaigns.contains_key(&enrollment.campaign_id) {
            return Err(CampaignError::CampaignNotFound(enrollment.campaign_id));
        }

        let key = (enrollment.campaign_id, enrollment.account_id.clone());
        if let Some(existing) = tables.live.get(&key).and_then(|id| tables.enrollments.get(id)) {
            return Ok(EnrollOutcome::Skipped(existing.clone()));
        }

        if enrollment.status.is_live() {
            tables.live.insert(key, enrollment.id);
        }
        tables.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(EnrollOutcome::Created(enrollment))
    }

    async fn get_enrollment(&self, id: Uuid) -> CampaignResult<Option<CampaignEnrollment>> {
        Ok(self.tables.read().enrollments.get(&id).cloned())
    }

    async fn list_enrollments(
        &self,
        campaign_id: Uuid,
    ) -> CampaignResult<Vec<CampaignEnrollment>> {
        let mut enrollments: Vec<CampaignEnrollment> = self
            .tables
            .read()
            .enrollments
            .values()
            .filter(|e| e.campaign_id == campaign_id)
            .cloned()
            .collect();
        enrollments.sort_by(|a, b| a.enrolled_at.cmp(&b.enrolled_at).then(a.id.cmp(&b.id)));
        Ok(enrollments)
    }

    async fn due_enrollments(
        &self,
        now: DateTime<Utc>,
        after: Option<DueCursor>,
        limit: usize,
    ) -> CampaignResult<Vec<CampaignEnrollment>> {
        let tables = self.tables.read();
        let mut due: Vec<CampaignEnrollment> = tables
            .enrollments
            .values()
            .filter(|e| e.is_due(now))
            .filter(|e| match (after, e.next_step_due) {
                (Some(cursor), Some(due)) => (due, e.id) > (cursor.due, cursor.id),
                _ => true,
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_step_due.cmp(&b.next_step_due).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn compare_and_swap_enrollment(
        &self,
        expected_version: u64,
        mut updated: CampaignEnrollment,
    ) -> CampaignResult<Option<CampaignEnrollment>> {
        let mut tables = self.tables.write();
        let stored = tables
            .enrollments
            .get(&updated.id)
            .ok_or(CampaignError::EnrollmentNotFound(updated.id))?;
        if stored.version != expected_version {
            return Ok(None);
        }

        let key = (stored.campaign_id, stored.account_id.clone());
        let was_live = stored.status.is_live();
        if updated.status.is_live() && !was_live {
            if let Some(other) = tables.live.get(&key) {
                return Err(CampaignError::Persistence(format!(
                    "enrollment {} is already live for account {}",
                    other, key.1
                )));
            }
        }

        updated.version = expected_version + 1;
        match (was_live, updated.status.is_live()) {
            (true, false) => {
                tables.live.remove(&key);
            }
            (false, true) => {
                tables.live.insert(key, updated.id);
            }
            _ => {}
        }
        tables.enrollments.insert(updated.id, updated.clone());
        Ok(Some(updated))
    }
}
