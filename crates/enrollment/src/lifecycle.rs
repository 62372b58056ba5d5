//! Campaign Lifecycle Controller: campaign CRUD and enrollment stats.

use std::sync::Arc;

use campaign_core::event_bus::{make_event, EventSink};
use campaign_core::types::EventType;
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::state_machine::check_campaign_transition;
use crate::steps::{build_steps, StepTemplates};
use crate::store::CampaignStore;
use crate::types::{
    Campaign, CampaignStatus, CampaignStep, CampaignUpdate, CampaignWithStats, CascadeDeletion,
    EnrollmentCounts, NewCampaign, NewStep,
};

#[derive(Clone)]
pub struct CampaignLifecycle {
    store: Arc<dyn CampaignStore>,
    steps: StepTemplates,
    event_sink: Arc<dyn EventSink>,
    enforce_status_transitions: bool,
}

impl std::fmt::Debug for CampaignLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampaignLifecycle")
            .field("enforce_status_transitions", &self.enforce_status_transitions)
            .finish()
    }
}

impl CampaignLifecycle {
    pub fn new(store: Arc<dyn CampaignStore>) -> Self {
        Self {
            steps: StepTemplates::new(store.clone()),
            store,
            event_sink: campaign_core::event_bus::noop_sink(),
            enforce_status_transitions: false,
        }
    }

    /// Attach an event sink for lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Validate status writes against the campaign transition table.
    pub fn with_status_transitions(mut self, enforce: bool) -> Self {
        self.enforce_status_transitions = enforce;
        self
    }

    pub async fn create_campaign(&self, new: NewCampaign) -> CampaignResult<CampaignWithStats> {
        self.create_campaign_at(new, Utc::now()).await
    }

    /// Create a draft campaign and its steps in one unit.
    pub async fn create_campaign_at(
        &self,
        new: NewCampaign,
        now: DateTime<Utc>,
    ) -> CampaignResult<CampaignWithStats> {
        if new.name.trim().is_empty() {
            return Err(CampaignError::Validation("campaign name is required".into()));
        }
        let campaign = Campaign {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            trigger: new.trigger,
            trigger_conditions: new.trigger_conditions,
            status: CampaignStatus::Draft,
            owner: new.owner,
            created_at: now,
            updated_at: now,
        };
        let steps = build_steps(campaign.id, new.steps, now)?;

        self.store
            .insert_campaign(campaign.clone(), steps.clone())
            .await?;
        info!(
            campaign_id = %campaign.id,
            name = %campaign.name,
            steps = steps.len(),
            "Campaign created"
        );
        self.event_sink
            .emit(make_event(EventType::CampaignCreated, campaign.id, None, None));

        Ok(CampaignWithStats {
            campaign,
            steps,
            enrollments: Vec::new(),
            counts: EnrollmentCounts::default(),
        })
    }

    pub async fn add_step(&self, campaign_id: Uuid, step: NewStep) -> CampaignResult<CampaignStep> {
        self.steps.add_step(campaign_id, step).await
    }

    pub async fn list_campaigns(&self) -> CampaignResult<Vec<Campaign>> {
        self.store.list_campaigns().await
    }

    /// The campaign with its ordered steps, all enrollments, and counts
    /// computed from the enrollments as they are now.
    pub async fn get_campaign_with_stats(&self, id: Uuid) -> CampaignResult<CampaignWithStats> {
        let campaign = self
            .store
            .get_campaign(id)
            .await?
            .ok_or(CampaignError::CampaignNotFound(id))?;
        let steps = self.steps.sequence(id).await?.into_vec();
        let enrollments = self.store.list_enrollments(id).await?;
        let counts = EnrollmentCounts::from_enrollments(&enrollments);
        Ok(CampaignWithStats {
            campaign,
            steps,
            enrollments,
            counts,
        })
    }

    /// Apply the supplied fields only.
    pub async fn update_campaign(&self, id: Uuid, update: CampaignUpdate) -> CampaignResult<Campaign> {
        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(CampaignError::Validation("campaign name is required".into()));
            }
        }
        let enforce = self.enforce_status_transitions;
        let requested_status = update.status;
        let now = Utc::now();
        let previous_status = Arc::new(Mutex::new(None));

        let updated = {
            let previous = previous_status.clone();
            self.store
                .update_campaign(
                    id,
                    Box::new(move |campaign| {
                        *previous.lock() = Some(campaign.status);
                        if let Some(status) = update.status {
                            if enforce {
                                check_campaign_transition(campaign.status, status)?;
                            }
                            campaign.status = status;
                        }
                        if let Some(name) = update.name {
                            campaign.name = name;
                        }
                        if let Some(description) = update.description {
                            campaign.description = description;
                        }
                        if let Some(conditions) = update.trigger_conditions {
                            campaign.trigger_conditions = conditions;
                        }
                        campaign.updated_at = now;
                        Ok(())
                    }),
                )
                .await?
        };

        let previous_status = *previous_status.lock();
        if let (Some(from), Some(to)) = (previous_status, requested_status) {
            if from != to {
                info!(campaign_id = %id, %from, %to, "Campaign status changed");
                self.event_sink.emit(
                    make_event(EventType::CampaignStatusChanged, id, None, None)
                        .with_detail(format!("{from} -> {to}")),
                );
            }
        }
        Ok(updated)
    }

    /// Remove the campaign with all of its enrollments and steps.
    pub async fn delete_campaign(&self, id: Uuid) -> CampaignResult<CascadeDeletion> {
        let removed = self.store.delete_campaign_cascade(id).await?;
        info!(
            campaign_id = %id,
            enrollments = removed.enrollments,
            steps = removed.steps,
            "Campaign deleted"
        );
        self.event_sink.emit(
            make_event(EventType::CampaignDeleted, id, None, None).with_detail(format!(
                "{} enrollments, {} steps",
                removed.enrollments, removed.steps
            )),
        );
        Ok(removed)
    }
}
