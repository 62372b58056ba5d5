//! Step Template Store: validated, ordered step definitions per campaign.

use std::sync::Arc;

use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::store::CampaignStore;
use crate::types::{BranchAction, CampaignStep, NewStep, StepConfig};

/// Longest delay a single step may carry.
pub const MAX_STEP_DELAY_DAYS: u32 = 3650;

/// A campaign's steps in `step_order` order.
#[derive(Debug, Clone, Default)]
pub struct StepSequence {
    steps: Vec<CampaignStep>,
}

impl StepSequence {
    pub fn new(mut steps: Vec<CampaignStep>) -> Self {
        steps.sort_by_key(|s| s.step_order);
        Self { steps }
    }

    pub fn first(&self) -> Option<&CampaignStep> {
        self.steps.first()
    }

    pub fn by_id(&self, id: Uuid) -> Option<&CampaignStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn by_order(&self, step_order: u32) -> Option<&CampaignStep> {
        self.steps.iter().find(|s| s.step_order == step_order)
    }

    /// The step immediately after `step_order`, if any.
    pub fn after(&self, step_order: u32) -> Option<&CampaignStep> {
        self.steps.iter().find(|s| s.step_order > step_order)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn into_vec(self) -> Vec<CampaignStep> {
        self.steps
    }
}

/// Validate one step definition that will sit at `step_order` in a
/// sequence of `total` steps.
pub fn validate_step(step: &NewStep, step_order: u32, total: u32) -> CampaignResult<()> {
    if step.name.trim().is_empty() {
        return Err(CampaignError::Validation(format!(
            "step {step_order} has an empty name"
        )));
    }
    let delay_hours = u64::from(step.delay_days) * 24 + u64::from(step.delay_hours);
    if delay_hours > u64::from(MAX_STEP_DELAY_DAYS) * 24 {
        return Err(CampaignError::Validation(format!(
            "step {step_order} delay exceeds {MAX_STEP_DELAY_DAYS} days"
        )));
    }
    match &step.config {
        StepConfig::Email(email) => {
            if email.subject.trim().is_empty() || email.body.trim().is_empty() {
                return Err(CampaignError::Validation(format!(
                    "email step {step_order} needs a subject and a body"
                )));
            }
        }
        StepConfig::Task(task) => {
            if task.title.trim().is_empty() {
                return Err(CampaignError::Validation(format!(
                    "task step {step_order} needs a title"
                )));
            }
        }
        StepConfig::Wait => {}
        StepConfig::Condition(condition) => {
            if condition.rule.attribute.trim().is_empty() {
                return Err(CampaignError::Validation(format!(
                    "condition step {step_order} has no attribute"
                )));
            }
            for branch in [&condition.on_match, &condition.otherwise] {
                if let BranchAction::GoTo { step_order: target } = branch {
                    if *target == step_order {
                        return Err(CampaignError::Validation(format!(
                            "condition step {step_order} branches to itself"
                        )));
                    }
                    if *target == 0 || *target > total {
                        return Err(CampaignError::Validation(format!(
                            "condition step {step_order} branches to unknown step {target}"
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Turn step definitions into stored steps with contiguous 1-based order.
pub fn build_steps(
    campaign_id: Uuid,
    steps: Vec<NewStep>,
    now: DateTime<Utc>,
) -> CampaignResult<Vec<CampaignStep>> {
    let total = steps.len() as u32;
    steps
        .into_iter()
        .enumerate()
        .map(|(i, step)| {
            let step_order = i as u32 + 1;
            validate_step(&step, step_order, total)?;
            Ok(CampaignStep {
                id: Uuid::new_v4(),
                campaign_id,
                step_order,
                name: step.name,
                config: step.config,
                delay_days: step.delay_days,
                delay_hours: step.delay_hours,
                created_at: now,
            })
        })
        .collect()
}

/// Read access to step templates plus appending new ones.
#[derive(Clone)]
pub struct StepTemplates {
    store: Arc<dyn CampaignStore>,
}

impl StepTemplates {
    pub fn new(store: Arc<dyn CampaignStore>) -> Self {
        Self { store }
    }

    pub async fn sequence(&self, campaign_id: Uuid) -> CampaignResult<StepSequence> {
        Ok(StepSequence::new(self.store.list_steps(campaign_id).await?))
    }

    pub async fn first_step(&self, campaign_id: Uuid) -> CampaignResult<Option<CampaignStep>> {
        Ok(self.sequence(campaign_id).await?.first().cloned())
    }

    /// Append a step at the end of the campaign's sequence. Rejected once
    /// any account is live in the campaign.
    pub async fn add_step(&self, campaign_id: Uuid, step: NewStep) -> CampaignResult<CampaignStep> {
        let existing = self.sequence(campaign_id).await?;
        let step_order = existing.len() as u32 + 1;
        validate_step(&step, step_order, step_order)?;

        let step = CampaignStep {
            id: Uuid::new_v4(),
            campaign_id,
            step_order,
            name: step.name,
            config: step.config,
            delay_days: step.delay_days,
            delay_hours: step.delay_hours,
            created_at: Utc::now(),
        };
        self.store.append_step(step.clone()).await?;
        info!(
            campaign_id = %campaign_id,
            step_order,
            step_type = %step.step_type(),
            "Step appended"
        );
        Ok(step)
    }
}
