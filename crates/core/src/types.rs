use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle event describing something that happened to a campaign or one
/// of its enrollments. Consumed by reporting and activity feeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub campaign_id: Uuid,
    pub enrollment_id: Option<Uuid>,
    pub account_id: Option<String>,
    pub step_order: Option<u32>,
    pub detail: Option<String>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

impl AnalyticsEvent {
    pub fn with_step(mut self, step_order: u32) -> Self {
        self.step_order = Some(step_order);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Enrollment events
    EnrollmentCreated,
    EnrollmentSkipped,
    EnrollmentPaused,
    EnrollmentResumed,
    EnrollmentCompleted,
    EnrollmentExited,
    EnrollmentFailed,
    // Step events
    StepExecuted,
    StepDispatchFailed,
    // Campaign events
    CampaignCreated,
    CampaignActivated,
    CampaignStatusChanged,
    CampaignDeleted,
}
