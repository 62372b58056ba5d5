use std::collections::HashMap;
use std::fmt;

use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Campaign ──────────────────────────────────────────────────────────────

/// An outreach campaign: an ordered step sequence that accounts are enrolled into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub trigger: CampaignTrigger,
    /// Structured audience filter. Opaque to the engine.
    pub trigger_conditions: serde_json::Value,
    pub status: CampaignStatus,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

impl CampaignStatus {
    /// Accounts may only be enrolled into draft or active campaigns.
    pub fn is_enrollable(&self) -> bool {
        matches!(self, Self::Draft | Self::Active)
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

/// What brings accounts into a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum CampaignTrigger {
    Manual,
    Event { event_type: String },
}

// ─── Steps ─────────────────────────────────────────────────────────────────

/// One unit of the outreach sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStep {
    pub id: Uuid,
    pub campaign_id: Uuid,
    /// 1-based, unique and contiguous within the campaign.
    pub step_order: u32,
    pub name: String,
    pub config: StepConfig,
    pub delay_days: u32,
    pub delay_hours: u32,
    pub created_at: DateTime<Utc>,
}

impl CampaignStep {
    pub fn step_type(&self) -> StepType {
        self.config.step_type()
    }

    pub fn delay(&self) -> Duration {
        Duration::hours(i64::from(self.delay_days) * 24 + i64::from(self.delay_hours))
    }

    /// Time at which this step becomes due when the enrollment enters (or
    /// resumes at) it at `entered_at`.
    pub fn due_from(&self, entered_at: DateTime<Utc>) -> CampaignResult<DateTime<Utc>> {
        entered_at.checked_add_signed(self.delay()).ok_or_else(|| {
            CampaignError::Validation(format!(
                "step {} delay of {}d {}h is out of range",
                self.step_order, self.delay_days, self.delay_hours
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Email,
    Task,
    Wait,
    Condition,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Task => write!(f, "task"),
            Self::Wait => write!(f, "wait"),
            Self::Condition => write!(f, "condition"),
        }
    }
}

/// Typed step payload, keyed by step type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StepConfig {
    Email(EmailConfig),
    Task(TaskConfig),
    Wait,
    Condition(ConditionConfig),
}

impl StepConfig {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::Email(_) => StepType::Email,
            Self::Task(_) => StepType::Task,
            Self::Wait => StepType::Wait,
            Self::Condition(_) => StepType::Condition,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailConfig {
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Branch on the current account state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub rule: ConditionRule,
    pub on_match: BranchAction,
    pub otherwise: BranchAction,
}

/// Compares one account attribute against a literal.
///
/// `attribute` is either a built-in field (`health_score`, `name`) or a key
/// in the account's free-form attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRule {
    pub attribute: String,
    pub operator: Comparison,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Exists,
    Missing,
}

/// Where an enrollment goes after a condition step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum BranchAction {
    /// Continue with the next sequential step.
    Next,
    /// Jump to the step with this order.
    GoTo { step_order: u32 },
    /// Leave the campaign early.
    Exit {
        #[serde(default)]
        reason: Option<String>,
    },
}

// ─── Enrollment ────────────────────────────────────────────────────────────

/// The binding of one account to one campaign's step sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignEnrollment {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub account_id: String,
    pub status: EnrollmentStatus,
    /// `None` once the sequence has been run off, or when the campaign has
    /// no steps.
    pub current_step_id: Option<Uuid>,
    pub current_step_order: u32,
    pub next_step_due: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_step_executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    /// Consecutive failed attempts at the current step.
    pub dispatch_attempts: u32,
    pub last_error: Option<String>,
    /// Bumped by the store on every committed write.
    pub version: u64,
}

impl CampaignEnrollment {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EnrollmentStatus::Active
            && self.next_step_due.map(|due| due <= now).unwrap_or(false)
    }
}

/// Runtime status of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Exited,
    /// Dead-lettered after exhausting dispatch attempts.
    Failed,
}

impl EnrollmentStatus {
    /// Live enrollments block re-enrollment of the same account.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Exited | Self::Failed)
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Exited => write!(f, "exited"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ─── Accounts ──────────────────────────────────────────────────────────────

/// Read-only snapshot of a customer account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub health_score: Option<f64>,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl Account {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            health_score: None,
            attributes: HashMap::new(),
        }
    }

    pub fn with_health_score(mut self, score: f64) -> Self {
        self.health_score = Some(score);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

// ─── Requests / results ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger: CampaignTrigger,
    #[serde(default)]
    pub trigger_conditions: serde_json::Value,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub steps: Vec<NewStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStep {
    pub name: String,
    pub config: StepConfig,
    #[serde(default)]
    pub delay_days: u32,
    #[serde(default)]
    pub delay_hours: u32,
}

impl NewStep {
    pub fn new(name: impl Into<String>, config: StepConfig) -> Self {
        Self {
            name: name.into(),
            config,
            delay_days: 0,
            delay_hours: 0,
        }
    }

    pub fn after(mut self, delay_days: u32, delay_hours: u32) -> Self {
        self.delay_days = delay_days;
        self.delay_hours = delay_hours;
        self
    }
}

/// Partial campaign update. Only supplied fields change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<CampaignStatus>,
    pub trigger_conditions: Option<serde_json::Value>,
}

/// Outcome of an enroll call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollmentResult {
    pub enrolled: u32,
    pub skipped: u32,
    pub enrollments: Vec<CampaignEnrollment>,
}

/// Enrollment counts partitioned by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentCounts {
    pub active: u64,
    pub paused: u64,
    pub completed: u64,
    pub exited: u64,
    pub failed: u64,
}

impl EnrollmentCounts {
    pub fn from_enrollments<'a>(enrollments: impl IntoIterator<Item = &'a CampaignEnrollment>) -> Self {
        let mut counts = Self::default();
        for enrollment in enrollments {
            match enrollment.status {
                EnrollmentStatus::Active => counts.active += 1,
                EnrollmentStatus::Paused => counts.paused += 1,
                EnrollmentStatus::Completed => counts.completed += 1,
                EnrollmentStatus::Exited => counts.exited += 1,
                EnrollmentStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> u64 {
        self.active + self.paused + self.completed + self.exited + self.failed
    }
}

/// A campaign with its steps, enrollments, and status counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignWithStats {
    pub campaign: Campaign,
    pub steps: Vec<CampaignStep>,
    pub enrollments: Vec<CampaignEnrollment>,
    pub counts: EnrollmentCounts,
}

/// Rows removed by a cascading campaign delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeDeletion {
    pub enrollments: usize,
    pub steps: usize,
}
