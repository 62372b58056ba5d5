//! Outreach dispatchers for email and task steps.
//!
//! Dispatch is at-least-once: the scheduler may repeat a dispatch after a
//! timeout or a lost race, so implementations must deduplicate on
//! `DispatchRequest::idempotency_key`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{Account, EmailConfig, StepType, TaskConfig};

/// Everything a dispatcher needs to act for one enrollment at one step.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub campaign_id: Uuid,
    pub enrollment_id: Uuid,
    pub step_id: Uuid,
    pub step_order: u32,
    pub account: Account,
}

impl DispatchRequest {
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.enrollment_id, self.step_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub idempotency_key: String,
    pub provider_message_id: String,
    /// The key had already been delivered; nothing new was sent.
    pub duplicate: bool,
}

#[async_trait]
pub trait EmailDispatcher: Send + Sync {
    async fn send_email(
        &self,
        request: &DispatchRequest,
        email: &EmailConfig,
    ) -> CampaignResult<DispatchReceipt>;
}

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn create_task(
        &self,
        request: &DispatchRequest,
        task: &TaskConfig,
    ) -> CampaignResult<DispatchReceipt>;
}

/// Substitute `{{account.name}}` and `{{account.id}}` placeholders.
pub fn render_template(text: &str, account: &Account) -> String {
    text.replace("{{account.name}}", &account.name)
        .replace("{{account.id}}", &account.id)
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// How the outbox answers the next dispatch.
#[derive(Debug, Clone)]
pub enum OutboxMode {
    Deliver,
    Fail(String),
    /// Sleep before delivering; used to exercise dispatch timeouts.
    Stall(Duration),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub idempotency_key: String,
    pub kind: StepType,
    pub campaign_id: Uuid,
    pub account_id: String,
    pub step_order: u32,
    pub summary: String,
    pub provider_message_id: String,
    pub recorded_at: DateTime<Utc>,
}

/// In-process dispatcher that records deliveries keyed by enrollment and
/// step. Serves both email and task steps.
pub struct OutboxDispatcher {
    records: DashMap<String, OutboxRecord>,
    mode: Mutex<OutboxMode>,
    attempts: AtomicU64,
}

impl OutboxDispatcher {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            mode: Mutex::new(OutboxMode::Deliver),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn set_mode(&self, mode: OutboxMode) {
        *self.mode.lock() = mode;
    }

    pub fn records(&self) -> Vec<OutboxRecord> {
        let mut records: Vec<OutboxRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        records
    }

    pub fn delivered(&self, kind: StepType) -> usize {
        self.records.iter().filter(|r| r.value().kind == kind).count()
    }

    /// Dispatch calls received, including failed and duplicate ones.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    async fn deliver(
        &self,
        kind: StepType,
        request: &DispatchRequest,
        summary: String,
    ) -> CampaignResult<DispatchReceipt> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let mode = self.mode.lock().clone();
        match mode {
            OutboxMode::Deliver => {}
            OutboxMode::Fail(reason) => return Err(CampaignError::Dispatch(reason)),
            OutboxMode::Stall(delay) => tokio::time::sleep(delay).await,
        }

        let key = request.idempotency_key();
        if let Some(existing) = self.records.get(&key) {
            debug!(idempotency_key = %key, "Duplicate dispatch suppressed");
            return Ok(DispatchReceipt {
                idempotency_key: key,
                provider_message_id: existing.provider_message_id.clone(),
                duplicate: true,
            });
        }

        let provider_message_id = format!("ob-{}", Uuid::new_v4());
        info!(
            kind = %kind,
            account_id = %request.account.id,
            step_order = request.step_order,
            summary = %summary,
            "Outreach dispatched"
        );
        let record = OutboxRecord {
            idempotency_key: key.clone(),
            kind,
            campaign_id: request.campaign_id,
            account_id: request.account.id.clone(),
            step_order: request.step_order,
            summary,
            provider_message_id: provider_message_id.clone(),
            recorded_at: Utc::now(),
        };
        let entry = self.records.entry(key.clone()).or_insert(record);
        Ok(DispatchReceipt {
            idempotency_key: key,
            duplicate: entry.provider_message_id != provider_message_id,
            provider_message_id: entry.provider_message_id.clone(),
        })
    }
}

impl Default for OutboxDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmailDispatcher for OutboxDispatcher {
    async fn send_email(
        &self,
        request: &DispatchRequest,
        email: &EmailConfig,
    ) -> CampaignResult<DispatchReceipt> {
        let subject = render_template(&email.subject, &request.account);
        self.deliver(StepType::Email, request, subject).await
    }
}

#[async_trait]
impl TaskDispatcher for OutboxDispatcher {
    async fn create_task(
        &self,
        request: &DispatchRequest,
        task: &TaskConfig,
    ) -> CampaignResult<DispatchReceipt> {
        let title = render_template(&task.title, &request.account);
        self.deliver(StepType::Task, request, title).await
    }
}
