//! Step Scheduler: advances every due enrollment exactly once per sweep.
//!
//! Each enrollment is handled as read, effect, compare-and-swap:
//!
//! 1. the due enrollment is loaded with its version,
//! 2. the current step's effect runs (bounded by the dispatch timeout),
//! 3. the new pointer is committed only if the version is unchanged.
//!
//! A crash between 2 and 3 leaves the pointer where it was, so the effect is
//! repeated on the next sweep and deduplicated by the dispatcher's
//! idempotency key. Two sweeps racing on the same enrollment may both
//! dispatch, but only one commits the advance.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use campaign_core::config::SchedulerConfig;
use campaign_core::event_bus::{make_event, EventSink};
use campaign_core::types::EventType;
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::directory::AccountDirectory;
use crate::dispatch::{DispatchRequest, EmailDispatcher, TaskDispatcher};
use crate::evaluator::ConditionEvaluator;
use crate::state_machine::EnrollmentStateMachine;
use crate::steps::StepSequence;
use crate::store::{CampaignStore, DueCursor};
use crate::types::{
    Account, BranchAction, CampaignEnrollment, CampaignStatus, CampaignStep, EnrollmentStatus,
    StepConfig,
};

/// What happened to one enrollment during a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AdvanceOutcome {
    /// Not active or not yet due.
    NotDue,
    /// The campaign is paused or archived.
    Held,
    Advanced { step_order: u32 },
    Completed,
    Exited,
    /// The effect failed; the same step runs again next sweep.
    Retrying { attempts: u32 },
    /// Dispatch attempts exhausted; the enrollment was dead-lettered.
    Failed,
    /// Another writer committed first; nothing was written.
    Conflict,
}

/// Totals for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: u32,
    pub advanced: u32,
    pub completed: u32,
    pub exited: u32,
    pub retried: u32,
    pub failed: u32,
    pub held: u32,
    pub conflicts: u32,
    /// Enrollments whose processing errored outside the step effect.
    pub errors: u32,
}

impl SweepReport {
    fn record(&mut self, outcome: &AdvanceOutcome) {
        match outcome {
            AdvanceOutcome::NotDue => {}
            AdvanceOutcome::Held => self.held += 1,
            AdvanceOutcome::Advanced { .. } => self.advanced += 1,
            AdvanceOutcome::Completed => self.completed += 1,
            AdvanceOutcome::Exited => self.exited += 1,
            AdvanceOutcome::Retrying { .. } => self.retried += 1,
            AdvanceOutcome::Failed => self.failed += 1,
            AdvanceOutcome::Conflict => self.conflicts += 1,
        }
    }
}

/// Where the enrollment goes after a successful effect.
enum Transition {
    Goto(CampaignStep),
    Complete,
    Exit(Option<String>),
}

#[derive(Clone)]
pub struct StepScheduler {
    store: Arc<dyn CampaignStore>,
    directory: Arc<dyn AccountDirectory>,
    email: Arc<dyn EmailDispatcher>,
    tasks: Arc<dyn TaskDispatcher>,
    evaluator: Arc<dyn ConditionEvaluator>,
    event_sink: Arc<dyn EventSink>,
    config: SchedulerConfig,
}

impl std::fmt::Debug for StepScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepScheduler")
            .field("config", &self.config)
            .finish()
    }
}

impl StepScheduler {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        directory: Arc<dyn AccountDirectory>,
        email: Arc<dyn EmailDispatcher>,
        tasks: Arc<dyn TaskDispatcher>,
        evaluator: Arc<dyn ConditionEvaluator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            directory,
            email,
            tasks,
            evaluator,
            event_sink: campaign_core::event_bus::noop_sink(),
            config,
        }
    }

    /// Attach an event sink for lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub async fn sweep(&self) -> CampaignResult<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Process every enrollment due at `now`. Enrollments are advanced
    /// independently; one failing does not stop the others. Store errors
    /// while paging abort the sweep, leaving the remainder for the next one.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> CampaignResult<SweepReport> {
        let started = Instant::now();
        let mut report = SweepReport::default();
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut cursor: Option<DueCursor> = None;
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        loop {
            let page = self
                .store
                .due_enrollments(now, cursor, self.config.batch_size.max(1))
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = DueCursor::after(last);

            // One step sequence per campaign per page.
            let mut sequences: HashMap<Uuid, Option<Arc<StepSequence>>> = HashMap::new();
            let mut handles = Vec::new();

            for enrollment in page {
                if !seen.insert(enrollment.id) {
                    continue;
                }
                report.examined += 1;

                let sequence = match sequences.get(&enrollment.campaign_id) {
                    Some(cached) => cached.clone(),
                    None => match self.load_sequence(enrollment.campaign_id).await {
                        Ok(loaded) => {
                            sequences.insert(enrollment.campaign_id, loaded.clone());
                            loaded
                        }
                        Err(err) => {
                            report.errors += 1;
                            warn!(
                                enrollment_id = %enrollment.id,
                                campaign_id = %enrollment.campaign_id,
                                error = %err,
                                "Could not load campaign steps"
                            );
                            continue;
                        }
                    },
                };
                let Some(sequence) = sequence else {
                    report.record(&AdvanceOutcome::Held);
                    continue;
                };

                let permit = permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| CampaignError::Internal(e.into()))?;
                let scheduler = self.clone();
                let id = enrollment.id;
                let handle = tokio::spawn(async move {
                    let result = scheduler.advance(enrollment, &sequence, now).await;
                    drop(permit);
                    result
                });
                handles.push((id, handle));
            }

            for (id, handle) in handles {
                match handle.await {
                    Ok(Ok(outcome)) => report.record(&outcome),
                    Ok(Err(err)) => {
                        report.errors += 1;
                        warn!(enrollment_id = %id, error = %err, "Enrollment advance failed");
                    }
                    Err(join_err) => {
                        report.errors += 1;
                        error!(enrollment_id = %id, error = %join_err, "Enrollment advance task aborted");
                    }
                }
            }
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("sweep.duration_ms").record(elapsed_ms);
        if report.examined > 0 {
            info!(
                examined = report.examined,
                advanced = report.advanced,
                completed = report.completed,
                exited = report.exited,
                retried = report.retried,
                failed = report.failed,
                held = report.held,
                conflicts = report.conflicts,
                errors = report.errors,
                elapsed_ms,
                "Sweep finished"
            );
        } else {
            debug!(elapsed_ms, "Sweep found nothing due");
        }
        Ok(report)
    }

    /// Steps of a campaign whose enrollments may advance, or `None` when the
    /// campaign is held (paused, archived, or gone).
    async fn load_sequence(&self, campaign_id: Uuid) -> CampaignResult<Option<Arc<StepSequence>>> {
        let campaign = self.store.get_campaign(campaign_id).await?;
        match campaign {
            Some(c) if matches!(c.status, CampaignStatus::Draft | CampaignStatus::Active) => {
                let steps = self.store.list_steps(campaign_id).await?;
                Ok(Some(Arc::new(StepSequence::new(steps))))
            }
            Some(c) => {
                debug!(campaign_id = %campaign_id, status = %c.status, "Campaign held, skipping its enrollments");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Advance a single enrollment if it is due at `now`.
    pub async fn advance(
        &self,
        enrollment: CampaignEnrollment,
        sequence: &StepSequence,
        now: DateTime<Utc>,
    ) -> CampaignResult<AdvanceOutcome> {
        if !enrollment.is_due(now) {
            return Ok(AdvanceOutcome::NotDue);
        }
        let step = enrollment
            .current_step_id
            .and_then(|id| sequence.by_id(id))
            .ok_or_else(|| {
                CampaignError::Validation(format!(
                    "enrollment {} points at step {:?} which is not in its campaign",
                    enrollment.id, enrollment.current_step_id
                ))
            })?;

        match self.execute(&enrollment, step, sequence).await {
            Ok(transition) => self.commit(enrollment, step, transition, now).await,
            Err(err) => self.record_failure(enrollment, step, err, now).await,
        }
    }

    /// Run the step's effect and decide where the enrollment goes next.
    async fn execute(
        &self,
        enrollment: &CampaignEnrollment,
        step: &CampaignStep,
        sequence: &StepSequence,
    ) -> CampaignResult<Transition> {
        let timeout = self.config.dispatch_timeout();
        let timeout_ms = self.config.dispatch_timeout_ms;

        let branch = match &step.config {
            StepConfig::Wait => BranchAction::Next,
            StepConfig::Email(email) => {
                let request = self.dispatch_request(enrollment, step).await?;
                let receipt = tokio::time::timeout(timeout, self.email.send_email(&request, email))
                    .await
                    .map_err(|_| CampaignError::DispatchTimeout(timeout_ms))??;
                debug!(enrollment_id = %enrollment.id, message_id = %receipt.provider_message_id, duplicate = receipt.duplicate, "Email step dispatched");
                BranchAction::Next
            }
            StepConfig::Task(task) => {
                let request = self.dispatch_request(enrollment, step).await?;
                let receipt = tokio::time::timeout(timeout, self.tasks.create_task(&request, task))
                    .await
                    .map_err(|_| CampaignError::DispatchTimeout(timeout_ms))??;
                debug!(enrollment_id = %enrollment.id, task_ref = %receipt.provider_message_id, duplicate = receipt.duplicate, "Task step dispatched");
                BranchAction::Next
            }
            StepConfig::Condition(condition) => {
                let account = self.account(enrollment).await?;
                tokio::time::timeout(timeout, self.evaluator.evaluate(condition, &account))
                    .await
                    .map_err(|_| CampaignError::DispatchTimeout(timeout_ms))??
            }
        };

        match branch {
            BranchAction::Next => Ok(match sequence.after(step.step_order) {
                Some(next) => Transition::Goto(next.clone()),
                None => Transition::Complete,
            }),
            BranchAction::GoTo { step_order } => sequence
                .by_order(step_order)
                .cloned()
                .map(Transition::Goto)
                .ok_or_else(|| {
                    CampaignError::Validation(format!(
                        "step {} branches to missing step {}",
                        step.step_order, step_order
                    ))
                }),
            BranchAction::Exit { reason } => Ok(Transition::Exit(reason)),
        }
    }

    async fn account(&self, enrollment: &CampaignEnrollment) -> CampaignResult<Account> {
        let timeout = self.config.dispatch_timeout();
        tokio::time::timeout(timeout, self.directory.snapshot(&enrollment.account_id))
            .await
            .map_err(|_| CampaignError::DispatchTimeout(self.config.dispatch_timeout_ms))??
            .ok_or_else(|| {
                CampaignError::Dispatch(format!(
                    "account {} is no longer in the directory",
                    enrollment.account_id
                ))
            })
    }

    async fn dispatch_request(
        &self,
        enrollment: &CampaignEnrollment,
        step: &CampaignStep,
    ) -> CampaignResult<DispatchRequest> {
        Ok(DispatchRequest {
            campaign_id: enrollment.campaign_id,
            enrollment_id: enrollment.id,
            step_id: step.id,
            step_order: step.step_order,
            account: self.account(enrollment).await?,
        })
    }

    /// Commit the post-effect state with compare-and-swap.
    async fn commit(
        &self,
        enrollment: CampaignEnrollment,
        executed: &CampaignStep,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> CampaignResult<AdvanceOutcome> {
        let mut machine = EnrollmentStateMachine::new(enrollment.id, enrollment.status);
        let mut updated = enrollment.clone();
        updated.updated_at = now;
        updated.last_step_executed_at = Some(now);
        updated.dispatch_attempts = 0;
        updated.last_error = None;

        let (outcome, event_type) = match transition {
            Transition::Goto(next) => {
                machine.transition(EnrollmentStatus::Active)?;
                updated.current_step_id = Some(next.id);
                updated.current_step_order = next.step_order;
                updated.next_step_due = Some(next.due_from(now)?);
                (
                    AdvanceOutcome::Advanced {
                        step_order: next.step_order,
                    },
                    EventType::StepExecuted,
                )
            }
            Transition::Complete => {
                machine.transition(EnrollmentStatus::Completed)?;
                updated.current_step_id = None;
                updated.next_step_due = None;
                updated.completed_at = Some(now);
                (AdvanceOutcome::Completed, EventType::EnrollmentCompleted)
            }
            Transition::Exit(reason) => {
                machine.transition(EnrollmentStatus::Exited)?;
                updated.current_step_id = None;
                updated.next_step_due = None;
                updated.completed_at = Some(now);
                updated.exit_reason = reason.or_else(|| Some(format!("condition at step {}", executed.step_order)));
                (AdvanceOutcome::Exited, EventType::EnrollmentExited)
            }
        };
        updated.status = machine.state;

        let Some(committed) = self
            .store
            .compare_and_swap_enrollment(enrollment.version, updated)
            .await?
        else {
            metrics::counter!("sweep.conflicts").increment(1);
            warn!(
                enrollment_id = %enrollment.id,
                step_order = executed.step_order,
                "Enrollment changed during sweep, advance discarded"
            );
            return Ok(AdvanceOutcome::Conflict);
        };

        metrics::counter!("sweep.steps_advanced").increment(1);
        debug!(
            enrollment_id = %committed.id,
            executed_step = executed.step_order,
            step_type = %executed.step_type(),
            status = %committed.status,
            current_step = committed.current_step_order,
            next_due = ?committed.next_step_due,
            "Enrollment advanced"
        );

        let mut event = make_event(
            event_type,
            committed.campaign_id,
            Some(committed.id),
            Some(committed.account_id.clone()),
        )
        .with_step(executed.step_order);
        if let Some(reason) = &committed.exit_reason {
            event = event.with_detail(reason.clone());
        } else {
            event = event.with_detail(executed.step_type().to_string());
        }
        self.event_sink.emit(event);

        Ok(outcome)
    }

    /// Keep the enrollment on its step, counting the failed attempt and
    /// dead-lettering it once the configured ceiling is reached.
    async fn record_failure(
        &self,
        enrollment: CampaignEnrollment,
        step: &CampaignStep,
        err: CampaignError,
        now: DateTime<Utc>,
    ) -> CampaignResult<AdvanceOutcome> {
        metrics::counter!("sweep.dispatch_failures").increment(1);

        let mut updated = enrollment.clone();
        updated.dispatch_attempts = enrollment.dispatch_attempts.saturating_add(1);
        updated.last_error = Some(err.to_string());
        updated.updated_at = now;

        let max = self.config.max_dispatch_attempts;
        let exhausted = max > 0 && updated.dispatch_attempts >= max;
        if exhausted {
            let mut machine = EnrollmentStateMachine::new(enrollment.id, enrollment.status);
            machine.transition(EnrollmentStatus::Failed)?;
            updated.status = machine.state;
            updated.next_step_due = None;
            updated.completed_at = Some(now);
        }
        let attempts = updated.dispatch_attempts;

        let Some(committed) = self
            .store
            .compare_and_swap_enrollment(enrollment.version, updated)
            .await?
        else {
            metrics::counter!("sweep.conflicts").increment(1);
            return Ok(AdvanceOutcome::Conflict);
        };

        if exhausted {
            metrics::counter!("sweep.dead_lettered").increment(1);
            error!(
                enrollment_id = %committed.id,
                step_order = step.step_order,
                attempts,
                error = %err,
                "Dispatch attempts exhausted, enrollment dead-lettered"
            );
            self.event_sink.emit(
                make_event(
                    EventType::EnrollmentFailed,
                    committed.campaign_id,
                    Some(committed.id),
                    Some(committed.account_id.clone()),
                )
                .with_step(step.step_order)
                .with_detail(err.to_string()),
            );
            return Ok(AdvanceOutcome::Failed);
        }

        warn!(
            enrollment_id = %committed.id,
            step_order = step.step_order,
            step_type = %step.step_type(),
            attempts,
            retryable = err.is_retryable(),
            error = %err,
            "Step effect failed, will retry next sweep"
        );
        self.event_sink.emit(
            make_event(
                EventType::StepDispatchFailed,
                committed.campaign_id,
                Some(committed.id),
                Some(committed.account_id.clone()),
            )
            .with_step(step.step_order)
            .with_detail(err.to_string()),
        );
        Ok(AdvanceOutcome::Retrying { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticAccountDirectory;
    use crate::dispatch::{DispatchReceipt, OutboxDispatcher, OutboxMode};
    use crate::evaluator::RuleEvaluator;
    use crate::manager::EnrollmentManager;
    use crate::steps::build_steps;
    use crate::store::InMemoryStore;
    use crate::types::{
        Campaign, CampaignTrigger, Comparison, ConditionConfig, ConditionRule,
        EmailConfig, NewStep, StepType, TaskConfig, TaskPriority,
    };
    use campaign_core::event_bus::capture_sink;
    use chrono::Duration;

    struct Harness {
        store: Arc<InMemoryStore>,
        directory: Arc<StaticAccountDirectory>,
        outbox: Arc<OutboxDispatcher>,
        manager: EnrollmentManager,
        scheduler: StepScheduler,
    }

    fn harness(config: SchedulerConfig) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let directory = Arc::new(StaticAccountDirectory::with_accounts([
            Account::new("acct-1", "Acme").with_health_score(30.0),
            Account::new("acct-2", "Globex").with_health_score(90.0),
        ]));
        let outbox = Arc::new(OutboxDispatcher::new());
        let manager = EnrollmentManager::new(store.clone(), directory.clone());
        let scheduler = StepScheduler::new(
            store.clone(),
            directory.clone(),
            outbox.clone(),
            outbox.clone(),
            Arc::new(RuleEvaluator::new()),
            config,
        );
        Harness {
            store,
            directory,
            outbox,
            manager,
            scheduler,
        }
    }

    async fn campaign(store: &InMemoryStore, steps: Vec<NewStep>) -> Uuid {
        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            name: "Health check".into(),
            description: String::new(),
            trigger: CampaignTrigger::Manual,
            trigger_conditions: serde_json::json!({}),
            status: CampaignStatus::Active,
            owner: None,
            created_at: now,
            updated_at: now,
        };
        let id = campaign.id;
        let steps = build_steps(id, steps, now).unwrap();
        store.insert_campaign(campaign, steps).await.unwrap();
        id
    }

    fn email() -> StepConfig {
        StepConfig::Email(EmailConfig {
            subject: "Checking in, {{account.name}}".into(),
            body: "How are things?".into(),
            template: None,
        })
    }

    fn task() -> StepConfig {
        StepConfig::Task(TaskConfig {
            title: "Call {{account.name}}".into(),
            description: None,
            priority: TaskPriority::High,
            assignee: None,
        })
    }

    fn health_branch() -> StepConfig {
        StepConfig::Condition(ConditionConfig {
            rule: ConditionRule {
                attribute: "health_score".into(),
                operator: Comparison::Lt,
                value: serde_json::json!(50),
            },
            on_match: BranchAction::GoTo { step_order: 3 },
            otherwise: BranchAction::Exit {
                reason: Some("healthy".into()),
            },
        })
    }

    #[tokio::test]
    async fn test_not_due_enrollments_are_untouched() {
        let h = harness(SchedulerConfig::default());
        let id = campaign(&h.store, vec![NewStep::new("Later", email()).after(1, 0)]).await;
        let t0 = Utc::now();
        h.manager.enroll_at(id, &["acct-1".into()], t0).await.unwrap();

        let report = h.scheduler.sweep_at(t0 + Duration::hours(23)).await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(h.outbox.attempts(), 0);

        let report = h.scheduler.sweep_at(t0 + Duration::hours(24)).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(h.outbox.delivered(StepType::Email), 1);
    }

    #[tokio::test]
    async fn test_condition_branches_and_exits() {
        let h = harness(SchedulerConfig::default());
        let id = campaign(
            &h.store,
            vec![
                NewStep::new("Check health", health_branch()),
                NewStep::new("Newsletter", email()),
                NewStep::new("Escalate", task()).after(0, 2),
            ],
        )
        .await;
        let t0 = Utc::now();
        h.manager
            .enroll_at(id, &["acct-1".into(), "acct-2".into()], t0)
            .await
            .unwrap();

        let report = h.scheduler.sweep_at(t0).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.advanced, 1);
        assert_eq!(report.exited, 1);

        let enrollments = h.store.list_enrollments(id).await.unwrap();
        let at_risk = enrollments.iter().find(|e| e.account_id == "acct-1").unwrap();
        assert_eq!(at_risk.status, EnrollmentStatus::Active);
        assert_eq!(at_risk.current_step_order, 3);
        assert_eq!(at_risk.next_step_due, Some(t0 + Duration::hours(2)));

        let healthy = enrollments.iter().find(|e| e.account_id == "acct-2").unwrap();
        assert_eq!(healthy.status, EnrollmentStatus::Exited);
        assert_eq!(healthy.exit_reason.as_deref(), Some("healthy"));
        assert_eq!(healthy.current_step_id, None);
        assert_eq!(healthy.next_step_due, None);
    }

    #[tokio::test]
    async fn test_dispatch_failure_keeps_step_and_retries() {
        let h = harness(SchedulerConfig::default());
        let sink = capture_sink();
        let scheduler = h.scheduler.clone().with_event_sink(sink.clone());
        let id = campaign(
            &h.store,
            vec![NewStep::new("Hello", email()), NewStep::new("Rest", StepConfig::Wait)],
        )
        .await;
        let t0 = Utc::now();
        h.manager.enroll_at(id, &["acct-1".into()], t0).await.unwrap();

        h.outbox.set_mode(OutboxMode::Fail("smtp 421".into()));
        for attempt in 1..=3u32 {
            let report = scheduler.sweep_at(t0 + Duration::minutes(attempt.into())).await.unwrap();
            assert_eq!(report.retried, 1);
        }
        let e = &h.store.list_enrollments(id).await.unwrap()[0];
        assert_eq!(e.status, EnrollmentStatus::Active);
        assert_eq!(e.current_step_order, 1);
        assert_eq!(e.dispatch_attempts, 3);
        assert_eq!(e.next_step_due, Some(t0));
        assert!(e.last_error.as_deref().unwrap().contains("smtp 421"));
        assert_eq!(sink.count_type(EventType::StepDispatchFailed), 3);

        h.outbox.set_mode(OutboxMode::Deliver);
        let report = scheduler.sweep_at(t0 + Duration::minutes(5)).await.unwrap();
        assert_eq!(report.advanced, 1);
        let e = &h.store.list_enrollments(id).await.unwrap()[0];
        assert_eq!(e.current_step_order, 2);
        assert_eq!(e.dispatch_attempts, 0);
        assert_eq!(e.last_error, None);
    }

    #[tokio::test]
    async fn test_dispatch_timeout_is_retried() {
        let config = SchedulerConfig {
            dispatch_timeout_ms: 20,
            ..SchedulerConfig::default()
        };
        let h = harness(config);
        let id = campaign(&h.store, vec![NewStep::new("Call", task())]).await;
        let t0 = Utc::now();
        h.manager.enroll_at(id, &["acct-1".into()], t0).await.unwrap();

        h.outbox.set_mode(OutboxMode::Stall(std::time::Duration::from_millis(500)));
        let report = h.scheduler.sweep_at(t0).await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(h.outbox.delivered(StepType::Task), 0);
        let e = &h.store.list_enrollments(id).await.unwrap()[0];
        assert!(e.last_error.as_deref().unwrap().contains("timed out"));

        h.outbox.set_mode(OutboxMode::Deliver);
        let report = h.scheduler.sweep_at(t0).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(h.outbox.delivered(StepType::Task), 1);
    }

    #[tokio::test]
    async fn test_bounded_retries_dead_letter() {
        let config = SchedulerConfig {
            max_dispatch_attempts: 2,
            ..SchedulerConfig::default()
        };
        let h = harness(config);
        let id = campaign(&h.store, vec![NewStep::new("Hello", email())]).await;
        let t0 = Utc::now();
        h.manager.enroll_at(id, &["acct-1".into()], t0).await.unwrap();
        h.outbox.set_mode(OutboxMode::Fail("bounced".into()));

        let first = h.scheduler.sweep_at(t0).await.unwrap();
        assert_eq!(first.retried, 1);
        let second = h.scheduler.sweep_at(t0).await.unwrap();
        assert_eq!(second.failed, 1);

        let e = &h.store.list_enrollments(id).await.unwrap()[0];
        assert_eq!(e.status, EnrollmentStatus::Failed);
        assert_eq!(e.next_step_due, None);

        let third = h.scheduler.sweep_at(t0 + Duration::days(1)).await.unwrap();
        assert_eq!(third.examined, 0);
    }

    #[tokio::test]
    async fn test_missing_account_does_not_block_others() {
        let h = harness(SchedulerConfig::default());
        let id = campaign(&h.store, vec![NewStep::new("Hello", email())]).await;
        let t0 = Utc::now();
        h.manager
            .enroll_at(id, &["acct-1".into(), "acct-2".into()], t0)
            .await
            .unwrap();
        h.directory.remove("acct-1");

        let report = h.scheduler.sweep_at(t0).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.retried, 1);
        assert_eq!(report.completed, 1);
    }

    /// Email dispatcher that panics for one account and delivers the rest.
    struct PanicsFor {
        account_id: &'static str,
        inner: Arc<OutboxDispatcher>,
    }

    #[async_trait::async_trait]
    impl EmailDispatcher for PanicsFor {
        async fn send_email(
            &self,
            request: &DispatchRequest,
            email: &EmailConfig,
        ) -> CampaignResult<DispatchReceipt> {
            if request.account.id == self.account_id {
                panic!("mail client crashed for {}", request.account.id);
            }
            self.inner.send_email(request, email).await
        }
    }

    #[tokio::test]
    async fn test_panicking_dispatch_is_isolated() {
        let h = harness(SchedulerConfig::default());
        let scheduler = StepScheduler::new(
            h.store.clone(),
            h.directory.clone(),
            Arc::new(PanicsFor {
                account_id: "acct-1",
                inner: h.outbox.clone(),
            }),
            h.outbox.clone(),
            Arc::new(RuleEvaluator::new()),
            SchedulerConfig::default(),
        );
        let id = campaign(&h.store, vec![NewStep::new("Hello", email())]).await;
        let t0 = Utc::now();
        h.manager
            .enroll_at(id, &["acct-1".into(), "acct-2".into()], t0)
            .await
            .unwrap();

        let report = scheduler.sweep_at(t0).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(h.outbox.delivered(StepType::Email), 1);

        let enrollments = h.store.list_enrollments(id).await.unwrap();
        let crashed = enrollments.iter().find(|e| e.account_id == "acct-1").unwrap();
        let delivered = enrollments.iter().find(|e| e.account_id == "acct-2").unwrap();
        // The crashed enrollment was never committed and stays due.
        assert_eq!(crashed.status, EnrollmentStatus::Active);
        assert_eq!(crashed.next_step_due, Some(t0));
        assert_eq!(delivered.status, EnrollmentStatus::Completed);
    }

    #[tokio::test]
    async fn test_paused_enrollments_and_campaigns_are_held() {
        let h = harness(SchedulerConfig::default());
        let id = campaign(&h.store, vec![NewStep::new("Hello", email())]).await;
        let t0 = Utc::now();
        let result = h
            .manager
            .enroll_at(id, &["acct-1".into(), "acct-2".into()], t0)
            .await
            .unwrap();
        h.manager.pause_at(result.enrollments[0].id, t0).await.unwrap();

        let report = h.scheduler.sweep_at(t0).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.completed, 1);

        let other = campaign(&h.store, vec![NewStep::new("Hello", email())]).await;
        h.manager.enroll_at(other, &["acct-2".into()], t0).await.unwrap();
        h.store
            .update_campaign(
                other,
                Box::new(|c| {
                    c.status = CampaignStatus::Paused;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        let report = h.scheduler.sweep_at(t0).await.unwrap();
        assert_eq!(report.held, 1);
        assert_eq!(report.advanced + report.completed, 0);
    }

    #[tokio::test]
    async fn test_stale_version_is_a_conflict() {
        let h = harness(SchedulerConfig::default());
        let id = campaign(
            &h.store,
            vec![NewStep::new("Hello", email()), NewStep::new("Rest", StepConfig::Wait)],
        )
        .await;
        let t0 = Utc::now();
        let stale = h
            .manager
            .enroll_at(id, &["acct-1".into()], t0)
            .await
            .unwrap()
            .enrollments
            .remove(0);
        let sequence = StepSequence::new(h.store.list_steps(id).await.unwrap());

        let first = h.scheduler.advance(stale.clone(), &sequence, t0).await.unwrap();
        assert_eq!(first, AdvanceOutcome::Advanced { step_order: 2 });

        // A second sweep holding the old snapshot dispatches again (deduped)
        // but cannot commit.
        let second = h.scheduler.advance(stale, &sequence, t0).await.unwrap();
        assert_eq!(second, AdvanceOutcome::Conflict);
        assert_eq!(h.outbox.delivered(StepType::Email), 1);

        let e = &h.store.list_enrollments(id).await.unwrap()[0];
        assert_eq!(e.current_step_order, 2);
        assert_eq!(e.version, 1);
    }

    #[tokio::test]
    async fn test_sweep_drains_multiple_pages() {
        let config = SchedulerConfig {
            batch_size: 2,
            max_concurrency: 3,
            ..SchedulerConfig::default()
        };
        let h = harness(config);
        let accounts: Vec<String> = (0..7).map(|i| format!("bulk-{i}")).collect();
        for id in &accounts {
            h.directory.upsert(Account::new(id.clone(), id.clone()));
        }
        let id = campaign(&h.store, vec![NewStep::new("Hello", email())]).await;
        let t0 = Utc::now();
        h.manager.enroll_at(id, &accounts, t0).await.unwrap();

        let report = h.scheduler.sweep_at(t0).await.unwrap();
        assert_eq!(report.examined, 7);
        assert_eq!(report.completed, 7);
        assert_eq!(h.outbox.delivered(StepType::Email), 7);
    }
}
