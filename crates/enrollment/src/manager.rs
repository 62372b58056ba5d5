//! Enrollment Manager: enrolls accounts into campaigns and applies manual
//! enrollment controls (pause, resume, exit).

use std::sync::Arc;

use campaign_core::event_bus::{make_event, EventSink};
use campaign_core::types::EventType;
use campaign_core::{CampaignError, CampaignResult};
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::directory::AccountDirectory;
use crate::state_machine::EnrollmentStateMachine;
use crate::steps::StepTemplates;
use crate::store::{CampaignStore, EnrollOutcome};
use crate::types::{CampaignEnrollment, EnrollmentResult, EnrollmentStatus};

#[derive(Clone)]
pub struct EnrollmentManager {
    store: Arc<dyn CampaignStore>,
    directory: Arc<dyn AccountDirectory>,
    steps: StepTemplates,
    event_sink: Arc<dyn EventSink>,
    complete_empty_enrollments: bool,
}

impl std::fmt::Debug for EnrollmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrollmentManager")
            .field("complete_empty_enrollments", &self.complete_empty_enrollments)
            .finish()
    }
}

impl EnrollmentManager {
    pub fn new(store: Arc<dyn CampaignStore>, directory: Arc<dyn AccountDirectory>) -> Self {
        Self {
            steps: StepTemplates::new(store.clone()),
            store,
            directory,
            event_sink: campaign_core::event_bus::noop_sink(),
            complete_empty_enrollments: true,
        }
    }

    /// Attach an event sink for lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Whether enrollments into a campaign without steps start `completed`.
    pub fn with_complete_empty_enrollments(mut self, complete: bool) -> Self {
        self.complete_empty_enrollments = complete;
        self
    }

    pub async fn enroll(
        &self,
        campaign_id: Uuid,
        account_ids: &[String],
    ) -> CampaignResult<EnrollmentResult> {
        self.enroll_at(campaign_id, account_ids, Utc::now()).await
    }

    /// Enroll each resolvable account, skipping accounts that already have a
    /// live enrollment in the campaign. A draft campaign becomes active once
    /// at least one enrollment has been created.
    pub async fn enroll_at(
        &self,
        campaign_id: Uuid,
        account_ids: &[String],
        now: DateTime<Utc>,
    ) -> CampaignResult<EnrollmentResult> {
        let campaign = self
            .store
            .get_campaign(campaign_id)
            .await?
            .ok_or(CampaignError::CampaignNotFound(campaign_id))?;
        if !campaign.status.is_enrollable() {
            return Err(CampaignError::CampaignNotEnrollable {
                id: campaign_id,
                status: campaign.status.to_string(),
            });
        }

        let accounts = self.directory.resolve(account_ids).await?;
        if accounts.is_empty() {
            return Err(CampaignError::NoValidAccounts);
        }

        let first_step = self.steps.first_step(campaign_id).await?;
        let first_due = first_step
            .as_ref()
            .map(|s| s.due_from(now))
            .transpose()?;
        let mut result = EnrollmentResult::default();
        let mut failure = None;

        for account in &accounts {
            let mut enrollment = CampaignEnrollment {
                id: Uuid::new_v4(),
                campaign_id,
                account_id: account.id.clone(),
                status: EnrollmentStatus::Active,
                current_step_id: first_step.as_ref().map(|s| s.id),
                current_step_order: 1,
                next_step_due: first_due,
                enrolled_at: now,
                updated_at: now,
                last_step_executed_at: None,
                completed_at: None,
                exit_reason: None,
                dispatch_attempts: 0,
                last_error: None,
                version: 0,
            };
            if first_step.is_none() && self.complete_empty_enrollments {
                enrollment.status = EnrollmentStatus::Completed;
                enrollment.completed_at = Some(now);
            }

            match self.store.enroll_or_skip(enrollment).await {
                Ok(EnrollOutcome::Created(created)) => {
                    result.enrolled += 1;
                    metrics::counter!("enrollment.created").increment(1);
                    self.event_sink.emit(
                        make_event(
                            EventType::EnrollmentCreated,
                            campaign_id,
                            Some(created.id),
                            Some(created.account_id.clone()),
                        )
                        .with_step(created.current_step_order),
                    );
                    if created.status == EnrollmentStatus::Completed {
                        self.event_sink.emit(make_event(
                            EventType::EnrollmentCompleted,
                            campaign_id,
                            Some(created.id),
                            Some(created.account_id.clone()),
                        ));
                    }
                    result.enrollments.push(created);
                }
                Ok(EnrollOutcome::Skipped(existing)) => {
                    result.skipped += 1;
                    metrics::counter!("enrollment.skipped").increment(1);
                    debug!(
                        campaign_id = %campaign_id,
                        account_id = %account.id,
                        existing = %existing.id,
                        "Account already enrolled, skipping"
                    );
                    self.event_sink.emit(make_event(
                        EventType::EnrollmentSkipped,
                        campaign_id,
                        Some(existing.id),
                        Some(account.id.clone()),
                    ));
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        // Enrollments committed before a failure still activate the campaign.
        if result.enrolled > 0 && self.store.activate_if_draft(campaign_id, now).await? {
            info!(campaign_id = %campaign_id, "Campaign activated by first enrollment");
            self.event_sink.emit(
                make_event(EventType::CampaignActivated, campaign_id, None, None)
                    .with_detail("draft -> active"),
            );
        }

        if let Some(err) = failure {
            return Err(err);
        }

        info!(
            campaign_id = %campaign_id,
            requested = account_ids.len(),
            enrolled = result.enrolled,
            skipped = result.skipped,
            "Enrollment request processed"
        );
        Ok(result)
    }

    pub async fn get_enrollment(&self, id: Uuid) -> CampaignResult<CampaignEnrollment> {
        self.store
            .get_enrollment(id)
            .await?
            .ok_or(CampaignError::EnrollmentNotFound(id))
    }

    pub async fn list_enrollments(&self, campaign_id: Uuid) -> CampaignResult<Vec<CampaignEnrollment>> {
        self.store.list_enrollments(campaign_id).await
    }

    pub async fn pause(&self, id: Uuid) -> CampaignResult<CampaignEnrollment> {
        self.pause_at(id, Utc::now()).await
    }

    /// Stop an active enrollment from being advanced. The current step and
    /// its due time are kept.
    pub async fn pause_at(&self, id: Uuid, now: DateTime<Utc>) -> CampaignResult<CampaignEnrollment> {
        let enrollment = self
            .transition(id, EnrollmentStatus::Paused, now, |_| {})
            .await?;
        self.event_sink.emit(
            make_event(
                EventType::EnrollmentPaused,
                enrollment.campaign_id,
                Some(enrollment.id),
                Some(enrollment.account_id.clone()),
            )
            .with_step(enrollment.current_step_order),
        );
        Ok(enrollment)
    }

    pub async fn resume(&self, id: Uuid) -> CampaignResult<CampaignEnrollment> {
        self.resume_at(id, Utc::now()).await
    }

    /// Reactivate a paused enrollment. The current step's delay restarts
    /// from `now`.
    pub async fn resume_at(&self, id: Uuid, now: DateTime<Utc>) -> CampaignResult<CampaignEnrollment> {
        let current = self.get_enrollment(id).await?;
        let sequence = self.steps.sequence(current.campaign_id).await?;
        let due = current
            .current_step_id
            .and_then(|step_id| sequence.by_id(step_id))
            .map(|step| step.due_from(now))
            .transpose()?;

        let enrollment = self
            .transition(id, EnrollmentStatus::Active, now, move |e| {
                e.next_step_due = due;
            })
            .await?;
        self.event_sink.emit(
            make_event(
                EventType::EnrollmentResumed,
                enrollment.campaign_id,
                Some(enrollment.id),
                Some(enrollment.account_id.clone()),
            )
            .with_step(enrollment.current_step_order),
        );
        Ok(enrollment)
    }

    pub async fn exit(&self, id: Uuid, reason: Option<String>) -> CampaignResult<CampaignEnrollment> {
        self.exit_at(id, reason, Utc::now()).await
    }

    /// End an active or paused enrollment early.
    pub async fn exit_at(
        &self,
        id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> CampaignResult<CampaignEnrollment> {
        let detail = reason.clone().unwrap_or_else(|| "manual exit".to_string());
        let enrollment = self
            .transition(id, EnrollmentStatus::Exited, now, move |e| {
                e.current_step_id = None;
                e.next_step_due = None;
                e.exit_reason = reason;
                e.completed_at = Some(now);
            })
            .await?;
        self.event_sink.emit(
            make_event(
                EventType::EnrollmentExited,
                enrollment.campaign_id,
                Some(enrollment.id),
                Some(enrollment.account_id.clone()),
            )
            .with_detail(detail),
        );
        Ok(enrollment)
    }

    /// Guarded status change committed with compare-and-swap.
    async fn transition(
        &self,
        id: Uuid,
        to: EnrollmentStatus,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut CampaignEnrollment),
    ) -> CampaignResult<CampaignEnrollment> {
        let current = self.get_enrollment(id).await?;
        let mut machine = EnrollmentStateMachine::new(id, current.status);
        machine.transition(to)?;

        let mut updated = current.clone();
        updated.status = machine.state;
        updated.updated_at = now;
        apply(&mut updated);

        let committed = self
            .store
            .compare_and_swap_enrollment(current.version, updated)
            .await?
            .ok_or(CampaignError::ConcurrentModification(id))?;
        info!(
            enrollment_id = %id,
            from = %current.status,
            to = %committed.status,
            "Enrollment status changed"
        );
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticAccountDirectory;
    use crate::steps::build_steps;
    use crate::store::InMemoryStore;
    use crate::types::{
        Account, Campaign, CampaignStatus, CampaignTrigger, NewStep, StepConfig,
    };
    use campaign_core::event_bus::capture_sink;
    use chrono::Duration;

    struct Fixture {
        store: Arc<InMemoryStore>,
        manager: EnrollmentManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let directory = Arc::new(StaticAccountDirectory::with_accounts([
            Account::new("acct-1", "Acme"),
            Account::new("acct-2", "Globex"),
        ]));
        let manager = EnrollmentManager::new(store.clone(), directory);
        Fixture { store, manager }
    }

    async fn campaign(
        store: &InMemoryStore,
        status: CampaignStatus,
        steps: Vec<NewStep>,
    ) -> Uuid {
        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            name: "Expansion".into(),
            description: String::new(),
            trigger: CampaignTrigger::Manual,
            trigger_conditions: serde_json::json!({}),
            status,
            owner: None,
            created_at: now,
            updated_at: now,
        };
        let steps = build_steps(campaign.id, steps, now).unwrap();
        let id = campaign.id;
        store.insert_campaign(campaign, steps).await.unwrap();
        id
    }

    fn wait_steps() -> Vec<NewStep> {
        vec![
            NewStep::new("Cool off", StepConfig::Wait).after(1, 0),
            NewStep::new("Cool off more", StepConfig::Wait).after(0, 5),
        ]
    }

    #[tokio::test]
    async fn test_enroll_sets_first_step_and_due() {
        let f = fixture();
        let id = campaign(&f.store, CampaignStatus::Active, wait_steps()).await;
        let t0 = Utc::now();

        let result = f.manager.enroll_at(id, &["acct-1".into()], t0).await.unwrap();
        assert_eq!(result.enrolled, 1);
        assert_eq!(result.skipped, 0);

        let e = &result.enrollments[0];
        let first = f.store.list_steps(id).await.unwrap()[0].clone();
        assert_eq!(e.status, EnrollmentStatus::Active);
        assert_eq!(e.current_step_order, 1);
        assert_eq!(e.current_step_id, Some(first.id));
        assert_eq!(e.next_step_due, Some(t0 + Duration::hours(24)));
    }

    #[tokio::test]
    async fn test_second_enroll_is_skipped() {
        let f = fixture();
        let id = campaign(&f.store, CampaignStatus::Active, wait_steps()).await;

        f.manager.enroll(id, &["acct-1".into()]).await.unwrap();
        let again = f.manager.enroll(id, &["acct-1".into()]).await.unwrap();
        assert_eq!(again.enrolled, 0);
        assert_eq!(again.skipped, 1);
        assert!(again.enrollments.is_empty());

        let live: Vec<_> = f
            .store
            .list_enrollments(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.status.is_live())
            .collect();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_ids_are_dropped() {
        let f = fixture();
        let id = campaign(&f.store, CampaignStatus::Active, wait_steps()).await;

        let result = f
            .manager
            .enroll(id, &["acct-1".into(), "ghost".into(), "acct-2".into()])
            .await
            .unwrap();
        assert_eq!(result.enrolled, 2);
        assert_eq!(result.skipped, 0);

        let err = f.manager.enroll(id, &["ghost".into()]).await.unwrap_err();
        assert!(matches!(err, CampaignError::NoValidAccounts));
    }

    #[tokio::test]
    async fn test_rejects_unknown_and_unenrollable_campaigns() {
        let f = fixture();
        let err = f
            .manager
            .enroll(Uuid::new_v4(), &["acct-1".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, CampaignError::CampaignNotFound(_)));

        for status in [CampaignStatus::Paused, CampaignStatus::Archived] {
            let id = campaign(&f.store, status, wait_steps()).await;
            let err = f.manager.enroll(id, &["acct-1".into()]).await.unwrap_err();
            assert!(matches!(err, CampaignError::CampaignNotEnrollable { .. }));
            assert!(f.store.list_enrollments(id).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_out_of_range_delay_fails_enroll_without_writing() {
        let f = fixture();
        let id = campaign(&f.store, CampaignStatus::Active, wait_steps()).await;
        let mut steps = f.store.list_steps(id).await.unwrap();
        // Stored data that never went through step validation.
        let mut stale = steps.remove(0);
        stale.delay_days = u32::MAX;
        f.store.delete_campaign_cascade(id).await.unwrap();
        let now = Utc::now();
        let campaign = Campaign {
            id,
            name: "Legacy".into(),
            description: String::new(),
            trigger: CampaignTrigger::Manual,
            trigger_conditions: serde_json::json!({}),
            status: CampaignStatus::Active,
            owner: None,
            created_at: now,
            updated_at: now,
        };
        f.store.insert_campaign(campaign, vec![stale]).await.unwrap();

        let err = f.manager.enroll(id, &["acct-1".into()]).await.unwrap_err();
        assert!(matches!(err, CampaignError::Validation(_)));
        assert!(f.store.list_enrollments(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_draft_activates_only_when_something_was_created() {
        let f = fixture();
        let sink = capture_sink();
        let manager = f.manager.clone().with_event_sink(sink.clone());
        let id = campaign(&f.store, CampaignStatus::Draft, wait_steps()).await;

        manager.enroll(id, &["acct-1".into()]).await.unwrap();
        let campaign = f.store.get_campaign(id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Active);
        assert_eq!(sink.count_type(EventType::CampaignActivated), 1);

        // A draft campaign where every account is skipped stays draft.
        let other = campaign_with_live_enrollment(&f).await;
        let result = manager.enroll(other, &["acct-1".into()]).await.unwrap();
        assert_eq!(result.skipped, 1);
        let other = f.store.get_campaign(other).await.unwrap().unwrap();
        assert_eq!(other.status, CampaignStatus::Draft);
        assert_eq!(sink.count_type(EventType::CampaignActivated), 1);
    }

    /// A draft campaign that already holds a live enrollment for acct-1,
    /// written directly through the store.
    async fn campaign_with_live_enrollment(f: &Fixture) -> Uuid {
        let id = campaign(&f.store, CampaignStatus::Draft, wait_steps()).await;
        let now = Utc::now();
        f.store
            .enroll_or_skip(CampaignEnrollment {
                id: Uuid::new_v4(),
                campaign_id: id,
                account_id: "acct-1".into(),
                status: EnrollmentStatus::Active,
                current_step_id: None,
                current_step_order: 1,
                next_step_due: None,
                enrolled_at: now,
                updated_at: now,
                last_step_executed_at: None,
                completed_at: None,
                exit_reason: None,
                dispatch_attempts: 0,
                last_error: None,
                version: 0,
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_zero_step_campaign_completes_immediately() {
        let f = fixture();
        let id = campaign(&f.store, CampaignStatus::Draft, vec![]).await;

        let result = f.manager.enroll(id, &["acct-1".into()]).await.unwrap();
        assert_eq!(result.enrolled, 1);
        let e = &result.enrollments[0];
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert_eq!(e.current_step_id, None);
        assert_eq!(e.next_step_due, None);
        assert!(e.completed_at.is_some());

        let campaign = f.store.get_campaign(id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Active);

        // Completed enrollments do not block re-enrollment.
        let again = f.manager.enroll(id, &["acct-1".into()]).await.unwrap();
        assert_eq!(again.enrolled, 1);
    }

    #[tokio::test]
    async fn test_zero_step_campaign_can_stay_active() {
        let f = fixture();
        let manager = f.manager.clone().with_complete_empty_enrollments(false);
        let id = campaign(&f.store, CampaignStatus::Active, vec![]).await;

        let result = manager.enroll(id, &["acct-1".into()]).await.unwrap();
        let e = &result.enrollments[0];
        assert_eq!(e.status, EnrollmentStatus::Active);
        assert_eq!(e.current_step_id, None);
        assert_eq!(e.next_step_due, None);

        let again = manager.enroll(id, &["acct-1".into()]).await.unwrap();
        assert_eq!(again.skipped, 1);
    }

    #[tokio::test]
    async fn test_pause_resume_recomputes_due_from_resume_time() {
        let f = fixture();
        let id = campaign(&f.store, CampaignStatus::Active, wait_steps()).await;
        let t0 = Utc::now();
        let e = f
            .manager
            .enroll_at(id, &["acct-1".into()], t0)
            .await
            .unwrap()
            .enrollments
            .remove(0);

        let paused = f.manager.pause_at(e.id, t0 + Duration::hours(3)).await.unwrap();
        assert_eq!(paused.status, EnrollmentStatus::Paused);

        let resumed_at = t0 + Duration::hours(10);
        let resumed = f.manager.resume_at(e.id, resumed_at).await.unwrap();
        assert_eq!(resumed.status, EnrollmentStatus::Active);
        assert_eq!(resumed.current_step_order, 1);
        assert_eq!(resumed.next_step_due, Some(resumed_at + Duration::hours(24)));

        let err = f.manager.resume(e.id).await.unwrap_err();
        assert!(matches!(err, CampaignError::InvalidEnrollmentTransition { .. }));
    }

    #[tokio::test]
    async fn test_exit_is_terminal_and_frees_account() {
        let f = fixture();
        let id = campaign(&f.store, CampaignStatus::Active, wait_steps()).await;
        let e = f
            .manager
            .enroll(id, &["acct-1".into()])
            .await
            .unwrap()
            .enrollments
            .remove(0);

        let exited = f.manager.exit(e.id, Some("renewed".into())).await.unwrap();
        assert_eq!(exited.status, EnrollmentStatus::Exited);
        assert_eq!(exited.exit_reason.as_deref(), Some("renewed"));
        assert_eq!(exited.next_step_due, None);

        assert!(f.manager.pause(e.id).await.is_err());
        let again = f.manager.enroll(id, &["acct-1".into()]).await.unwrap();
        assert_eq!(again.enrolled, 1);
    }
}
