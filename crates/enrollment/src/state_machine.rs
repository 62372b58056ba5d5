use campaign_core::{CampaignError, CampaignResult};
use uuid::Uuid;

use crate::types::{CampaignStatus, EnrollmentStatus};

/// Describes a single valid state transition.
#[derive(Debug, Clone, Copy)]
pub struct StateTransition<S> {
    pub from: S,
    pub to: S,
    pub trigger: &'static str,
}

/// Every transition an enrollment may take. `completed`, `exited` and
/// `failed` have no outgoing edges.
pub const ENROLLMENT_TRANSITIONS: &[StateTransition<EnrollmentStatus>] = &[
    // Active ->
    StateTransition {
        from: EnrollmentStatus::Active,
        to: EnrollmentStatus::Active,
        trigger: "step_advanced",
    },
    StateTransition {
        from: EnrollmentStatus::Active,
        to: EnrollmentStatus::Paused,
        trigger: "pause",
    },
    StateTransition {
        from: EnrollmentStatus::Active,
        to: EnrollmentStatus::Completed,
        trigger: "sequence_complete",
    },
    StateTransition {
        from: EnrollmentStatus::Active,
        to: EnrollmentStatus::Exited,
        trigger: "exit",
    },
    StateTransition {
        from: EnrollmentStatus::Active,
        to: EnrollmentStatus::Failed,
        trigger: "dispatch_exhausted",
    },
    // Paused ->
    StateTransition {
        from: EnrollmentStatus::Paused,
        to: EnrollmentStatus::Active,
        trigger: "resume",
    },
    StateTransition {
        from: EnrollmentStatus::Paused,
        to: EnrollmentStatus::Exited,
        trigger: "exit",
    },
];

/// Campaign status table. Same-status writes are accepted separately as
/// no-ops; `archived` is final.
pub const CAMPAIGN_TRANSITIONS: &[StateTransition<CampaignStatus>] = &[
    StateTransition {
        from: CampaignStatus::Draft,
        to: CampaignStatus::Active,
        trigger: "first_enrollment",
    },
    StateTransition {
        from: CampaignStatus::Draft,
        to: CampaignStatus::Archived,
        trigger: "archive",
    },
    StateTransition {
        from: CampaignStatus::Active,
        to: CampaignStatus::Paused,
        trigger: "pause",
    },
    StateTransition {
        from: CampaignStatus::Active,
        to: CampaignStatus::Archived,
        trigger: "archive",
    },
    StateTransition {
        from: CampaignStatus::Paused,
        to: CampaignStatus::Active,
        trigger: "resume",
    },
    StateTransition {
        from: CampaignStatus::Paused,
        to: CampaignStatus::Archived,
        trigger: "archive",
    },
];

/// Guards enrollment lifecycle by enforcing `ENROLLMENT_TRANSITIONS`.
#[derive(Debug, Clone)]
pub struct EnrollmentStateMachine {
    pub enrollment_id: Uuid,
    pub state: EnrollmentStatus,
}

impl EnrollmentStateMachine {
    pub fn new(enrollment_id: Uuid, state: EnrollmentStatus) -> Self {
        Self {
            enrollment_id,
            state,
        }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(from: EnrollmentStatus, to: EnrollmentStatus) -> bool {
        ENROLLMENT_TRANSITIONS
            .iter()
            .any(|t| t.from == from && t.to == to)
    }

    /// Attempts to move the state machine to `to`.
    pub fn transition(&mut self, to: EnrollmentStatus) -> CampaignResult<()> {
        if Self::can_transition(self.state, to) {
            self.state = to;
            Ok(())
        } else {
            Err(CampaignError::InvalidEnrollmentTransition {
                id: self.enrollment_id,
                from: self.state.to_string(),
                to: to.to_string(),
            })
        }
    }
}

/// Checks a requested campaign status write against `CAMPAIGN_TRANSITIONS`.
pub fn check_campaign_transition(from: CampaignStatus, to: CampaignStatus) -> CampaignResult<()> {
    if from == to
        || CAMPAIGN_TRANSITIONS
            .iter()
            .any(|t| t.from == from && t.to == to)
    {
        Ok(())
    } else {
        Err(CampaignError::InvalidStatusTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
