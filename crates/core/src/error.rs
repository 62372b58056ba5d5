use thiserror::Error;
use uuid::Uuid;

pub type CampaignResult<T> = Result<T, CampaignError>;

/// Broad failure classes used to decide how a caller reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input or an operation the current state does not allow.
    /// Reported to the caller, nothing was mutated.
    Validation,
    /// An outreach or condition collaborator failed or timed out.
    /// The owning step is retried on the next sweep.
    Dispatch,
    /// The store was unavailable or rejected the write.
    Persistence,
    Internal,
}

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Campaign {0} not found")]
    CampaignNotFound(Uuid),

    #[error("Campaign {id} is {status} and cannot accept enrollments")]
    CampaignNotEnrollable { id: Uuid, status: String },

    #[error("None of the requested accounts could be resolved")]
    NoValidAccounts,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid campaign status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Campaign {0} has live enrollments, its steps can no longer change")]
    StepsLocked(Uuid),

    #[error("Enrollment {0} not found")]
    EnrollmentNotFound(Uuid),

    #[error("Enrollment {id} cannot move from {from} to {to}")]
    InvalidEnrollmentTransition { id: Uuid, from: String, to: String },

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Dispatch timed out after {0}ms")]
    DispatchTimeout(u64),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Enrollment {0} was modified concurrently")]
    ConcurrentModification(Uuid),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CampaignError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::CampaignNotFound(_)
            | Self::CampaignNotEnrollable { .. }
            | Self::NoValidAccounts
            | Self::Validation(_)
            | Self::InvalidStatusTransition { .. }
            | Self::StepsLocked(_)
            | Self::EnrollmentNotFound(_)
            | Self::InvalidEnrollmentTransition { .. } => ErrorCategory::Validation,
            Self::Dispatch(_) | Self::DispatchTimeout(_) => ErrorCategory::Dispatch,
            Self::Persistence(_) | Self::ConcurrentModification(_) => ErrorCategory::Persistence,
            Self::Config(_) | Self::Serialization(_) | Self::Internal(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// True when repeating the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Dispatch(_) | Self::DispatchTimeout(_) | Self::ConcurrentModification(_)
        )
    }
}

impl From<config::ConfigError> for CampaignError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            CampaignError::NoValidAccounts.category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            CampaignError::DispatchTimeout(250).category(),
            ErrorCategory::Dispatch
        );
        assert_eq!(
            CampaignError::Persistence("down".into()).category(),
            ErrorCategory::Persistence
        );
        assert_eq!(
            CampaignError::Internal(anyhow::anyhow!("boom")).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_retryable() {
        assert!(CampaignError::Dispatch("smtp 421".into()).is_retryable());
        assert!(CampaignError::ConcurrentModification(Uuid::new_v4()).is_retryable());
        assert!(!CampaignError::StepsLocked(Uuid::new_v4()).is_retryable());
        assert!(!CampaignError::Persistence("constraint".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let id = Uuid::nil();
        let err = CampaignError::CampaignNotEnrollable {
            id,
            status: "archived".into(),
        };
        assert_eq!(
            err.to_string(),
            format!("Campaign {id} is archived and cannot accept enrollments")
        );
    }
}
