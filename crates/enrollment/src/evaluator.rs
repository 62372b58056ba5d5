use std::cmp::Ordering;

use async_trait::async_trait;
use campaign_core::CampaignResult;
use tracing::debug;

use crate::types::{Account, BranchAction, Comparison, ConditionConfig, ConditionRule};

/// Decides where an enrollment goes after a condition step.
#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        config: &ConditionConfig,
        account: &Account,
    ) -> CampaignResult<BranchAction>;
}

/// Evaluates `ConditionRule`s against an account snapshot.
#[derive(Debug, Clone, Default)]
pub struct RuleEvaluator;

impl RuleEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluates a single rule against the account.
    ///
    /// Supports:
    /// - `exists` / `missing` -> presence of the attribute
    /// - `eq` / `ne` -> JSON equality
    /// - `gt` / `gte` / `lt` / `lte` -> numeric comparison, falling back to
    ///   string comparison when both sides are strings
    ///
    /// A comparison against a missing attribute is false.
    pub fn matches(&self, rule: &ConditionRule, account: &Account) -> bool {
        let actual = Self::lookup(&rule.attribute, account);
        match rule.operator {
            Comparison::Exists => actual.is_some(),
            Comparison::Missing => actual.is_none(),
            Comparison::Eq => actual.as_ref() == Some(&rule.value),
            Comparison::Ne => actual.map(|v| v != rule.value).unwrap_or(false),
            Comparison::Gt => Self::order(actual, &rule.value) == Some(Ordering::Greater),
            Comparison::Gte => matches!(
                Self::order(actual, &rule.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Comparison::Lt => Self::order(actual, &rule.value) == Some(Ordering::Less),
            Comparison::Lte => matches!(
                Self::order(actual, &rule.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    fn lookup(attribute: &str, account: &Account) -> Option<serde_json::Value> {
        match attribute {
            "health_score" => account.health_score.map(serde_json::Value::from),
            "name" => Some(serde_json::Value::from(account.name.clone())),
            "id" => Some(serde_json::Value::from(account.id.clone())),
            key => account
                .attributes
                .get(key)
                .filter(|v| !v.is_null())
                .cloned(),
        }
    }

    fn order(actual: Option<serde_json::Value>, expected: &serde_json::Value) -> Option<Ordering> {
        let actual = actual?;
        match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => match (actual.as_str(), expected.as_str()) {
                (Some(a), Some(b)) => Some(a.cmp(b)),
                _ => None,
            },
        }
    }
}

#[async_trait]
impl ConditionEvaluator for RuleEvaluator {
    async fn evaluate(
        &self,
        config: &ConditionConfig,
        account: &Account,
    ) -> CampaignResult<BranchAction> {
        let matched = self.matches(&config.rule, account);
        debug!(
            account_id = %account.id,
            attribute = %config.rule.attribute,
            matched,
            "Condition evaluated"
        );
        Ok(if matched {
            config.on_match.clone()
        } else {
            config.otherwise.clone()
        })
    }
}
