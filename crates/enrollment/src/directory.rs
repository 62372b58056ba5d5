//! Account directory: resolves opaque account identifiers to snapshots.

use async_trait::async_trait;
use campaign_core::CampaignResult;
use dashmap::DashMap;
use tracing::debug;

use crate::types::Account;

/// Read-only, best-effort account lookup. Unknown ids are omitted rather
/// than reported as errors.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Resolve `ids` in request order, dropping ids that do not resolve.
    async fn resolve(&self, ids: &[String]) -> CampaignResult<Vec<Account>>;

    /// Current state of a single account.
    async fn snapshot(&self, id: &str) -> CampaignResult<Option<Account>>;
}

/// Directory backed by an in-process map. Used by the sweeper's local mode
/// and by tests.
#[derive(Default)]
pub struct StaticAccountDirectory {
    accounts: DashMap<String, Account>,
}

impl StaticAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
        let directory = Self::new();
        for account in accounts {
            directory.upsert(account);
        }
        directory
    }

    /// Insert or replace an account snapshot.
    pub fn upsert(&self, account: Account) {
        self.accounts.insert(account.id.clone(), account);
    }

    pub fn remove(&self, id: &str) -> Option<Account> {
        self.accounts.remove(id).map(|(_, account)| account)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[async_trait]
impl AccountDirectory for StaticAccountDirectory {
    async fn resolve(&self, ids: &[String]) -> CampaignResult<Vec<Account>> {
        let resolved: Vec<Account> = ids
            .iter()
            .filter_map(|id| self.accounts.get(id).map(|r| r.value().clone()))
            .collect();
        debug!(
            requested = ids.len(),
            resolved = resolved.len(),
            "Resolved accounts"
        );
        Ok(resolved)
    }

    async fn snapshot(&self, id: &str) -> CampaignResult<Option<Account>> {
        Ok(self.accounts.get(id).map(|r| r.value().clone()))
    }
}
