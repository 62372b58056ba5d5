//! Demo data: a three-step win-back campaign and a handful of accounts.

use serde_json::json;

use campaign_core::CampaignResult;
use tracing::info;

use crate::directory::StaticAccountDirectory;
use crate::lifecycle::CampaignLifecycle;
use crate::manager::EnrollmentManager;
use crate::types::{
    Account, CampaignTrigger, EmailConfig, EnrollmentResult, NewCampaign, NewStep, StepConfig,
    TaskConfig, TaskPriority,
};

/// Email now, wait two days, then open a follow-up task for the owner.
pub fn win_back_campaign() -> NewCampaign {
    NewCampaign {
        name: "Win-back".into(),
        description: "Re-engage accounts whose usage has dropped".into(),
        trigger: CampaignTrigger::Manual,
        trigger_conditions: json!({ "health_score": { "lt": 50 } }),
        owner: Some("cs-team".into()),
        steps: vec![
            NewStep::new(
                "We miss you",
                StepConfig::Email(EmailConfig {
                    subject: "We miss you, {{account.name}}".into(),
                    body: "Here is what changed since your last visit.".into(),
                    template: Some("win_back_v1".into()),
                }),
            ),
            NewStep::new("Give it two days", StepConfig::Wait).after(2, 0),
            NewStep::new(
                "Call the account",
                StepConfig::Task(TaskConfig {
                    title: "Follow up with {{account.name}}".into(),
                    description: Some("No reply to the win-back email".into()),
                    priority: TaskPriority::High,
                    assignee: None,
                }),
            ),
        ],
    }
}

pub fn demo_accounts() -> Vec<Account> {
    vec![
        Account::new("acct-acme", "Acme Corp")
            .with_health_score(38.0)
            .with_attribute("plan", json!("enterprise")),
        Account::new("acct-globex", "Globex")
            .with_health_score(44.5)
            .with_attribute("plan", json!("growth")),
        Account::new("acct-initech", "Initech")
            .with_health_score(21.0)
            .with_attribute("plan", json!("starter")),
    ]
}

/// Register the demo accounts, create the win-back campaign, and enroll
/// every demo account into it.
pub async fn seed(
    lifecycle: &CampaignLifecycle,
    manager: &EnrollmentManager,
    directory: &StaticAccountDirectory,
) -> CampaignResult<EnrollmentResult> {
    let accounts = demo_accounts();
    let ids: Vec<String> = accounts.iter().map(|a| a.id.clone()).collect();
    for account in accounts {
        directory.upsert(account);
    }

    let created = lifecycle.create_campaign(win_back_campaign()).await?;
    let result = manager.enroll(created.campaign.id, &ids).await?;
    info!(
        campaign_id = %created.campaign.id,
        enrolled = result.enrolled,
        "Demo campaign seeded"
    );
    Ok(result)
}
