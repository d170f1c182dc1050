use crate::{
    error::{InstallerError, InstallerResult},
    planner::{format_conflicts, TransactionPlan},
};
use async_trait::async_trait;
use colored::*;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub decision: Decision,
    pub override_conflicts: bool,
}

impl Confirmation {
    pub fn rejected() -> Self {
        Self {
            decision: Decision::Reject,
            override_conflicts: false,
        }
    }

    pub fn accepted(&self) -> bool {
        self.decision == Decision::Accept
    }
}

#[async_trait]
pub trait ConfirmationPrompt: Send + Sync {
    async fn confirm_conflicts(&self, plan: &TransactionPlan) -> InstallerResult<Decision>;

    async fn confirm_plan(&self, plan: &TransactionPlan) -> InstallerResult<Decision>;
}

#[derive(Clone)]
pub struct ConfirmationGate {
    prompt: Arc<dyn ConfirmationPrompt>,
}

impl ConfirmationGate {
    pub fn new(prompt: Arc<dyn ConfirmationPrompt>) -> Self {
        Self { prompt }
    }

    /// Conflict override first (if any), then the ordinary confirmation.
    /// Rejecting the override ends the exchange without the second question.
    pub async fn confirm(&self, plan: &TransactionPlan) -> InstallerResult<Confirmation> {
        let override_conflicts = plan.requires_override();
        if override_conflicts {
            debug!("Plan has {} conflicts, asking for override", plan.conflicts.len());
            if self.prompt.confirm_conflicts(plan).await? == Decision::Reject {
                info!("Conflict override rejected for {}", plan.targets.join(" "));
                return Ok(Confirmation::rejected());
            }
        }

        let decision = self.prompt.confirm_plan(plan).await?;
        info!("{} of {}: {:?}", plan.operation, plan.targets.join(" "), decision);
        Ok(Confirmation {
            decision,
            override_conflicts: override_conflicts && decision == Decision::Accept,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoPolicy {
    pub accept: bool,
    pub override_conflicts: bool,
}

impl AutoPolicy {
    pub fn accept_clean() -> Self {
        Self {
            accept: true,
            override_conflicts: false,
        }
    }

    pub fn accept_all() -> Self {
        Self {
            accept: true,
            override_conflicts: true,
        }
    }

    pub fn reject() -> Self {
        Self {
            accept: false,
            override_conflicts: false,
        }
    }
}

fn decision(yes: bool) -> Decision {
    if yes { Decision::Accept } else { Decision::Reject }
}

#[async_trait]
impl ConfirmationPrompt for AutoPolicy {
    async fn confirm_conflicts(&self, _plan: &TransactionPlan) -> InstallerResult<Decision> {
        Ok(decision(self.override_conflicts))
    }

    async fn confirm_plan(&self, _plan: &TransactionPlan) -> InstallerResult<Decision> {
        Ok(decision(self.accept))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DialoguerPrompt;

impl DialoguerPrompt {
    async fn ask(question: String, default: bool) -> InstallerResult<Decision> {
        let answer = tokio::task::spawn_blocking(move || {
            dialoguer::Confirm::new()
                .with_prompt(question)
                .default(default)
                .interact()
        })
        .await?
        .map_err(|e| InstallerError::Io(std::io::Error::other(e.to_string())))?;
        Ok(decision(answer))
    }
}

#[async_trait]
impl ConfirmationPrompt for DialoguerPrompt {
    async fn confirm_conflicts(&self, plan: &TransactionPlan) -> InstallerResult<Decision> {
        println!("{}", "The following packages have conflicts.".red().bold());
        println!("\n{}\n", plan.targets.join(" "));
        println!("{}", format_conflicts(&plan.conflicts).yellow());
        if let Some(message) = plan.trial.as_ref().and_then(|t| t.message.as_ref()) {
            println!("{}", message.yellow());
        }
        Self::ask("Resolve and install anyway?".to_string(), false).await
    }

    async fn confirm_plan(&self, plan: &TransactionPlan) -> InstallerResult<Decision> {
        println!("{}", "The following packages were selected.".bold());
        println!("\n{}\n", plan.targets.join(" "));
        println!("{}\n", plan.summary_text);
        if !plan.details_text.is_empty() {
            println!("{}\n", plan.details_text.cyan());
        }
        Self::ask(format!("Proceed with {}?", plan.operation), true).await
    }
}
