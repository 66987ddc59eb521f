//! Operator confirmations and the manual intervention escape hatch.

use std::io;
use std::sync::Arc;

use dialoguer::{theme::ColorfulTheme, Confirm};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::warn;

use crate::remediation::CONSENSUS_LOG_PATH;

/// Asks the operator before the workflow does something destructive.
pub trait ConfirmationPort: Send + Sync {
    /// Ask a yes/no question. `false` declines.
    fn confirm(&self, prompt: &str) -> bool;

    /// Hand control to the operator for a manual fix and wait for them to
    /// report back. `true` means they completed it.
    fn acknowledge_manual(&self, request: &ManualInterventionRequest) -> bool;
}

/// Approves every automated step up front and never performs manual work.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl ConfirmationPort for AutoApprove {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }

    fn acknowledge_manual(&self, request: &ManualInterventionRequest) -> bool {
        warn!(
            service = %request.service,
            "Manual intervention requested in non-interactive mode; skipping"
        );
        false
    }
}

/// Interactive prompts on the controlling terminal.
///
/// Ctrl+C at a prompt arrives as a key press rather than a signal, so it is
/// reported through [`TerminalConfirmation::interrupted`].
#[derive(Debug, Clone, Default)]
pub struct TerminalConfirmation {
    interrupt: Arc<Notify>,
}

impl TerminalConfirmation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves once the operator pressed Ctrl+C at one of the prompts.
    pub async fn interrupted(&self) {
        self.interrupt.notified().await;
    }

    fn ask(&self, prompt: &str) -> bool {
        let answer = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(false)
            .interact();
        self.settle(answer)
    }

    fn settle(&self, answer: dialoguer::Result<bool>) -> bool {
        match answer {
            Ok(answer) => answer,
            Err(dialoguer::Error::IO(e)) if e.kind() == io::ErrorKind::Interrupted => {
                warn!("Prompt interrupted by operator");
                self.interrupt.notify_one();
                false
            }
            Err(e) => {
                warn!(error = %e, "Prompt failed; treating as declined");
                false
            }
        }
    }
}

impl ConfirmationPort for TerminalConfirmation {
    fn confirm(&self, prompt: &str) -> bool {
        self.ask(prompt)
    }

    fn acknowledge_manual(&self, request: &ManualInterventionRequest) -> bool {
        println!();
        for line in request.instructions() {
            println!("  {line}");
        }
        println!();
        self.ask("Manual cleanup finished?")
    }
}

/// Whether the workflow may fall back to a manual fix, and what it costs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualInterventionPolicy {
    /// Offer a manual step once automated remediation has not helped
    pub enabled: bool,
    /// The manual step uses one of the `max_retries` slots instead of coming
    /// on top of them
    pub counts_against_retries: bool,
}

impl ManualInterventionPolicy {
    /// Automated remediation slots left once the manual step is accounted for.
    #[must_use]
    pub fn automated_slots(&self, max_retries: u32) -> u32 {
        if self.enabled && self.counts_against_retries {
            max_retries.saturating_sub(1)
        } else {
            max_retries
        }
    }

    /// Whether a manual step can run at all with this retry budget.
    #[must_use]
    pub fn allows_manual(&self, max_retries: u32) -> bool {
        self.enabled && (!self.counts_against_retries || max_retries >= 1)
    }
}

/// What the operator is asked to do by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManualInterventionRequest {
    /// Namespace of the consensus store
    pub namespace: String,
    /// Statefulset whose replicas need their raft log removed
    pub service: String,
    /// Claims to clean, in order
    pub volume_claims: Vec<String>,
}

impl ManualInterventionRequest {
    /// Step-by-step instructions for the operator.
    #[must_use]
    pub fn instructions(&self) -> Vec<String> {
        let mut lines = vec![
            format!(
                "Scale {} to 0: kubectl -n {} scale statefulset/{} --replicas=0",
                self.service, self.namespace, self.service
            ),
            "For each claim, mount it in a helper pod and remove the raft log:".to_string(),
        ];
        lines.extend(
            self.volume_claims
                .iter()
                .map(|claim| format!("  {claim}: rm -f {CONSENSUS_LOG_PATH}")),
        );
        lines.push(format!(
            "Scale {} back up and wait for the replicas to elect a leader",
            self.service
        ));
        lines
    }
}

/// Outcome of the manual step, kept in the workflow record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManualInterventionRecord {
    /// What was asked
    pub request: ManualInterventionRequest,
    /// The operator reported the fix as done
    pub acknowledged: bool,
    /// The step used a retry slot
    pub counted_against_retries: bool,
}
