//! Shell-command broker: callers queue a command, the remote executor polls
//! it out, runs it, and posts the exit code and output back.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::approval::{ApprovalGate, TOOL_SHELL};
use crate::broker::{Broker, ItemStatus, SubmitOutcome, WorkItem};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    pub working_directory: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    #[serde(default)]
    pub command_id: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// The synthetic outcome for a command the user refused. Never admitted to
/// the engine, so it is distinguishable from a timeout ("no result").
fn rejected_result() -> CommandResult {
    CommandResult {
        command_id: "rejected".to_string(),
        exit_code: -1,
        stdout: Some(String::new()),
        stderr: Some("Command rejected by user".to_string()),
    }
}

pub struct CommandBroker {
    engine: Broker<CommandPayload, CommandResult>,
    /// Completed results, kept after the waiter resolves so a later
    /// `/cmd/status` lookup still finds the outcome. Append-only.
    results: DashMap<String, CommandResult>,
    approvals: Arc<ApprovalGate>,
    timeout: Duration,
}

impl CommandBroker {
    pub fn new(engine: Broker<CommandPayload, CommandResult>, approvals: Arc<ApprovalGate>, timeout: Duration) -> Self {
        Self {
            engine,
            results: DashMap::new(),
            approvals,
            timeout,
        }
    }

    /// Queue a command and wait for its result.
    ///
    /// With a session attached the command first passes the approval gate;
    /// a rejection (or gate timeout) returns the sentinel result without the
    /// command ever becoming visible to pollers. Engine timeout or
    /// cancellation returns `None`.
    pub async fn queue_command(
        &self,
        command: &str,
        working_directory: Option<String>,
        session_id: Option<String>,
        cancel: CancellationToken,
    ) -> Option<CommandResult> {
        if let Some(sid) = session_id.as_deref() {
            let approved = self
                .approvals
                .request_approval(sid, TOOL_SHELL, command, self.timeout, cancel.clone())
                .await;
            if !approved {
                warn!(command = %command, "command rejected by user");
                return Some(rejected_result());
            }
        }

        let payload = CommandPayload {
            command: command.to_string(),
            working_directory,
            session_id,
        };

        match self.engine.submit(payload, self.timeout, cancel).await {
            Ok(SubmitOutcome::Completed(result)) => {
                info!(
                    id = %result.command_id,
                    exit_code = result.exit_code,
                    stdout_len = result.stdout.as_deref().map_or(0, str::len),
                    "command completed"
                );
                Some(result)
            }
            Ok(SubmitOutcome::TimedOut) | Ok(SubmitOutcome::Cancelled) => None,
            Err(err) => {
                warn!(error = %err, "failed to queue command");
                None
            }
        }
    }

    /// Claim the oldest pending command for the polling executor.
    pub fn poll_pending_command(&self) -> Option<WorkItem<CommandPayload>> {
        let item = self.engine.poll_next()?;
        info!(id = %item.id, command = %item.payload.command, "dispatched command to client");
        Some(item)
    }

    /// Record a result posted by the executor and wake the waiting caller.
    /// Results with an empty identifier are ignored.
    pub fn submit_result(&self, result: CommandResult) {
        if result.command_id.is_empty() {
            return;
        }

        info!(id = %result.command_id, exit_code = result.exit_code, "result received");

        let id = result.command_id.clone();
        self.results
            .entry(id.clone())
            .or_insert_with(|| result.clone());
        self.engine.complete(&id, result);
    }

    /// Completed result lookup, surviving waiter resolution.
    pub fn command_status(&self, command_id: &str) -> Option<CommandResult> {
        self.results.get(command_id).map(|r| r.value().clone())
    }

    pub fn is_pending(&self, command_id: &str) -> bool {
        self.engine.contains(command_id)
    }

    pub fn pending_status(&self, command_id: &str) -> Option<ItemStatus> {
        self.engine.status_of(command_id)
    }

    pub fn stats(&self) -> crate::broker::BrokerStats {
        self.engine.stats()
    }
}
