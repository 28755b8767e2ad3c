//! Human-approval gate: a broker instance whose payload is a yes/no question
//! about a tool invocation, resolved by the approval UI rather than by remote
//! dispatch.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{Broker, ItemStatus, SubmitOutcome, WorkItem};

/// Tool name attached to gated shell commands.
pub const TOOL_SHELL: &str = "Bash";
/// Tool name attached to gated file writes.
pub const TOOL_WRITE: &str = "Write";

/// What the human is asked to approve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub session_id: String,
    pub tool_name: String,
    /// Full tool input, stored untruncated -- the approval UI renders the
    /// whole text. Only log lines elide it.
    pub tool_input: String,
}

pub struct ApprovalGate {
    engine: Broker<ApprovalRequest, bool>,
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self {
            engine: Broker::new("appr"),
        }
    }

    /// Queue an approval question for `session_id` and suspend until the
    /// human answers, the timeout elapses, or `cancel` fires. Anything but an
    /// explicit "yes" -- rejection, timeout, cancellation, admission failure
    /// -- comes back as `false`; the distinctions live in the logs.
    pub async fn request_approval(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_input: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> bool {
        info!(
            session_id = %session_id,
            tool = %tool_name,
            input = %elide(tool_input, 100),
            "queued approval request"
        );

        let request = ApprovalRequest {
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            tool_input: tool_input.to_string(),
        };

        match self.engine.submit(request, timeout, cancel).await {
            Ok(SubmitOutcome::Completed(approved)) => approved,
            Ok(SubmitOutcome::TimedOut) => {
                warn!(session_id = %session_id, tool = %tool_name, "approval timed out");
                false
            }
            Ok(SubmitOutcome::Cancelled) => {
                warn!(session_id = %session_id, tool = %tool_name, "approval cancelled");
                false
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "approval admission failed");
                false
            }
        }
    }

    /// First (lowest-id) pending question for `session_id`, without claiming
    /// it. Unlike the operational brokers there is no dispatch transition:
    /// the item stays pending until a human responds.
    pub fn poll_pending(&self, session_id: &str) -> Option<WorkItem<ApprovalRequest>> {
        self.engine.find_pending(|req| req.session_id == session_id)
    }

    /// Record the human decision for `id` and wake the waiting caller.
    /// Returns false if the request is unknown (already resolved or expired).
    pub fn submit_response(&self, id: &str, approved: bool) -> bool {
        let status = if approved {
            ItemStatus::Approved
        } else {
            ItemStatus::Rejected
        };
        if !self.engine.mark_status(id, status) {
            return false;
        }

        info!(id = %id, status = %status, "approval response received");
        self.engine.complete(id, approved);
        true
    }

    pub fn stats(&self) -> crate::broker::BrokerStats {
        self.engine.stats()
    }
}

/// Shorten long tool input for log lines. Display-only; stored requests keep
/// the full text.
fn elide(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let cut: String = input.chars().take(max_chars).collect();
    format!("{cut}...")
}
