//! Integration tests for the command broker: queue/poll/result rendezvous,
//! approval gating, status lookups.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use backhaul::approval::ApprovalGate;
use backhaul::broker::{Broker, ItemStatus, WorkItem};
use backhaul::command::{CommandBroker, CommandPayload, CommandResult};

fn broker_with_timeout(timeout: Duration) -> (Arc<CommandBroker>, Arc<ApprovalGate>) {
    let gate = Arc::new(ApprovalGate::new());
    let broker = Arc::new(CommandBroker::new(Broker::new("cmd"), gate.clone(), timeout));
    (broker, gate)
}

async fn wait_for_dispatch(broker: &CommandBroker) -> WorkItem<CommandPayload> {
    for _ in 0..100 {
        if let Some(item) = broker.poll_pending_command() {
            return item;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no pending command appeared");
}

async fn wait_for_approval(
    gate: &ApprovalGate,
    session_id: &str,
) -> WorkItem<backhaul::approval::ApprovalRequest> {
    for _ in 0..100 {
        if let Some(item) = gate.poll_pending(session_id) {
            return item;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no pending approval appeared for {session_id}");
}

// ---------------------------------------------------------------------------
// End-to-end rendezvous
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queued_command_round_trips_result() {
    let (broker, _gate) = broker_with_timeout(Duration::from_secs(2));

    let caller = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .queue_command("dir", None, None, CancellationToken::new())
                .await
        })
    };

    let item = wait_for_dispatch(&broker).await;
    assert_eq!(item.payload.command, "dir");
    assert_eq!(item.status, ItemStatus::Dispatched);

    broker.submit_result(CommandResult {
        command_id: item.id.clone(),
        exit_code: 0,
        stdout: Some("file1.txt".to_string()),
        stderr: None,
    });

    let result = caller.await.unwrap().expect("caller should get the result");
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout.as_deref(), Some("file1.txt"));

    // The outcome stays retrievable after the waiter resolved.
    let status = broker.command_status(&item.id).expect("status retained");
    assert_eq!(status.stdout.as_deref(), Some("file1.txt"));
    assert!(!broker.is_pending(&item.id));
}

#[tokio::test]
async fn poll_skips_already_dispatched_commands() {
    let (broker, _gate) = broker_with_timeout(Duration::from_secs(2));

    for (i, command) in ["dir", "echo hello"].into_iter().enumerate() {
        let spawn_broker = broker.clone();
        tokio::spawn(async move {
            spawn_broker
                .queue_command(command, None, None, CancellationToken::new())
                .await
        });
        // Make admission order deterministic.
        wait_for_live_count(&broker, i + 1).await;
    }

    let first = broker.poll_pending_command().unwrap();
    assert_eq!(first.payload.command, "dir");

    let second = broker.poll_pending_command().unwrap();
    assert_eq!(second.payload.command, "echo hello");

    assert!(broker.poll_pending_command().is_none());
}

async fn wait_for_live_count(broker: &CommandBroker, n: usize) {
    for _ in 0..100 {
        if broker.stats().live_items >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("broker never admitted {n} command(s)");
}

// ---------------------------------------------------------------------------
// Approval gating
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approved_command_is_admitted_and_completes() {
    let (broker, gate) = broker_with_timeout(Duration::from_secs(2));

    let caller = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .queue_command("dir", None, Some("session1".to_string()), CancellationToken::new())
                .await
        })
    };

    // Act as the approval UI.
    let pending = wait_for_approval(&gate, "session1").await;
    assert_eq!(pending.payload.tool_name, "Bash");
    assert_eq!(pending.payload.tool_input, "dir");
    gate.submit_response(&pending.id, true);

    // Act as the remote executor.
    let item = wait_for_dispatch(&broker).await;
    broker.submit_result(CommandResult {
        command_id: item.id,
        exit_code: 0,
        stdout: Some("ok".to_string()),
        stderr: None,
    });

    let result = caller.await.unwrap().unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout.as_deref(), Some("ok"));
}

#[tokio::test]
async fn rejected_command_returns_sentinel_and_is_never_admitted() {
    let (broker, gate) = broker_with_timeout(Duration::from_secs(2));

    let caller = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .queue_command("dir", None, Some("session1".to_string()), CancellationToken::new())
                .await
        })
    };

    // The command must not become pollable while the approval is open.
    let pending = {
        let mut found = None;
        for _ in 0..100 {
            assert!(broker.poll_pending_command().is_none());
            if let Some(item) = gate.poll_pending("session1") {
                found = Some(item);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        found.expect("no pending approval appeared")
    };
    gate.submit_response(&pending.id, false);

    let result = caller.await.unwrap().expect("rejection is a result, not a timeout");
    assert_eq!(result.exit_code, -1);
    assert_eq!(result.command_id, "rejected");
    assert_eq!(result.stderr.as_deref(), Some("Command rejected by user"));

    // Nor afterwards.
    assert!(broker.poll_pending_command().is_none());
    assert_eq!(broker.stats().live_items, 0);
}

// ---------------------------------------------------------------------------
// Timeouts and edge cases
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeout_returns_none_and_clears_pending() {
    let (broker, _gate) = broker_with_timeout(Duration::from_millis(100));

    let result = broker
        .queue_command("dir", None, None, CancellationToken::new())
        .await;

    assert!(result.is_none());
    assert_eq!(broker.stats().live_items, 0);
}

#[tokio::test]
async fn result_with_empty_id_is_ignored() {
    let (broker, _gate) = broker_with_timeout(Duration::from_secs(2));

    broker.submit_result(CommandResult {
        command_id: String::new(),
        exit_code: 0,
        stdout: None,
        stderr: None,
    });

    assert!(broker.command_status("").is_none());
}

#[tokio::test]
async fn status_lookup_for_unknown_command() {
    let (broker, _gate) = broker_with_timeout(Duration::from_secs(2));

    assert!(broker.command_status("cmd-000000000042").is_none());
    assert!(!broker.is_pending("cmd-000000000042"));
    assert!(broker.pending_status("cmd-000000000042").is_none());
}

#[tokio::test]
async fn pending_status_tracks_dispatch() {
    let (broker, _gate) = broker_with_timeout(Duration::from_secs(2));

    let _caller = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .queue_command("dir", None, None, CancellationToken::new())
                .await
        })
    };

    let item = wait_for_dispatch(&broker).await;
    assert_eq!(broker.pending_status(&item.id), Some(ItemStatus::Dispatched));
    assert!(broker.is_pending(&item.id));
}
