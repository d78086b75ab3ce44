//! End-to-end flow against the local cluster driver: create an
//! environment, attach a terminal, drive the lifecycle, tear down.

use std::sync::Arc;
use std::time::Duration;

use devgrid_cluster::{ClusterRegistry, seal_credential};
use devgrid_core::{Principal, SubscriptionTier};
use devgrid_orchestrator::{Orchestrator, OrchestratorError, RetryPolicy};
use devgrid_relay::{Frame, Relay, RelayError};
use devgrid_state::{ClusterHealth, ClusterRecord, EnvStatus, StateStore};
use devgridd::local::LocalConnector;

struct Harness {
    state: StateStore,
    registry: Arc<ClusterRegistry>,
    orchestrator: Orchestrator,
    relay: Relay,
}

fn harness() -> Harness {
    let state = StateStore::open_in_memory().unwrap();
    let registry = Arc::new(ClusterRegistry::new(
        state.clone(),
        Arc::new(LocalConnector::new("/bin/sh")),
        3,
        2,
    ));
    state
        .put_cluster(&ClusterRecord {
            id: "local".to_string(),
            name: "local machine".to_string(),
            region: "dev".to_string(),
            health: ClusterHealth::Healthy,
            credential: seal_credential(b"local"),
            capacity: 10,
            active_environments: 0,
            created_at: 0,
            updated_at: 0,
        })
        .unwrap();

    let orchestrator = Orchestrator::new(
        state.clone(),
        registry.clone(),
        RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            call_timeout: Duration::from_millis(500),
        },
        Duration::from_millis(5),
        Duration::from_secs(5),
    );
    let relay = Relay::new(
        state.clone(),
        registry.clone(),
        orchestrator.clone(),
        100,
        50,
        Duration::from_secs(600),
    );
    Harness {
        state,
        registry,
        orchestrator,
        relay,
    }
}

fn alice() -> Principal {
    Principal::user("alice", SubscriptionTier::Free)
}

async fn wait_for(state: &StateStore, env_id: &str, status: EnvStatus) {
    for _ in 0..400 {
        if let Some(env) = state.get_environment(env_id).unwrap() {
            if env.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("environment {env_id} never reached {status}");
}

#[tokio::test]
async fn full_environment_and_terminal_lifecycle() {
    let h = harness();

    // Create reaches running and claims a capacity slot.
    let env = h
        .orchestrator
        .create(&alice(), "devbox", "python")
        .await
        .unwrap();
    wait_for(&h.state, &env.id, EnvStatus::Running).await;
    assert_eq!(
        h.registry.get_cluster("local").unwrap().active_environments,
        1
    );

    // Attach a terminal and run a command through the shell.
    let mut channel = h.relay.open(&alice(), &env.id).await.unwrap();
    channel
        .to_relay
        .send(Frame::Input {
            data: "echo from-devgrid\n".to_string(),
        })
        .await
        .unwrap();

    let mut seen = String::new();
    for _ in 0..100 {
        match tokio::time::timeout(Duration::from_millis(100), channel.from_relay.recv()).await {
            Ok(Some(Frame::Output { data })) => {
                seen.push_str(&data);
                if seen.contains("from-devgrid") {
                    break;
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => panic!("terminal channel closed early"),
            Err(_) => {}
        }
    }
    assert!(seen.contains("from-devgrid"), "shell output never arrived: {seen:?}");

    // Close the terminal before the lifecycle moves on.
    h.relay.close_session(&channel.connection_id, None).await;
    assert!(
        !h.state
            .get_session(&channel.connection_id)
            .unwrap()
            .unwrap()
            .live
    );

    // Stop → terminal refused → start → running again.
    let stopped = h.orchestrator.stop("alice", &env.id).await.unwrap();
    assert_eq!(stopped.status, EnvStatus::Stopped);

    let err = h.relay.open(&alice(), &env.id).await.unwrap_err();
    assert!(matches!(
        err,
        RelayError::EnvironmentNotReady {
            status: EnvStatus::Stopped
        }
    ));

    h.orchestrator.start("alice", &env.id).await.unwrap();
    wait_for(&h.state, &env.id, EnvStatus::Running).await;

    // Delete releases the slot and the record survives for audit.
    let deleted = h.orchestrator.delete("alice", &env.id).await.unwrap();
    assert_eq!(deleted.status, EnvStatus::Terminated);
    assert_eq!(
        h.registry.get_cluster("local").unwrap().active_environments,
        0
    );
    assert!(h.state.get_environment(&env.id).unwrap().is_some());
}

#[tokio::test]
async fn quota_holds_across_the_full_stack() {
    let h = harness();

    let env = h
        .orchestrator
        .create(&alice(), "only-one", "python")
        .await
        .unwrap();
    wait_for(&h.state, &env.id, EnvStatus::Running).await;

    let err = h
        .orchestrator
        .create(&alice(), "second", "python")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::QuotaExceeded(_)));

    // Deleting frees the quota for a new environment.
    h.orchestrator.delete("alice", &env.id).await.unwrap();
    let replacement = h
        .orchestrator
        .create(&alice(), "second", "python")
        .await
        .unwrap();
    wait_for(&h.state, &replacement.id, EnvStatus::Running).await;
}
