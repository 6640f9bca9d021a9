use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use shell_bridge::testing::ScriptedConnector;
use shell_bridge::{
    AuditLog, AuditStatus, BridgeError, CommandDescriptor, CommandExecutor,
    InfrastructureDescriptor, InfrastructureRegistry, InvokeError, PoolConfig, PoolRegistry,
    RetryPolicy,
};

fn infrastructure(id: &str) -> InfrastructureDescriptor {
    serde_json::from_value(json!({
        "id": id,
        "label": format!("Exchange {id}"),
        "version": "2019",
        "server": format!("{id}.mail.example"),
        "connection_uri": format!("https://{id}.mail.example/powershell"),
        "auth": "basic",
        "credentials": {"domain": "CORP", "username": "svc-mail", "password": "pw"}
    }))
    .expect("descriptor fixture")
}

struct Harness {
    connector: ScriptedConnector,
    executor: Arc<CommandExecutor>,
}

fn harness(pool: PoolConfig, audit_capacity: usize, retries: u32) -> Harness {
    let connector = ScriptedConnector::new();
    let infrastructures =
        Arc::new(InfrastructureRegistry::new(vec![infrastructure("eu"), infrastructure("us")]).unwrap());
    let pools = Arc::new(PoolRegistry::new(Arc::new(connector.clone()), pool));
    let executor = Arc::new(CommandExecutor::new(
        infrastructures,
        pools,
        Arc::new(AuditLog::new(audit_capacity)),
        RetryPolicy {
            default_timeout: Duration::from_secs(5),
            default_retry_attempts: retries,
            retry_delay: Duration::from_millis(1),
        },
    ));
    Harness { connector, executor }
}

fn pool(min: usize, max: usize) -> PoolConfig {
    PoolConfig {
        min_sessions: min,
        max_sessions: max,
        acquire_timeout: Duration::ZERO,
        max_session_age: Duration::ZERO,
        max_idle: Duration::ZERO,
        reap_interval: Duration::ZERO,
    }
}

#[tokio::test]
async fn every_attempt_is_audited_even_when_retried() {
    let h = harness(pool(1, 2), 16, 3);
    h.connector
        .push_failure(InvokeError::Dropped("reset".into()))
        .push_failure(InvokeError::TimedOut(Duration::from_secs(1)));

    let result = h
        .executor
        .execute(&CommandDescriptor::new("Get-Queue").caller("ops"))
        .await;
    assert!(result.success());
    assert_eq!(result.attempts, 3);

    let statuses: Vec<_> = h.executor.audit().list().iter().map(|e| (e.attempt, e.status)).collect();
    assert_eq!(
        statuses,
        vec![
            (3, AuditStatus::Completed),
            (2, AuditStatus::Failed),
            (1, AuditStatus::Failed)
        ]
    );
}

#[tokio::test]
async fn audit_log_stays_within_capacity_under_load() {
    let h = harness(pool(0, 4), 8, 0);
    let calls: Vec<_> = (0..20)
        .map(|n| {
            let executor = Arc::clone(&h.executor);
            tokio::spawn(async move {
                executor
                    .execute(&CommandDescriptor::new("Get-Mailbox").param("Identity", format!("user{n}")))
                    .await
            })
        })
        .collect();
    for call in calls {
        assert!(call.await.unwrap().success());
    }
    let entries = h.executor.audit().list();
    assert_eq!(entries.len(), 8);
    assert_eq!(entries[0].index, 19);
    assert!(entries.iter().all(|e| e.status == AuditStatus::Completed));
}

#[tokio::test]
async fn pools_are_isolated_per_infrastructure() {
    let h = harness(pool(0, 1), 16, 0);
    h.connector.set_invoke_delay(Duration::from_millis(30));
    let eu = {
        let executor = Arc::clone(&h.executor);
        tokio::spawn(async move { executor.execute(&CommandDescriptor::new("Get-Queue").on(Some("eu"))).await })
    };
    let us = {
        let executor = Arc::clone(&h.executor);
        tokio::spawn(async move { executor.execute(&CommandDescriptor::new("Get-Queue").on(Some("us"))).await })
    };
    assert!(eu.await.unwrap().success());
    assert!(us.await.unwrap().success());
    assert_eq!(h.connector.connects(), 2);

    let stats = h.executor.pools().stats();
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|s| s.idle == 1 && s.in_use == 0));
}

#[tokio::test]
async fn saturated_pool_reports_exhaustion_without_retrying() {
    let h = harness(pool(0, 1), 16, 3);
    h.connector.set_invoke_delay(Duration::from_millis(500));
    let slow = {
        let executor = Arc::clone(&h.executor);
        tokio::spawn(async move { executor.execute(&CommandDescriptor::new("Get-MessageTrace")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let starved = h
        .executor
        .execute(&CommandDescriptor::new("Get-Queue").timeout(Duration::from_millis(100)))
        .await;
    assert_eq!(starved.attempts, 1);
    assert!(matches!(starved.error(), Some(BridgeError::PoolExhausted { .. })));
    assert!(slow.await.unwrap().success());
}

#[tokio::test]
async fn per_attempt_timeout_discards_the_session() {
    let h = harness(pool(0, 1), 16, 0);
    h.connector.set_invoke_delay(Duration::from_millis(200));
    let result = h
        .executor
        .execute(&CommandDescriptor::new("Get-Mailbox").timeout(Duration::from_millis(50)))
        .await;
    assert!(matches!(result.error(), Some(BridgeError::TransportBroken { .. })));
    assert_eq!(h.executor.pools().stats()[0].idle, 0);
}

#[tokio::test]
async fn cancelled_call_never_returns_its_session_to_the_pool() {
    let h = harness(pool(0, 1), 16, 0);
    h.connector.set_invoke_delay(Duration::from_secs(5));
    let executor = Arc::clone(&h.executor);
    let call = tokio::spawn(async move { executor.execute(&CommandDescriptor::new("Get-Mailbox")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    call.abort();
    let _ = call.await;

    let stats = h.executor.pools().stats();
    assert_eq!((stats[0].idle, stats[0].in_use), (0, 0));

    h.connector.set_invoke_delay(Duration::ZERO);
    let next = h.executor.execute(&CommandDescriptor::new("Get-Mailbox")).await;
    assert!(next.success());
    assert_eq!(h.connector.connects(), 2);
}
