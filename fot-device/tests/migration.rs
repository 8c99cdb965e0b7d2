use fot_device::codec::{CONNECTIONS_RESPONSE_TOPIC, CONNECTIONS_TOPIC};
use fot_device::{BrokerEndpoint, Lifecycle, MigrationOutcome, MigrationState, RollbackReason};
use fot_devkit::{sensor, TatuMessageBuilder, TestHarness};
use std::time::Duration;

fn broker(host: &str) -> BrokerEndpoint {
    BrokerEndpoint::new(host, 1883).with_credentials("karaf", "karaf")
}

#[tokio::test(start_paused = true)]
async fn connack_just_before_deadline_commits() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]);
    let old = harness.connect("broker-a").await.unwrap();
    harness.connector.auto_connack("broker-b", true, Duration::from_millis(9));

    let outcome = harness
        .engine
        .migrate(broker("broker-b"), Duration::from_millis(10), false)
        .await;
    assert!(matches!(outcome, MigrationOutcome::Committed));

    let new = harness.connector.connection_to("broker-b").unwrap();
    assert!(!new.is_disconnected());
    assert!(old.is_disconnected());
    assert_eq!(harness.active_connection().unwrap().endpoint().host, "broker-b");

    assert!(new.get_subscriptions().contains(&CONNECTIONS_RESPONSE_TOPIC.to_string()));
    assert!(new.get_subscriptions().contains(&"dev/dev1".to_string()));
    assert_eq!(new.get_unsubscriptions(), vec![CONNECTIONS_RESPONSE_TOPIC.to_string()]);

    // give a late watchdog every chance to misfire
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!new.is_disconnected());
    assert!(!harness.controller.device().is_migrating());
    assert_eq!(harness.engine.state(), MigrationState::Idle);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn connect_request_describes_the_device() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50), sensor("h1", 20, 100)]);
    harness.connector.auto_connack("broker-b", true, Duration::from_millis(1));

    let outcome = harness
        .engine
        .migrate(broker("broker-b"), Duration::from_secs(10), false)
        .await;
    assert!(outcome.is_committed());

    let new = harness.connector.connection_to("broker-b").unwrap();
    let connect = new.last_message_on(CONNECTIONS_TOPIC).unwrap();
    let text = connect.text();
    assert!(text.starts_with("CONNECT VALUE BROKER "));

    let body: serde_json::Value = serde_json::from_str(&text[text.find('{').unwrap()..]).unwrap();
    assert_eq!(body["HEADER"]["NAME"], "dev1");
    assert_eq!(body["TIME_OUT"], 10.0);
    assert_eq!(body["DEVICE"]["id"], "dev1");
    assert_eq!(body["DEVICE"]["sensors"].as_array().unwrap().len(), 2);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn missing_connack_rolls_back_and_drops_candidate() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]);
    let old = harness.connect("broker-a").await.unwrap();

    let outcome = harness
        .engine
        .migrate(broker("broker-b"), Duration::from_secs(10), false)
        .await;
    assert!(matches!(
        outcome,
        MigrationOutcome::RolledBack(RollbackReason::HandshakeTimeout(t)) if t == Duration::from_secs(10)
    ));

    let candidate = harness.connector.connection_to("broker-b").unwrap();
    assert!(candidate.is_disconnected());
    assert!(!old.is_disconnected());
    assert_eq!(harness.active_connection().unwrap().endpoint().host, "broker-a");
    assert!(!harness.controller.device().is_migrating());
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_connack_keeps_current_broker() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]);
    let old = harness.connect("broker-a").await.unwrap();
    harness.connector.auto_connack("broker-b", false, Duration::from_millis(5));

    let outcome = harness
        .engine
        .migrate(broker("broker-b"), Duration::from_secs(10), false)
        .await;
    assert!(matches!(outcome, MigrationOutcome::RolledBack(RollbackReason::HandshakeRejected(_))));

    let candidate = harness.connector.connection_to("broker-b").unwrap();
    assert_eq!(candidate.disconnect_count(), 1);
    assert!(!old.is_disconnected());
    assert_eq!(harness.active_connection().unwrap().endpoint().host, "broker-a");
    assert!(!harness.controller.device().is_migrating());
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_migration_is_rejected_as_busy() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]);
    harness.connect("broker-a").await.unwrap();
    harness.connector.auto_connack("broker-b", true, Duration::from_millis(50));

    let engine = harness.engine.clone();
    let first = tokio::spawn(async move { engine.migrate(broker("broker-b"), Duration::from_secs(10), false).await });

    let controller = harness.controller.clone();
    assert!(harness.wait_until(1_000, || controller.device().is_migrating()).await);

    let second = harness
        .engine
        .migrate(broker("broker-c"), Duration::from_secs(10), false)
        .await;
    assert!(matches!(second, MigrationOutcome::Busy));

    assert!(first.await.unwrap().is_committed());
    assert_eq!(harness.connector.attempts_to("broker-c"), 0);
    let connects: usize = harness
        .connector
        .connections()
        .iter()
        .map(|c| c.find_messages_by_topic(CONNECTIONS_TOPIC).len())
        .sum();
    assert_eq!(connects, 1);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unreachable_candidate_rolls_back_without_retry() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]);
    let old = harness.connect("broker-a").await.unwrap();
    harness.connector.set_unreachable("broker-b");

    let outcome = harness
        .engine
        .migrate(broker("broker-b"), Duration::from_secs(10), false)
        .await;
    assert!(matches!(outcome, MigrationOutcome::RolledBack(RollbackReason::ConnectFailed(_))));
    assert_eq!(harness.connector.attempts_to("broker-b"), 1);
    assert!(!old.is_disconnected());
    assert!(!harness.controller.device().is_migrating());
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn initial_handshake_retries_until_broker_is_up() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]);
    harness.connector.fail_next_connects(2);
    harness.connector.auto_connack("broker-a", true, Duration::from_millis(1));

    let outcome = harness
        .engine
        .migrate(broker("broker-a"), Duration::from_secs(10), true)
        .await;
    assert!(outcome.is_committed());
    assert_eq!(harness.connector.attempts_to("broker-a"), 3);
    assert!(harness.controller.slot().is_connected());
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn running_flows_pause_during_handshake_and_resume_after() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50), sensor("h1", 10, 50)]);
    harness.connect("broker-a").await.unwrap();
    let t1 = harness.controller.runner("t1").unwrap().clone();
    let h1 = harness.controller.runner("h1").unwrap().clone();
    t1.start_default();

    harness.connector.auto_connack("broker-b", true, Duration::from_millis(100));
    let engine = harness.engine.clone();
    let migration = tokio::spawn(async move { engine.migrate(broker("broker-b"), Duration::from_secs(10), false).await });

    let controller = harness.controller.clone();
    assert!(harness.wait_until(1_000, || controller.device().is_migrating()).await);
    assert_eq!(t1.state(), Lifecycle::Paused);
    assert_eq!(h1.state(), Lifecycle::Idle);

    assert!(migration.await.unwrap().is_committed());
    assert_eq!(t1.state(), Lifecycle::Running);
    assert_eq!(h1.state(), Lifecycle::Idle);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn flows_resume_after_failed_migration_too() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]);
    harness.connect("broker-a").await.unwrap();
    let t1 = harness.controller.runner("t1").unwrap().clone();
    t1.start_default();

    let outcome = harness
        .engine
        .migrate(broker("broker-b"), Duration::from_millis(200), false)
        .await;
    assert!(matches!(outcome, MigrationOutcome::RolledBack(RollbackReason::HandshakeTimeout(_))));
    assert_eq!(t1.state(), Lifecycle::Running);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lost_candidate_connection_rolls_back() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]);
    harness.connect("broker-a").await.unwrap();

    let engine = harness.engine.clone();
    let migration = tokio::spawn(async move { engine.migrate(broker("broker-b"), Duration::from_secs(10), false).await });

    let connector = harness.connector.clone();
    assert!(
        harness
            .wait_until(1_000, || connector
                .connection_to("broker-b")
                .map(|c| !c.find_messages_by_topic(CONNECTIONS_TOPIC).is_empty())
                .unwrap_or(false))
            .await
    );
    let candidate = harness.connector.connection_to("broker-b").unwrap();
    candidate.inject_connection_lost("connection reset by peer");

    let outcome = migration.await.unwrap();
    assert!(matches!(outcome, MigrationOutcome::RolledBack(RollbackReason::ConnectionLost(_))));
    assert_eq!(harness.active_connection().unwrap().endpoint().host, "broker-a");
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn set_broker_command_moves_the_device() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]).with_dispatcher();
    let old = harness.connect("broker-a").await.unwrap();
    harness.connector.auto_connack("broker-b", true, Duration::from_millis(5));

    let command = TatuMessageBuilder::set_broker_request("gw-2", "tcp://broker-b", 1883, "karaf", "karaf");
    assert!(old.inject_message("dev/dev1", command));

    let slot = harness.controller.slot().clone();
    let moved = harness
        .wait_until(2_000, || slot.endpoint().map(|e| e.host == "broker-b").unwrap_or(false))
        .await;
    assert!(moved);
    assert!(old.is_disconnected());
    assert_eq!(
        harness.active_connection().unwrap().endpoint(),
        &BrokerEndpoint::new("broker-b", 1883).with_credentials("karaf", "karaf")
    );
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn set_for_other_targets_is_ignored() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]).with_dispatcher();
    let conn = harness.connect("broker-a").await.unwrap();

    assert!(conn.inject_message("dev/dev1", r#"SET VALUE samplingRate {"value":3}"#));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.connector.connect_attempts(), 1);
    assert!(!harness.controller.device().is_migrating());
    harness.shutdown().await;
}
