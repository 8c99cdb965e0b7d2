use fot_device::transport::QoS;
use fot_device::{DeviceError, Lifecycle};
use fot_devkit::{sensor, TatuMessageBuilder, TestHarness};
use std::time::Duration;

const RESPONSE_TOPIC: &str = "dev/dev1/RES";
const COMMAND_TOPIC: &str = "dev/dev1";

#[tokio::test(start_paused = true)]
async fn flow_publishes_one_window_of_samples() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 30)]);
    let conn = harness.connect("broker-a").await.unwrap();

    let runner = harness.controller.runner("t1").unwrap();
    assert_eq!(runner.start(10, 30), Lifecycle::Running);

    let msg = harness.wait_for_message(&conn, RESPONSE_TOPIC, 1_000).await.unwrap();
    assert_eq!(msg.qos, QoS::ExactlyOnce);

    let json = msg.json().unwrap();
    assert_eq!(json["METHOD"], "FLOW");
    assert_eq!(json["HEADER"]["NAME"], "dev1");
    assert_eq!(json["BODY"]["FLOW"]["collect"], 10);
    assert_eq!(json["BODY"]["FLOW"]["publish"], 30);
    let values = json["BODY"]["t1"].as_array().unwrap();
    assert_eq!(values.len(), 3);
    assert!(values.iter().all(|v| (10..=30).contains(&v.as_i64().unwrap())));

    let sink = harness.telemetry_sink.clone();
    assert!(harness.wait_until(1_000, || !sink.records().is_empty()).await);
    let readings = harness.telemetry_sink.records();
    let reading = &readings[0];
    assert_eq!(reading.sensor_id, "t1");
    assert_eq!(reading.values.len(), 3);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lifecycle_follows_the_state_machine() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]);
    harness.connect("broker-a").await.unwrap();
    let runner = harness.controller.runner("t1").unwrap();

    assert_eq!(runner.state(), Lifecycle::Idle);
    assert_eq!(runner.resume(), Lifecycle::Idle);
    assert!(!runner.pause());

    runner.start_default();
    assert_eq!(runner.state(), Lifecycle::Running);
    assert!(runner.pause());
    assert_eq!(runner.state(), Lifecycle::Paused);
    assert_eq!(runner.resume(), Lifecycle::Running);

    runner.stop();
    assert_eq!(runner.state(), Lifecycle::Idle);
    harness.shutdown().await;
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Start(i64, i64),
    Pause,
    Resume,
    Stop,
}

#[tokio::test(start_paused = true)]
async fn every_transition_lands_in_the_expected_state() {
    use Lifecycle::*;
    use Step::*;

    let cases: &[(&str, &[(Step, Lifecycle)])] = &[
        ("pause while paused", &[(Start(10, 50), Running), (Pause, Paused), (Pause, Paused)]),
        ("stop while paused", &[(Start(10, 50), Running), (Pause, Paused), (Stop, Idle), (Resume, Idle)]),
        ("start while paused", &[(Start(10, 50), Running), (Pause, Paused), (Start(20, 60), Running)]),
        ("invalid start while paused", &[(Start(10, 50), Running), (Pause, Paused), (Start(0, 50), Idle)]),
        ("invalid publish interval", &[(Start(10, 0), Idle), (Start(10, 50), Running), (Start(10, -5), Idle)]),
        ("stop twice", &[(Start(10, 50), Running), (Stop, Idle), (Stop, Idle), (Pause, Idle)]),
        ("resume while running", &[(Start(10, 50), Running), (Resume, Running), (Pause, Paused), (Resume, Running)]),
    ];

    for (name, steps) in cases {
        let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]);
        harness.connect("broker-a").await.unwrap();
        let runner = harness.controller.runner("t1").unwrap();

        for (i, (step, expected)) in steps.iter().enumerate() {
            match *step {
                Start(collect, publish) => {
                    assert_eq!(runner.start(collect, publish), *expected, "{name}: step {i} {step:?}");
                }
                Pause => {
                    runner.pause();
                }
                Resume => {
                    assert_eq!(runner.resume(), *expected, "{name}: step {i} {step:?}");
                }
                Stop => runner.stop(),
            }
            assert_eq!(runner.state(), *expected, "{name}: step {i} {step:?}");
        }
        harness.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn paused_flow_publishes_nothing() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 20)]);
    let conn = harness.connect("broker-a").await.unwrap();
    let runner = harness.controller.runner("t1").unwrap();

    runner.start_default();
    tokio::time::sleep(Duration::from_millis(15)).await;
    runner.pause();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(conn.find_messages_by_topic(RESPONSE_TOPIC).is_empty());
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn non_positive_cadence_stops_the_flow() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]);
    harness.connect("broker-a").await.unwrap();
    let runner = harness.controller.runner("t1").unwrap();

    assert_eq!(runner.start(-1, 10), Lifecycle::Idle);

    runner.start_default();
    assert_eq!(runner.start(0, 10), Lifecycle::Idle);
    assert_eq!(runner.state(), Lifecycle::Idle);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn restarting_a_running_flow_retunes_it() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]);
    let conn = harness.connect("broker-a").await.unwrap();
    let runner = harness.controller.runner("t1").unwrap();

    runner.start(10, 30);
    assert_eq!(runner.start(20, 40), Lifecycle::Running);
    assert_eq!(runner.cadence(), (20, 40));

    let msg = harness.wait_for_message(&conn, RESPONSE_TOPIC, 1_000).await.unwrap();
    assert_eq!(msg.json().unwrap()["BODY"]["FLOW"]["publish"], 40);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stop_all_flows_is_idempotent() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50), sensor("h1", 20, 60)]);
    harness.connect("broker-a").await.unwrap();

    harness.controller.start_all_flows();
    harness.controller.stop_all_flows();
    harness.controller.stop_all_flows();

    for runner in harness.controller.runners() {
        assert_eq!(runner.state(), Lifecycle::Idle);
    }
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pause_all_reports_only_running_sensors() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50), sensor("h1", 20, 60)]);
    harness.connect("broker-a").await.unwrap();
    harness.controller.runner("h1").unwrap().start_default();

    let paused = harness.controller.pause_all_flows();
    assert_eq!(paused, vec!["h1".to_string()]);

    harness.controller.resume_flows(&paused);
    assert_eq!(harness.controller.runner("h1").unwrap().state(), Lifecycle::Running);
    assert_eq!(harness.controller.runner("t1").unwrap().state(), Lifecycle::Idle);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn publish_failure_moves_flow_to_idle() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 20)]);
    let conn = harness.connect("broker-a").await.unwrap();
    conn.set_fail_publish(true);

    let runner = harness.controller.runner("t1").unwrap().clone();
    runner.start_default();
    assert!(harness.wait_until(1_000, || runner.state() == Lifecycle::Idle).await);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn flow_without_connection_goes_idle() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 20)]);

    let runner = harness.controller.runner("t1").unwrap().clone();
    runner.start_default();
    assert!(harness.wait_until(1_000, || runner.state() == Lifecycle::Idle).await);

    let err = harness
        .controller
        .publish(RESPONSE_TOPIC, b"x".to_vec(), QoS::AtLeastOnce)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::NotConnected));
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn flow_command_starts_and_stops_sensor() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]).with_dispatcher();
    let conn = harness.connect("broker-a").await.unwrap();
    let runner = harness.controller.runner("t1").unwrap().clone();

    conn.inject_message(COMMAND_TOPIC, TatuMessageBuilder::flow_request("t1", 100, 300));
    assert!(harness.wait_until(1_000, || runner.state() == Lifecycle::Running).await);
    assert_eq!(runner.cadence(), (100, 300));

    conn.inject_message(COMMAND_TOPIC, TatuMessageBuilder::flow_request("t1", 0, 300));
    assert!(harness.wait_until(1_000, || runner.state() == Lifecycle::Idle).await);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn get_command_answers_with_current_value() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]).with_dispatcher();
    let conn = harness.connect("broker-a").await.unwrap();

    conn.inject_message(COMMAND_TOPIC, TatuMessageBuilder::get_request("t1"));
    let msg = harness.wait_for_message(&conn, RESPONSE_TOPIC, 1_000).await.unwrap();

    let json = msg.json().unwrap();
    assert_eq!(json["METHOD"], "GET");
    assert_eq!(json["CODE"], "POST");
    let value = json["BODY"]["t1"].as_i64().unwrap();
    assert!((10..=30).contains(&value));
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_and_malformed_commands_are_ignored() {
    let harness = TestHarness::new("dev1", vec![sensor("t1", 10, 50)]).with_dispatcher();
    let conn = harness.connect("broker-a").await.unwrap();

    conn.inject_message(COMMAND_TOPIC, TatuMessageBuilder::get_request("nope"));
    conn.inject_message(COMMAND_TOPIC, "GET x");
    conn.inject_message(COMMAND_TOPIC, "FLOW VALUE t1 {broken");
    conn.inject_message(COMMAND_TOPIC, TatuMessageBuilder::evt_request("t1"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(conn.find_messages_by_topic(RESPONSE_TOPIC).is_empty());
    assert_eq!(harness.controller.runner("t1").unwrap().state(), Lifecycle::Idle);

    // the dispatcher is still alive afterwards
    conn.inject_message(COMMAND_TOPIC, TatuMessageBuilder::get_request("t1"));
    assert!(harness.wait_for_message(&conn, RESPONSE_TOPIC, 1_000).await.is_some());
    harness.shutdown().await;
}
