use std::path::PathBuf;

use rchat_core::{ArqConfig, LinkConfig, TestScenario};
use rchat_simulator::scenario_runner::{check_assertion, prepare};
use rchat_simulator::{Command, Simulator, load_scenario, run_scenario};

fn scenario(name: &str) -> TestScenario {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../scenarios")
        .join(name);
    load_scenario(&path).unwrap()
}

fn finished(scenario: &TestScenario) -> Simulator {
    let mut sim = prepare(scenario, ArqConfig::default(), LinkConfig::default()).unwrap();
    sim.run_until(scenario.duration_ms);
    sim.shutdown();
    sim
}

#[test]
fn retransmit_gap_passes() {
    let report = run_scenario(
        &scenario("retransmit_gap.toml"),
        ArqConfig::default(),
        LinkConfig::default(),
    )
    .unwrap();
    let bob = report.clients.iter().find(|c| c.user == "bob").unwrap();
    let texts: Vec<&str> = bob.received.iter().map(|m| m.summary.as_str()).collect();
    assert_eq!(texts, vec!["first", "second", "third"]);
    assert_eq!(report.relay.out_of_order, 1);
}

#[test]
fn file_transfer_passes() {
    let sim = finished(&scenario("file_transfer.toml"));
    let bob = sim.client("bob").unwrap();
    assert_eq!(bob.ready_files(), vec![("report.bin", "alice")]);
    assert_eq!(bob.downloaded("report.bin").map(<[u8]>::len), Some(5000));
}

#[test]
fn blackhole_stalls_the_sender() {
    let scenario = scenario("blackhole_failure.toml");
    let sim = finished(&scenario);
    for assertion in &scenario.assertions {
        check_assertion(&sim, assertion).unwrap();
    }
    let alice = sim.client("alice").unwrap();
    assert_eq!(alice.failed_seqs(), vec![0, 1]);
    assert!(sim.client("bob").unwrap().received_texts().is_empty());
}

#[test]
fn offline_receiver_fills_mailbox() {
    let scenario = scenario("offline_receiver.toml");
    let sim = finished(&scenario);
    for assertion in &scenario.assertions {
        check_assertion(&sim, assertion).unwrap();
    }
    assert_eq!(sim.relay().mailbox_len("bob"), 2);
    assert_eq!(sim.relay().stats.mailbox_full, 4);
    assert_eq!(sim.client("alice").unwrap().failed_seqs(), vec![2, 3]);
}

#[test]
fn lossy_chat_parses() {
    let scenario = scenario("lossy_chat.toml");
    assert_eq!(scenario.clients.len(), 3);
    assert_eq!(scenario.config.loss_rate, Some(0.1));
    assert_eq!(scenario.actions.len(), 4);
}

#[test]
fn failed_assertion_is_reported() {
    let toml = r#"
        name = "Wrong Expectation"
        description = "Claims a message that was never sent."
        duration_ms = 5000

        [[assertions]]
        type = "text_delivered"
        to = "bob"
        text = "never sent"
    "#;
    let scenario: TestScenario = toml::from_str(toml).unwrap();
    let err = run_scenario(&scenario, ArqConfig::default(), LinkConfig::default()).unwrap_err();
    assert!(err.to_string().contains("never sent"));
}

#[test]
fn unknown_client_is_rejected() {
    let toml = r#"
        name = "Typo"
        description = "Action from a client that is not connected."

        [[actions]]
        type = "send_text"
        time = 10
        from = "mallory"
        to = "bob"
        text = "hi"
    "#;
    let scenario: TestScenario = toml::from_str(toml).unwrap();
    assert!(prepare(&scenario, ArqConfig::default(), LinkConfig::default()).is_err());
}

#[test]
fn late_command_after_disconnect_is_rejected() {
    let mut sim = Simulator::new(ArqConfig::default(), LinkConfig::default());
    sim.add_client("alice").unwrap();
    sim.add_client("bob").unwrap();
    sim.schedule_command(100, "alice", Command::Disconnect);
    sim.schedule_command(
        200,
        "alice",
        Command::SendText {
            to: "bob".into(),
            text: "too late".into(),
        },
    );
    sim.run_until(1_000);
    let alice = sim.client("alice").unwrap();
    assert_eq!(alice.stats.rejected_commands, 1);
    assert_eq!(alice.stats.transmissions, 0);
    assert_eq!(alice.armed_timers(), 0);
}
