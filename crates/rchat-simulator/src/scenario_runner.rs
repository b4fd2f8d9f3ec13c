use std::fs;
use std::path::Path;

use anyhow::Context;
use rchat_core::{ArqConfig, LinkConfig, TestAction, TestAssertion, TestScenario};
use thiserror::Error;
use tracing::info;

use crate::engine::{ClientNode, Command, Simulator};
use crate::trace::SimulationReport;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("scenario references unknown client `{0}`")]
    UnknownClient(String),
    #[error("assertion failed: {0}")]
    AssertionFailed(String),
}

/// Deterministic file body used by `send_file` actions and `file_intact` checks.
pub fn file_content(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

pub fn load_scenario(path: &Path) -> anyhow::Result<TestScenario> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario file {}", path.display()))?;
    toml::from_str(&content).context("Failed to parse scenario")
}

/// Build a simulator with the scenario's clients connected and its actions
/// and faults scheduled.
pub fn prepare(
    scenario: &TestScenario,
    mut arq: ArqConfig,
    mut link: LinkConfig,
) -> anyhow::Result<Simulator> {
    scenario.config.apply_to(&mut arq, &mut link);
    let mut sim = Simulator::new(arq, link);

    for client in &scenario.clients {
        sim.add_client(client)
            .with_context(|| format!("Failed to connect {client}"))?;
    }
    let known = |name: &String| -> Result<(), ScenarioError> {
        if scenario.clients.contains(name) {
            Ok(())
        } else {
            Err(ScenarioError::UnknownClient(name.clone()))
        }
    };

    for action in &scenario.actions {
        match action {
            TestAction::SendText {
                time,
                from,
                to,
                text,
            } => {
                known(from)?;
                sim.schedule_command(
                    *time,
                    from,
                    Command::SendText {
                        to: to.clone(),
                        text: text.clone(),
                    },
                );
            }
            TestAction::SendFile {
                time,
                from,
                to,
                file_name,
                size,
            } => {
                known(from)?;
                sim.schedule_command(
                    *time,
                    from,
                    Command::SendFile {
                        to: to.clone(),
                        file_name: file_name.clone(),
                        bytes: file_content(*size),
                    },
                );
            }
            TestAction::Download {
                time,
                client,
                file_name,
            } => {
                known(client)?;
                sim.schedule_command(
                    *time,
                    client,
                    Command::Download {
                        file_name: file_name.clone(),
                    },
                );
            }
            TestAction::Disconnect { time, client } => {
                known(client)?;
                sim.schedule_command(*time, client, Command::Disconnect);
            }
            TestAction::DropNextRequestSeq { client, seq } => {
                known(client)?;
                sim.add_drop_next_request_seq(client, *seq);
            }
            TestAction::Blackhole {
                client,
                from,
                until,
            } => {
                known(client)?;
                sim.add_blackhole(client, *from, *until);
            }
        }
    }
    Ok(sim)
}

/// Run a scenario to completion and check its assertions.
///
/// The simulation runs for `duration_ms`, then every client disconnects and
/// in-flight traffic drains before the assertions are evaluated.
pub fn run_scenario(
    scenario: &TestScenario,
    arq: ArqConfig,
    link: LinkConfig,
) -> anyhow::Result<SimulationReport> {
    info!("Running Scenario: {}", scenario.name);
    info!("Description: {}", scenario.description);

    let mut sim = prepare(scenario, arq, link)?;
    sim.run_until(scenario.duration_ms);
    sim.shutdown();

    for assertion in &scenario.assertions {
        check_assertion(&sim, assertion)?;
    }

    info!("Test Scenario Passed!");
    Ok(sim.export_report())
}

fn node<'a>(sim: &'a Simulator, name: &str) -> Result<&'a ClientNode, ScenarioError> {
    sim.client(name)
        .ok_or_else(|| ScenarioError::UnknownClient(name.to_string()))
}

fn check_range(what: &str, value: u32, min: u32, max: Option<u32>) -> Result<(), ScenarioError> {
    if value < min {
        return Err(ScenarioError::AssertionFailed(format!(
            "{what} was {value}, expected min {min}"
        )));
    }
    if let Some(max) = max
        && value > max
    {
        return Err(ScenarioError::AssertionFailed(format!(
            "{what} was {value}, expected max {max}"
        )));
    }
    Ok(())
}

pub fn check_assertion(sim: &Simulator, assertion: &TestAssertion) -> Result<(), ScenarioError> {
    match assertion {
        TestAssertion::TextDelivered { to, text } => {
            let found = node(sim, to)?
                .received_texts()
                .iter()
                .any(|(_, body)| body == text);
            if !found {
                return Err(ScenarioError::AssertionFailed(format!(
                    "{text:?} was not delivered to {to}"
                )));
            }
        }
        TestAssertion::FileReady { to, file_name } => {
            let found = node(sim, to)?
                .ready_files()
                .iter()
                .any(|(name, _)| name == file_name);
            if !found {
                return Err(ScenarioError::AssertionFailed(format!(
                    "{file_name} never completed at {to}"
                )));
            }
        }
        TestAssertion::FileIntact {
            to,
            from,
            file_name,
            size,
        } => {
            let receiver = node(sim, to)?;
            let expected = file_content(*size);
            let assembled = receiver.session.assemble(file_name, from);
            let intact = match &assembled {
                Ok(bytes) => bytes[..] == expected[..],
                Err(_) => receiver.downloaded(file_name) == Some(&expected[..]),
            };
            if !intact {
                return Err(ScenarioError::AssertionFailed(format!(
                    "{file_name} from {from} at {to} does not match the {size} bytes sent"
                )));
            }
        }
        TestAssertion::PermanentFailures { client, min, max } => {
            let count = node(sim, client)?.stats.permanent_failures;
            check_range(&format!("{client} permanent failures"), count, *min, *max)?;
        }
        TestAssertion::WindowDrained { client } => {
            let status = node(sim, client)?.session.status();
            if status.buffered > 0 || status.queued_chunks > 0 {
                return Err(ScenarioError::AssertionFailed(format!(
                    "{client} still holds {} unacknowledged segments and {} queued chunks",
                    status.buffered, status.queued_chunks
                )));
            }
        }
        TestAssertion::RequestCount { client, min, max } => {
            let count = node(sim, client)?.stats.transmissions;
            check_range(&format!("{client} transmissions"), count, *min, *max)?;
        }
    }
    Ok(())
}
