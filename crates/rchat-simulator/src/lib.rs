pub mod engine;
pub mod relay;
pub mod scenario_runner;
pub mod trace;

pub use engine::{AddClientError, ClientNode, ClientStats, Command, LinkEventSummary, Simulator};
pub use relay::{Relay, RelayStats};
pub use scenario_runner::{ScenarioError, file_content, load_scenario, run_scenario};
pub use trace::SimulationReport;
