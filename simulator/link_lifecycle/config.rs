// Link Lifecycle Scenario Configuration

use ll_rust::ll_config::SimulationConfig;
use ll_rust::ll_interface::SimTime;
use ll_rust::ll_medium::MediumConfig;
use serde::Deserialize;

// ============================================================================
// Scenario File
// ============================================================================

/// A complete scenario as loaded from YAML
#[derive(Debug, Clone, Deserialize)]
pub struct LinkScenario {
    /// Scenario metadata
    #[serde(default)]
    pub meta: ScenarioMeta,

    /// Seed, default medium and link timing
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Simulated time to run after the last action, in seconds (default: 30.0)
    #[serde(default = "default_duration")]
    pub duration: SimTime,

    pub media: Vec<MediumEntry>,

    pub nodes: Vec<NodeEntry>,

    /// Timed actions, applied in order of `at`
    #[serde(default)]
    pub actions: Vec<TimedAction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScenarioMeta {
    pub name: Option<String>,
    pub description: Option<String>,
}

fn default_duration() -> SimTime {
    30.0
}

// ============================================================================
// Topology
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct MediumEntry {
    pub name: String,

    /// Overrides the simulation wide medium defaults
    #[serde(default)]
    pub config: Option<MediumConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub name: String,

    /// Media the node attaches to at time zero
    #[serde(default)]
    pub attach: Vec<String>,

    /// Keep retrying the attachment periodically (default: false)
    #[serde(default)]
    pub reattach: bool,
}

// ============================================================================
// Actions
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct TimedAction {
    /// Simulation time in seconds
    pub at: SimTime,

    #[serde(flatten)]
    pub action: ScenarioAction,
}

/// Things that happen to the topology while the simulation runs.
///
/// `peer` is a node name; it is resolved to that node's attachment name on
/// the medium when the action fires.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScenarioAction {
    Attach { node: String, medium: String },
    Detach { node: String, medium: String },
    Outage { node: String },
    Repair { node: String },
    BreakMedium { medium: String },
    RepairMedium { medium: String },
    RemoveMedium { medium: String },
    SetLoss { medium: String, loss_rate: f64 },
    RequestGate { node: String, medium: String, peer: String },
    SendData {
        node: String,
        medium: String,
        peer: String,
        #[serde(default = "default_packet_size")]
        size: usize,
        #[serde(default = "default_count")]
        count: usize,
    },
}

fn default_packet_size() -> usize {
    512
}

fn default_count() -> usize {
    1
}

impl LinkScenario {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Actions sorted by time; equal times keep file order.
    pub fn sorted_actions(&self) -> Vec<TimedAction> {
        let mut actions = self.actions.clone();
        actions.sort_by(|a, b| a.at.total_cmp(&b.at));
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
meta:
  name: outage
simulation:
  seed: 5
media:
  - name: lan
    config:
      bandwidth_kbit: 1000
nodes:
  - name: alpha
    attach: [lan]
  - name: beta
    attach: [lan]
    reattach: true
actions:
  - at: 5.0
    action: outage
    node: beta
  - at: 1.0
    action: send_data
    node: alpha
    medium: lan
    peer: beta
    count: 3
"#;

    #[test]
    fn test_parse_scenario() {
        let scenario = LinkScenario::from_yaml(SCENARIO).unwrap();

        assert_eq!(scenario.meta.name.as_deref(), Some("outage"));
        assert_eq!(scenario.simulation.seed, Some(5));
        assert_eq!(scenario.duration, 30.0);
        assert_eq!(scenario.media[0].config.as_ref().unwrap().bandwidth_kbit, Some(1000));
        assert!(scenario.nodes[1].reattach);

        let actions = scenario.sorted_actions();
        assert_eq!(actions[0].at, 1.0);
        match &actions[0].action {
            ScenarioAction::SendData { size, count, .. } => {
                assert_eq!(*size, 512);
                assert_eq!(*count, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let yaml = "media: []\nnodes: []\nactions:\n  - at: 1.0\n    action: explode\n";
        assert!(LinkScenario::from_yaml(yaml).is_err());
    }
}
