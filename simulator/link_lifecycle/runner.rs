// Link Lifecycle Scenario Runner

use super::config::{LinkScenario, ScenarioAction, TimedAction};
use super::stats::*;
use ll_rust::ll_error::LinkError;
use ll_rust::ll_interface::{Event, EventSink, MediumId, NodeId, Requirements, SimTime};
use ll_rust::ll_simulation::Simulation;
use log::{info, warn};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("unknown medium '{0}'")]
    UnknownMedium(String),

    #[error("node '{node}' has no attachment on '{medium}'")]
    NoAttachment { node: String, medium: String },

    #[error(transparent)]
    Link(#[from] LinkError),
}

// ============================================================================
// Console Sink
// ============================================================================

/// Prints trace events through the logger and tallies them.
struct ConsoleSink {
    counters: Rc<RefCell<EventCounters>>,
    verbose: bool,
}

impl EventSink for ConsoleSink {
    fn log(&mut self, time: SimTime, event: Event) {
        self.counters.borrow_mut().record(&event);
        match &event {
            Event::Transmission { .. } | Event::SignalingSent { .. } | Event::ProcessStateChange { .. } => {
                if self.verbose {
                    info!("[{:>9.4}] {:?}", time, event);
                }
            }
            _ => info!("[{:>9.4}] {:?}", time, event),
        }
    }
}

// ============================================================================
// Runner
// ============================================================================

pub struct LinkLifecycleRunner {
    scenario: LinkScenario,
    sim: Simulation,
    counters: Rc<RefCell<EventCounters>>,
    nodes: BTreeMap<String, NodeId>,
    media: BTreeMap<String, MediumId>,
    failed_actions: usize,
    events_handled: usize,
}

impl LinkLifecycleRunner {
    /// `seed` overrides the one in the scenario file.
    pub fn new(mut scenario: LinkScenario, seed: Option<u64>, verbose: bool) -> Self {
        if seed.is_some() {
            scenario.simulation.seed = seed;
        }

        let counters = Rc::new(RefCell::new(EventCounters::default()));
        let sink = ConsoleSink {
            counters: Rc::clone(&counters),
            verbose,
        };
        let sim = Simulation::new_with_sink(scenario.simulation.clone(), Box::new(sink));

        Self {
            scenario,
            sim,
            counters,
            nodes: BTreeMap::new(),
            media: BTreeMap::new(),
            failed_actions: 0,
            events_handled: 0,
        }
    }

    pub fn run(mut self) -> Result<ScenarioResult, ScenarioError> {
        self.scenario.simulation.validate()?;
        self.build_topology()?;

        for timed in self.scenario.sorted_actions() {
            self.events_handled += self.sim.run_until(timed.at);
            if let Err(e) = self.apply(&timed) {
                warn!("t={:.3}: {:?} failed: {}", timed.at, timed.action, e);
                self.failed_actions += 1;
            }
        }

        let end = self.sim.now() + self.scenario.duration;
        self.events_handled += self.sim.run_until(end);

        Ok(self.collect())
    }

    fn build_topology(&mut self) -> Result<(), ScenarioError> {
        for entry in &self.scenario.media {
            let id = self.sim.add_medium(&entry.name, entry.config.clone());
            self.media.insert(entry.name.clone(), id);
        }
        for entry in &self.scenario.nodes {
            let id = self.sim.add_node(&entry.name);
            self.nodes.insert(entry.name.clone(), id);
        }

        for entry in self.scenario.nodes.clone() {
            let node = self.node(&entry.name)?;
            for medium_name in &entry.attach {
                let medium = self.medium(medium_name)?;
                if let Err(e) = self.sim.attach(node, medium) {
                    warn!("{} can not attach to {}: {}", entry.name, medium_name, e);
                    self.failed_actions += 1;
                }
                if entry.reattach {
                    self.sim.enable_reattach(node, medium);
                }
            }
        }
        Ok(())
    }

    fn node(&self, name: &str) -> Result<NodeId, ScenarioError> {
        self.nodes
            .get(name)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownNode(name.to_string()))
    }

    fn medium(&self, name: &str) -> Result<MediumId, ScenarioError> {
        self.media
            .get(name)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownMedium(name.to_string()))
    }

    // node name -> its current attachment name on the medium
    fn attachment_name(&self, node: &str, medium: &str) -> Result<String, ScenarioError> {
        let node_id = self.node(node)?;
        let medium_id = self.medium(medium)?;
        self.sim
            .observer(node_id, medium_id)
            .and_then(|o| o.attachment_name())
            .map(|name| name.to_string())
            .ok_or_else(|| ScenarioError::NoAttachment {
                node: node.to_string(),
                medium: medium.to_string(),
            })
    }

    fn apply(&mut self, timed: &TimedAction) -> Result<(), ScenarioError> {
        info!("t={:.3}: {:?}", self.sim.now(), timed.action);

        match &timed.action {
            ScenarioAction::Attach { node, medium } => {
                let (node, medium) = (self.node(node)?, self.medium(medium)?);
                self.sim.attach(node, medium)?;
            }
            ScenarioAction::Detach { node, medium } => {
                let (node, medium) = (self.node(node)?, self.medium(medium)?);
                self.sim.detach(node, medium);
            }
            ScenarioAction::Outage { node } => {
                let node = self.node(node)?;
                self.sim.node_outage(node);
            }
            ScenarioAction::Repair { node } => {
                let node = self.node(node)?;
                self.sim.repair_node(node)?;
            }
            ScenarioAction::BreakMedium { medium } => {
                let medium = self.medium(medium)?;
                self.sim.set_medium_broken(medium, true)?;
            }
            ScenarioAction::RepairMedium { medium } => {
                let medium = self.medium(medium)?;
                self.sim.set_medium_broken(medium, false)?;
            }
            ScenarioAction::RemoveMedium { medium } => {
                let id = self.medium(medium)?;
                self.sim.remove_medium(id);
                self.media.remove(medium);
            }
            ScenarioAction::SetLoss { medium, loss_rate } => {
                let id = self.medium(medium)?;
                if let Some(m) = self.sim.medium_mut(id) {
                    m.set_loss_rate(*loss_rate);
                }
            }
            ScenarioAction::RequestGate { node, medium, peer } => {
                let peer = self.attachment_name(peer, medium)?;
                let (node_id, medium_id) = (self.node(node)?, self.medium(medium)?);
                let request = self
                    .sim
                    .request_gate(node_id, medium_id, &peer, Requirements::best_effort())?;
                info!("request {} issued by {} for {}", request, node, peer);
            }
            ScenarioAction::SendData {
                node,
                medium,
                peer,
                size,
                count,
            } => {
                let peer = self.attachment_name(peer, medium)?;
                let (node_id, medium_id) = (self.node(node)?, self.medium(medium)?);
                for _ in 0..*count {
                    self.sim.send_data(node_id, medium_id, &peer, vec![0u8; *size])?;
                }
            }
        }
        Ok(())
    }

    fn collect(&self) -> ScenarioResult {
        let mut nodes = Vec::new();
        for (node_name, node_id) in &self.nodes {
            for (medium_name, medium_id) in &self.media {
                let Some(observer) = self.sim.observer(*node_id, *medium_id) else {
                    continue;
                };
                let gates = self
                    .sim
                    .gates(*node_id, *medium_id)
                    .iter()
                    .map(|g| GateSummary {
                        id: g.gate_id(),
                        kind: g.kind,
                        peer: g.peer_name.clone(),
                        peer_gate: g.peer_gate,
                        operational: g.is_operational(),
                    })
                    .collect();
                nodes.push(NodeSummary {
                    node: node_name.clone(),
                    medium: medium_name.clone(),
                    attachment: observer.attachment_name().map(|n| n.to_string()),
                    gates,
                    processes: observer.processes().count(),
                });
            }
        }

        let media = self
            .media
            .iter()
            .filter_map(|(name, id)| {
                self.sim.medium(*id).map(|m| MediumSummary {
                    name: name.clone(),
                    broken: m.is_broken(),
                    stats: m.stats().clone(),
                })
            })
            .collect();

        ScenarioResult {
            name: self.scenario.meta.name.clone().unwrap_or_else(|| "unnamed".to_string()),
            seed: self.scenario.simulation.seed,
            end_time: self.sim.now(),
            events_handled: self.events_handled,
            failed_actions: self.failed_actions,
            counters: self.counters.borrow().clone(),
            nodes,
            media,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ll_rust::ll_gate::GateKind;

    #[test]
    fn test_outage_and_repair_scenario() {
        let yaml = r#"
simulation:
  seed: 9
duration: 5.0
media:
  - name: lan
nodes:
  - name: alpha
    attach: [lan]
  - name: beta
    attach: [lan]
actions:
  - at: 1.0
    action: send_data
    node: alpha
    medium: lan
    peer: beta
    count: 4
  - at: 2.0
    action: outage
    node: beta
  - at: 3.0
    action: repair
    node: beta
"#;
        let scenario = LinkScenario::from_yaml(yaml).unwrap();
        let result = LinkLifecycleRunner::new(scenario, None, false).run().unwrap();

        assert_eq!(result.failed_actions, 0);
        assert_eq!(result.counters.attached, 2);
        assert_eq!(result.nodes.len(), 2);
        for node in &result.nodes {
            assert_eq!(node.gates.len(), 1);
            assert_eq!(node.gates[0].kind, GateKind::DirectDown);
            assert!(node.gates[0].operational);
        }
    }

    #[test]
    fn test_unknown_node_counts_as_failed_action() {
        let yaml = r#"
media:
  - name: lan
nodes:
  - name: alpha
    attach: [lan]
actions:
  - at: 1.0
    action: outage
    node: ghost
"#;
        let scenario = LinkScenario::from_yaml(yaml).unwrap();
        let result = LinkLifecycleRunner::new(scenario, Some(1), false).run().unwrap();

        assert_eq!(result.failed_actions, 1);
        assert_eq!(result.seed, Some(1));
    }
}
