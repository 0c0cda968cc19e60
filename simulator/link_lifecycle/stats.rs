// Link Lifecycle Scenario Statistics

use ll_rust::ll_gate::GateKind;
use ll_rust::ll_interface::{Event, GateId, SimTime};
use ll_rust::ll_medium::MediumStats;

// ============================================================================
// Result
// ============================================================================

/// Outcome of one scenario run
#[derive(Debug, Clone, Default)]
pub struct ScenarioResult {
    pub name: String,
    pub seed: Option<u64>,
    pub end_time: SimTime,
    pub events_handled: usize,
    pub failed_actions: usize,
    pub counters: EventCounters,
    pub nodes: Vec<NodeSummary>,
    pub media: Vec<MediumSummary>,
}

/// Final per-node, per-medium view
#[derive(Debug, Clone)]
pub struct NodeSummary {
    pub node: String,
    pub medium: String,
    pub attachment: Option<String>,
    pub gates: Vec<GateSummary>,
    pub processes: usize,
}

#[derive(Debug, Clone)]
pub struct GateSummary {
    pub id: GateId,
    pub kind: GateKind,
    pub peer: String,
    pub peer_gate: Option<GateId>,
    pub operational: bool,
}

#[derive(Debug, Clone)]
pub struct MediumSummary {
    pub name: String,
    pub broken: bool,
    pub stats: MediumStats,
}

// ============================================================================
// Event Counters
// ============================================================================

/// Tally of the trace events seen during a run
#[derive(Debug, Clone, Default)]
pub struct EventCounters {
    pub attached: usize,
    pub detached: usize,
    pub gates_established: usize,
    pub gates_removed: usize,
    pub neighbors_lost: usize,
    pub protocol_violations: usize,
    pub requests_completed: usize,
    pub requests_failed: usize,
    pub layer_disconnected: usize,
    pub layer_connected: usize,
}

impl EventCounters {
    pub fn record(&mut self, event: &Event) {
        match event {
            Event::Attached { .. } => self.attached += 1,
            Event::Detached { .. } => self.detached += 1,
            Event::GateEstablished { .. } => self.gates_established += 1,
            Event::GateRemoved { .. } => self.gates_removed += 1,
            Event::NeighborLost { .. } => self.neighbors_lost += 1,
            Event::ProtocolViolation { .. } => self.protocol_violations += 1,
            Event::RequestCompleted { gate: Some(_), .. } => self.requests_completed += 1,
            Event::RequestCompleted { gate: None, .. } => self.requests_failed += 1,
            Event::LayerDisconnected { .. } => self.layer_disconnected += 1,
            Event::LayerConnected { .. } => self.layer_connected += 1,
            _ => {}
        }
    }
}

impl ScenarioResult {
    pub fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║    LINK LIFECYCLE RESULTS                              ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        println!("Scenario: {}", self.name);
        match self.seed {
            Some(seed) => println!("Seed: {}", seed),
            None => println!("Seed: random"),
        }
        println!("Ended at t={:.3}s after {} events", self.end_time, self.events_handled);
        if self.failed_actions > 0 {
            println!("Failed actions: {}", self.failed_actions);
        }
        println!();

        let c = &self.counters;
        println!("═══ Events ═══");
        println!("  Attached: {}, Detached: {}", c.attached, c.detached);
        println!("  Gates: {} established, {} removed", c.gates_established, c.gates_removed);
        println!("  Neighbors lost: {}", c.neighbors_lost);
        println!("  Layer: {} disconnected, {} connected", c.layer_disconnected, c.layer_connected);
        println!("  Requests: {} completed, {} failed", c.requests_completed, c.requests_failed);
        if c.protocol_violations > 0 {
            println!("  Protocol violations: {}", c.protocol_violations);
        }
        println!();

        println!("═══ Gates ═══");
        for node in &self.nodes {
            println!(
                "  {} on {} as {} ({} processes)",
                node.node,
                node.medium,
                node.attachment.as_deref().unwrap_or("-"),
                node.processes
            );
            for gate in &node.gates {
                let peer_gate = gate.peer_gate.map(|g| g.to_string()).unwrap_or_else(|| "?".into());
                println!(
                    "    gate {:>3} {:?} -> {} (peer gate {}){}",
                    gate.id,
                    gate.kind,
                    gate.peer,
                    peer_gate,
                    if gate.operational { "" } else { " [not operational]" }
                );
            }
        }
        println!();

        println!("═══ Media ═══");
        for medium in &self.media {
            let s = &medium.stats;
            println!(
                "  {}{}: {} transmissions, {} delivered, {} dropped, {} corrupted, {} bytes",
                medium.name,
                if medium.broken { " [broken]" } else { "" },
                s.transmissions,
                s.delivered,
                s.dropped,
                s.corrupted,
                s.delivered_bytes
            );
        }
    }
}
