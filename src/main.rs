use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use simple_logger::SimpleLogger;

use ll_rust::ll_gate::GateKind;
use ll_rust::{MediumConfig, NodeId, Simulation, SimulationConfig};

fn main() {
    SimpleLogger::new().init().unwrap();

    info!("starting");

    let num_of_nodes = 6;
    let rounds = 20;
    let seed = rand::thread_rng().next_u64();
    info!("seed {}", seed);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut sim = Simulation::new(SimulationConfig::with_seed(seed));

    let bus = sim.add_medium(
        "bus",
        Some(MediumConfig {
            bandwidth_kbit: Some(2000),
            loss_rate: 0.05,
            ..MediumConfig::default()
        }),
    );

    // attach all nodes
    let nodes: Vec<NodeId> = (0..num_of_nodes)
        .map(|i| sim.add_node(&format!("node{}", i)))
        .collect();
    for node in &nodes {
        if let Err(e) = sim.attach(*node, bus) {
            warn!("node {} failed to attach: {}", node, e);
        }
    }
    sim.run_until(1.0);

    for round in 0..rounds {
        let t = sim.now();

        // random traffic between established neighbors
        for node in &nodes {
            let peers: Vec<String> = sim
                .gates(*node, bus)
                .iter()
                .filter(|g| g.kind == GateKind::DirectDown && g.is_operational())
                .map(|g| g.peer_name.clone())
                .collect();
            if peers.is_empty() {
                continue;
            }
            let peer = &peers[rng.gen_range(0..peers.len())];
            let size = rng.gen_range(64..1500);
            if let Err(e) = sim.send_data(*node, bus, peer, vec![0u8; size]) {
                info!("{}: node {} -> {}: {}", round, node, peer, e);
            }
        }

        // disturbances
        match round {
            5 => {
                info!("{}: medium broken", round);
                let _ = sim.set_medium_broken(bus, true);
            }
            7 => {
                info!("{}: medium repaired", round);
                let _ = sim.set_medium_broken(bus, false);
            }
            10 => {
                info!("{}: outage of node {}", round, nodes[0]);
                sim.node_outage(nodes[0]);
            }
            13 => {
                if let Err(e) = sim.repair_node(nodes[0]) {
                    warn!("repair of node {} failed: {}", nodes[0], e);
                }
            }
            _ => {}
        }

        sim.run_until(t + 1.0);
    }
    sim.run_until_idle(100_000);

    for node in &nodes {
        let gates = sim.gates(*node, bus);
        let direct = gates.iter().filter(|g| g.kind == GateKind::DirectDown).count();
        let backup = gates.len() - direct;
        let name = sim
            .observer(*node, bus)
            .and_then(|o| o.attachment_name())
            .unwrap_or("-")
            .to_string();
        info!("{}: {} direct gates, {} backup gates", name, direct, backup);
    }

    if let Some(medium) = sim.medium(bus) {
        let stats = medium.stats();
        info!(
            "t={:.3}: {} transmissions, {} delivered, {} dropped, {} bytes",
            sim.now(),
            stats.transmissions,
            stats.delivered,
            stats.dropped,
            stats.delivered_bytes
        );
    }
}
