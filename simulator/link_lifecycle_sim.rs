// Link Lifecycle Simulator Example

mod link_lifecycle;

use link_lifecycle::config::{MediumEntry, NodeEntry, ScenarioMeta};
use link_lifecycle::{LinkLifecycleRunner, LinkScenario, ScenarioAction, TimedAction};
use ll_rust::{MediumConfig, SimulationConfig};
use simple_logger::SimpleLogger;

fn main() {
    SimpleLogger::new().init().unwrap();

    println!("╔════════════════════════════════════════════════════════╗");
    println!("║    Link Lifecycle Simulator                            ║");
    println!("╚════════════════════════════════════════════════════════╝\n");

    let mut simulation = SimulationConfig::with_seed(2024);
    // short signaling timeout so lost handshakes show up quickly
    simulation.link.process_timeout = 2.0;

    let node_names = ["alpha", "beta", "gamma", "delta", "epsilon"];
    let nodes = node_names
        .iter()
        .map(|name| NodeEntry {
            name: name.to_string(),
            attach: vec!["wlan".to_string()],
            reattach: true,
        })
        .collect();

    let mut actions = Vec::new();
    for (i, name) in node_names.iter().enumerate() {
        let peer = node_names[(i + 1) % node_names.len()];
        actions.push(TimedAction {
            at: 1.0 + i as f64 * 0.1,
            action: ScenarioAction::SendData {
                node: name.to_string(),
                medium: "wlan".to_string(),
                peer: peer.to_string(),
                size: 1200,
                count: 10,
            },
        });
    }
    actions.push(TimedAction {
        at: 5.0,
        action: ScenarioAction::Outage {
            node: "gamma".to_string(),
        },
    });
    actions.push(TimedAction {
        at: 8.0,
        action: ScenarioAction::Repair {
            node: "gamma".to_string(),
        },
    });
    actions.push(TimedAction {
        at: 12.0,
        action: ScenarioAction::SetLoss {
            medium: "wlan".to_string(),
            loss_rate: 0.5,
        },
    });
    actions.push(TimedAction {
        at: 12.5,
        action: ScenarioAction::RequestGate {
            node: "epsilon".to_string(),
            medium: "wlan".to_string(),
            peer: "alpha".to_string(),
        },
    });

    let scenario = LinkScenario {
        meta: ScenarioMeta {
            name: Some("five nodes on a wireless medium".to_string()),
            description: None,
        },
        simulation,
        duration: 30.0,
        media: vec![MediumEntry {
            name: "wlan".to_string(),
            config: Some(MediumConfig {
                bandwidth_kbit: Some(11_000),
                delay_ms: 5,
                loss_rate: 0.02,
                ..MediumConfig::default()
            }),
        }],
        nodes,
        actions,
    };

    match LinkLifecycleRunner::new(scenario, None, false).run() {
        Ok(result) => result.print_summary(),
        Err(e) => eprintln!("simulation failed: {}", e),
    }
}
