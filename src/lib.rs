//! # ll_rust - Lower Layer Link Simulation
//!
//! A discrete event simulation of a shared broadcast medium (a bus) and the
//! link establishment machinery that sits on top of it. Nodes attach to a
//! medium under a generated attachment name, discover each other, and pair
//! up forwarding gates through a small signaling handshake.
//!
//! ## Core Components
//!
//! - **Medium**: bandwidth, delay, loss and bit errors; one packet on the wire at a time
//! - **AttachmentLayer**: bindings, connections and round-robin transmission over a medium
//! - **GateConstructionProcess**: the per-neighbor signaling state machine
//! - **LinkObserver**: attachment, neighbor discovery and process bookkeeping of one node
//! - **Simulation**: owns everything above and drives the event loop
//!
//! ## Usage
//!
//! ```no_run
//! use ll_rust::{Simulation, SimulationConfig};
//!
//! let mut sim = Simulation::new(SimulationConfig::with_seed(42));
//! let bus = sim.add_medium("bus", None);
//! let a = sim.add_node("a");
//! let b = sim.add_node("b");
//!
//! sim.attach(a, bus).unwrap();
//! sim.attach(b, bus).unwrap();
//! sim.run_until_idle(10_000);
//!
//! assert_eq!(sim.gates(a, bus).len(), 1);
//! ```
//!
//! All components of one simulation share a single `Scheduler` and are not
//! `Send`; independent simulations can run on separate threads.

// Time line and errors
pub mod ll_error;
pub mod ll_interface;
pub mod ll_scheduler;
pub mod ll_timer;

// Lower layer
pub mod ll_connection;
pub mod ll_layer;
pub mod ll_medium;

// Link establishment
pub mod ll_config;
pub mod ll_gate;
pub mod ll_naming;
pub mod ll_observer;
pub mod ll_process;
pub mod ll_signaling;

pub mod ll_simulation;

// Re-export commonly used types
pub use ll_config::{LinkConfig, SimulationConfig};
pub use ll_error::{ErrorClass, LinkError};
pub use ll_interface::{
    CollectingSink, EndpointRef, Event, EventSink, Identity, LayerEvent, LowerLayer, MediumId,
    Name, NodeId, NoOpSink, Packet, Requirements, SimTime,
};
pub use ll_layer::AttachmentLayer;
pub use ll_medium::{Medium, MediumConfig};
pub use ll_observer::LinkObserver;
pub use ll_scheduler::Scheduler;
pub use ll_simulation::Simulation;
