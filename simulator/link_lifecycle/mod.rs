// Link Lifecycle Simulator Module

pub mod config;
pub mod runner;
pub mod stats;

// Re-export commonly used types
pub use config::{LinkScenario, ScenarioAction, TimedAction};
pub use runner::{LinkLifecycleRunner, ScenarioError};
pub use stats::{EventCounters, ScenarioResult};
