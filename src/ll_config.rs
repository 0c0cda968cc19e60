use serde::{Deserialize, Serialize};

use crate::ll_error::LinkError;
use crate::ll_interface::SimTime;
use crate::ll_medium::MediumConfig;

/// Timing and retry policy of link establishment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Period of the reattach check in seconds (default: 10.0)
    pub reattach_interval: SimTime,

    /// Upper bound for a signaling exchange, also used as the passive wait
    /// timeout, in seconds (default: 10.0)
    pub process_timeout: SimTime,

    /// Number of re-sends of a signaling request (default: 3)
    pub signaling_retries: u32,

    /// Attempts to find a free attachment name (default: 10)
    pub max_name_attempts: u32,

    /// Round trip estimate in seconds if the medium does not advertise a
    /// delay (default: 10.0)
    pub fallback_rtt: SimTime,

    /// Delay between rediscovering a neighbor we only have a backup gate for
    /// and the follow-up repair check, in seconds (default: 1.0)
    pub repair_delay: SimTime,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reattach_interval: 10.0,
            process_timeout: 10.0,
            signaling_retries: 3,
            max_name_attempts: 10,
            fallback_rtt: 10.0,
            repair_delay: 1.0,
        }
    }
}

/// Top level configuration of a simulation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Seed for all random decisions; `None` draws one from the OS
    pub seed: Option<u64>,

    /// Defaults for media created without an explicit configuration
    pub medium: MediumConfig,

    pub link: LinkConfig,
}

impl SimulationConfig {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }

    /// Rejects values the simulation can not work with.
    pub fn validate(&self) -> Result<(), LinkError> {
        let link = &self.link;
        if link.max_name_attempts == 0 {
            return Err(LinkError::InvalidConfig("max_name_attempts must be at least 1".to_string()));
        }
        let positive = link.process_timeout > 0.0 && link.reattach_interval > 0.0;
        if !positive || !(link.fallback_rtt >= 0.0) || !(link.repair_delay >= 0.0) {
            return Err(LinkError::InvalidConfig("timeouts must be positive".to_string()));
        }
        Ok(())
    }
}
