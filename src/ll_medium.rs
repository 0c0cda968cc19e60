use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::ll_error::LinkError;
use crate::ll_interface::{
    Capabilities, EndpointRef, MediumId, Name, Packet, Requirements, SimEvent, SimTime,
    PROTECTED_HEADER_BYTES,
};
use crate::ll_scheduler::{EventHandle, SimScheduler};

// ============================================================================
// Configuration
// ============================================================================

/// Physical parameters of a simulated medium.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediumConfig {
    /// Data rate in kbit/s; `None` means infinite (default: None)
    pub bandwidth_kbit: Option<u64>,

    /// Propagation delay in ms (default: 10)
    pub delay_ms: u64,

    /// Use `delay_ms` as transmission delay instead of deriving it from the
    /// packet size and bandwidth (default: false)
    pub constant_delay: bool,

    /// Probability that a data packet is lost (default: 0.0)
    pub loss_rate: f64,

    /// Per-byte corruption probability for lost packets (default: 0.0)
    pub bit_error_rate: f64,
}

impl Default for MediumConfig {
    fn default() -> Self {
        Self {
            bandwidth_kbit: None,
            delay_ms: 10,
            constant_delay: false,
            loss_rate: 0.0,
            bit_error_rate: 0.0,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediumStats {
    pub transmissions: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub corrupted: u64,
    pub delivered_bytes: u64,
}

// ============================================================================
// Medium
// ============================================================================

struct InFlight {
    handle: EventHandle,
    packet: Packet,
    dest: EndpointRef,
    started: SimTime,
    lost: bool,
}

/// Outcome of a finished transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub dest: EndpointRef,
    pub started: SimTime,
    pub size: usize,
    pub corrupted: bool,
    /// `None` if the packet got lost on the way
    pub packet: Option<Packet>,
}

impl Delivery {
    pub fn delivered(&self) -> bool {
        self.packet.is_some()
    }
}

/// Result of `Medium::set_broken`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokenTransition {
    Unchanged,
    Broke,
    Repaired,
}

/// Half-duplex shared channel: at most one packet is in flight at any time.
pub struct Medium {
    id: MediumId,
    name: Name,
    config: MediumConfig,
    available_kbit: Option<u64>,
    in_flight: Option<InFlight>,
    broken: bool,
    rng: StdRng,
    stats: MediumStats,
    scheduler: SimScheduler,
}

impl Medium {
    pub fn new(
        id: MediumId,
        name: impl Into<Name>,
        config: MediumConfig,
        scheduler: SimScheduler,
        seed: u64,
    ) -> Self {
        let mut config = config;
        config.loss_rate = clamp_probability(config.loss_rate);
        config.bit_error_rate = clamp_probability(config.bit_error_rate);

        Self {
            id,
            name: name.into(),
            available_kbit: config.bandwidth_kbit,
            config,
            in_flight: None,
            broken: false,
            rng: StdRng::seed_from_u64(seed),
            stats: MediumStats::default(),
            scheduler,
        }
    }

    pub fn id(&self) -> MediumId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &MediumConfig {
        &self.config
    }

    pub fn stats(&self) -> &MediumStats {
        &self.stats
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Starts transmitting `packet` towards `dest`.
    ///
    /// Returns `Ok(false)` if another packet is still in flight; the caller
    /// keeps the packet queued.
    pub fn transmit(&mut self, mut packet: Packet, dest: EndpointRef) -> Result<bool, LinkError> {
        if self.broken {
            return Err(LinkError::MediumBroken);
        }
        if self.in_flight.is_some() {
            trace!("medium {} busy, packet stays queued", self.name);
            return Ok(false);
        }

        let lost = !packet.is_special()
            && self.config.loss_rate > 0.0
            && self.rng.gen_bool(self.config.loss_rate);

        if lost && self.config.bit_error_rate > 0.0 {
            packet.corrupted = self.corrupt(&mut packet.data);
        }

        let delay = self.delay_for(packet.size());
        let started = self.scheduler.now();
        let handle = self
            .scheduler
            .schedule_in(delay, SimEvent::Delivery { medium: self.id });

        trace!(
            "medium {} sends {} bytes, delay {:.6}s{}",
            self.name,
            packet.size(),
            delay,
            if lost { " (lost)" } else { "" }
        );

        self.stats.transmissions += 1;
        self.in_flight = Some(InFlight {
            handle,
            packet,
            dest,
            started,
            lost,
        });

        Ok(true)
    }

    // only the body after the protected header is touched
    fn corrupt(&mut self, data: &mut [u8]) -> bool {
        let rate = (self.config.bit_error_rate * 10.0).min(1.0);
        let mut corrupted = false;

        for byte in data.iter_mut().skip(PROTECTED_HEADER_BYTES) {
            if self.rng.gen_bool(rate) {
                let value = -(self.rng.gen::<f64>() * 127.0) as i8;
                *byte = value as u8;
                corrupted = true;
            }
        }

        corrupted
    }

    /// Transmission delay for `size` bytes in seconds.
    pub fn delay_for(&self, size: usize) -> SimTime {
        if self.config.constant_delay {
            return self.config.delay_ms as f64 / 1000.0;
        }

        match self.config.bandwidth_kbit {
            Some(kbit) if kbit > 0 => size as f64 / (1000.0 * kbit as f64 / 8.0),
            _ => 0.0,
        }
    }

    /// Ends the current transmission. Called for the scheduled
    /// `SimEvent::Delivery` of this medium.
    pub fn complete_transmission(&mut self) -> Option<Delivery> {
        let flight = self.in_flight.take()?;
        // the delivery event is the one being handled, make sure a stale handle
        // does not linger in the pending set
        self.scheduler.cancel(flight.handle);

        let size = flight.packet.size();
        let corrupted = flight.packet.corrupted;

        let packet = if flight.lost {
            self.stats.dropped += 1;
            if corrupted {
                self.stats.corrupted += 1;
            }
            debug!("medium {} dropped packet of {} bytes", self.name, size);
            None
        } else {
            self.stats.delivered += 1;
            self.stats.delivered_bytes += size as u64;
            Some(flight.packet)
        };

        Some(Delivery {
            dest: flight.dest,
            started: flight.started,
            size,
            corrupted,
            packet,
        })
    }

    // ===== Resources =====

    /// Reserves what `requirements` ask for. Nothing is committed if any part
    /// of the request can not be met.
    pub fn reserve(&mut self, requirements: &Requirements) -> Result<(), LinkError> {
        if let Some(max_delay) = requirements.max_delay_ms {
            if self.config.delay_ms > max_delay {
                return Err(LinkError::DelayUnsupported {
                    required: max_delay,
                    offered: self.config.delay_ms,
                });
            }
        }

        if let (Some(requested), Some(available)) = (requirements.datarate_kbit, self.available_kbit) {
            if requested > available {
                return Err(LinkError::InsufficientBandwidth {
                    requested,
                    available,
                });
            }
            self.available_kbit = Some(available - requested);
        }

        Ok(())
    }

    pub fn free(&mut self, requirements: &Requirements) {
        if let (Some(released), Some(available)) = (requirements.datarate_kbit, self.available_kbit) {
            let total = self.config.bandwidth_kbit.unwrap_or(u64::MAX);
            self.available_kbit = Some(available.saturating_add(released).min(total));
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            delay_ms: self.config.delay_ms,
            bandwidth_kbit: self.available_kbit,
            loss_rate: self.config.loss_rate,
        }
    }

    // ===== State changes =====

    /// A repair schedules `SimEvent::MediumRepaired` for the next tick instead
    /// of notifying anyone inline.
    pub fn set_broken(&mut self, broken: bool) -> BrokenTransition {
        if self.broken == broken {
            return BrokenTransition::Unchanged;
        }
        self.broken = broken;

        if broken {
            debug!("medium {} broken", self.name);
            BrokenTransition::Broke
        } else {
            debug!("medium {} repaired", self.name);
            self.scheduler
                .schedule_in(0.0, SimEvent::MediumRepaired { medium: self.id });
            BrokenTransition::Repaired
        }
    }

    pub fn set_loss_rate(&mut self, rate: f64) {
        self.config.loss_rate = clamp_probability(rate);
    }

    pub fn set_bit_error_rate(&mut self, rate: f64) {
        self.config.bit_error_rate = clamp_probability(rate);
    }

    pub fn set_delay_ms(&mut self, delay_ms: u64) {
        self.config.delay_ms = delay_ms;
    }

    /// Changes the total data rate. Existing reservations keep their share.
    pub fn set_bandwidth_kbit(&mut self, bandwidth: Option<u64>) {
        let reserved = match (self.config.bandwidth_kbit, self.available_kbit) {
            (Some(total), Some(available)) => total.saturating_sub(available),
            _ => 0,
        };
        self.config.bandwidth_kbit = bandwidth;
        self.available_kbit = bandwidth.map(|total| total.saturating_sub(reserved));
    }

    /// Drops a transmission that is still in flight, e.g. when the medium is
    /// deleted.
    pub fn abort_transmission(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            self.scheduler.cancel(flight.handle);
        }
    }
}

fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}
