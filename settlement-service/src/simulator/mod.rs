//! Synthetic community: houses with PV, base load and scheduled appliances.
//!
//! Everything random comes from a seeded `StdRng` and everything temporal
//! from an injected simulated clock, so a given seed and start time replay
//! the exact same appliance schedule and meter trace.

pub mod house;
pub mod solar;

use std::time::Duration;

use serde::Deserialize;
use time::macros::datetime;
use time::OffsetDateTime;

use crate::config::SimulatorConfig;

pub use house::SimHouse;

/// When an EV tends to be plugged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvSchedule {
    /// Plugged in during working hours (08:00-14:00 start window).
    Day,
    /// Plugged in overnight (22:00-23:00 start window).
    Night,
}

/// A simulated wall clock advancing one fixed step per tick.
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    current: OffsetDateTime,
}

/// Midsummer morning, so the PV curve has daylight to work with.
pub const DEFAULT_SIM_START: OffsetDateTime = datetime!(2025-07-15 06:00:00 UTC);

impl SimClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self { current: start }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.current
    }

    /// Return the current simulated time, then advance by `step`.
    pub fn tick(&mut self, step: Duration) -> OffsetDateTime {
        let now = self.current;
        self.current += step;
        now
    }
}

/// Build the configured house fleet, each with its own rng derived from the
/// fleet seed and the house id.
pub fn build_houses(cfg: &SimulatorConfig, start: OffsetDateTime) -> Vec<SimHouse> {
    cfg.houses
        .iter()
        .map(|entry| SimHouse::new(entry, &cfg.load, &cfg.appliances, cfg.seed, start))
        .collect()
}
