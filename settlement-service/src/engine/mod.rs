//! The metering and settlement engine.
//!
//! Readings arrive asynchronously from a transport; settlement runs on a
//! fixed interval. The engine owns both per-device counter baselines and
//! the interval's accumulated deltas behind one lock: the transport path
//! merges deltas in, the driver's tick drains them out (read-and-clear), so
//! energy settled in interval N can never be counted again in N+1.

pub mod breakeven;
pub mod counter_store;
pub mod driver;
pub mod settlement;
pub mod tariff;
pub mod units;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Result;
use community_client::domain::MeterReading;
use tokio::sync::Mutex;

pub use breakeven::break_even_price;
pub use counter_store::{CounterStore, IntervalDelta, MeterCounters, Observation};
pub use driver::SettlementDriver;
pub use settlement::{settle, Settlement};
pub use tariff::{TariffRates, TariffSnapshot, TariffStore};

/// Maps stable device identities (hardware addresses) to house ids.
///
/// Readings from devices not in the registry are ignored: dynamic device
/// registration is expected and not an error.
#[derive(Debug, Clone, Default)]
pub struct HouseRegistry {
    by_mac: HashMap<String, u32>,
}

impl HouseRegistry {
    pub fn new(entries: impl IntoIterator<Item = (String, u32)>) -> Self {
        Self {
            by_mac: entries.into_iter().collect(),
        }
    }

    pub fn lookup(&self, mac: &str) -> Option<u32> {
        self.by_mac.get(mac).copied()
    }

    pub fn len(&self) -> usize {
        self.by_mac.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_mac.is_empty()
    }
}

/// One house's deltas accumulated since the last settlement tick.
#[derive(Debug, Clone)]
pub struct PendingHouse {
    pub house_id: u32,
    pub mac: String,
    pub delta: IntervalDelta,
}

/// What happened to a single reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObserveOutcome {
    /// Device not in the registry; reading dropped.
    UnknownDevice,
    /// First reading for this device; baseline stored, nothing to settle.
    First,
    /// Delta accumulated for the current interval.
    Accumulated { house_id: u32, reset: bool },
}

struct EngineState {
    counters: CounterStore,
    pending: BTreeMap<u32, PendingHouse>,
}

pub struct SettlementEngine {
    registry: HouseRegistry,
    state: Mutex<EngineState>,
}

impl SettlementEngine {
    pub fn new(registry: HouseRegistry, counters: CounterStore) -> Self {
        Self {
            registry,
            state: Mutex::new(EngineState {
                counters,
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Feed one reading: derive the delta against the stored baseline and
    /// merge it into the current interval's buffer.
    pub async fn observe(&self, reading: &MeterReading) -> ObserveOutcome {
        let Some(house_id) = self.registry.lookup(&reading.mac) else {
            return ObserveOutcome::UnknownDevice;
        };

        let counters = MeterCounters {
            ei_kwh: reading.ei_kwh,
            eo_kwh: reading.eo_kwh,
            uptime_s: reading.uptime_s,
        };

        let mut state = self.state.lock().await;
        match state.counters.observe(&reading.mac, counters) {
            Observation::First => ObserveOutcome::First,
            Observation::Delta { delta, reset } => {
                state
                    .pending
                    .entry(house_id)
                    .or_insert_with(|| PendingHouse {
                        house_id,
                        mac: reading.mac.clone(),
                        delta: IntervalDelta::default(),
                    })
                    .delta
                    .merge(delta);
                ObserveOutcome::Accumulated { house_id, reset }
            }
        }
    }

    /// Take the interval's accumulated deltas, leaving the buffer empty.
    pub async fn drain(&self) -> BTreeMap<u32, PendingHouse> {
        let mut state = self.state.lock().await;
        std::mem::take(&mut state.pending)
    }

    /// Persist counter baselines so a restart resumes without re-counting
    /// or losing energy.
    pub async fn checkpoint(&self, path: &Path) -> Result<()> {
        let state = self.state.lock().await;
        state.counters.save(path)
    }

    pub async fn tracked_devices(&self) -> usize {
        self.state.lock().await.counters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn reading(mac: &str, ei: f64, eo: f64) -> MeterReading {
        MeterReading {
            ts: datetime!(2025-07-15 12:00:00 UTC),
            mac: mac.to_string(),
            smid: None,
            pi_kw: 0.0,
            po_kw: 0.0,
            ei_kwh: ei,
            eo_kwh: eo,
            uptime_s: 0,
        }
    }

    fn engine() -> SettlementEngine {
        let registry = HouseRegistry::new([("AA-11".to_string(), 1), ("BB-22".to_string(), 2)]);
        SettlementEngine::new(registry, CounterStore::new())
    }

    #[tokio::test]
    async fn unknown_devices_are_ignored() {
        let engine = engine();
        assert_eq!(
            engine.observe(&reading("CC-33", 1.0, 0.0)).await,
            ObserveOutcome::UnknownDevice
        );
        assert!(engine.drain().await.is_empty());
    }

    #[tokio::test]
    async fn deltas_accumulate_within_an_interval() {
        let engine = engine();

        engine.observe(&reading("AA-11", 100.0, 50.0)).await;
        engine.observe(&reading("AA-11", 100.5, 50.0)).await;
        engine.observe(&reading("AA-11", 101.0, 50.2)).await;

        let pending = engine.drain().await;
        let house = &pending[&1];
        assert!((house.delta.ei_kwh - 1.0).abs() < 1e-9);
        assert!((house.delta.eo_kwh - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn drain_clears_the_buffer_so_nothing_is_double_counted() {
        let engine = engine();

        engine.observe(&reading("AA-11", 100.0, 50.0)).await;
        engine.observe(&reading("AA-11", 100.5, 50.0)).await;

        let first = engine.drain().await;
        assert_eq!(first.len(), 1);
        assert!(engine.drain().await.is_empty());

        // The baseline survived the drain: the next reading only yields the
        // new movement.
        engine.observe(&reading("AA-11", 100.75, 50.0)).await;
        let second = engine.drain().await;
        assert!((second[&1].delta.ei_kwh - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn first_reading_establishes_a_baseline_only() {
        let engine = engine();
        assert_eq!(
            engine.observe(&reading("BB-22", 7.0, 3.0)).await,
            ObserveOutcome::First
        );
        assert!(engine.drain().await.is_empty());
        assert_eq!(engine.tracked_devices().await, 1);
    }
}
