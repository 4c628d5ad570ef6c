//! Per-device memory of the last observed cumulative meter counters.
//!
//! Smart meters report ever-increasing import (`Ei`) and export (`Eo`)
//! registers; interval energy is the difference between two consecutive
//! observations, clamped at zero per register. The clamp absorbs meter
//! resets and reboots (the counter restarting from a lower value) without
//! producing negative or absurdly large deltas. Known limitation: whatever
//! energy flowed during the single interval in which a reset happened is
//! unrecorded and cannot be recovered.
//!
//! Baselines survive process restarts through an explicit JSON checkpoint
//! (`load`/`save`), so restarting the service neither re-counts nor loses
//! energy.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The cumulative registers last seen for one device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeterCounters {
    pub ei_kwh: f64,
    pub eo_kwh: f64,
    pub uptime_s: i64,
}

/// Non-negative interval energy for one device, derived from two
/// consecutive counter observations. Import and export are independent;
/// settlement nets them later.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IntervalDelta {
    pub ei_kwh: f64,
    pub eo_kwh: f64,
}

impl IntervalDelta {
    pub fn merge(&mut self, other: IntervalDelta) {
        self.ei_kwh += other.ei_kwh;
        self.eo_kwh += other.eo_kwh;
    }

    /// Signed net flow, positive while the device exported more than it
    /// imported.
    pub fn net_kwh(&self) -> f64 {
        self.eo_kwh - self.ei_kwh
    }
}

/// Outcome of feeding one reading into the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// First reading for this device; no baseline existed yet.
    First,
    /// A delta against the previous baseline. `reset` is set when either
    /// register went backwards and was clamped.
    Delta { delta: IntervalDelta, reset: bool },
}

#[derive(Debug, Default)]
pub struct CounterStore {
    baselines: HashMap<String, MeterCounters>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new observation and return the interval delta against the
    /// stored baseline.
    ///
    /// The baseline is overwritten unconditionally, including after a
    /// detected reset, so subsequent deltas are computed relative to the
    /// meter's new counter values. Re-delivering an unchanged reading
    /// yields a delta of exactly zero.
    pub fn observe(&mut self, mac: &str, counters: MeterCounters) -> Observation {
        let outcome = match self.baselines.get(mac) {
            None => Observation::First,
            Some(prev) => {
                let reset = counters.ei_kwh < prev.ei_kwh || counters.eo_kwh < prev.eo_kwh;
                let delta = IntervalDelta {
                    ei_kwh: (counters.ei_kwh - prev.ei_kwh).max(0.0),
                    eo_kwh: (counters.eo_kwh - prev.eo_kwh).max(0.0),
                };
                Observation::Delta { delta, reset }
            }
        };

        self.baselines.insert(mac.to_string(), counters);
        outcome
    }

    pub fn get(&self, mac: &str) -> Option<&MeterCounters> {
        self.baselines.get(mac)
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    /// Load baselines from a checkpoint file. A missing file is a fresh
    /// start, not an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read counter checkpoint {}", path.display()))?;
        let baselines: HashMap<String, MeterCounters> = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse counter checkpoint {}", path.display()))?;

        Ok(Self { baselines })
    }

    /// Persist baselines. Written to a sibling temp file first and renamed
    /// so a crash mid-write cannot truncate the previous checkpoint.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(&self.baselines)?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents)
            .with_context(|| format!("failed to write counter checkpoint {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace counter checkpoint {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(ei: f64, eo: f64) -> MeterCounters {
        MeterCounters {
            ei_kwh: ei,
            eo_kwh: eo,
            uptime_s: 0,
        }
    }

    #[test]
    fn first_observation_yields_no_delta() {
        let mut store = CounterStore::new();
        assert_eq!(
            store.observe("AA-11", counters(1000.0, 500.0)),
            Observation::First
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn increasing_counters_yield_independent_deltas() {
        let mut store = CounterStore::new();
        store.observe("AA-11", counters(1000.0, 500.0));

        let obs = store.observe("AA-11", counters(1000.25, 500.75));
        match obs {
            Observation::Delta { delta, reset } => {
                assert!((delta.ei_kwh - 0.25).abs() < 1e-9);
                assert!((delta.eo_kwh - 0.75).abs() < 1e-9);
                assert!(!reset);
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn counter_regression_is_clamped_to_zero() {
        let mut store = CounterStore::new();
        store.observe("AA-11", counters(1000.0, 500.0));

        // Meter reset: both registers restart near zero.
        let obs = store.observe("AA-11", counters(0.1, 0.0));
        match obs {
            Observation::Delta { delta, reset } => {
                assert_eq!(delta, IntervalDelta::default());
                assert!(reset);
            }
            other => panic!("expected delta, got {other:?}"),
        }

        // The new baseline is the post-reset value.
        let obs = store.observe("AA-11", counters(0.3, 0.1));
        match obs {
            Observation::Delta { delta, reset } => {
                assert!((delta.ei_kwh - 0.2).abs() < 1e-9);
                assert!((delta.eo_kwh - 0.1).abs() < 1e-9);
                assert!(!reset);
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn redelivered_reading_is_idempotent() {
        let mut store = CounterStore::new();
        store.observe("AA-11", counters(1000.0, 500.0));
        store.observe("AA-11", counters(1001.0, 500.5));

        let obs = store.observe("AA-11", counters(1001.0, 500.5));
        match obs {
            Observation::Delta { delta, reset } => {
                assert_eq!(delta, IntervalDelta::default());
                assert!(!reset);
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn devices_are_tracked_independently() {
        let mut store = CounterStore::new();
        store.observe("AA-11", counters(100.0, 0.0));
        store.observe("BB-22", counters(200.0, 50.0));

        let obs = store.observe("AA-11", counters(101.0, 0.0));
        match obs {
            Observation::Delta { delta, .. } => assert!((delta.ei_kwh - 1.0).abs() < 1e-9),
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn checkpoint_roundtrip_preserves_deltas_across_restart() {
        let path = std::env::temp_dir().join("counter_store_roundtrip_test.json");
        let _ = fs::remove_file(&path);

        let mut store = CounterStore::new();
        store.observe("AA-11", counters(1000.0, 500.0));
        store.save(&path).unwrap();

        // A reloaded store must produce the same delta the original would
        // have, as if the process never stopped.
        let mut reloaded = CounterStore::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);

        let obs = reloaded.observe("AA-11", counters(1002.0, 501.0));
        match obs {
            Observation::Delta { delta, reset } => {
                assert!((delta.ei_kwh - 2.0).abs() < 1e-9);
                assert!((delta.eo_kwh - 1.0).abs() < 1e-9);
                assert!(!reset);
            }
            other => panic!("expected delta, got {other:?}"),
        }

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_checkpoint_is_a_fresh_start() {
        let path = std::env::temp_dir().join("counter_store_missing_test.json");
        let _ = fs::remove_file(&path);

        let store = CounterStore::load(&path).unwrap();
        assert!(store.is_empty());
    }
}
