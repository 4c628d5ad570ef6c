//! Tariff persistence and per-interval snapshots.
//!
//! Tariffs live in an externally editable JSON file. The engine only ever
//! reads an immutable snapshot once per interval; if the file is missing or
//! unreadable the last known-good rates are used, so settlement never
//! blocks on tariff I/O.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// The four tariff legs, in ct/kWh.
///
/// `p_con` is optional: when absent, the house consumption price is derived
/// per interval by the break-even optimizer instead.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TariffRates {
    /// House sells surplus PV to the community.
    pub p_pv: f64,
    /// Community sells surplus to the grid.
    pub p_grid_del: f64,
    /// Community buys its deficit from the grid.
    pub p_grid_con: f64,
    /// Community sells to net-importing houses; derived when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p_con: Option<f64>,
}

/// Immutable rates in effect for one settlement interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TariffSnapshot {
    pub rates: TariffRates,
    /// Price used when an interval has no importing houses and `p_con` is
    /// not configured.
    pub default_p_con: f64,
}

pub struct TariffStore {
    path: PathBuf,
    default_p_con: f64,
    last_good: Mutex<TariffRates>,
}

impl TariffStore {
    pub fn new(path: PathBuf, defaults: TariffRates, default_p_con: f64) -> Self {
        Self {
            path,
            default_p_con,
            last_good: Mutex::new(defaults),
        }
    }

    /// Read the rates currently on disk, falling back to the last
    /// known-good rates if the file is missing or malformed.
    pub fn current(&self) -> TariffRates {
        match self.read_file() {
            Ok(rates) => {
                *self.last_good.lock().unwrap() = rates;
                rates
            }
            Err(e) => {
                let fallback = *self.last_good.lock().unwrap();
                tracing::warn!(
                    error = %e,
                    "tariff file unreadable, using last known-good rates"
                );
                fallback
            }
        }
    }

    /// The snapshot a settlement interval is priced against.
    pub fn snapshot(&self) -> TariffSnapshot {
        TariffSnapshot {
            rates: self.current(),
            default_p_con: self.default_p_con,
        }
    }

    /// Persist new rates and adopt them as last known-good.
    pub fn store(&self, rates: TariffRates) -> Result<()> {
        let contents = serde_json::to_string_pretty(&rates)?;
        fs::write(&self.path, contents)
            .with_context(|| format!("failed to write tariff file {}", self.path.display()))?;
        *self.last_good.lock().unwrap() = rates;
        Ok(())
    }

    fn read_file(&self) -> Result<TariffRates> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read tariff file {}", self.path.display()))?;
        let rates: TariffRates = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse tariff file {}", self.path.display()))?;
        Ok(rates)
    }
}
