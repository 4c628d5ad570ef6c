//! Thin typed quantities for the settlement math.
//!
//! Conversion happens at the boundaries (wire payloads, storage records,
//! config) where everything is a plain `f64`; inside the engine the two
//! physically meaningful operations are integrating power over an interval
//! and pricing energy at a rate.

use std::ops::{Add, AddAssign, Mul};
use std::time::Duration;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Instantaneous power (kW).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Kilowatts(pub f64);

/// Interval energy (kWh).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct KilowattHours(pub f64);

/// A tariff leg price (ct/kWh).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct CentsPerKwh(pub f64);

/// A monetary amount (ct).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Cents(pub f64);

impl Kilowatts {
    /// Energy produced or consumed at this power level over `interval`.
    pub fn over(self, interval: Duration) -> KilowattHours {
        KilowattHours(self.0 * interval.as_secs_f64() / SECONDS_PER_HOUR)
    }
}

impl KilowattHours {
    pub fn clamp_non_negative(self) -> Self {
        KilowattHours(self.0.max(0.0))
    }
}

impl Mul<CentsPerKwh> for KilowattHours {
    type Output = Cents;

    fn mul(self, rate: CentsPerKwh) -> Cents {
        Cents(self.0 * rate.0)
    }
}

impl Add for KilowattHours {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        KilowattHours(self.0 + rhs.0)
    }
}

impl AddAssign for KilowattHours {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Add for Cents {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Cents(self.0 + rhs.0)
    }
}

impl AddAssign for Cents {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_integrates_to_energy_over_interval() {
        // 3.6 kW over 10 seconds is exactly 0.01 kWh.
        let e = Kilowatts(3.6).over(Duration::from_secs(10));
        assert!((e.0 - 0.01).abs() < 1e-12);
    }

    #[test]
    fn energy_priced_at_rate_yields_cents() {
        let v = KilowattHours(2.0) * CentsPerKwh(25.0);
        assert_eq!(v, Cents(50.0));
    }

    #[test]
    fn clamp_absorbs_negative_energy() {
        assert_eq!(KilowattHours(-1.5).clamp_non_negative(), KilowattHours(0.0));
        assert_eq!(KilowattHours(1.5).clamp_non_negative(), KilowattHours(1.5));
    }
}
