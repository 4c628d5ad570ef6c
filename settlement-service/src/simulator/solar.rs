//! Solar PV production model, tuned for a Central European midsummer day
//! (Basel-like latitude, July insolation).

use rand::{rngs::StdRng, Rng};
use time::OffsetDateTime;

/// Solar noon with DST, local summer time.
const SOLAR_NOON: f64 = 13.0;
/// Hours of daylight in July.
const DAY_LENGTH: f64 = 15.5;
/// Panel temperature, inverter losses and soiling.
const SYSTEM_EFFICIENCY: f64 = 0.85;
/// Cloud variation: random ±20 %.
const CLOUD_VARIATION: f64 = 0.2;

/// Clear-sky production for a system of `pv_kwp` peak power at the given
/// time. Deterministic; the cloud noise lives in [`pv_production_kw`].
pub fn clear_sky_production_kw(pv_kwp: f64, at: OffsetDateTime) -> f64 {
    if pv_kwp <= 0.0 {
        return 0.0;
    }

    let hour = at.hour() as f64 + at.minute() as f64 / 60.0;

    // No production outside the daylight window.
    if hour < 5.5 || hour > 21.0 {
        return 0.0;
    }

    // Normalized position in the day: -1 at dawn, 0 at solar noon, 1 at dusk.
    let position = (hour - SOLAR_NOON) / (DAY_LENGTH / 2.0);
    if position.abs() > 1.0 {
        return 0.0;
    }

    let elevation_factor = (position * std::f64::consts::FRAC_PI_2).cos();

    (pv_kwp * elevation_factor * SYSTEM_EFFICIENCY).max(0.0)
}

/// Current production including cloud noise drawn from the caller's rng.
pub fn pv_production_kw(pv_kwp: f64, at: OffsetDateTime, rng: &mut StdRng) -> f64 {
    let clear = clear_sky_production_kw(pv_kwp, at);
    if clear <= 0.0 {
        return 0.0;
    }

    let cloud_factor = 1.0 + rng.gen_range(-CLOUD_VARIATION..CLOUD_VARIATION);
    (clear * cloud_factor).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use time::macros::datetime;

    #[test]
    fn no_production_at_night() {
        assert_eq!(
            clear_sky_production_kw(10.0, datetime!(2025-07-15 02:00:00 UTC)),
            0.0
        );
        assert_eq!(
            clear_sky_production_kw(10.0, datetime!(2025-07-15 22:30:00 UTC)),
            0.0
        );
    }

    #[test]
    fn peak_production_near_solar_noon() {
        let noon = clear_sky_production_kw(10.0, datetime!(2025-07-15 13:00:00 UTC));
        assert!((noon - 10.0 * 0.85).abs() < 1e-9);

        let morning = clear_sky_production_kw(10.0, datetime!(2025-07-15 08:00:00 UTC));
        assert!(morning > 0.0 && morning < noon);
    }

    #[test]
    fn zero_capacity_produces_nothing() {
        assert_eq!(
            clear_sky_production_kw(0.0, datetime!(2025-07-15 13:00:00 UTC)),
            0.0
        );
        assert_eq!(
            clear_sky_production_kw(-5.0, datetime!(2025-07-15 13:00:00 UTC)),
            0.0
        );
    }

    #[test]
    fn cloud_noise_stays_within_bounds_and_is_seeded() {
        let at = datetime!(2025-07-15 13:00:00 UTC);
        let clear = clear_sky_production_kw(10.0, at);

        let mut rng1 = StdRng::seed_from_u64(42);
        let mut rng2 = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let a = pv_production_kw(10.0, at, &mut rng1);
            let b = pv_production_kw(10.0, at, &mut rng2);
            assert_eq!(a, b);
            assert!(a >= clear * 0.8 - 1e-9 && a <= clear * 1.2 + 1e-9);
        }
    }
}
