use community_client::domain::MeterReading;

use crate::pipeline::{Envelope, PipelineError, Transform};

/// Pure validation of a raw `MeterReading`.
///
/// Rules:
/// - cumulative registers and instantaneous powers must be finite,
/// - cumulative registers and instantaneous powers must be non-negative,
/// - the device identity must be non-empty.
///
/// A register going *backwards* relative to the previous reading is not a
/// validation failure; that is the counter store's reset handling.
pub fn validate_reading(env: Envelope<MeterReading>) -> Result<Envelope<MeterReading>, PipelineError> {
    let r = &env.payload;

    if r.mac.trim().is_empty() {
        return Err(PipelineError::Transform("mac must be non-empty".to_string()));
    }

    for (name, value) in [
        ("ei_kwh", r.ei_kwh),
        ("eo_kwh", r.eo_kwh),
        ("pi_kw", r.pi_kw),
        ("po_kw", r.po_kw),
    ] {
        if !value.is_finite() {
            return Err(PipelineError::Transform(format!("{name} must be finite")));
        }
        if value < 0.0 {
            return Err(PipelineError::Transform(format!(
                "{name} must be non-negative"
            )));
        }
    }

    Ok(env)
}

#[derive(Clone, Default)]
pub struct ReadingValidation;

#[async_trait::async_trait]
impl Transform<MeterReading, MeterReading> for ReadingValidation {
    async fn apply(
        &self,
        input: Envelope<MeterReading>,
    ) -> Result<Envelope<MeterReading>, PipelineError> {
        match validate_reading(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_readings_rejected_total").increment(1);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn reading(ei: f64, eo: f64) -> Envelope<MeterReading> {
        Envelope::now(MeterReading {
            ts: datetime!(2025-07-15 12:00:00 UTC),
            mac: "AA-11-BB-22-CC-01".to_string(),
            smid: None,
            pi_kw: 0.5,
            po_kw: 0.0,
            ei_kwh: ei,
            eo_kwh: eo,
            uptime_s: 1000,
        })
    }

    #[test]
    fn validation_accepts_valid_reading() {
        assert!(validate_reading(reading(1042.1, 512.0)).is_ok());
    }

    #[test]
    fn validation_rejects_negative_register() {
        let res = validate_reading(reading(-0.1, 512.0));
        assert!(matches!(res, Err(PipelineError::Transform(_))));
    }

    #[test]
    fn validation_rejects_non_finite_values() {
        let res = validate_reading(reading(f64::NAN, 512.0));
        assert!(matches!(res, Err(PipelineError::Transform(_))));

        let res = validate_reading(reading(f64::INFINITY, 512.0));
        assert!(matches!(res, Err(PipelineError::Transform(_))));
    }

    #[test]
    fn validation_rejects_empty_mac() {
        let mut env = reading(1.0, 2.0);
        env.payload.mac = "  ".to_string();
        let res = validate_reading(env);
        assert!(matches!(res, Err(PipelineError::Transform(_))));
    }
}
