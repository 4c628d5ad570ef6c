//! The reading pipeline's terminal stage: every validated reading is fed
//! into the settlement engine's counter store and interval buffer.

use std::sync::Arc;

use community_client::domain::MeterReading;
use futures::StreamExt;

use crate::engine::{ObserveOutcome, SettlementEngine};
use crate::pipeline::{Envelope, PipelineError, Sink};

pub struct EngineSink {
    engine: Arc<SettlementEngine>,
}

impl EngineSink {
    pub fn new(engine: Arc<SettlementEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl Sink<MeterReading> for EngineSink {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<MeterReading>, PipelineError>>
            + Send
            + Unpin
            + 'static,
    {
        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(error = %e, "error in upstream pipeline for EngineSink");
                    continue;
                }
            };

            let reading = env.payload;
            match self.engine.observe(&reading).await {
                ObserveOutcome::UnknownDevice => {
                    metrics::counter!("readings_unknown_device_total").increment(1);
                    tracing::debug!(mac = %reading.mac, "reading from unregistered device ignored");
                }
                ObserveOutcome::First => {
                    metrics::counter!("readings_ingested_total").increment(1);
                    tracing::info!(
                        mac = %reading.mac,
                        ei_kwh = reading.ei_kwh,
                        eo_kwh = reading.eo_kwh,
                        "first reading for device, baseline stored"
                    );
                }
                ObserveOutcome::Accumulated { house_id, reset } => {
                    metrics::counter!("readings_ingested_total").increment(1);
                    if reset {
                        metrics::counter!("counter_resets_total").increment(1);
                        tracing::warn!(
                            mac = %reading.mac,
                            house_id,
                            "meter counter went backwards; delta clamped to zero for this interval"
                        );
                    }
                }
            }
        }

        Ok(())
    }
}
