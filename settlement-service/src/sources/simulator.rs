//! Reading source backed by the synthetic community.
//!
//! Each real-time tick advances the simulated clock by one settlement
//! interval and emits one reading per house, feeding the same pipeline,
//! engine and publisher wiring as live metering.

use std::{sync::Arc, time::Duration};

use async_stream::stream;
use community_client::domain::MeterReading;
use futures::Stream;

use crate::config::SimulatorConfig;
use crate::pipeline::{Envelope, PipelineError, Source};
use crate::simulator::{build_houses, SimClock, SimHouse, DEFAULT_SIM_START};

struct SimState {
    houses: Vec<SimHouse>,
    clock: SimClock,
    step: Duration,
}

pub struct SimulatorSource {
    state: Arc<tokio::sync::Mutex<Option<SimState>>>,
}

impl SimulatorSource {
    pub fn new(cfg: &SimulatorConfig, interval: Duration) -> Self {
        let start = cfg.start_time.unwrap_or(DEFAULT_SIM_START);
        let houses = build_houses(cfg, start);

        tracing::info!(
            houses = houses.len(),
            seed = cfg.seed,
            %start,
            "synthetic community initialized"
        );

        Self {
            state: Arc::new(tokio::sync::Mutex::new(Some(SimState {
                houses,
                clock: SimClock::new(start),
                step: interval,
            }))),
        }
    }
}

#[async_trait::async_trait]
impl Source<MeterReading> for SimulatorSource {
    async fn stream(
        &self,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<Envelope<MeterReading>, PipelineError>> + Send>>
    {
        let mut guard = self.state.lock().await;
        let mut state = guard
            .take()
            .expect("SimulatorSource stream already taken; only one consumer supported");

        let s = stream! {
            let mut ticker = tokio::time::interval(state.step);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let now = state.clock.tick(state.step);

                for house in &mut state.houses {
                    let reading = house.update(now, state.step);
                    metrics::counter!("simulated_readings_total").increment(1);
                    yield Ok(Envelope::now(reading));
                }
            }
        };

        Box::pin(s)
    }
}
