//! The periodic settlement driver.
//!
//! One tick per fixed interval: drain the accumulated deltas, resolve the
//! tariff snapshot, settle, hand the records to the publisher, and
//! periodically checkpoint counter baselines. On shutdown the partial
//! interval is flushed and baselines are saved so the next start resumes
//! without re-counting or losing energy.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::engine::{settle, SettlementEngine, TariffStore};
use crate::sinks::{SettlementPoint, SettlementPublisher};

/// Settle whatever has accumulated since the last call, stamped with `ts`.
///
/// Returns `false` when no readings arrived this interval (nothing is
/// published for a no-data interval). With `detach_publish` the storage
/// write runs on its own task: a slow or failing store never delays the
/// next tick.
pub async fn settle_interval(
    engine: &SettlementEngine,
    tariffs: &TariffStore,
    publisher: &Arc<dyn SettlementPublisher>,
    ts: OffsetDateTime,
    detach_publish: bool,
) -> bool {
    let pending = engine.drain().await;
    if pending.is_empty() {
        tracing::debug!("no readings this interval, skipping settlement");
        return false;
    }

    let snapshot = tariffs.snapshot();
    let settlement = settle(ts, &pending, &snapshot);

    metrics::counter!("settlement_intervals_total").increment(1);
    metrics::counter!("settlement_house_records_total")
        .increment(settlement.houses.len() as u64);

    tracing::info!(
        "settled: cons={:.6}kWh, prod={:.6}kWh, grid_in={:.6}kWh ({:.2}ct), grid_out={:.6}kWh ({:.2}ct), p_con={:.2}ct/kWh, profit={:.4}ct",
        settlement.community.total_consumption_kwh,
        settlement.community.total_production_kwh,
        settlement.community.grid_import_kwh,
        settlement.community.value_grid_import_ct,
        settlement.community.grid_export_kwh,
        settlement.community.value_grid_export_ct,
        settlement.effective_p_con,
        settlement.community.community_profit_ct,
    );

    let mut points: Vec<SettlementPoint> = settlement
        .houses
        .into_iter()
        .map(SettlementPoint::House)
        .collect();
    points.push(SettlementPoint::Community(settlement.community));

    if detach_publish {
        let publisher = Arc::clone(publisher);
        tokio::spawn(async move {
            if let Err(e) = publisher.publish(points).await {
                tracing::error!(error = %e, "settlement publish failed; interval left as a gap");
            }
        });
    } else if let Err(e) = publisher.publish(points).await {
        tracing::error!(error = %e, "settlement publish failed; interval left as a gap");
    }

    true
}

pub struct SettlementDriver {
    engine: Arc<SettlementEngine>,
    tariffs: Arc<TariffStore>,
    publisher: Arc<dyn SettlementPublisher>,
    interval: Duration,
    state_file: PathBuf,
    /// Checkpoint the counter baselines every this many ticks.
    checkpoint_ticks: u32,
}

impl SettlementDriver {
    pub fn new(
        engine: Arc<SettlementEngine>,
        tariffs: Arc<TariffStore>,
        publisher: Arc<dyn SettlementPublisher>,
        interval: Duration,
        state_file: PathBuf,
        checkpoint_interval: Duration,
    ) -> Self {
        let checkpoint_ticks = (checkpoint_interval.as_secs_f64() / interval.as_secs_f64())
            .round()
            .max(1.0) as u32;
        Self {
            engine,
            tariffs,
            publisher,
            interval,
            state_file,
            checkpoint_ticks,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval completes immediately; consume
        // it so the first settlement covers a full interval.
        ticker.tick().await;

        tracing::info!(
            interval_s = self.interval.as_secs(),
            "settlement driver started"
        );

        let mut ticks_since_checkpoint: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    settle_interval(
                        &self.engine,
                        &self.tariffs,
                        &self.publisher,
                        OffsetDateTime::now_utc(),
                        true,
                    )
                    .await;

                    ticks_since_checkpoint += 1;
                    if ticks_since_checkpoint >= self.checkpoint_ticks {
                        ticks_since_checkpoint = 0;
                        if let Err(e) = self.engine.checkpoint(&self.state_file).await {
                            tracing::error!(error = %e, "counter checkpoint failed");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested, flushing partial interval");
                    settle_interval(
                        &self.engine,
                        &self.tariffs,
                        &self.publisher,
                        OffsetDateTime::now_utc(),
                        false,
                    )
                    .await;
                    self.engine.checkpoint(&self.state_file).await?;
                    tracing::info!("counter baselines saved, driver stopped");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CounterStore, HouseRegistry, TariffRates};
    use community_client::domain::MeterReading;
    use std::sync::Mutex;
    use time::macros::datetime;

    /// Publisher that records what it was asked to write.
    #[derive(Default)]
    struct RecordingPublisher {
        batches: Mutex<Vec<Vec<SettlementPoint>>>,
    }

    #[async_trait::async_trait]
    impl SettlementPublisher for RecordingPublisher {
        async fn publish(
            &self,
            points: Vec<SettlementPoint>,
        ) -> Result<(), crate::pipeline::PipelineError> {
            self.batches.lock().unwrap().push(points);
            Ok(())
        }
    }

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

    fn tariff_store() -> Arc<TariffStore> {
        let path = std::env::temp_dir().join("driver_test_tariffs_absent.json");
        let _ = std::fs::remove_file(&path);
        Arc::new(TariffStore::new(
            path,
            TariffRates {
                p_pv: 20.0,
                p_grid_del: 6.0,
                p_grid_con: 30.0,
                p_con: None,
            },
            25.0,
        ))
    }

    #[tokio::test]
    async fn empty_interval_publishes_nothing() {
        let engine = Arc::new(SettlementEngine::new(
            HouseRegistry::new([("AA-11".to_string(), 1)]),
            CounterStore::new(),
        ));
        let publisher = Arc::new(RecordingPublisher::default());
        let dyn_publisher: Arc<dyn SettlementPublisher> = publisher.clone();

        let settled = settle_interval(
            &engine,
            &tariff_store(),
            &dyn_publisher,
            datetime!(2025-07-15 12:00:10 UTC),
            false,
        )
        .await;

        assert!(!settled);
        assert!(publisher.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn settled_interval_publishes_house_and_community_records() {
        let engine = Arc::new(SettlementEngine::new(
            HouseRegistry::new([("AA-11".to_string(), 1), ("BB-22".to_string(), 2)]),
            CounterStore::new(),
        ));
        let publisher = Arc::new(RecordingPublisher::default());
        let dyn_publisher: Arc<dyn SettlementPublisher> = publisher.clone();
        let tariffs = tariff_store();

        // Baselines, then movement: house 1 imports, house 2 exports.
        engine.observe(&reading("AA-11", 100.0, 0.0)).await;
        engine.observe(&reading("BB-22", 50.0, 200.0)).await;
        engine.observe(&reading("AA-11", 100.4, 0.0)).await;
        engine.observe(&reading("BB-22", 50.0, 200.9)).await;

        let settled = settle_interval(
            &engine,
            &tariffs,
            &dyn_publisher,
            datetime!(2025-07-15 12:00:10 UTC),
            false,
        )
        .await;
        assert!(settled);

        let batches = publisher.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let points = &batches[0];
        assert_eq!(points.len(), 3);

        let community = points
            .iter()
            .find_map(|p| match p {
                SettlementPoint::Community(r) => Some(r),
                _ => None,
            })
            .expect("community record present");
        // Break-even pricing keeps the books balanced.
        assert!(community.community_profit_ct.abs() < 1e-6);
        assert!((community.net_community_kwh - 0.5).abs() < 1e-9);

        // Next interval starts empty.
        drop(batches);
        let settled = settle_interval(
            &engine,
            &tariffs,
            &dyn_publisher,
            datetime!(2025-07-15 12:00:20 UTC),
            false,
        )
        .await;
        assert!(!settled);
    }
}
