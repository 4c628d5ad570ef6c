//! Offline settlement of a recorded readings file (NDJSON or CSV).
//!
//! Re-runs delta extraction and settlement over interval windows derived
//! from the recorded wall-clock timestamps, publishing the results to the
//! configured sink. Intended for filling gaps left by publish failures:
//! capture the raw readings, then resettle them later.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::StreamExt;
use settlement_service::{
    config::{AppConfig, SinkKind},
    engine::{
        driver::settle_interval, CounterStore, HouseRegistry, SettlementEngine, TariffRates,
        TariffStore,
    },
    observability,
    pipeline::Source,
    sinks::{IlpPublisher, QuestDbPublisher, SettlementPublisher},
    sources::{ReadingBackfillFileSource, ReadingCsvFileSource},
    transform,
};
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();
    observability::init_metrics();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        bail!("usage: resettle_readings <readings_file.{{ndjson|csv}}>");
    }
    let file_path = Path::new(&args[1]);

    // Load configuration (SETTLEMENT_CONFIG can point at a replay-specific file).
    let cfg = AppConfig::load()?;

    let registry = HouseRegistry::new(
        cfg.houses
            .iter()
            .map(|h| (h.mac.clone(), h.house_id)),
    );
    if registry.is_empty() {
        bail!("no houses configured; nothing to resettle against");
    }

    // Replay always starts from empty baselines: the first reading per
    // device establishes its baseline, exactly as in live operation.
    let engine = SettlementEngine::new(registry, CounterStore::new());

    let tariffs = TariffStore::new(
        cfg.tariffs.file.clone(),
        TariffRates {
            p_pv: cfg.tariffs.p_pv,
            p_grid_del: cfg.tariffs.p_grid_del,
            p_grid_con: cfg.tariffs.p_grid_con,
            p_con: cfg.tariffs.p_con,
        },
        cfg.tariffs.default_p_con,
    );

    let publisher: Arc<dyn SettlementPublisher> = match cfg.sink.kind {
        SinkKind::Ilp => {
            let ilp_addr: SocketAddr = cfg
                .questdb
                .ilp_tcp_addr
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid questdb.ilp_tcp_addr: {e}"))?;
            Arc::new(IlpPublisher::new(
                ilp_addr,
                cfg.sink.max_retries,
                Duration::from_millis(cfg.sink.retry_backoff_ms),
            ))
        }
        SinkKind::Pgwire => {
            let pool = PgPoolOptions::new()
                .max_connections(cfg.questdb.max_connections)
                .connect(&cfg.questdb.uri)
                .await?;
            Arc::new(QuestDbPublisher::new(
                pool,
                cfg.sink.batch_size,
                cfg.sink.max_retries,
                Duration::from_millis(cfg.sink.retry_backoff_ms),
            ))
        }
    };

    let mut stream = match file_path.extension().and_then(|e| e.to_str()) {
        Some("csv") => ReadingCsvFileSource::new(file_path).stream().await,
        Some("ndjson") | Some("jsonl") => {
            ReadingBackfillFileSource::new(file_path).stream().await
        }
        other => bail!("unsupported readings file extension: {other:?}"),
    };

    let interval = time::Duration::seconds(cfg.settlement.interval_secs as i64);
    let mut window_end: Option<time::OffsetDateTime> = None;
    let mut readings: u64 = 0;
    let mut intervals: u64 = 0;

    while let Some(item) = stream.next().await {
        let env = match item {
            Ok(env) => env,
            Err(e) => bail!("replay aborted: {e}"),
        };

        let env = match transform::validate_reading(env) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, "skipping invalid recorded reading");
                continue;
            }
        };

        let ts = env.payload.ts;
        match window_end {
            None => window_end = Some(ts + interval),
            Some(mut end) => {
                // Close every elapsed window before folding this reading in,
                // so gaps in the recording settle as empty intervals.
                while ts >= end {
                    if settle_interval(&engine, &tariffs, &publisher, end, false).await {
                        intervals += 1;
                    }
                    end += interval;
                }
                window_end = Some(end);
            }
        }

        engine.observe(&env.payload).await;
        readings += 1;
    }

    // Flush the final partial window.
    if let Some(end) = window_end {
        if settle_interval(&engine, &tariffs, &publisher, end, false).await {
            intervals += 1;
        }
    }

    tracing::info!(readings, intervals, "resettlement finished");
    Ok(())
}
