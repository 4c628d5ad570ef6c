use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use settlement_service::{
    api::{self, ApiState},
    config::{AppConfig, SinkKind},
    engine::{CounterStore, HouseRegistry, SettlementDriver, SettlementEngine, TariffRates, TariffStore},
    observability,
    pipeline::Pipeline,
    sinks::{EngineSink, IlpPublisher, QuestDbPublisher, SettlementPublisher},
    sources::HttpMeterSource,
    transform::ReadingValidation,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();
    observability::init_metrics();

    // Load configuration
    let cfg = AppConfig::load()?;

    let registry = HouseRegistry::new(
        cfg.houses
            .iter()
            .map(|h| (h.mac.clone(), h.house_id)),
    );
    if registry.is_empty() {
        tracing::warn!("no houses configured; all incoming readings will be ignored");
    }

    let counters = CounterStore::load(&cfg.settlement.state_file)?;
    tracing::info!(
        devices = counters.len(),
        state_file = %cfg.settlement.state_file.display(),
        "counter baselines restored"
    );

    let engine = Arc::new(SettlementEngine::new(registry, counters));

    let tariffs = Arc::new(TariffStore::new(
        cfg.tariffs.file.clone(),
        TariffRates {
            p_pv: cfg.tariffs.p_pv,
            p_grid_del: cfg.tariffs.p_grid_del,
            p_grid_con: cfg.tariffs.p_grid_con,
            p_con: cfg.tariffs.p_con,
        },
        cfg.tariffs.default_p_con,
    ));

    // Create the QuestDB connection pool only if something uses pgwire.
    let needs_pool = cfg.sink.kind == SinkKind::Pgwire || cfg.api.is_some();
    let pool = if needs_pool {
        Some(
            PgPoolOptions::new()
                .max_connections(cfg.questdb.max_connections)
                .connect(&cfg.questdb.uri)
                .await?,
        )
    } else {
        None
    };

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
            let pool = pool.clone().expect("pgwire pool must be initialized");
            Arc::new(QuestDbPublisher::new(
                pool,
                cfg.sink.batch_size,
                cfg.sink.max_retries,
                Duration::from_millis(cfg.sink.retry_backoff_ms),
            ))
        }
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    // Reading pipeline: HTTP ingest -> validation -> engine.
    let source = HttpMeterSource::new(&cfg.ingest.http_bind_addr, cfg.ingest.channel_capacity).await?;
    let pipeline = Pipeline {
        source,
        transforms: vec![Arc::new(ReadingValidation)],
        sink: EngineSink::new(engine.clone()),
    };
    tokio::spawn(async move {
        if let Err(e) = pipeline.run().await {
            tracing::error!(error = %e, "reading pipeline terminated");
        }
    });

    if let Some(api_cfg) = &cfg.api {
        let state = ApiState {
            pool: pool.clone(),
            tariffs: tariffs.clone(),
        };
        let bind = api_cfg.bind_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(&bind, state).await {
                tracing::error!(error = %e, "query API terminated");
            }
        });
    }

    let driver = SettlementDriver::new(
        engine,
        tariffs,
        publisher,
        Duration::from_secs(cfg.settlement.interval_secs),
        cfg.settlement.state_file.clone(),
        Duration::from_secs(cfg.settlement.checkpoint_secs),
    );
    driver.run(shutdown).await
}
