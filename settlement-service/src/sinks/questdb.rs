//! QuestDB pgwire publisher: batched `INSERT`s through the connection pool.

use std::time::Duration;

use community_client::domain::{CommunityEnergyRecord, HouseEnergyRecord};
use sqlx::{postgres::PgPool, Postgres, QueryBuilder};

use crate::pipeline::PipelineError;
use crate::sinks::{SettlementPoint, SettlementPublisher};

pub struct QuestDbPublisher {
    pool: PgPool,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl QuestDbPublisher {
    pub fn new(pool: PgPool, batch_size: usize, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
        }
    }

    async fn insert_houses(&self, batch: &[&HouseEnergyRecord]) -> Result<(), sqlx::Error> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO house_energy (ts, house_id, mac, delta_ei_kwh, delta_eo_kwh, net_flow_kwh, value_consumption_ct, value_pv_delivery_ct, tariff_p_con, tariff_p_pv) ",
        );

        builder.push("VALUES ");
        builder.push_values(batch, |mut b, r| {
            b.push_bind(r.ts)
                .push_bind(&r.house_id)
                .push_bind(&r.mac)
                .push_bind(r.delta_ei_kwh)
                .push_bind(r.delta_eo_kwh)
                .push_bind(r.net_flow_kwh)
                .push_bind(r.value_consumption_ct)
                .push_bind(r.value_pv_delivery_ct)
                .push_bind(r.tariff_p_con)
                .push_bind(r.tariff_p_pv);
        });

        let query = builder.build();
        query.execute(&self.pool).await.map(|_| ())
    }

    async fn insert_community(&self, r: &CommunityEnergyRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO community_energy (ts, total_consumption_kwh, total_production_kwh, net_community_kwh, grid_import_kwh, grid_export_kwh, value_grid_import_ct, value_grid_export_ct, community_profit_ct, tariff_p_grid_con, tariff_p_grid_del, tariff_p_con) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(r.ts)
        .bind(r.total_consumption_kwh)
        .bind(r.total_production_kwh)
        .bind(r.net_community_kwh)
        .bind(r.grid_import_kwh)
        .bind(r.grid_export_kwh)
        .bind(r.value_grid_import_ct)
        .bind(r.value_grid_export_ct)
        .bind(r.community_profit_ct)
        .bind(r.tariff_p_grid_con)
        .bind(r.tariff_p_grid_del)
        .bind(r.tariff_p_con)
        .execute(&self.pool)
        .await
        .map(|_| ())
    }

    async fn insert_all(&self, points: &[SettlementPoint]) -> Result<(), sqlx::Error> {
        let houses: Vec<&HouseEnergyRecord> = points
            .iter()
            .filter_map(|p| match p {
                SettlementPoint::House(r) => Some(r),
                SettlementPoint::Community(_) => None,
            })
            .collect();

        for chunk in houses.chunks(self.batch_size) {
            if !chunk.is_empty() {
                self.insert_houses(chunk).await?;
            }
        }

        for point in points {
            if let SettlementPoint::Community(r) = point {
                self.insert_community(r).await?;
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl SettlementPublisher for QuestDbPublisher {
    async fn publish(&self, points: Vec<SettlementPoint>) -> Result<(), PipelineError> {
        if points.is_empty() {
            return Ok(());
        }

        let mut attempt: u32 = 0;
        loop {
            match self.insert_all(&points).await {
                Ok(()) => {
                    metrics::counter!("questdb_published_records_total")
                        .increment(points.len() as u64);
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "questdb publish failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "questdb publish failed, giving up");
                    metrics::counter!("questdb_publish_errors_total").increment(1);
                    return Err(PipelineError::Sink(e.to_string()));
                }
            }
        }
    }
}
