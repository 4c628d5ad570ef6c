use std::str::FromStr;

use anyhow::Result;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::domain::HouseEnergyRecord;

#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error("unknown measurement '{0}'")]
    UnknownMeasurement(String),
    #[error("field '{field}' is not queryable on measurement '{measurement}'")]
    UnknownField { measurement: String, field: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// The two settlement tables a dashboard may chart from.
///
/// Field names are interpolated into SQL, so they are checked against a
/// per-table allowlist instead of being bound as parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measurement {
    HouseEnergy,
    CommunityEnergy,
}

impl Measurement {
    pub fn table(self) -> &'static str {
        match self {
            Self::HouseEnergy => "house_energy",
            Self::CommunityEnergy => "community_energy",
        }
    }

    fn allowed_fields(self) -> &'static [&'static str] {
        match self {
            Self::HouseEnergy => &[
                "delta_ei_kwh",
                "delta_eo_kwh",
                "net_flow_kwh",
                "value_consumption_ct",
                "value_pv_delivery_ct",
                "tariff_p_con",
                "tariff_p_pv",
            ],
            Self::CommunityEnergy => &[
                "total_consumption_kwh",
                "total_production_kwh",
                "net_community_kwh",
                "grid_import_kwh",
                "grid_export_kwh",
                "value_grid_import_ct",
                "value_grid_export_ct",
                "community_profit_ct",
                "tariff_p_grid_con",
                "tariff_p_grid_del",
                "tariff_p_con",
            ],
        }
    }

    fn check_field<'a>(self, field: &'a str) -> Result<&'a str, QueryError> {
        if self.allowed_fields().contains(&field) {
            Ok(field)
        } else {
            Err(QueryError::UnknownField {
                measurement: self.table().to_string(),
                field: field.to_string(),
            })
        }
    }
}

impl FromStr for Measurement {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "house_energy" => Ok(Self::HouseEnergy),
            "community_energy" => Ok(Self::CommunityEnergy),
            other => Err(QueryError::UnknownMeasurement(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HouseEnergySummary {
    pub house_id: String,
    pub delta_ei_kwh: f64,
    pub delta_eo_kwh: f64,
    pub net_flow_kwh: f64,
    pub value_consumption_ct: f64,
    pub value_pv_delivery_ct: f64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CommunityEnergySummary {
    pub total_consumption_kwh: f64,
    pub total_production_kwh: f64,
    pub grid_import_kwh: f64,
    pub grid_export_kwh: f64,
    pub value_grid_import_ct: f64,
    pub value_grid_export_ct: f64,
    pub community_profit_ct: f64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FieldSample {
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub ts: OffsetDateTime,
    pub value: f64,
}

/// Per-house settlement totals over a trailing window, one row per house.
pub async fn house_summaries(
    pool: &PgPool,
    since: OffsetDateTime,
) -> Result<Vec<HouseEnergySummary>> {
    let rows = sqlx::query_as::<_, HouseEnergySummary>(
        r#"
        SELECT
            house_id,
            SUM(delta_ei_kwh)         AS delta_ei_kwh,
            SUM(delta_eo_kwh)         AS delta_eo_kwh,
            SUM(net_flow_kwh)         AS net_flow_kwh,
            SUM(value_consumption_ct) AS value_consumption_ct,
            SUM(value_pv_delivery_ct) AS value_pv_delivery_ct
        FROM house_energy
        WHERE ts >= $1
        GROUP BY house_id
        ORDER BY house_id
        "#,
    )
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Settlement totals for a single house over a trailing window.
pub async fn house_summary(
    pool: &PgPool,
    house_id: &str,
    since: OffsetDateTime,
) -> Result<Option<HouseEnergySummary>> {
    let row = sqlx::query_as::<_, HouseEnergySummary>(
        r#"
        SELECT
            house_id,
            SUM(delta_ei_kwh)         AS delta_ei_kwh,
            SUM(delta_eo_kwh)         AS delta_eo_kwh,
            SUM(net_flow_kwh)         AS net_flow_kwh,
            SUM(value_consumption_ct) AS value_consumption_ct,
            SUM(value_pv_delivery_ct) AS value_pv_delivery_ct
        FROM house_energy
        WHERE house_id = $1
          AND ts >= $2
        GROUP BY house_id
        "#,
    )
    .bind(house_id)
    .bind(since)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Community-level totals over a trailing window.
///
/// Returns zeros rather than NULL sums when the window holds no intervals.
pub async fn community_summary(
    pool: &PgPool,
    since: OffsetDateTime,
) -> Result<CommunityEnergySummary> {
    let row = sqlx::query_as::<_, CommunityEnergySummary>(
        r#"
        SELECT
            COALESCE(SUM(total_consumption_kwh), 0.0) AS total_consumption_kwh,
            COALESCE(SUM(total_production_kwh), 0.0)  AS total_production_kwh,
            COALESCE(SUM(grid_import_kwh), 0.0)       AS grid_import_kwh,
            COALESCE(SUM(grid_export_kwh), 0.0)       AS grid_export_kwh,
            COALESCE(SUM(value_grid_import_ct), 0.0)  AS value_grid_import_ct,
            COALESCE(SUM(value_grid_export_ct), 0.0)  AS value_grid_export_ct,
            COALESCE(SUM(community_profit_ct), 0.0)   AS community_profit_ct
        FROM community_energy
        WHERE ts >= $1
        "#,
    )
    .bind(since)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Fetch a time-ordered settlement profile for a single house.
pub async fn house_profile(
    pool: &PgPool,
    house_id: &str,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<HouseEnergyRecord>> {
    let rows = sqlx::query_as::<_, HouseEnergyRecord>(
        r#"
        SELECT
            ts,
            house_id,
            mac,
            delta_ei_kwh,
            delta_eo_kwh,
            net_flow_kwh,
            value_consumption_ct,
            value_pv_delivery_ct,
            tariff_p_con,
            tariff_p_pv
        FROM house_energy
        WHERE house_id = $1
          AND ts >= $2
          AND ts <  $3
        ORDER BY ts
        "#,
    )
    .bind(house_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Time series of one numeric field for charting.
pub async fn field_series(
    pool: &PgPool,
    measurement: Measurement,
    field: &str,
    since: OffsetDateTime,
) -> Result<Vec<FieldSample>, QueryError> {
    let field = measurement.check_field(field)?;

    // Both identifiers come from the allowlists above, never from the caller
    // verbatim.
    let sql = format!(
        "SELECT ts, {field} AS value FROM {table} WHERE ts >= $1 ORDER BY ts",
        field = field,
        table = measurement.table(),
    );

    let rows = sqlx::query_as::<_, FieldSample>(&sql)
        .bind(since)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measurement_parses_known_tables() {
        assert_eq!(
            "house_energy".parse::<Measurement>().unwrap(),
            Measurement::HouseEnergy
        );
        assert_eq!(
            "community_energy".parse::<Measurement>().unwrap(),
            Measurement::CommunityEnergy
        );
        assert!(matches!(
            "grid_energy".parse::<Measurement>(),
            Err(QueryError::UnknownMeasurement(_))
        ));
    }

    #[test]
    fn field_allowlist_rejects_unknown_and_cross_table_fields() {
        assert!(Measurement::HouseEnergy.check_field("net_flow_kwh").is_ok());
        assert!(matches!(
            Measurement::HouseEnergy.check_field("grid_import_kwh"),
            Err(QueryError::UnknownField { .. })
        ));
        assert!(matches!(
            Measurement::CommunityEnergy.check_field("ts; DROP TABLE community_energy"),
            Err(QueryError::UnknownField { .. })
        ));
    }
}
