use time::OffsetDateTime;

/// Community-level settlement aggregate for a single interval.
///
/// `net_community_kwh` is `total_production_kwh - total_consumption_kwh`;
/// its sign decides which one of `grid_import_kwh`/`grid_export_kwh` is
/// non-zero. With the break-even house tariff in effect,
/// `community_profit_ct` is zero up to floating rounding.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CommunityEnergyRecord {
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub ts: OffsetDateTime,
    pub total_consumption_kwh: f64,
    pub total_production_kwh: f64,
    pub net_community_kwh: f64,
    pub grid_import_kwh: f64,
    pub grid_export_kwh: f64,
    /// Cost of energy bought from the grid (ct).
    pub value_grid_import_ct: f64,
    /// Revenue from energy sold to the grid (ct).
    pub value_grid_export_ct: f64,
    /// Community-side sells minus community-side buys across all legs (ct).
    pub community_profit_ct: f64,
    pub tariff_p_grid_con: f64,
    pub tariff_p_grid_del: f64,
    /// Effective house consumption price used for this interval (ct/kWh).
    pub tariff_p_con: f64,
}
