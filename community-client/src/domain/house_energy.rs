use time::OffsetDateTime;

/// One house's settled energy exchange for a single interval.
///
/// `delta_ei_kwh`/`delta_eo_kwh` are the raw counter deltas; `net_flow_kwh`
/// is `delta_eo_kwh - delta_ei_kwh` (positive while the house is a net
/// exporter). Exactly one of the two value fields is non-zero: settlement
/// nets the deltas into a single signed flow before pricing.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HouseEnergyRecord {
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub ts: OffsetDateTime,
    pub house_id: String,
    pub mac: String,
    pub delta_ei_kwh: f64,
    pub delta_eo_kwh: f64,
    pub net_flow_kwh: f64,
    /// What the house owes the community for net imports (ct).
    pub value_consumption_ct: f64,
    /// What the community owes the house for net PV exports (ct).
    pub value_pv_delivery_ct: f64,
    /// House consumption price in effect for this interval (ct/kWh).
    pub tariff_p_con: f64,
    /// PV sale price in effect for this interval (ct/kWh).
    pub tariff_p_pv: f64,
}
