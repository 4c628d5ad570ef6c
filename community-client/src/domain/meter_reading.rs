use time::OffsetDateTime;

/// One raw smart-meter observation for a single device.
///
/// `ei_kwh`/`eo_kwh` are the meter's cumulative import/export registers and
/// only ever grow, except when the meter itself resets. `ts` is the
/// wall-clock observation time assigned at the transport boundary; the
/// meter's own `uptime_s` counter is carried along for diagnostics only.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeterReading {
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub ts: OffsetDateTime,
    /// Stable device identity (hardware address).
    pub mac: String,
    /// Meter serial as reported by the device, if any.
    pub smid: Option<String>,
    /// Instantaneous import power (kW).
    pub pi_kw: f64,
    /// Instantaneous export power (kW).
    pub po_kw: f64,
    /// Cumulative imported energy (kWh).
    pub ei_kwh: f64,
    /// Cumulative exported energy (kWh).
    pub eo_kwh: f64,
    /// Meter uptime counter (seconds).
    pub uptime_s: i64,
}
