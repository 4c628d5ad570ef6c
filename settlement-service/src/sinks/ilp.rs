//! QuestDB ILP (InfluxDB line protocol over TCP) publisher.
//!
//! Each settled record becomes one line in a measurement (`house_energy` or
//! `community_energy`). A deterministic `event_id` tag derived from the
//! record contents makes accidental re-publication of the same interval
//! deduplicable downstream.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use community_client::domain::{CommunityEnergyRecord, HouseEnergyRecord};
use time::OffsetDateTime;
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::Mutex};

use crate::pipeline::PipelineError;
use crate::sinks::{SettlementPoint, SettlementPublisher};

/// Escape measurement/tag keys/tag values/field keys for ILP.
///
/// ILP requires escaping commas, spaces and equals with a backslash.
fn ilp_escape_ident(s: &str, out: &mut String) {
    for ch in s.chars() {
        match ch {
            ',' | ' ' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
}

fn push_tag(out: &mut String, key: &str, value: &str) {
    out.push(',');
    ilp_escape_ident(key, out);
    out.push('=');
    ilp_escape_ident(value, out);
}

fn push_field_f64(out: &mut String, first: &mut bool, key: &str, value: f64) {
    if *first {
        *first = false;
    } else {
        out.push(',');
    }

    ilp_escape_ident(key, out);
    out.push('=');
    // Numeric fields only; QuestDB parses the plain float form.
    out.push_str(&value.to_string());
}

fn ts_to_unix_nanos(ts: OffsetDateTime) -> i128 {
    ts.unix_timestamp_nanos()
}

fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}

fn hash_f64(hasher: &mut blake3::Hasher, v: f64) {
    hasher.update(&v.to_bits().to_le_bytes());
}

fn event_id_house(r: &HouseEnergyRecord) -> String {
    let mut h = blake3::Hasher::new();
    h.update(&ts_to_unix_nanos(r.ts).to_le_bytes());
    hash_str(&mut h, &r.house_id);
    hash_str(&mut h, &r.mac);
    hash_f64(&mut h, r.delta_ei_kwh);
    hash_f64(&mut h, r.delta_eo_kwh);
    hash_f64(&mut h, r.net_flow_kwh);
    hash_f64(&mut h, r.value_consumption_ct);
    hash_f64(&mut h, r.value_pv_delivery_ct);
    h.finalize().to_hex().to_string()
}

fn event_id_community(r: &CommunityEnergyRecord) -> String {
    let mut h = blake3::Hasher::new();
    h.update(&ts_to_unix_nanos(r.ts).to_le_bytes());
    hash_f64(&mut h, r.total_consumption_kwh);
    hash_f64(&mut h, r.total_production_kwh);
    hash_f64(&mut h, r.net_community_kwh);
    hash_f64(&mut h, r.community_profit_ct);
    h.finalize().to_hex().to_string()
}

pub trait IlpEncode {
    fn write_ilp_line(&self, out: &mut String);
}

impl IlpEncode for HouseEnergyRecord {
    fn write_ilp_line(&self, out: &mut String) {
        // measurement
        out.push_str("house_energy");

        // tags (SYMBOL columns)
        let event_id = event_id_house(self);
        push_tag(out, "event_id", &event_id);
        push_tag(out, "house_id", &self.house_id);
        push_tag(out, "mac", &self.mac);

        // fields (numeric metrics)
        out.push(' ');
        let mut first = true;
        push_field_f64(out, &mut first, "delta_ei_kwh", self.delta_ei_kwh);
        push_field_f64(out, &mut first, "delta_eo_kwh", self.delta_eo_kwh);
        push_field_f64(out, &mut first, "net_flow_kwh", self.net_flow_kwh);
        push_field_f64(out, &mut first, "value_consumption_ct", self.value_consumption_ct);
        push_field_f64(out, &mut first, "value_pv_delivery_ct", self.value_pv_delivery_ct);
        push_field_f64(out, &mut first, "tariff_p_con", self.tariff_p_con);
        push_field_f64(out, &mut first, "tariff_p_pv", self.tariff_p_pv);

        // timestamp (nanos)
        out.push(' ');
        out.push_str(&ts_to_unix_nanos(self.ts).to_string());
    }
}

impl IlpEncode for CommunityEnergyRecord {
    fn write_ilp_line(&self, out: &mut String) {
        out.push_str("community_energy");

        let event_id = event_id_community(self);
        push_tag(out, "event_id", &event_id);

        out.push(' ');
        let mut first = true;
        push_field_f64(out, &mut first, "total_consumption_kwh", self.total_consumption_kwh);
        push_field_f64(out, &mut first, "total_production_kwh", self.total_production_kwh);
        push_field_f64(out, &mut first, "net_community_kwh", self.net_community_kwh);
        push_field_f64(out, &mut first, "grid_import_kwh", self.grid_import_kwh);
        push_field_f64(out, &mut first, "grid_export_kwh", self.grid_export_kwh);
        push_field_f64(out, &mut first, "value_grid_import_ct", self.value_grid_import_ct);
        push_field_f64(out, &mut first, "value_grid_export_ct", self.value_grid_export_ct);
        push_field_f64(out, &mut first, "community_profit_ct", self.community_profit_ct);
        push_field_f64(out, &mut first, "tariff_p_grid_con", self.tariff_p_grid_con);
        push_field_f64(out, &mut first, "tariff_p_grid_del", self.tariff_p_grid_del);
        push_field_f64(out, &mut first, "tariff_p_con", self.tariff_p_con);

        out.push(' ');
        out.push_str(&ts_to_unix_nanos(self.ts).to_string());
    }
}

impl IlpEncode for SettlementPoint {
    fn write_ilp_line(&self, out: &mut String) {
        match self {
            SettlementPoint::House(r) => r.write_ilp_line(out),
            SettlementPoint::Community(r) => r.write_ilp_line(out),
        }
    }
}

pub struct IlpPublisher {
    addr: SocketAddr,
    max_retries: u32,
    retry_backoff: Duration,
    // The TCP connection is reused between intervals and replaced on write
    // failure.
    stream: Mutex<Option<TcpStream>>,
}

impl IlpPublisher {
    pub fn new(addr: SocketAddr, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            addr,
            max_retries,
            retry_backoff,
            stream: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<TcpStream, PipelineError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| PipelineError::Sink(format!("failed to connect to QuestDB ILP: {e}")))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    fn encode(points: &[SettlementPoint]) -> Vec<u8> {
        // Heuristic capacity: ~256 bytes per line.
        let mut s = String::with_capacity(points.len().saturating_mul(256));
        for point in points {
            point.write_ilp_line(&mut s);
            s.push('\n');
        }
        s.into_bytes()
    }
}

#[async_trait::async_trait]
impl SettlementPublisher for IlpPublisher {
    async fn publish(&self, points: Vec<SettlementPoint>) -> Result<(), PipelineError> {
        if points.is_empty() {
            return Ok(());
        }

        let started = SystemTime::now();
        let payload = Self::encode(&points);

        let mut guard = self.stream.lock().await;
        let mut attempt: u32 = 0;
        loop {
            if guard.is_none() {
                *guard = Some(self.connect().await?);
            }
            let stream = guard.as_mut().expect("connection established above");

            match stream.write_all(&payload).await {
                Ok(()) => {
                    metrics::counter!("questdb_published_records_total")
                        .increment(points.len() as u64);
                    metrics::counter!("questdb_ilp_bytes_total").increment(payload.len() as u64);
                    if let Ok(dur) = SystemTime::now().duration_since(started) {
                        metrics::histogram!("settlement_publish_latency_seconds")
                            .record(dur.as_secs_f64());
                    }
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "QuestDB ILP publish failed, reconnecting and retrying"
                    );
                    metrics::counter!("questdb_ilp_retry_total").increment(1);

                    tokio::time::sleep(sleep_for).await;
                    *guard = Some(self.connect().await?);
                }
                Err(e) => {
                    tracing::error!(error = %e, "QuestDB ILP publish failed, giving up");
                    metrics::counter!("questdb_publish_errors_total").increment(1);
                    *guard = None;
                    return Err(PipelineError::Sink(format!("ilp write failed: {e}")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn house_record() -> HouseEnergyRecord {
        HouseEnergyRecord {
            ts: datetime!(2025-07-15 12:00:00 UTC),
            house_id: "2".to_string(),
            mac: "AA-11-BB-22-CC-01".to_string(),
            delta_ei_kwh: 0.0,
            delta_eo_kwh: 0.0125,
            net_flow_kwh: 0.0125,
            value_consumption_ct: 0.0,
            value_pv_delivery_ct: 0.25,
            tariff_p_con: 25.0,
            tariff_p_pv: 20.0,
        }
    }

    #[test]
    fn ilp_escape_ident_escapes_commas_spaces_and_equals() {
        let mut out = String::new();
        ilp_escape_ident("a b,c=d", &mut out);
        assert_eq!(out, "a\\ b\\,c\\=d");
    }

    #[test]
    fn house_line_includes_tags_fields_and_nanos_timestamp() {
        let r = house_record();
        let mut line = String::new();
        r.write_ilp_line(&mut line);

        assert!(line.starts_with("house_energy,"));
        assert!(line.contains("event_id="));
        assert!(line.contains("house_id=2"));
        assert!(line.contains("mac=AA-11-BB-22-CC-01"));
        assert!(line.contains(" delta_ei_kwh=0"));
        assert!(line.contains(",value_pv_delivery_ct=0.25"));

        let ts_nanos = ts_to_unix_nanos(r.ts).to_string();
        assert!(line.ends_with(&ts_nanos));
    }

    #[test]
    fn event_id_is_deterministic_and_content_sensitive() {
        let r = house_record();
        let mut a = String::new();
        r.write_ilp_line(&mut a);
        let mut b = String::new();
        r.write_ilp_line(&mut b);
        assert_eq!(a, b);

        let mut changed = house_record();
        changed.value_pv_delivery_ct = 0.26;
        let mut c = String::new();
        changed.write_ilp_line(&mut c);
        assert_ne!(a, c);
    }

    #[test]
    fn community_line_carries_the_profit_field() {
        let r = CommunityEnergyRecord {
            ts: datetime!(2025-07-15 12:00:00 UTC),
            total_consumption_kwh: 1.5,
            total_production_kwh: 2.0,
            net_community_kwh: 0.5,
            grid_import_kwh: 0.0,
            grid_export_kwh: 0.5,
            value_grid_import_ct: 0.0,
            value_grid_export_ct: 3.0,
            community_profit_ct: 0.0,
            tariff_p_grid_con: 30.0,
            tariff_p_grid_del: 6.0,
            tariff_p_con: 20.0,
        };

        let mut line = String::new();
        r.write_ilp_line(&mut line);

        assert!(line.starts_with("community_energy,"));
        assert!(line.contains("community_profit_ct=0"));
        assert!(line.contains("grid_export_kwh=0.5"));
        assert!(!line.contains("house_id="));
    }
}
