//! HTTP ingest endpoint for raw smart-meter readings.
//!
//! Accepts the meter's native JSON payload (cumulative `Ei`/`Eo` registers,
//! instantaneous `Pi`/`Po`, uptime `ts`) plus the `mac` device identity the
//! transport layer derives from its topic or sender. Delivery is
//! at-least-once and unordered across devices; idempotence is the counter
//! store's job, not the transport's.

use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, routing::post, Json, Router};
use community_client::domain::MeterReading;
use futures::{Stream, StreamExt};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::pipeline::{Envelope, PipelineError, Source};

#[derive(Clone)]
struct SharedSender {
    tx: mpsc::Sender<Envelope<MeterReading>>,
}

#[derive(Clone)]
pub struct HttpMeterSource {
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope<MeterReading>>>>>,
}

/// Wire shape of one reading, in the meter's own field casing. Fields the
/// meter may omit default to zero, matching the tolerant behaviour of the
/// upstream firmware.
#[derive(serde::Deserialize)]
struct IncomingReading {
    mac: String,
    #[serde(rename = "SMid", default)]
    smid: Option<String>,
    #[serde(rename = "Pi", default)]
    pi: f64,
    #[serde(rename = "Po", default)]
    po: f64,
    #[serde(rename = "Ei", default)]
    ei: f64,
    #[serde(rename = "Eo", default)]
    eo: f64,
    #[serde(rename = "ts", default)]
    ts: i64,
}

impl From<IncomingReading> for MeterReading {
    fn from(i: IncomingReading) -> Self {
        MeterReading {
            // Observation time is assigned at the boundary; the meter's own
            // `ts` is an uptime counter, not wall time.
            ts: OffsetDateTime::now_utc(),
            mac: i.mac,
            smid: i.smid,
            pi_kw: i.pi,
            po_kw: i.po,
            ei_kwh: i.ei,
            eo_kwh: i.eo,
            uptime_s: i.ts,
        }
    }
}

impl HttpMeterSource {
    pub async fn new(bind_addr: &str, channel_capacity: usize) -> Result<Self, PipelineError> {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let shared = SharedSender { tx };

        let app = Router::new()
            .route("/ingest/readings", post(ingest_readings))
            .with_state(shared.clone());

        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| PipelineError::Source(format!("invalid bind addr: {e}")))?;

        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                        tracing::error!(error = %e, "meter ingest server error");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to bind meter ingest listener");
                }
            }
        });

        Ok(Self {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        })
    }
}

#[async_trait::async_trait]
impl Source<MeterReading> for HttpMeterSource {
    async fn stream(
        &self,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<Envelope<MeterReading>, PipelineError>> + Send>>
    {
        let mut guard = self.receiver.lock().await;
        let rx = guard
            .take()
            .expect("HttpMeterSource stream already taken; only one consumer supported");

        let stream = ReceiverStream::new(rx).map(Ok);
        Box::pin(stream)
    }
}

async fn ingest_readings(
    State(sender): State<SharedSender>,
    Json(payload): Json<Vec<IncomingReading>>,
) -> Result<(), axum::http::StatusCode> {
    metrics::counter!("http_ingest_requests_total").increment(1);

    for incoming in payload {
        let reading: MeterReading = incoming.into();
        let env = Envelope::now(reading);

        if let Err(_e) = sender.tx.send(env).await {
            // Channel closed; treat as server error
            metrics::counter!("http_ingest_failed_total").increment(1);
            return Err(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incoming_reading_parses_meter_field_casing() {
        let json = r#"{
            "mac": "AA-11-BB-22-CC-01",
            "SMid": "SIM00002",
            "Pi": 0.532,
            "Po": 0.0,
            "Ei": 1042.118,
            "Eo": 512.007,
            "ts": 86410
        }"#;

        let incoming: IncomingReading = serde_json::from_str(json).unwrap();
        let reading: MeterReading = incoming.into();

        assert_eq!(reading.mac, "AA-11-BB-22-CC-01");
        assert_eq!(reading.smid.as_deref(), Some("SIM00002"));
        assert!((reading.ei_kwh - 1042.118).abs() < 1e-9);
        assert!((reading.eo_kwh - 512.007).abs() < 1e-9);
        assert_eq!(reading.uptime_s, 86410);
    }

    #[test]
    fn missing_optional_fields_default_to_zero() {
        let json = r#"{"mac": "AA-11-BB-22-CC-01", "Ei": 10.0, "Eo": 5.0}"#;
        let incoming: IncomingReading = serde_json::from_str(json).unwrap();
        let reading: MeterReading = incoming.into();

        assert_eq!(reading.smid, None);
        assert_eq!(reading.pi_kw, 0.0);
        assert_eq!(reading.po_kw, 0.0);
        assert_eq!(reading.uptime_s, 0);
    }
}
