//! NDJSON replay source for recorded raw readings.
//!
//! Each line is one JSON object with a wall-clock RFC3339 `ts` plus the
//! domain reading fields. Used by `resettle_readings` to recompute
//! settlements for a stretch of readings captured while the storage
//! backend was unavailable.

use std::path::PathBuf;

use async_stream::try_stream;
use community_client::domain::MeterReading;
use futures::Stream;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

use crate::pipeline::{Envelope, PipelineError, Source};

pub struct ReadingBackfillFileSource {
    path: PathBuf,
}

#[derive(serde::Deserialize)]
struct RecordedReading {
    #[serde(with = "time::serde::rfc3339")]
    ts: time::OffsetDateTime,
    mac: String,
    #[serde(default)]
    smid: Option<String>,
    #[serde(default)]
    pi_kw: f64,
    #[serde(default)]
    po_kw: f64,
    ei_kwh: f64,
    eo_kwh: f64,
    #[serde(default)]
    uptime_s: i64,
}

impl From<RecordedReading> for MeterReading {
    fn from(r: RecordedReading) -> Self {
        MeterReading {
            ts: r.ts,
            mac: r.mac,
            smid: r.smid,
            pi_kw: r.pi_kw,
            po_kw: r.po_kw,
            ei_kwh: r.ei_kwh,
            eo_kwh: r.eo_kwh,
            uptime_s: r.uptime_s,
        }
    }
}

impl ReadingBackfillFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl Source<MeterReading> for ReadingBackfillFileSource {
    async fn stream(
        &self,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<Envelope<MeterReading>, PipelineError>> + Send>>
    {
        let path = self.path.clone();
        let s = try_stream! {
            let file = File::open(&path)
                .await
                .map_err(|e| PipelineError::Source(format!("failed to open NDJSON file: {e}")))?;
            let mut lines = BufReader::new(file).lines();

            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| PipelineError::Source(format!("failed to read NDJSON line: {e}")))?
            {
                if line.trim().is_empty() {
                    continue;
                }

                let recorded: RecordedReading = serde_json::from_str(&line).map_err(|e| {
                    metrics::counter!("reading_replay_parse_errors_total").increment(1);
                    PipelineError::Source(format!("invalid NDJSON reading: {e}"))
                })?;

                yield Envelope::now(recorded.into());
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn recorded_reading_parses_rfc3339_timestamps() {
        let line = r#"{"ts":"2025-07-15T12:00:00Z","mac":"AA-11-BB-22-CC-01","smid":"SIM00002","pi_kw":0.5,"po_kw":0.0,"ei_kwh":1042.1,"eo_kwh":512.0,"uptime_s":86410}"#;

        let recorded: RecordedReading = serde_json::from_str(line).unwrap();
        let reading: MeterReading = recorded.into();

        assert_eq!(reading.ts, datetime!(2025-07-15 12:00:00 UTC));
        assert_eq!(reading.mac, "AA-11-BB-22-CC-01");
        assert!((reading.ei_kwh - 1042.1).abs() < 1e-9);
    }

    #[test]
    fn optional_fields_may_be_omitted() {
        let line = r#"{"ts":"2025-07-15T12:00:00Z","mac":"AA-11","ei_kwh":1.0,"eo_kwh":2.0}"#;
        let recorded: RecordedReading = serde_json::from_str(line).unwrap();
        assert_eq!(recorded.smid, None);
        assert_eq!(recorded.pi_kw, 0.0);
        assert_eq!(recorded.uptime_s, 0);
    }
}
