//! CSV replay source for recorded raw readings.
//!
//! Expected header columns (by name):
//! - ts (RFC3339 timestamp)
//! - mac
//! - smid (optional)
//! - pi_kw (optional)
//! - po_kw (optional)
//! - ei_kwh
//! - eo_kwh
//! - uptime_s (optional)

use std::{fs::File, path::PathBuf};

use community_client::domain::MeterReading;
use csv::StringRecord;
use futures::Stream;
use time::OffsetDateTime;

use crate::pipeline::{Envelope, PipelineError, Source};

pub struct ReadingCsvFileSource {
    path: PathBuf,
}

impl ReadingCsvFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

fn parse_optional_f64(s: &str) -> Option<f64> {
    if s.trim().is_empty() {
        None
    } else {
        s.parse().ok()
    }
}

fn parse_optional_string(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn record_to_reading(
    record: &StringRecord,
    headers: &csv::StringRecord,
) -> Result<MeterReading, PipelineError> {
    let get = |name: &str| -> Result<&str, PipelineError> {
        headers
            .iter()
            .position(|h| h == name)
            .and_then(|idx| record.get(idx))
            .ok_or_else(|| PipelineError::Source(format!("missing column '{name}' in CSV record")))
    };

    let ts_str = get("ts")?;
    let ts = OffsetDateTime::parse(ts_str.trim(), &time::format_description::well_known::Rfc3339)
        .map_err(|e| PipelineError::Source(format!("invalid ts '{ts_str}': {e}")))?;

    let mac = get("mac")?.trim().to_string();
    let smid = get("smid").ok().map(parse_optional_string).unwrap_or(None);

    let ei_str = get("ei_kwh")?;
    let ei_kwh: f64 = ei_str
        .trim()
        .parse()
        .map_err(|e| PipelineError::Source(format!("invalid ei_kwh '{ei_str}': {e}")))?;

    let eo_str = get("eo_kwh")?;
    let eo_kwh: f64 = eo_str
        .trim()
        .parse()
        .map_err(|e| PipelineError::Source(format!("invalid eo_kwh '{eo_str}': {e}")))?;

    let pi_kw = get("pi_kw").ok().and_then(parse_optional_f64).unwrap_or(0.0);
    let po_kw = get("po_kw").ok().and_then(parse_optional_f64).unwrap_or(0.0);
    let uptime_s = get("uptime_s")
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .unwrap_or(0);

    Ok(MeterReading {
        ts,
        mac,
        smid,
        pi_kw,
        po_kw,
        ei_kwh,
        eo_kwh,
        uptime_s,
    })
}

#[async_trait::async_trait]
impl Source<MeterReading> for ReadingCsvFileSource {
    async fn stream(
        &self,
    ) -> std::pin::Pin<Box<dyn Stream<Item = Result<Envelope<MeterReading>, PipelineError>> + Send>>
    {
        // This source uses a blocking CSV reader but is wrapped in a single async task.
        // For large files, you might want to move this onto a dedicated thread pool.
        let path = self.path.clone();
        let s = async_stream::try_stream! {
            let file = File::open(&path)
                .map_err(|e| PipelineError::Source(format!("failed to open CSV file: {e}")))?;
            let mut rdr = csv::Reader::from_reader(file);
            let headers = rdr
                .headers()
                .map_err(|e| PipelineError::Source(format!("failed to read CSV headers: {e}")))?
                .clone();

            for result in rdr.records() {
                let record = result.map_err(|e| PipelineError::Source(format!(
                    "failed to read CSV record: {e}"
                )))?;

                let reading = match record_to_reading(&record, &headers) {
                    Ok(r) => r,
                    Err(e) => {
                        metrics::counter!("reading_replay_parse_errors_total").increment(1);
                        Err(e)?
                    }
                };

                yield Envelope::now(reading);
            }
        };

        Box::pin(s)
    }
}
