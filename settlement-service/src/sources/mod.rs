pub mod http_meter;
pub mod reading_backfill_file;
pub mod reading_csv_file;
pub mod simulator;

pub use http_meter::HttpMeterSource;
pub use reading_backfill_file::ReadingBackfillFileSource;
pub use reading_csv_file::ReadingCsvFileSource;
pub use simulator::SimulatorSource;
