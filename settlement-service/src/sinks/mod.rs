pub mod engine;
pub mod ilp;
pub mod questdb;

use community_client::domain::{CommunityEnergyRecord, HouseEnergyRecord};

use crate::pipeline::PipelineError;

pub use engine::EngineSink;
pub use ilp::IlpPublisher;
pub use questdb::QuestDbPublisher;

/// One record of a settled interval on its way to storage.
#[derive(Debug, Clone)]
pub enum SettlementPoint {
    House(HouseEnergyRecord),
    Community(CommunityEnergyRecord),
}

/// Writes one interval's settled records to the time-series store.
///
/// Publication is fire-and-forget from the driver's point of view: a
/// publisher retries with bounded backoff internally, and a final failure
/// is a gap in the historical record, never a reason to hold up the next
/// interval.
#[async_trait::async_trait]
pub trait SettlementPublisher: Send + Sync {
    async fn publish(&self, points: Vec<SettlementPoint>) -> Result<(), PipelineError>;
}
