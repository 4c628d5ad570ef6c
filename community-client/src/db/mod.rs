pub mod energy_queries;

pub use energy_queries::{
    community_summary, field_series, house_profile, house_summaries, house_summary,
    CommunityEnergySummary, FieldSample, HouseEnergySummary, Measurement, QueryError,
};
