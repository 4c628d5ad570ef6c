mod community_energy;
mod house_energy;
mod meter_reading;

pub use community_energy::CommunityEnergyRecord;
pub use house_energy::HouseEnergyRecord;
pub use meter_reading::MeterReading;
