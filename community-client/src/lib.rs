pub mod db;
pub mod domain;

pub use domain::{CommunityEnergyRecord, HouseEnergyRecord, MeterReading};
