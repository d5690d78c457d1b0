//! # Platoon Broker
//!
//! Hands out vehicle IDs, freezes and broadcasts the peer table when the
//! lead says so, seeds start positions and then collects reports until
//! every vehicle has left.

pub mod admission;
pub mod collector;
pub mod config;
pub mod error;

pub use admission::{Broker, Lane, Roster};
pub use collector::{collect, LaneBoard};
pub use config::BrokerConfig;
pub use error::{AdmissionError, RegistrationError};

use std::collections::BTreeMap;

use platoon_protocol::{Report, VehicleId};

/// Run one simulation from admission to the last lane closing
pub fn run(config: &BrokerConfig) -> Result<BTreeMap<VehicleId, Report>, AdmissionError> {
    let broker = Broker::bind(&config.host, config.port)?;
    let mut roster = broker.admit()?;
    roster.seed_start_positions();
    collect(roster.into_lanes(), config.snapshot_interval)
}
