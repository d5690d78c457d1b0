//! A vehicle from registration to shutdown.

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use crate::bootstrap::{admission_prompt, BrokerSession};
use crate::config::VehicleConfig;
use crate::context::{SharedState, TerminationReason};
use crate::error::AgentError;
use crate::links::establish_links;
use crate::runtime::Runtime;

/// Register with the broker, link to the neighbours and drive until the
/// vehicle terminates. `keys` feeds the admission prompt and then the
/// running commands.
pub fn run(config: &VehicleConfig, keys: Receiver<u8>) -> Result<TerminationReason, AgentError> {
    let mut session = BrokerSession::connect(&config.broker_host, config.broker_port, &config.timing)?;
    let id = session.request_identity()?;
    if id.is_lead() {
        admission_prompt(&mut session, &keys)?;
    }

    let table = session.receive_peer_table(id)?;
    let start = session.request_start_position()?;
    let links = establish_links(&table, id, config.broker_port, &config.timing)?;
    let reporter = session.into_reporter(config.timing.poll)?;
    info!("vehicle {} linked, keys: d faster, a slower, s stop, q quit", id);

    let state = Arc::new(SharedState::new(id, config.motion, start));
    let rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    Ok(Runtime::new(state, links, config.timing).run(keys, reporter, rng))
}
