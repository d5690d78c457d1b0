//! # Platoon Protocol
//!
//! Wire formats shared by platoon vehicles and the identity broker.
//!
//! ## Vehicle links
//!
//! Length-prefixed text frames between chain neighbours:
//! ```text
//! [len:u32-BE][payload...]
//! ```
//!
//! | Payload | Message | Meaning |
//! |---------|---------|---------|
//! | `"A"` | Accelerate | speed up (relayed toward the front) |
//! | `"D"` | Decelerate | slow down (relayed toward the front) |
//! | `"S"` | Stop | stop, cascades in both directions |
//! | `"Q"` | Quit | leave the simulation, cascades in both directions |
//! | `412.75` | Position | sender's position, sent to the vehicle behind |
//!
//! ## Broker
//!
//! Unframed byte exchange, see [`broker`]: admission marker `0`, decimal ID,
//! admission commands `c`/`s`, the peer table as a JSON object, the `xpos`
//! start position request, and `{"0": position, "1": speed}` reports
//! acknowledged with `ACK`.

pub mod broker;
mod messages;
pub mod socket;

pub use broker::{AdmissionCommand, PeerAddr, PeerTable, Report, VehicleId};
pub use messages::{ControlMessage, ProtocolError, MAX_FRAME_LEN};
pub use socket::{Backoff, FrameReader, FrameWriter, PeerConnection, PeerListener, Transport};

use std::time::Duration;

/// Well-known broker port. Vehicle `k` listens for its successor on
/// `DEFAULT_BROKER_PORT + k`.
pub const DEFAULT_BROKER_PORT: u16 = 6789;

/// Maximum number of vehicles in one platoon.
pub const MAX_VEHICLES: usize = 9;

/// How long a vehicle waits for the broker during bootstrap.
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(15);
