//! # Platoon Vehicle
//!
//! One vehicle of a platoon. It registers with the broker, links to the
//! vehicles directly in front and behind, and then keeps its headway while
//! relaying speed commands along the chain.
//!
//! ```text
//!  broker ── reports ──┐
//!                      │
//!  [1] <──── [2] <──── [3]
//!   lead  positions flow back, A/D flow forward, S/Q flow both ways
//! ```

pub mod agent;
pub mod bootstrap;
pub mod config;
pub mod context;
pub mod error;
pub mod headway;
pub mod input;
pub mod links;
pub mod motion;
pub mod relay;
pub mod runtime;

pub use config::{MotionParams, Timing, VehicleConfig};
pub use context::{Direction, SharedState, TerminationFlag, TerminationReason};
pub use error::{AgentError, BootstrapError, LinkError};
pub use headway::{HeadwayResult, Thresholds};
pub use motion::MotionState;
