//! Runtime configuration for a vehicle.

use std::time::Duration;

use platoon_protocol::{Backoff, BOOTSTRAP_TIMEOUT, DEFAULT_BROKER_PORT};

use crate::headway::Thresholds;

/// Motion tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionParams {
    pub max_speed: f64,
    /// Automatic speed-up when the gap is too large
    pub accel_step: f64,
    /// Speed-up for a user or relayed accelerate
    pub user_accel_step: f64,
    pub decel_step: f64,
    /// Position gain per tick is `speed * U(0,1) / jitter_divisor`
    pub jitter_divisor: f64,
    pub thresholds: Thresholds,
}

impl Default for MotionParams {
    fn default() -> Self {
        MotionParams {
            max_speed: 1.0,
            accel_step: 0.05,
            user_accel_step: 0.1,
            decel_step: 0.1,
            jitter_divisor: 50_000.0,
            thresholds: Thresholds::default(),
        }
    }
}

/// Loop pacing and deadlines
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    /// Minimum spacing of main loop iterations
    pub tick: Duration,
    pub position_interval: Duration,
    pub report_interval: Duration,
    /// Read deadline on every socket and input poll
    pub poll: Duration,
    /// Give up linking to neighbours after this long
    pub link_timeout: Option<Duration>,
    pub backoff: Backoff,
    /// Deadline on each broker reply during bootstrap
    pub bootstrap_timeout: Duration,
    /// Silence that ends a decimal reply from the broker
    pub token_settle: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            tick: Duration::from_micros(20),
            position_interval: Duration::from_millis(5),
            report_interval: Duration::from_millis(10),
            poll: Duration::from_millis(50),
            link_timeout: None,
            backoff: Backoff::default(),
            bootstrap_timeout: BOOTSTRAP_TIMEOUT,
            token_settle: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VehicleConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub motion: MotionParams,
    pub timing: Timing,
    /// Fixed jitter seed, mostly for tests
    pub seed: Option<u64>,
}

impl VehicleConfig {
    pub fn new(broker_host: impl Into<String>) -> Self {
        VehicleConfig {
            broker_host: broker_host.into(),
            broker_port: DEFAULT_BROKER_PORT,
            motion: MotionParams::default(),
            timing: Timing::default(),
            seed: None,
        }
    }
}
