use std::time::Duration;

use platoon_protocol::DEFAULT_BROKER_PORT;
use platoon_vehicle::{MotionParams, Timing, VehicleConfig};

const HELP: &str = "\
Platoon vehicle - one car of a peer-to-peer platoon

Registers with the broker, links to the vehicles in front and behind and
keeps its distance. Keys while running: d faster, a slower, s stop, q quit.
The lead vehicle first admits others: c admits one more, s starts.

USAGE:
  platoon-vehicle [OPTIONS] <BROKER-HOST>

OPTIONS:
  -h, --help                  Prints help information
  --port <port>               Broker port (default: 6789); vehicle k listens on port+k
  --max-speed <f64>           Top speed (default: 1.0)
  --tick-us <n>               Minimum main loop tick in microseconds (default: 20)
  --position-interval-ms <n>  Position samples to the vehicle behind (default: 5)
  --report-interval-ms <n>    Reports to the broker (default: 10)
  --poll-ms <n>               Read deadline on every socket (default: 50)
  --link-timeout-secs <n>     Give up linking to neighbours after n seconds
  --bootstrap-timeout-secs <n> Wait this long for each broker reply (default: 15)
  --seed <n>                  Fixed seed for the position jitter
  -v, --verbose               Show connection and protocol events
  -vv, --trace                Show every position sample
  --log <file>                Write log output to file instead of stderr
";

/// Verbosity level for log output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Lifecycle status only
    Quiet = 0,
    /// Connection events, control frames
    Verbose = 1,
    /// Position samples and reports
    Trace = 2,
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Quiet
    }
}

#[derive(Debug)]
pub struct AppArgs {
    pub broker_host: String,
    pub port: u16,
    pub max_speed: Option<f64>,
    pub tick_us: Option<u64>,
    pub position_interval_ms: Option<u64>,
    pub report_interval_ms: Option<u64>,
    pub poll_ms: Option<u64>,
    pub link_timeout_secs: Option<u64>,
    pub bootstrap_timeout_secs: Option<u64>,
    pub seed: Option<u64>,
    pub verbosity: Verbosity,
    pub log_file: Option<String>,
}

impl AppArgs {
    pub fn to_config(&self) -> VehicleConfig {
        let mut motion = MotionParams::default();
        if let Some(max_speed) = self.max_speed {
            motion.max_speed = max_speed.max(0.0);
        }

        let mut timing = Timing::default();
        if let Some(us) = self.tick_us {
            timing.tick = Duration::from_micros(us);
        }
        if let Some(ms) = self.position_interval_ms {
            timing.position_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.report_interval_ms {
            timing.report_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.poll_ms {
            // A zero read deadline would mean no deadline at all
            timing.poll = Duration::from_millis(ms.max(1));
        }
        timing.link_timeout = self.link_timeout_secs.map(Duration::from_secs);
        if let Some(secs) = self.bootstrap_timeout_secs {
            timing.bootstrap_timeout = Duration::from_secs(secs.max(1));
        }

        VehicleConfig {
            broker_host: self.broker_host.clone(),
            broker_port: self.port,
            motion,
            timing,
            seed: self.seed,
        }
    }
}

pub fn parse_args() -> Result<AppArgs, pico_args::Error> {
    let mut pargs = pico_args::Arguments::from_env();

    if pargs.contains(["-h", "--help"]) {
        print!("{}", HELP);
        std::process::exit(0);
    }

    let verbosity = if pargs.contains("--trace") || pargs.contains("-vv") {
        Verbosity::Trace
    } else if pargs.contains(["-v", "--verbose"]) {
        Verbosity::Verbose
    } else {
        Verbosity::Quiet
    };

    let mut args = AppArgs {
        broker_host: String::new(),
        port: pargs
            .opt_value_from_str("--port")?
            .unwrap_or(DEFAULT_BROKER_PORT),
        max_speed: pargs.opt_value_from_str("--max-speed")?,
        tick_us: pargs.opt_value_from_str("--tick-us")?,
        position_interval_ms: pargs.opt_value_from_str("--position-interval-ms")?,
        report_interval_ms: pargs.opt_value_from_str("--report-interval-ms")?,
        poll_ms: pargs.opt_value_from_str("--poll-ms")?,
        link_timeout_secs: pargs.opt_value_from_str("--link-timeout-secs")?,
        bootstrap_timeout_secs: pargs.opt_value_from_str("--bootstrap-timeout-secs")?,
        seed: pargs.opt_value_from_str("--seed")?,
        verbosity,
        log_file: pargs.opt_value_from_str("--log")?,
    };
    args.broker_host = pargs.free_from_str()?;

    let remaining = pargs.finish();
    if !remaining.is_empty() {
        eprintln!("Warning: unused arguments left: {:?}.", remaining);
    }

    Ok(args)
}
