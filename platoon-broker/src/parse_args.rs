use platoon_broker::BrokerConfig;
use platoon_protocol::DEFAULT_BROKER_PORT;

const HELP: &str = "\
Platoon broker - identity and topology broker for platoon vehicles

Assigns vehicle IDs, broadcasts the peer table once the lead vehicle closes
admission, seeds start positions and collects position reports.

USAGE:
  platoon-broker [OPTIONS]

OPTIONS:
  -h, --help            Prints help information
  --host <addr>         Address to listen on (default: 0.0.0.0)
  --port <port>         Well-known port (default: 6789)
  -v, --verbose         Show connection and protocol events
  -vv, --trace          Show every report
  --log <file>          Write log output to file instead of stderr
";

/// Verbosity level for log output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Admission and snapshots
    Quiet = 0,
    /// Connection events
    Verbose = 1,
    /// Every report
    Trace = 2,
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Quiet
    }
}

#[derive(Debug)]
pub struct AppArgs {
    pub host: String,
    pub port: u16,
    pub verbosity: Verbosity,
    pub log_file: Option<String>,
}

impl AppArgs {
    pub fn to_config(&self) -> BrokerConfig {
        BrokerConfig {
            host: self.host.clone(),
            port: self.port,
            ..BrokerConfig::default()
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

    let args = AppArgs {
        host: pargs
            .opt_value_from_str("--host")?
            .unwrap_or_else(|| "0.0.0.0".to_string()),
        port: pargs
            .opt_value_from_str("--port")?
            .unwrap_or(DEFAULT_BROKER_PORT),
        verbosity,
        log_file: pargs.opt_value_from_str("--log")?,
    };

    let remaining = pargs.finish();
    if !remaining.is_empty() {
        eprintln!("Warning: unused arguments left: {:?}.", remaining);
    }

    Ok(args)
}
