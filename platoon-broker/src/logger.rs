//! Log output to stderr or a file.

use std::fs::File;
use std::io;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::parse_args::Verbosity;

/// Install the global subscriber. `RUST_LOG` overrides `verbosity`.
pub fn init(verbosity: Verbosity, log_file: Option<&str>) -> io::Result<()> {
    let level = match verbosity {
        Verbosity::Quiet => "info",
        Verbosity::Verbose => "debug",
        Verbosity::Trace => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match log_file {
        Some(path) => {
            let file = File::create(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
        None => builder.with_writer(io::stderr).try_init(),
    };
    result.map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}
