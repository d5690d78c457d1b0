//! Log output to stderr or a file.

use std::fs::File;
use std::io::{self, Write};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::parse_args::Verbosity;

impl Verbosity {
    fn level(self) -> &'static str {
        match self {
            Verbosity::Quiet => "info",
            Verbosity::Verbose => "debug",
            Verbosity::Trace => "trace",
        }
    }
}

/// Stderr for a terminal in raw mode, where `\n` alone does not return
/// the cursor.
struct RawTerminal<W>(W);

impl<W: Write> Write for RawTerminal<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for chunk in buf.split_inclusive(|&b| b == b'\n') {
            match chunk.strip_suffix(b"\n") {
                Some(line) => {
                    self.0.write_all(line)?;
                    self.0.write_all(b"\r\n")?;
                }
                None => self.0.write_all(chunk)?,
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `verbosity`.
pub fn init(verbosity: Verbosity, log_file: Option<&str>, raw_terminal: bool) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity.level()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match log_file {
        Some(path) => {
            let file = File::create(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
        None if raw_terminal => builder
            .with_writer(|| RawTerminal(io::stderr()))
            .try_init(),
        None => builder.with_writer(io::stderr).try_init(),
    };
    result.map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}
