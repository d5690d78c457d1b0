mod logger;
mod parse_args;

use parse_args::parse_args;
use platoon_vehicle::agent;
use platoon_vehicle::input::{enter_raw_mode, spawn_key_reader};

fn main() {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Error parsing arguments: {}", e);
            std::process::exit(1);
        }
    };

    // Held until the final status line so the terminal is always restored
    let raw_mode = match enter_raw_mode() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: keys need Enter, raw mode unavailable: {}", e);
            None
        }
    };

    if let Err(e) = logger::init(args.verbosity, args.log_file.as_deref(), raw_mode.is_some()) {
        drop(raw_mode);
        eprintln!("Failed to set up logging: {}", e);
        std::process::exit(1);
    }
    if let Some(path) = &args.log_file {
        eprint!("Logging to: {}{}", path, if raw_mode.is_some() { "\r\n" } else { "\n" });
    }

    let keys = match spawn_key_reader(std::io::stdin()) {
        Ok(rx) => rx,
        Err(e) => {
            drop(raw_mode);
            eprintln!("Failed to read keys: {}", e);
            std::process::exit(1);
        }
    };

    let config = args.to_config();
    let result = agent::run(&config, keys);
    drop(raw_mode);

    match result {
        Ok(reason) => {
            eprintln!("{}", reason);
            std::process::exit(reason.exit_code());
        }
        Err(e) => {
            eprintln!("{}: {}", e.status(), e);
            std::process::exit(e.exit_code());
        }
    }
}
