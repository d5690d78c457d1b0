mod logger;
mod parse_args;

use parse_args::parse_args;

fn main() {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Error parsing arguments: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = logger::init(args.verbosity, args.log_file.as_deref()) {
        eprintln!("Failed to set up logging: {}", e);
        std::process::exit(1);
    }
    if let Some(path) = &args.log_file {
        eprintln!("Logging to: {}", path);
    }

    match platoon_broker::run(&args.to_config()) {
        Ok(latest) => {
            eprintln!("Simulation over, {} vehicle(s) reported", latest.len());
        }
        Err(e) => {
            eprintln!("Broker error: {}", e);
            std::process::exit(1);
        }
    }
}
