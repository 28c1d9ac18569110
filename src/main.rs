mod capture;
mod cli;
mod config;
mod context;
mod error;
mod installer;
mod record;
mod report;
mod server;
mod store;

use cli::Cli;

fn main() {
    // Logging is configured in config.toml ([logging] faultlog = "info") and starts
    // together with error capture, so nothing is logged before the command line is
    // handled.
    if let Err(err) = Cli::handle_command_line() {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
