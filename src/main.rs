//! doforward - a layer-4 TCP load balancer
//!
//! Usage:
//!     doforward [config-path]
//!
//! The configuration path defaults to `doforward.conf` next to the
//! executable. See --help for more options.

use clap::Parser;
use doforward::config::{load_config, Config};
use doforward::util::{init_logging, on_interrupt};
use doforward::{Error, Server};
use std::path::PathBuf;
use tracing::{error, info};

/// A layer-4 TCP load balancer.
#[derive(Parser, Debug)]
#[command(name = "doforward")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Exception: {} - {}", e.code(), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;

    // CLI overrides config.
    let log_level = cli.log_level.as_deref().unwrap_or(&config.server.log_level);
    init_logging(log_level, &config.server.log_format);

    if cli.validate {
        print_summary(&config);
        return Ok(());
    }

    info!(
        config_path = %config_path.display(),
        services = config.services.len(),
        "doforward starting"
    );

    let server = Server::new();
    server.run(config)?;

    let stopper = server.clone();
    on_interrupt(move || {
        info!("received shutdown signal");
        stopper.stop();
    })?;

    server.finish();
    info!("doforward shut down");
    Ok(())
}

/// `doforward.conf` next to the executable, falling back to the working
/// directory.
fn default_config_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("doforward.conf")))
        .unwrap_or_else(|| PathBuf::from("doforward.conf"))
}

fn print_summary(config: &Config) {
    println!("Configuration is valid.");
    println!("  Services: {}", config.services.len());
    for service in config.services.iter() {
        println!(
            "    - {} {}:{} [{}] ({} nodes)",
            service.name.as_deref().unwrap_or("<auto>"),
            service.host.as_deref().unwrap_or("?"),
            service.port.unwrap_or(0),
            service.balancing.as_deref().unwrap_or("roundrobin"),
            service.nodes.len()
        );
    }
    if config.services.is_empty() {
        error!("configuration defines no services");
    }
}
