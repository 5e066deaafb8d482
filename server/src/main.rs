use arena_server::config::ServerConfig;
use arena_server::network::Server;
use arena_server::services::Services;
use clap::Parser;
use log::{error, info, LevelFilter};

/// Authoritative arena game server
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the TOML configuration file (created if missing)
    #[clap(short, long, default_value = "server.toml")]
    config: String,
    /// Address to bind to, overrides the config file
    #[clap(short = 'H', long)]
    host: Option<String>,
    /// Port for both TCP and UDP, overrides the config file
    #[clap(short, long)]
    port: Option<u16>,
    /// Simulation tick interval in milliseconds
    #[clap(short, long)]
    tick_interval_ms: Option<u64>,
    /// Enable debug logging
    #[clap(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(tick_interval_ms) = self.tick_interval_ms {
            config.tick_interval_ms = tick_interval_ms;
        }
        config.verbose |= self.verbose;
    }
}

/// Starts logging before anything else runs. Without `RUST_LOG` the level
/// is debug or info; returns whether `RUST_LOG` chose the filter.
fn init_logging(verbose: bool) -> bool {
    let from_env = std::env::var_os("RUST_LOG").is_some();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    if !from_env && !verbose {
        log::set_max_level(LevelFilter::Info);
    }
    from_env
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let from_env = init_logging(args.verbose);

    let mut config = ServerConfig::load_or_create(&args.config)?;
    args.apply(&mut config);
    config.validate()?;
    // `verbose` may also come from the config file
    if config.verbose && !from_env {
        log::set_max_level(LevelFilter::Debug);
    }

    info!("{} is loading...", config.name);
    let services = Services::http(&config)?;
    let server = Server::bind(config, services).await?;
    info!("Server has started on {}", server.local_addr());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_accepts_records_before_config_is_read() {
        let from_env = init_logging(false);
        if !from_env {
            assert_eq!(log::max_level(), LevelFilter::Info);
            let metadata = log::Metadata::builder()
                .level(log::Level::Info)
                .target("arena_server::config")
                .build();
            assert!(log::logger().enabled(&metadata));
        }
    }
}
