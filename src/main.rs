mod agent;
mod budget;
mod channels;
mod config;
mod daemon;
mod engagement;
mod followup;
mod guard;
mod invoker;
mod messages;
mod momentum;
mod proactive;
mod providers;
mod scheduler;
mod state;
mod tools;
mod traits;
mod types;


use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("config.toml");
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-V" => {
                println!("cadenced {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                println!("cadenced {}", env!("CARGO_PKG_VERSION"));
                println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
                println!("Usage: cadenced [CONFIG_PATH]\n");
                println!("Options:");
                println!("  -h, --help       Print help");
                println!("  -V, --version    Print version");
                return Ok(());
            }
            other => {
                config_path = PathBuf::from(other);
            }
        }
    }

    let config = config::AppConfig::load(&config_path)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(daemon::run(config))
}
