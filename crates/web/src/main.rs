//! Nebula Console server

use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nebula_console_web::Settings;

#[derive(Parser)]
#[command(name = "nebula-console")]
#[command(about = "Nebula console - certificate authority and device provisioning API")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.nebula-console/config.toml")]
    config: PathBuf,

    /// HTTP listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn expand_home(path: PathBuf) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(rest))
            .unwrap_or_else(|| rest.to_path_buf()),
        Err(_) => path,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = expand_home(cli.config);
    let mut settings = Settings::load(&config_path)?;
    settings.apply_env()?;
    if let Some(listen) = cli.listen {
        settings.server.listen = listen;
    }
    if let Some(dir) = cli.data_dir {
        settings.server.data_dir = dir;
    }

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let json = settings.logging.format.eq_ignore_ascii_case("json");
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();

    info!("Nebula console v{}", nebula_console_common::VERSION);
    info!("Configuration: {}", config_path.display());

    std::fs::create_dir_all(&settings.server.data_dir)?;
    nebula_console_web::serve(settings).await
}
