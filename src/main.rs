use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};

use fedstore::{Config, Server};

/// Run a fedstore node.
#[derive(Parser, Debug)]
#[command(name = "fedstore", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Interface to bind (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Group member to join, as host:port
    #[arg(short, long)]
    seed: Option<String>,

    /// Maximum concurrent client connections
    #[arg(long)]
    max_clients: Option<usize>,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        if let Some(max_clients) = self.max_clients {
            config.max_clients = max_clients;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config()?;
    let seed = config.seed.clone();
    let server = Server::bind(config).await?;

    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    if let Some(seed) = seed {
        if let Err(e) = server.join(&seed).await {
            warn!("Could not join group via {}: {}", seed, e);
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");
    server.stop().await;

    match runner.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Server exited with error: {}", e);
            Err(e)
        }
        Err(e) => Err(e.into()),
    }
}
