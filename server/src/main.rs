use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::game::{self, GameState};
use server::network::Server;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(short = 'c', long)]
    config: Option<String>,

    /// Interface to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// TCP and UDP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of player slots
    #[arg(short, long)]
    max_players: Option<u32>,

    /// Simulation ticks per second
    #[arg(short, long)]
    tick_rate: Option<u32>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, server::error::ServerError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(max_players) = self.max_players {
            config.max_players = max_players;
        }
        if let Some(tick_rate) = self.tick_rate {
            config.tick_rate = tick_rate;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config()?;
    info!(
        "Starting server: {} slots at {} ticks per second",
        config.max_players, config.tick_rate
    );

    let server = Server::bind(config.clone()).await?;
    let game = GameState::new(server.network(), config.tick_rate);
    let handle = server.start(game::handlers(), game)?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C, shutting down gracefully...");

    let game = handle.shutdown().await?;
    info!("Server stopped after {} ticks", game.tick_count());
    Ok(())
}
