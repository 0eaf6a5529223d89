use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chat_relay::{
    cli::{Cli, Command},
    config::HubConfig,
    server::Server,
    terminal,
};

fn init_tracing() {
    use std::io::IsTerminal;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let listener = TcpListener::bind(args.listen).await?;
            let server = Server::new(listener, HubConfig::from(&args));
            let addr = server.local_addr()?;
            info!("hub listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("hub exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => terminal::run(args).await?,
        Command::Ping(args) => terminal::ping(args).await?,
    }

    Ok(())
}
