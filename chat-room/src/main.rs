use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use chat_room::{
    cli::Cli,
    page::PageTemplate,
    room::Room,
    server::{self, AppState},
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
    if let Err(err) = run(cli).await {
        error!("chat room exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let listener = TcpListener::bind(cli.addr.as_str())
        .await
        .with_context(|| format!("failed to listen on {}", cli.addr))?;

    let room = Room::spawn(cli.room_config());
    let page = PageTemplate::in_dir(&cli.templates);

    info!("chat room listening on {}", listener.local_addr()?);
    server::serve_until_ctrl_c(listener, AppState::new(room, page)).await
}
