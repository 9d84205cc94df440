//! `rbuild-server`: serve a mirror repository to `rbuild` clients.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use rbuild::io::config::{SERVER_CONFIG_FILE, load_server_config};
use rbuild::io::git::Git;
use rbuild_server::app;
use rbuild_server::state::AppState;

#[derive(Parser)]
#[command(name = "rbuild-server")]
#[command(about = "Build server that mirrors an rbuild client repository")]
struct Args {
    /// Address to bind the server to (overrides `bind` in the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides `port` in the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Mirror repository (any directory inside it)
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Config file (default: `<project>/rbuild-server.toml`)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rbuild_server=info".parse()?)
                .add_directive("rbuild=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let project_dir = Git::new(&args.project_dir)
        .toplevel()
        .with_context(|| format!("{} is not inside a git repository", args.project_dir.display()))?;
    let config_path = args
        .config
        .unwrap_or_else(|| project_dir.join(SERVER_CONFIG_FILE));
    let mut config = load_server_config(&config_path)?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate().context("invalid server config")?;
    info!(project_dir = %project_dir.display(), "starting rbuild-server");

    let max_upload = config.max_upload_bytes;
    let state = AppState::new(project_dir, &config);
    state.runtime().ensure()?;
    let app = app(state, max_upload);

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.bind, config.port))?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
