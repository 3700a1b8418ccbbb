//! Orchestrator API server - HTTP surface over the insights and proposal workflows.

mod error;
mod guard;
mod routes;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use tower_http::services::ServeDir;
use tracing::info;

use codex_orchestrator::io::config::find_repo_root;
use codex_orchestrator::orchestrator::Orchestrator;

use crate::guard::OriginPolicy;
use crate::state::AppState;

#[derive(Parser)]
#[command(name = "orchestrator-ui")]
#[command(about = "HTTP API for running insights and proposals over agent sessions")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Repository root (defaults to the enclosing git repository)
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Extra origin allowed to call the API, e.g. http://192.168.1.5:3001
    /// when binding a LAN address. Loopback origins on --port are always allowed.
    #[arg(long = "allow-origin", value_name = "ORIGIN")]
    allow_origins: Vec<String>,

    /// Directory containing UI static files (defaults to ui/dist under the repository)
    #[arg(long)]
    ui_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("orchestrator_ui=info".parse()?)
                .add_directive("codex_orchestrator=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let repo_root = match args.repo {
        Some(repo) => repo.canonicalize().unwrap_or(repo),
        None => find_repo_root(&std::env::current_dir().context("read current directory")?),
    };
    info!(repo_root = %repo_root.display(), "starting orchestrator-ui");

    let orchestrator = Orchestrator::from_repo(&repo_root)
        .with_context(|| format!("open orchestrator at {}", repo_root.display()))?;
    let origins = OriginPolicy::local(args.port, &args.allow_origins)?;
    let state = AppState::new(orchestrator, origins);

    let mut app = Router::new()
        .nest("/api", routes::guarded_api_router(&state))
        .with_state(state);

    let ui_dir = args
        .ui_dir
        .unwrap_or_else(|| repo_root.join("ui").join("dist"));

    if ui_dir.exists() {
        info!(ui_dir = %ui_dir.display(), "serving static UI files");
        app = app.fallback_service(ServeDir::new(ui_dir).append_index_html_on_directories(true));
    } else {
        info!(ui_dir = %ui_dir.display(), "UI directory not found, API-only mode");
    }

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
