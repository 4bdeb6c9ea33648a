//! WebQuery: answers natural-language queries by driving pooled browser
//! sessions and AI backends.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use webquery_chat::LLMConfig;
use webquery_core::WebQueryConfig;
use webquery_server::{build_router, AppState};

fn resolve_data_dir() -> PathBuf {
    std::env::var("WEBQUERY_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

fn print_help() {
    println!("WebQuery — browser query orchestration server");
    println!();
    println!("Usage: webquery [command]");
    println!();
    println!("Commands:");
    println!("  (none)                   Start the server");
    println!("  check-config [data-dir]  Validate configuration and print the resolved settings");
    println!("  help                     Show this help message");
}

fn check_config(data_dir: PathBuf) -> anyhow::Result<()> {
    let config = WebQueryConfig::from_env(&data_dir)?;
    let llm = LLMConfig::load(&config.llm_config_file());

    println!("Data directory:      {}", config.data_dir.display());
    println!("Port:                {}", config.port);
    println!("Infrastructure URL:  {}", config.infrastructure_url);
    println!("{}", serde_json::to_string_pretty(&config.orchestration)?);
    println!();
    match llm.resolve_provider() {
        Some((provider, model)) => println!("Preferred backend:   {} ({})", provider, model),
        None => println!("Preferred backend:   none"),
    }
    for spec in llm.backend_specs() {
        println!("  candidate: {} ({})", spec.provider, spec.model);
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--check-config" | "check-config" => {
                let data_dir = args.get(2).map(PathBuf::from).unwrap_or_else(resolve_data_dir);
                if let Err(e) = check_config(data_dir) {
                    eprintln!("Configuration invalid: {}", e);
                    std::process::exit(1);
                }
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'webquery help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    let config = WebQueryConfig::from_env(&data_dir)?;
    let port = config.port;
    let reap_every = (config.orchestration.session_idle_ttl() / 2).max(Duration::from_secs(1));

    let state = Arc::new(AppState::new(config)?);
    let reaper = state.pool().spawn_reaper(reap_every);

    let app = build_router(state.clone());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("WebQuery server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.abort();
    state.pool().shutdown().await;
    info!("Browser sessions closed");

    Ok(())
}
