//! gatehouse: round-robin reverse proxy with a fail-closed authorization gate.

mod auth;
mod config;
mod error;
mod proxy;
mod server;
mod stats;
#[cfg(test)]
mod test_support;

use config::ProxyConfig;
use server::AppState;

fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args: Vec<String> = std::env::args().collect();
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1).cloned())
        .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
        .or_else(|| std::env::var("GATEHOUSE_CONFIG").ok())
        .unwrap_or_else(|| "gatehouse.toml".to_string());

    let listen_override = args
        .iter()
        .position(|a| a == "--listen")
        .and_then(|i| args.get(i + 1).cloned());

    // Load configuration
    let mut config = ProxyConfig::load(&config_path)?;

    // CLI overrides take precedence over TOML and env vars
    if let Some(address) = listen_override {
        config.server.listen_address = address;
    }

    // The gRPC exporter needs a reactor context, so the runtime comes first
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let tracing_guard = gatehouse_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.server.listen_address,
            backends = ?config.backends.targets,
            auth_mode = ?config.auth.mode,
            otlp_export = tracing_guard.exporting(),
            "Starting gatehouse"
        );

        let result = run(config).await;
        drop(tracing_guard);
        result
    })
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(config)?;
    server::run(state).await
}
