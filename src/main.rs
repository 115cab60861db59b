use std::env;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relay_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" {
        eprintln!("Usage: linerelay serve --config <path>");
        std::process::exit(2);
    }

    let mut config_path = String::from("./config/example-config.yaml");
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = v;
            }
        }
    }

    let cfg = match relay_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(path = %config_path, error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    tracing::info!(
        path = %config_path,
        store = %cfg.store.kind,
        model = %cfg.gemini.model,
        "configuration loaded"
    );

    if let Err(e) = relay_server::serve(cfg).await {
        tracing::error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}
