use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod runtime;
mod server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::SkyflowD::parse();
    let mut config = skyflow::config::load_config(args.config.as_ref())
        .map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;
    if let Some(port) = args.port {
        config.daemon.port = port;
    }
    if let Some(database) = args.database {
        config.database.path = Some(database);
    }

    let runtime = runtime::Runtime::start(config)?;
    server::serve(runtime).await
}
