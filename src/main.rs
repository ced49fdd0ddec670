use anyhow::Context;
use logrelay::{Relay, RelayConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "logrelay=warn";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let stdout = std::io::stdout();
    let mut relay =
        Relay::new(RelayConfig::default(), stdout.lock()).context("relay configuration")?;

    tracing::info!(url = %relay.config().url, "relaying log events");

    match relay.run().await {
        Ok(never) => match never {},
        Err(err) => Err(err).context("writing to stdout"),
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, registry, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true),
        )
        .init();
}
