use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use snakestream::cli::{BrokerConfig, Cli};
use snakestream::logging::init_tracing;
use snakestream::transport::ws::serve;
use snakestream::{StreamService, VersionInfo};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = BrokerConfig::try_from(Cli::parse()).context("invalid configuration")?;
    let version = VersionInfo::new().with_worker(config.worker.program());

    let service = Arc::new(
        StreamService::new(config.max_streams, Arc::new(config.worker))
            .with_settings(config.session)
            .with_version(version),
    );

    serve(config.server, service).await
}
