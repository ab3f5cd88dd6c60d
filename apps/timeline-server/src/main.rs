use anyhow::Result;
use clap::Parser;
use tracing::info;

use timeline_server::{
    config::{Cli, ServerConfig},
    telemetry::Telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        redis = config.redis_url.is_some(),
        auth_bypass = config.auth.bypass,
        open_membership = config.membership.open,
        "starting timeline-server"
    );

    timeline_server::run(config, telemetry.metrics_handle()).await
}
