use anyhow::Result;
use tracing::info;

use pm_server::{Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env();
    info!(
        port = config.port,
        rate_limiting = config.enable_rate_limiting,
        require_invitation = config.require_invitation,
        media = config.enable_media_storage,
        verify_signatures = config.verify_challenge_signatures,
        "starting phantom server"
    );

    let server = Server::new(config);
    let runner = {
        let server = server.clone();
        tokio::spawn(server.run())
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop();
    runner.abort();
    Ok(())
}
