use nimbus::config::Config;
use nimbus::signaling::SignalingServer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;

    println!("   Nimbus Signalling Relay");
    println!("   Streamers on {}", config.streamer_addr());
    println!("   Players on {}", config.player_addr());
    println!("   Press Ctrl+C to stop\n");

    let server = SignalingServer::bind(&config).await?;

    tokio::select! {
        _ = server.run() => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Shutting down");
        }
    }

    Ok(())
}
