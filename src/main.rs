use clap::Parser;
use football_analyst_rs::{server, AgentConfig, SessionController};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

/// Voice conversation client for a hosted football-analyst assistant.
#[derive(Parser, Debug)]
#[command(name = "football-analyst", version, about, long_about = None)]
struct Cli {
    /// Address to serve the control screen on
    #[arg(short, long, default_value = "127.0.0.1:4200")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    log::info!("🚀 Initializing football-analyst");
    let config = AgentConfig::load();
    let controller = SessionController::initialize(&config);

    let shutdown = CancellationToken::new();
    let pump = tokio::spawn(controller.clone().run(shutdown.clone()));

    // Ctrl-C deactivates the session: force-stop any active call before
    // the control screen goes away.
    let signal_task = {
        let controller = controller.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("shutdown requested");
                controller.shutdown().await;
                shutdown.cancel();
            }
        })
    };

    server::serve(controller, cli.listen, shutdown.clone()).await?;

    shutdown.cancel();
    signal_task.abort();
    let _ = pump.await;
    Ok(())
}
