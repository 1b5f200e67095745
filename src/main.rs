//! SpringBloom Live - voice and video calls with a Gemini Live companion
//!
//! Opens the call window and runs the session controller on the current
//! thread. The window and Ctrl-C both end the process through `Shutdown`.

use anyhow::Context as _;
use springbloom_live::{launch_ui, LiveClient, LiveConfig, LiveSession, LocalDevices, SessionConfig, ShellCommand};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting SpringBloom Live");

    let live_config = LiveConfig::from_env().context("Gemini configuration")?;
    info!("Using model {} with voice {}", live_config.model, live_config.voice);

    let session_config = SessionConfig::default();
    let backend = LocalDevices::new(session_config.clone());
    let mut session = LiveSession::new(session_config, backend, LiveClient::new(live_config));

    let (command_tx, command_rx) = mpsc::unbounded_channel::<ShellCommand>();
    // the window thread is left to exit with the process
    let _window = launch_ui(session.subscribe(), session.subscribe_preview(), command_tx.clone());

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received");
                let _ = command_tx.send(ShellCommand::Shutdown);
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    session.run(command_rx).await;
    drop(session);
    info!("SpringBloom Live stopped");
    Ok(())
}
