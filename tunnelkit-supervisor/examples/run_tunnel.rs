//! Run Tunnel Example
//!
//! Launches the tunnel with credentials from the environment, keeps it up for
//! a fixed time and shuts it down.
//!
//! ```text
//! TESTINGBOT_KEY=... TESTINGBOT_SECRET=... cargo run --example run_tunnel
//! ```

use std::time::Duration;
use tokio::sync::oneshot;
use tunnelkit_supervisor::{LaunchConfig, Result, SupervisorConfig, TunnelSupervisor};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let key = std::env::var("TESTINGBOT_KEY").unwrap_or_default();
    let secret = std::env::var("TESTINGBOT_SECRET").unwrap_or_default();

    let supervisor = TunnelSupervisor::new(SupervisorConfig::load()?)?;
    let options = LaunchConfig::new()
        .with_credentials(key, secret)
        .with("tunnelIdentifier", "run-tunnel-example");

    println!("Starting tunnel (state: {})", supervisor.state().await);

    // Callback flavour; `launch(...).await` is equivalent.
    let (tx, rx) = oneshot::channel();
    supervisor.launch_with(options, move |result| {
        let _ = tx.send(result);
    });
    let tunnel = rx.await.expect("launch task panicked")?;

    println!(
        "Tunnel {} ready as pid {} since {}",
        tunnel.id(),
        tunnel.pid(),
        tunnel.started_at()
    );

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(30)) => {
            let exit = supervisor.terminate(&tunnel).await?;
            println!("Tunnel stopped: {:?}", exit);
        }
        closed = tunnel.closed() => {
            println!("Tunnel went away: {:?}", closed);
        }
    }

    Ok(())
}
