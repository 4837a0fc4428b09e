use anyhow::{Context, Result};
use ipcbroker::{Broker, Connection};
use tokio::net::UnixListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let path = ipcbroker::broker_socket()
        .with_context(|| "No path to broker socket is configured".to_string())?;
    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to remove existing socket {}", path.display()))?;
    }

    let listener = UnixListener::bind(&path)
        .with_context(|| format!("Failed to start listener at {}", path.display()))?;
    info!("listening on {}", path.display());

    let mut broker = Broker::new().with_name("ipcbrokerd");
    broker.start().with_context(|| "Failed to start broker")?;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let id = broker.add_connection(Connection::new(stream)).await;
                    info!("accepted client {id}");
                }
                Err(e) => error!("Failed to accept connection - {e}"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    broker.stop().await?;
    std::fs::remove_file(&path)
        .with_context(|| format!("Failed to remove socket {}", path.display()))?;
    Ok(())
}
