//! Run a unit of work repeatedly on its own task until stopped
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::{Error, Result};

/// A unit of work driven by [Periodic]
pub trait Work: Send + 'static {
    /// Run a single iteration
    fn work(&mut self) -> impl Future<Output = ()> + Send;
}

/// Handle to a loop calling [Work::work] with a fixed idle delay between iterations
#[derive(Debug)]
pub struct Periodic {
    name: String,
    idle_delay: Duration,
    stop_timeout: Duration,
    running: Option<Running>,
}

#[derive(Debug)]
struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Periodic {
    pub fn new(name: impl Into<String>, idle_delay: Duration, stop_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            idle_delay,
            stop_timeout,
            running: None,
        }
    }

    /// Spawn the loop driving `worker`. Fails if the loop is already running.
    pub fn start<W: Work>(&mut self, mut worker: W) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let idle_delay = self.idle_delay;
        let span = info_span!("periodic", name = %self.name);
        let task = tokio::spawn(
            async move {
                debug!("started");
                while !cancel_clone.is_cancelled() {
                    worker.work().await;
                    tokio::select! {
                        _ = tokio::time::sleep(idle_delay) => {},
                        _ = cancel_clone.cancelled() => {},
                    }
                }
                debug!("stopped");
            }
            .instrument(span),
        );
        self.running = Some(Running { cancel, task });
        Ok(())
    }

    /// Signal the loop to stop and wait for it to exit. Fails if the loop is not running.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let Some(Running { cancel, mut task }) = self.running.take() else {
            return Err(Error::NotRunning);
        };

        cancel.cancel();
        match tokio::time::timeout(self.stop_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} terminated abnormally - {e}", self.name),
            Err(_) => {
                warn!(
                    "{} did not stop within {:?} - aborting",
                    self.name, self.stop_timeout
                );
                task.abort();
            }
        }
        Ok(())
    }

    /// Whether the loop is running
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the loop. A running loop keeps its old name until restarted.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }
}

impl std::ops::Drop for Periodic {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
        }
    }
}
