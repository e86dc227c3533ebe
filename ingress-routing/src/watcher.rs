//! Container lifecycle watcher.
//!
//! Consumes one sequence of container starts (optionally the running set
//! first, then live events) and configures each container in order.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tracing::{error, info, warn};

use crate::config::ServiceFilter;
use crate::error::{Error, Result};
use crate::platform::{ContainerStart, ContainerStream, Platform};
use crate::return_path::ReturnPathInstaller;

/// Attempts per container before giving up.
pub const INSTALL_ATTEMPTS: u32 = 3;

const INSTALL_BACKOFF: Duration = Duration::from_millis(500);

/// Container starts as one sequence.
///
/// The live subscription is opened before the running set is listed, so no
/// container started in between is missed. With `backfill` set, running
/// containers passing the filter are yielded first.
pub fn container_starts<P>(platform: Arc<P>, backfill: Option<ServiceFilter>) -> ContainerStream
where
    P: Platform + 'static,
{
    let stream = async_stream::stream! {
        let mut live = match platform.container_starts().await {
            Ok(live) => live,
            Err(e) => {
                yield Err(e);
                return;
            }
        };

        if let Some(filter) = backfill {
            match platform.running_containers().await {
                Ok(running) => {
                    let selected: Vec<ContainerStart> = running
                        .into_iter()
                        .filter(|c| filter.matches(c.service.as_deref()))
                        .collect();
                    info!(count = selected.len(), "Backfilling running containers");
                    for container in selected {
                        yield Ok(container);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        while let Some(event) = live.next().await {
            yield event;
        }
    };
    stream.boxed()
}

/// Drives the return-path installer from container start events.
pub struct Watcher<P> {
    platform: Arc<P>,
    installer: ReturnPathInstaller,
    backfill: bool,
    attempts: u32,
    backoff: Duration,
    stopping: AtomicBool,
}

impl<P: Platform + 'static> Watcher<P> {
    pub fn new(platform: Arc<P>, installer: ReturnPathInstaller, backfill: bool) -> Self {
        Self {
            platform,
            installer,
            backfill,
            attempts: INSTALL_ATTEMPTS,
            backoff: INSTALL_BACKOFF,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Watch until `shutdown` resolves or the event stream ends.
    ///
    /// Spawned processes are terminated on every exit path. If `shutdown`
    /// resolves during an install, the processes it is waiting on are
    /// terminated right away and the install runs to its (failed) end
    /// without further retries.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let result = self.watch(shutdown).await;
        self.platform.shutdown();
        result
    }

    async fn watch<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.stopping.store(false, Ordering::SeqCst);
        let backfill = self.backfill.then(|| self.installer.services().clone());
        let mut events = container_starts(self.platform.clone(), backfill);
        tokio::pin!(shutdown);

        info!(backfill = self.backfill, "Watching container starts");
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping watcher");
                    return Ok(());
                }
                event = events.next() => match event {
                    Some(Ok(container)) => {
                        let install = self.handle(&container);
                        tokio::pin!(install);
                        tokio::select! {
                            biased;
                            () = &mut install => {}
                            () = &mut shutdown => {
                                info!(container = %container.id, "Shutdown requested during install");
                                self.stopping.store(true, Ordering::SeqCst);
                                self.platform.shutdown();
                                install.await;
                                return Ok(());
                            }
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "Container event error"),
                    None => return Err(Error::EventStreamClosed),
                },
            }
        }
    }

    async fn handle(&self, container: &ContainerStart) {
        for attempt in 1..=self.attempts {
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            match self
                .installer
                .install(self.platform.as_ref(), container)
                .await
            {
                Ok(_) => return,
                Err(e) if self.stopping.load(Ordering::SeqCst) => {
                    warn!(container = %container.id, error = %e, "Install interrupted by shutdown");
                    return;
                }
                Err(e) if attempt < self.attempts => {
                    warn!(container = %container.id, attempt, error = %e, "Install failed, retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                Err(e) => {
                    error!(
                        container = %container.id,
                        attempts = self.attempts,
                        error = %e,
                        "Failed to configure return path, leaving container unconfigured"
                    );
                }
            }
        }
    }
}
