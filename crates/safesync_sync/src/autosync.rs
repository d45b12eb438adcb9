//! Background syncing of marked databases as they are opened and edited.

use crate::cancel::CancelSignal;
use crate::driver::{SyncDriver, SyncOutcome};
use crate::error::SyncError;
use safesync_core::{DatabaseRegistry, ListenerId, RegistryEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Starts a sync whenever a marked database is opened or edited.
///
/// Triggers are queued and handled one database at a time. Triggers that
/// pile up while a sync runs are coalesced per name. A sync that ends in a
/// conflict releases the database again; the conflict was already announced
/// on the feed and waits for an explicit [`SyncDriver::sync`] and resolution.
///
/// Dropping the handle stops listening and cancels the running sync.
pub struct AutoSync {
    registry: Arc<DatabaseRegistry>,
    listener: ListenerId,
    shutdown: CancelSignal,
    task: Option<JoinHandle<()>>,
}

impl AutoSync {
    /// Starts listening on the driver's registry.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(driver: Arc<SyncDriver>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::clone(driver.registry());
        let listener = registry.events().listen(move |event| match event {
            RegistryEvent::Opened { name } | RegistryEvent::Changed { name } => {
                // Fails only after the worker stopped.
                let _ = tx.send(name.clone());
            }
            _ => {}
        });

        let shutdown = CancelSignal::new();
        let worker = Worker {
            driver,
            triggers: rx,
            shutdown: shutdown.clone(),
        };
        info!("auto-sync started");
        Self {
            registry,
            listener,
            shutdown,
            task: Some(tokio::spawn(worker.run())),
        }
    }

    /// Stops listening, cancels a running sync and waits for the worker.
    pub async fn stop(mut self) {
        self.detach();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "auto-sync worker ended abnormally");
            }
        }
        info!("auto-sync stopped");
    }

    fn detach(&self) {
        self.registry.events().unlisten(self.listener);
        self.shutdown.cancel();
    }
}

impl Drop for AutoSync {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for AutoSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoSync")
            .field("running", &self.task.is_some())
            .finish_non_exhaustive()
    }
}

struct Worker {
    driver: Arc<SyncDriver>,
    triggers: mpsc::UnboundedReceiver<String>,
    shutdown: CancelSignal,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let first = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                name = self.triggers.recv() => match name {
                    Some(name) => name,
                    None => break,
                },
            };

            let mut pending = vec![first];
            while let Ok(name) = self.triggers.try_recv() {
                if !pending.contains(&name) {
                    pending.push(name);
                }
            }

            for name in pending {
                if self.shutdown.is_cancelled() {
                    return;
                }
                self.sync(&name).await;
            }
        }
    }

    async fn sync(&self, name: &str) {
        match self.driver.tracker().is_marked(name) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(name, error = %e, "cannot read sync membership");
                return;
            }
        }
        if !self.driver.registry().is_open(name) {
            return;
        }

        match self.driver.sync(name, &self.shutdown).await {
            Ok(SyncOutcome::Conflict(resolver)) => {
                info!(
                    name,
                    remote_revision = %resolver.remote_revision(),
                    "conflict left for manual resolution"
                );
            }
            Ok(outcome) => debug!(name, ?outcome, "auto-sync finished"),
            Err(SyncError::Busy { .. }) => debug!(name, "already syncing"),
            Err(SyncError::Cancelled) => debug!(name, "auto-sync cancelled"),
            // Logged by the driver.
            Err(_) => {}
        }
    }
}
