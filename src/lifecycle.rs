//! Lifecycle of the two worker loops.
//!
//! [`Lifecycle`] is the cooperative stop token both loops observe at their
//! cycle boundaries.  [`Annotator`] owns the shared store and history,
//! spawns the loops and joins them on shutdown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join;
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::asset::AssetSink;
use crate::discovery::{run_discovery, DiscoveryError, DiscoverySettings};
use crate::history::UploadHistory;
use crate::inventory::Inventory;
use crate::publish::{run_publish, PublishSettings};
use crate::store::AnnotationStore;

/// Two-state stop token: running until [`Lifecycle::request_stop`], running
/// again after [`Lifecycle::reset`].
#[derive(Debug, Default)]
pub struct Lifecycle {
    token: Mutex<CancellationToken>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> CancellationToken {
        match self.token.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Token handed to a worker loop.
    pub fn token(&self) -> CancellationToken {
        self.current()
    }

    pub fn request_stop(&self) {
        self.current().cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.current().is_cancelled()
    }

    /// Replaces a stopped token with a fresh one.  Loops still holding the
    /// old token keep seeing it stopped.
    pub fn reset(&self) {
        let mut guard = match self.token.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_cancelled() {
            *guard = CancellationToken::new();
        }
    }
}

/// Sleeps for `duration`, waking early on a stop request.
///
/// Returns true when the loop should exit.
pub async fn pause(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
    shutdown.is_cancelled()
}

#[derive(Default)]
struct Workers {
    discovery: Option<JoinHandle<Result<(), DiscoveryError>>>,
    publish: Option<JoinHandle<()>>,
}

/// Owns the annotation pipeline: discovery → store → publish.
pub struct Annotator {
    inventory: Arc<dyn Inventory>,
    sink: Arc<dyn AssetSink>,
    discovery: DiscoverySettings,
    publish: PublishSettings,
    store: AnnotationStore,
    history: Arc<UploadHistory>,
    lifecycle: Lifecycle,
    workers: Workers,
}

impl Annotator {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        sink: Arc<dyn AssetSink>,
        discovery: DiscoverySettings,
        publish: PublishSettings,
        history_capacity: usize,
    ) -> Self {
        Self {
            inventory,
            sink,
            discovery,
            publish,
            store: AnnotationStore::new(),
            history: Arc::new(UploadHistory::new(history_capacity)),
            lifecycle: Lifecycle::new(),
            workers: Workers::default(),
        }
    }

    pub fn history(&self) -> &UploadHistory {
        &self.history
    }

    /// Spawns both loops.  Calling `start` while the loops are running is a
    /// no-op.
    pub fn start(&mut self) {
        if self.workers.discovery.is_some() || self.workers.publish.is_some() {
            warn!("Annotator already running");
            return;
        }
        self.lifecycle.reset();

        let discovery = tokio::spawn(run_discovery(
            Arc::clone(&self.inventory),
            self.store.clone(),
            self.discovery.clone(),
            self.lifecycle.token(),
        ));
        let publish = tokio::spawn(run_publish(
            Arc::clone(&self.sink),
            self.store.clone(),
            Arc::clone(&self.history),
            self.publish.clone(),
            self.lifecycle.token(),
        ));
        self.workers = Workers {
            discovery: Some(discovery),
            publish: Some(publish),
        };
        info!("Annotator started");
    }

    /// Resolves once the discovery loop has ended, surfacing its fault.
    ///
    /// Pends forever when discovery is not running, so it can sit in a
    /// `select!` next to a shutdown signal.
    pub async fn wait_discovery(&mut self) -> Result<(), DiscoveryError> {
        let Some(handle) = self.workers.discovery.as_mut() else {
            return std::future::pending().await;
        };
        let joined = handle.await;
        self.workers.discovery = None;
        match joined {
            Ok(result) => result,
            Err(e) => Err(DiscoveryError::Task(e)),
        }
    }

    /// Stops both loops and waits up to `timeout` for them to finish.
    ///
    /// Loops still running when the timeout expires are aborted.  Annotations
    /// not yet published are discarded.
    pub async fn shutdown(&mut self, timeout: Duration) {
        let idle = self.workers.discovery.is_none() && self.workers.publish.is_none();
        if idle && self.lifecycle.is_stopped() {
            return;
        }
        self.lifecycle.request_stop();

        let mut discovery = self.workers.discovery.take();
        let mut publish = self.workers.publish.take();

        let settled = tokio::time::timeout(
            timeout,
            join(settle_discovery(&mut discovery), settle_publish(&mut publish)),
        )
        .await;
        if settled.is_err() {
            warn!("Workers did not stop within {:?}, aborting", timeout);
            if let Some(handle) = &discovery {
                handle.abort();
            }
            if let Some(handle) = &publish {
                handle.abort();
            }
            // aborted tasks release their inventory session while unwinding
            join(settle_discovery(&mut discovery), settle_publish(&mut publish)).await;
        }

        let pending = self.store.snapshot_and_clear().await;
        if !pending.is_empty() {
            warn!("Discarding {} unpublished annotations", pending.len());
        }
        info!("Annotator stopped");
    }
}

/// Waits for the discovery task, if still held, and logs how it ended.
async fn settle_discovery(handle: &mut Option<JoinHandle<Result<(), DiscoveryError>>>) {
    let Some(task) = handle.as_mut() else {
        return;
    };
    let joined = task.await;
    *handle = None;
    match joined {
        Ok(Err(e)) => error!("Discovery loop ended with error: {}", e),
        Err(e) if !e.is_cancelled() => error!("Discovery task failed: {}", e),
        _ => {}
    }
}

async fn settle_publish(handle: &mut Option<JoinHandle<()>>) {
    let Some(task) = handle.as_mut() else {
        return;
    };
    let joined = task.await;
    *handle = None;
    if let Err(e) = joined {
        if !e.is_cancelled() {
            error!("Publish task failed: {}", e);
        }
    }
}
