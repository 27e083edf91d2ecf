//! Discovery loop.
//!
//! Each cycle opens an inventory session, walks the VM tree and upserts one
//! [`AnnotationRecord`] per assigned IP address.  A stop request is honoured
//! only between cycles; a walk in progress always runs to completion.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::inventory::{
    Inventory, InventoryError, InventoryNode, InventorySession, NodeRef, Property, PropertyError,
    VmProperties,
};
use crate::lifecycle::pause;
use crate::store::AnnotationStore;
use crate::types::AnnotationRecord;

/// Default maximum nesting depth visited during a walk.
pub const DEFAULT_MAX_DEPTH: usize = 10;

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub frequency: Duration,
    pub max_depth: usize,
}

impl From<&Config> for DiscoverySettings {
    fn from(cfg: &Config) -> Self {
        Self {
            frequency: Duration::from_secs(cfg.frequency_secs),
            max_depth: cfg.max_depth,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The endpoint could not be reached or the walk itself failed.
    #[error("inventory connectivity fault: {0}")]
    Connectivity(#[from] InventoryError),
    #[error("discovery task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Counters for one completed walk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkStats {
    pub vms: usize,
    pub records: usize,
}

/// Runs discovery until `shutdown` is cancelled.
///
/// Connectivity faults end the loop with an error; per-field faults are
/// absorbed into null fields.
pub async fn run_discovery(
    inventory: Arc<dyn Inventory>,
    store: AnnotationStore,
    settings: DiscoverySettings,
    shutdown: CancellationToken,
) -> Result<(), DiscoveryError> {
    info!("Collecting existing VM inventory data...");

    loop {
        info!("Searching for VMs");
        let stats = discover_once(inventory.as_ref(), &store, settings.max_depth).await?;
        info!(
            "Discovery pass complete: {} VMs, {} annotations ({} pending upload)",
            stats.vms,
            stats.records,
            store.len().await
        );

        if pause(settings.frequency, &shutdown).await {
            info!("Cleaning up discovery loop");
            return Ok(());
        }
    }
}

/// One full discovery cycle: connect, walk, disconnect.
pub async fn discover_once(
    inventory: &dyn Inventory,
    store: &AnnotationStore,
    max_depth: usize,
) -> Result<WalkStats, DiscoveryError> {
    let mut open = OpenSession(Some(inventory.connect().await?));
    let walked = match open.0.as_deref_mut() {
        Some(session) => walk(session, store, max_depth).await,
        None => Ok(WalkStats::default()),
    };
    open.close().await;

    match walked {
        Ok(stats) => Ok(stats),
        Err(e) => {
            error!("Inventory walk failed: {}", e);
            Err(e.into())
        }
    }
}

/// Inventory session that is closed even when the discovery task is
/// aborted mid-walk.
struct OpenSession(Option<Box<dyn InventorySession>>);

impl OpenSession {
    async fn close(mut self) {
        if let Some(session) = self.0.take() {
            if let Err(e) = session.disconnect().await {
                warn!("Failed to disconnect from inventory: {}", e);
            }
        }
    }
}

impl Drop for OpenSession {
    fn drop(&mut self) {
        let Some(session) = self.0.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!("Discovery interrupted, closing inventory session");
                runtime.spawn(async move {
                    if let Err(e) = session.disconnect().await {
                        warn!("Failed to disconnect from inventory: {}", e);
                    }
                });
            }
            Err(_) => warn!("Discovery interrupted, inventory session left open"),
        }
    }
}

/// Visits every node reachable from the session root down to `max_depth`.
///
/// Root entries sit at depth 1.  Nodes deeper than `max_depth` are skipped
/// without being resolved, which also bounds any cycle in the inventory.
pub async fn walk(
    session: &mut dyn InventorySession,
    store: &AnnotationStore,
    max_depth: usize,
) -> Result<WalkStats, InventoryError> {
    let mut stats = WalkStats::default();
    let mut stack: Vec<(NodeRef, usize)> = session
        .root()
        .await?
        .into_iter()
        .rev()
        .map(|node| (node, 1))
        .collect();

    while let Some((node, depth)) = stack.pop() {
        if depth > max_depth {
            debug!("Skipping {} beyond depth {}", node.as_str(), max_depth);
            continue;
        }

        match session.resolve(&node).await? {
            InventoryNode::Container { name, children } => {
                debug!("Entering {} ({} children)", name, children.len());
                stack.extend(children.into_iter().rev().map(|c| (c, depth + 1)));
            }
            InventoryNode::VirtualAppGroup { name, members } => {
                debug!("Entering app group {} ({} members)", name, members.len());
                stack.extend(members.into_iter().rev().map(|m| (m, depth + 1)));
            }
            InventoryNode::Vm(vm) => {
                stats.vms += 1;
                for record in vm_records(node.as_str(), vm) {
                    store.upsert(record).await;
                    stats.records += 1;
                }
            }
        }
    }

    Ok(stats)
}

/// Builds one record per assigned IP of the VM.
pub fn vm_records(vm_ref: &str, vm: VmProperties) -> Vec<AnnotationRecord> {
    let name = extract(vm_ref, "name", vm.name);
    let host = extract(vm_ref, "host", vm.host_name);
    let datastore = extract(
        vm_ref,
        "datastore",
        vm.vm_path_name.and_then(|path| {
            parse_datastore(&path).ok_or(PropertyError::Malformed {
                field: "vm_path_name",
                value: path,
            })
        }),
    );

    let mut records = Vec::new();
    for nic in vm.nics {
        if nic.ip_addresses.is_empty() {
            continue;
        }
        let port_group = extract(vm_ref, "port_group", nic.network);
        for ip in nic.ip_addresses {
            records.push(AnnotationRecord {
                ip,
                name: name.clone(),
                host: host.clone(),
                datastore: datastore.clone(),
                port_group: port_group.clone(),
            });
        }
    }
    records
}

/// Turns a per-field fault into a null value.
fn extract<T>(vm_ref: &str, field: &str, value: Property<T>) -> Option<T> {
    match value {
        Ok(v) => Some(v),
        Err(e) => {
            debug!("{}: {} unavailable: {}", vm_ref, field, e);
            None
        }
    }
}

/// Datastore name from a path such as `[ds1] web1/web1.vmx`.
pub fn parse_datastore(path: &str) -> Option<String> {
    let rest = path.trim_start().strip_prefix('[')?;
    let end = rest.find(']')?;
    Some(rest[..end].to_string())
}
