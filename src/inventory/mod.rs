//! Read-only view of the virtualization inventory.
//!
//! Discovery opens one [`InventorySession`] per cycle, asks it for the
//! top-level entries and resolves references lazily while walking.  Nodes
//! only hand out references to their children, so a collaborator may
//! expose a graph with cycles; the walker bounds its own depth.

use async_trait::async_trait;
use thiserror::Error;

pub mod vcenter;
pub use vcenter::VcenterInventory;

/// Opaque handle to an inventory object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef(pub String);

impl NodeRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A resolved inventory object.
#[derive(Debug, Clone)]
pub enum InventoryNode {
    /// Folder-like node; recurse into every child.
    Container { name: String, children: Vec<NodeRef> },
    /// Group of member VMs.
    VirtualAppGroup { name: String, members: Vec<NodeRef> },
    Vm(VmProperties),
}

/// Outcome of reading one attribute of one VM.
pub type Property<T> = Result<T, PropertyError>;

#[derive(Debug, Clone)]
pub struct VmProperties {
    pub name: Property<String>,
    /// Structured path such as `[ds1] web1/web1.vmx`.
    pub vm_path_name: Property<String>,
    pub host_name: Property<String>,
    pub nics: Vec<GuestNic>,
}

#[derive(Debug, Clone)]
pub struct GuestNic {
    pub network: Property<String>,
    pub ip_addresses: Vec<String>,
}

/// Failure to read a single VM attribute.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropertyError {
    #[error("property {0} is not set")]
    Missing(&'static str),
    #[error("property {field} has unexpected value {value:?}")]
    Malformed { field: &'static str, value: String },
    #[error("failed to read property {field}: {reason}")]
    Unavailable { field: &'static str, reason: String },
}

/// Connectivity-level failure talking to the inventory.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("inventory request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("inventory returned status {status} for {path}")]
    Status { status: u16, path: String },
    #[error("unknown inventory node {0:?}")]
    UnknownNode(NodeRef),
}

#[async_trait]
pub trait Inventory: Send + Sync {
    /// Opens a session against the virtualization endpoint.
    async fn connect(&self) -> Result<Box<dyn InventorySession>, InventoryError>;
}

#[async_trait]
pub trait InventorySession: Send {
    /// Top-level VM inventory entries.
    async fn root(&mut self) -> Result<Vec<NodeRef>, InventoryError>;

    async fn resolve(&mut self, node: &NodeRef) -> Result<InventoryNode, InventoryError>;

    async fn disconnect(self: Box<Self>) -> Result<(), InventoryError>;
}
