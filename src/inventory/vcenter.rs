use super::{
    GuestNic, Inventory, InventoryError, InventoryNode, InventorySession, NodeRef, PropertyError,
    VmProperties,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

const SESSION_HEADER: &str = "vmware-api-session-id";
const FOLDER_PREFIX: &str = "folder:";
const VM_PREFIX: &str = "vm:";
const VAPP_PREFIX: &str = "vapp:";

/// Inventory backed by the vSphere Automation REST API.
pub struct VcenterInventory {
    base_url: String,
    user: String,
    password: String,
    verify_tls: bool,
}

impl VcenterInventory {
    pub fn new(url: &str, user: String, password: String, verify_tls: bool) -> Self {
        Self {
            base_url: normalize_base_url(url),
            user,
            password,
            verify_tls,
        }
    }

    fn connect_error(&self, reason: impl ToString) -> InventoryError {
        InventoryError::Connect {
            endpoint: self.base_url.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Inventory for VcenterInventory {
    async fn connect(&self) -> Result<Box<dyn InventorySession>, InventoryError> {
        let http = Client::builder()
            .danger_accept_invalid_certs(!self.verify_tls)
            .build()
            .map_err(|e| self.connect_error(e))?;

        let resp = http
            .post(format!("{}/api/session", self.base_url))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| self.connect_error(e))?;
        if !resp.status().is_success() {
            return Err(self.connect_error(format!("login returned {}", resp.status())));
        }
        let token: String = resp.json().await.map_err(|e| self.connect_error(e))?;

        let mut session = VcenterSession {
            http,
            base_url: self.base_url.clone(),
            token,
            hosts_by_vm: HashMap::new(),
        };
        session.hosts_by_vm = session.load_vm_hosts().await?;
        info!(
            "Connected to vCenter at {} ({} VMs placed on hosts)",
            self.base_url,
            session.hosts_by_vm.len()
        );
        Ok(Box::new(session))
    }
}

struct VcenterSession {
    http: Client,
    base_url: String,
    token: String,
    hosts_by_vm: HashMap<String, String>,
}

impl VcenterSession {
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, InventoryError> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header(SESSION_HEADER, &self.token)
            .query(query)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(InventoryError::Status {
                status: resp.status().as_u16(),
                path: path.to_string(),
            });
        }
        Ok(resp.json().await?)
    }

    async fn load_vm_hosts(&self) -> Result<HashMap<String, String>, InventoryError> {
        let hosts: Vec<HostSummary> = self.get("/api/vcenter/host", &[]).await?;
        let mut map = HashMap::new();
        for host in hosts {
            let vms: Vec<VmSummary> = self
                .get("/api/vcenter/vm", &[("hosts", host.host.as_str())])
                .await?;
            for vm in vms {
                map.insert(vm.vm, host.name.clone());
            }
        }
        Ok(map)
    }

    async fn folder_children(&self, folder: &str) -> Result<Vec<NodeRef>, InventoryError> {
        let folders: Vec<FolderSummary> = self
            .get(
                "/api/vcenter/folder",
                &[("type", "VIRTUAL_MACHINE"), ("parent_folders", folder)],
            )
            .await?;
        let vapps = self.folder_vapps(folder).await?;
        let vms: Vec<VmSummary> = self.get("/api/vcenter/vm", &[("folders", folder)]).await?;
        Ok(child_refs(folders, vapps, vms))
    }

    /// vApps placed directly in `folder`.  Their VMs have no parent folder
    /// and are only reachable through the vApp.
    async fn folder_vapps(&self, folder: &str) -> Result<Vec<VappSummary>, InventoryError> {
        match self
            .get("/api/vcenter/vapp", &[("parent_folders", folder)])
            .await
        {
            // endpoint without vApp support
            Err(InventoryError::Status { status: 404, .. }) => Ok(Vec::new()),
            other => other,
        }
    }

    async fn vapp_members(&self, vapp: &str) -> Result<Vec<VmSummary>, InventoryError> {
        self.get("/api/vcenter/vm", &[("resource_pools", vapp)]).await
    }

    async fn resolve_vm(&self, vm: &str) -> VmProperties {
        let detail: Result<VmInfo, String> = self
            .get(&format!("/api/vcenter/vm/{}", vm), &[])
            .await
            .map_err(|e| e.to_string());
        if let Err(e) = &detail {
            warn!("Failed to read details for {}: {}", vm, e);
        }

        let interfaces: Vec<GuestInterface> = match self
            .get(&format!("/api/vcenter/vm/{}/guest/networking/interfaces", vm), &[])
            .await
        {
            Ok(interfaces) => interfaces,
            Err(e) => {
                // Guest tools not running, VM powered off, ...
                debug!("No guest networking for {}: {}", vm, e);
                Vec::new()
            }
        };

        vm_properties(detail, interfaces, self.hosts_by_vm.get(vm).cloned())
    }
}

#[async_trait]
impl InventorySession for VcenterSession {
    async fn root(&mut self) -> Result<Vec<NodeRef>, InventoryError> {
        let datacenters: Vec<DatacenterSummary> =
            self.get("/api/vcenter/datacenter", &[]).await?;

        let mut roots = Vec::new();
        for dc in datacenters {
            let info: DatacenterInfo = self
                .get(&format!("/api/vcenter/datacenter/{}", dc.datacenter), &[])
                .await?;
            debug!("Datacenter {} keeps VMs under {}", dc.name, info.vm_folder);
            roots.extend(self.folder_children(&info.vm_folder).await?);
        }
        Ok(roots)
    }

    async fn resolve(&mut self, node: &NodeRef) -> Result<InventoryNode, InventoryError> {
        if let Some(folder) = node.as_str().strip_prefix(FOLDER_PREFIX) {
            let children = self.folder_children(folder).await?;
            return Ok(InventoryNode::Container {
                name: folder.to_string(),
                children,
            });
        }
        if let Some(vapp) = node.as_str().strip_prefix(VAPP_PREFIX) {
            let members = self.vapp_members(vapp).await?;
            return Ok(vapp_group(vapp, members));
        }
        if let Some(vm) = node.as_str().strip_prefix(VM_PREFIX) {
            return Ok(InventoryNode::Vm(self.resolve_vm(vm).await));
        }
        Err(InventoryError::UnknownNode(node.clone()))
    }

    async fn disconnect(self: Box<Self>) -> Result<(), InventoryError> {
        let resp = self
            .http
            .delete(format!("{}/api/session", self.base_url))
            .header(SESSION_HEADER, &self.token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(InventoryError::Status {
                status: resp.status().as_u16(),
                path: "/api/session".into(),
            });
        }
        Ok(())
    }
}

fn normalize_base_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

/// Child references of a VM folder: subfolders, then vApps, then VMs.
fn child_refs(
    folders: Vec<FolderSummary>,
    vapps: Vec<VappSummary>,
    vms: Vec<VmSummary>,
) -> Vec<NodeRef> {
    folders
        .into_iter()
        .map(|f| NodeRef::new(format!("{}{}", FOLDER_PREFIX, f.folder)))
        .chain(
            vapps
                .into_iter()
                .map(|v| NodeRef::new(format!("{}{}", VAPP_PREFIX, v.vapp))),
        )
        .chain(vm_refs(vms))
        .collect()
}

fn vm_refs(vms: Vec<VmSummary>) -> impl Iterator<Item = NodeRef> {
    vms.into_iter()
        .map(|vm| NodeRef::new(format!("{}{}", VM_PREFIX, vm.vm)))
}

fn vapp_group(vapp: &str, members: Vec<VmSummary>) -> InventoryNode {
    InventoryNode::VirtualAppGroup {
        name: vapp.to_string(),
        members: vm_refs(members).collect(),
    }
}

/// Maps the REST views of one VM onto [`VmProperties`].
fn vm_properties(
    detail: Result<VmInfo, String>,
    interfaces: Vec<GuestInterface>,
    host: Option<String>,
) -> VmProperties {
    let unavailable = |field: &'static str, reason: &String| PropertyError::Unavailable {
        field,
        reason: reason.clone(),
    };

    let (name, vm_path_name) = match &detail {
        Ok(info) => (
            info.name.clone().ok_or(PropertyError::Missing("name")),
            info.disks
                .values()
                .find_map(|d| d.backing.as_ref().and_then(|b| b.vmdk_file.clone()))
                .ok_or(PropertyError::Missing("vm_path_name")),
        ),
        Err(reason) => (
            Err(unavailable("name", reason)),
            Err(unavailable("vm_path_name", reason)),
        ),
    };

    let nics = interfaces
        .into_iter()
        .map(|iface| {
            let network = match &detail {
                Ok(info) => iface
                    .nic
                    .as_ref()
                    .and_then(|key| info.nics.get(key))
                    .and_then(|nic| nic.backing.as_ref())
                    .and_then(|b| b.network_name.clone().or_else(|| b.network.clone()))
                    .ok_or(PropertyError::Missing("network")),
                Err(reason) => Err(unavailable("network", reason)),
            };
            let ip_addresses = iface
                .ip
                .map(|ip| ip.ip_addresses.into_iter().map(|a| a.ip_address).collect())
                .unwrap_or_default();
            GuestNic {
                network,
                ip_addresses,
            }
        })
        .collect();

    VmProperties {
        name,
        vm_path_name,
        host_name: host.ok_or(PropertyError::Missing("host")),
        nics,
    }
}

#[derive(Debug, Deserialize)]
struct DatacenterSummary {
    datacenter: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DatacenterInfo {
    vm_folder: String,
}

#[derive(Debug, Deserialize)]
struct FolderSummary {
    folder: String,
}

#[derive(Debug, Deserialize)]
struct HostSummary {
    host: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct VappSummary {
    vapp: String,
}

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
}

#[derive(Debug, Default, Deserialize)]
struct VmInfo {
    name: Option<String>,
    #[serde(default)]
    disks: BTreeMap<String, VmDisk>,
    #[serde(default)]
    nics: BTreeMap<String, VmNic>,
}

#[derive(Debug, Deserialize)]
struct VmDisk {
    backing: Option<DiskBacking>,
}

#[derive(Debug, Deserialize)]
struct DiskBacking {
    vmdk_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VmNic {
    backing: Option<NicBacking>,
}

#[derive(Debug, Deserialize)]
struct NicBacking {
    network: Option<String>,
    network_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GuestInterface {
    nic: Option<String>,
    ip: Option<GuestIpConfig>,
}

#[derive(Debug, Deserialize)]
struct GuestIpConfig {
    #[serde(default)]
    ip_addresses: Vec<GuestIpAddress>,
}

#[derive(Debug, Deserialize)]
struct GuestIpAddress {
    ip_address: String,
}
