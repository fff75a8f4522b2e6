//! Desired-state descriptors and observed state for Proxmox guests.
//!
//! A [`ResourceDescriptor`] is what the caller wants a guest to look like.
//! An [`ObservedState`] is what the reconciler last applied, plus the run
//! status it read back. The reconciler keeps nothing between calls, so the
//! caller persists `ObservedState` and hands it back on update/delete.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_STORAGE: &str = "local-lvm";

/// Guest type, selecting the `/qemu` or `/lxc` endpoint family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Qemu,
    Lxc,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Qemu => "qemu",
            ResourceKind::Lxc => "lxc",
        }
    }

    /// ID used when a descriptor does not pick one.
    pub fn default_id(&self) -> u32 {
        match self {
            ResourceKind::Qemu => 100,
            ResourceKind::Lxc => 200,
        }
    }

    /// Disk slot that the `disk_size` shorthand maps to.
    pub fn root_disk_slot(&self) -> &'static str {
        match self {
            ResourceKind::Qemu => "scsi0",
            ResourceKind::Lxc => "rootfs",
        }
    }

    pub fn default_disks(&self) -> BTreeMap<String, String> {
        let size = match self {
            ResourceKind::Qemu => 20,
            ResourceKind::Lxc => 8,
        };
        BTreeMap::from([(
            self.root_disk_slot().to_string(),
            format!("{DEFAULT_STORAGE}:{size}"),
        )])
    }

    pub fn default_networks(&self) -> BTreeMap<String, String> {
        let net0 = match self {
            ResourceKind::Qemu => "virtio,bridge=vmbr0",
            ResourceKind::Lxc => "name=eth0,bridge=vmbr0,ip=dhcp",
        };
        BTreeMap::from([("net0".to_string(), net0.to_string())])
    }

    /// Wire key carrying the guest name.
    pub fn name_key(&self) -> &'static str {
        match self {
            ResourceKind::Qemu => "name",
            ResourceKind::Lxc => "hostname",
        }
    }

    pub fn default_name(&self, id: u32) -> String {
        match self {
            ResourceKind::Qemu => format!("vm-{id}"),
            ResourceKind::Lxc => format!("lxc-{id}"),
        }
    }

    /// Containers start after creation unless told otherwise; VMs don't.
    pub fn starts_on_create(&self) -> bool {
        matches!(self, ResourceKind::Lxc)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "qemu" | "vm" => Ok(ResourceKind::Qemu),
            "lxc" | "ct" | "container" => Ok(ResourceKind::Lxc),
            other => Err(format!("unknown guest kind '{other}' (expected qemu or lxc)")),
        }
    }
}

/// Run status as seen by the reconciler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    #[default]
    Unknown,
    Stopped,
    Running,
    Locked,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceStatus::Unknown => "unknown",
            ResourceStatus::Stopped => "stopped",
            ResourceStatus::Running => "running",
            ResourceStatus::Locked => "locked",
        };
        f.write_str(s)
    }
}

/// Identity of one guest on one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub node: String,
    pub kind: ResourceKind,
    pub id: u32,
}

impl ResourceRef {
    pub fn new(node: impl Into<String>, kind: ResourceKind, id: u32) -> Self {
        Self {
            node: node.into(),
            kind,
            id,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.kind, self.id, self.node)
    }
}

/// A parsed `<storage>:<sizeGB>` disk spec.
///
/// Anything after the first `,` in the size segment is treated as disk
/// options and ignored here (`local-lvm:32,ssd=1` is 32 GB on `local-lvm`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub storage: String,
    pub size_gb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiskSpecError {
    #[error("'{0}' is not of the form <storage>:<sizeGB>")]
    Malformed(String),

    #[error("size '{size}' in '{spec}' is not a positive integer")]
    InvalidSize { spec: String, size: String },
}

impl FromStr for DiskSpec {
    type Err = DiskSpecError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (storage, rest) = spec
            .split_once(':')
            .ok_or_else(|| DiskSpecError::Malformed(spec.to_string()))?;
        if storage.is_empty() {
            return Err(DiskSpecError::Malformed(spec.to_string()));
        }

        let size = rest.split(',').next().unwrap_or_default();
        let invalid = || DiskSpecError::InvalidSize {
            spec: spec.to_string(),
            size: size.to_string(),
        };
        if size.is_empty() || !size.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let size_gb: u64 = size.parse().map_err(|_| invalid())?;
        if size_gb == 0 {
            return Err(invalid());
        }

        Ok(DiskSpec {
            storage: storage.to_string(),
            size_gb,
        })
    }
}

/// Errors found while validating a descriptor before any remote call.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("node is required")]
    MissingNode,

    #[error("invalid disk {slot}: {source}")]
    InvalidDisk {
        slot: String,
        #[source]
        source: DiskSpecError,
    },
}

/// Serialize container features to the `key=value,...` wire form.
pub fn features_to_wire(features: &BTreeMap<String, String>) -> String {
    features
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn default_cores() -> u32 {
    1
}

fn default_memory() -> u64 {
    512
}

fn default_swap() -> u64 {
    512
}

fn default_true() -> bool {
    true
}

/// Desired state of one guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    #[serde(default, alias = "vm_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    pub node: String,
    /// Hostname for containers, name for VMs.
    #[serde(default, alias = "hostname", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_cores")]
    pub cores: u32,
    /// Memory in MiB.
    #[serde(default = "default_memory")]
    pub memory: u64,
    /// Swap in MiB (containers only).
    #[serde(default = "default_swap")]
    pub swap: u64,
    #[serde(default)]
    pub disks: BTreeMap<String, String>,
    #[serde(default)]
    pub networks: BTreeMap<String, String>,
    #[serde(default)]
    pub features: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onboot: Option<bool>,
    #[serde(default = "default_true")]
    pub unprivileged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_on_create: Option<bool>,

    // Create-only container settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ostemplate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_keys: Option<String>,

    // Shorthands for a single root disk / single NIC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

impl ResourceDescriptor {
    pub fn new(kind: ResourceKind, node: impl Into<String>) -> Self {
        Self {
            kind,
            id: None,
            node: node.into(),
            name: None,
            cores: default_cores(),
            memory: default_memory(),
            swap: default_swap(),
            disks: BTreeMap::new(),
            networks: BTreeMap::new(),
            features: BTreeMap::new(),
            startup: None,
            onboot: None,
            unprivileged: true,
            start_on_create: None,
            ostemplate: None,
            password: None,
            ssh_public_keys: None,
            disk_size: None,
            network: None,
        }
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// The guest this descriptor addresses, using the kind's default ID when unset.
    pub fn target(&self) -> ResourceRef {
        ResourceRef::new(
            self.node.clone(),
            self.kind,
            self.id.unwrap_or_else(|| self.kind.default_id()),
        )
    }

    /// Fill in every default so two descriptors can be compared field by field.
    ///
    /// Shorthands are folded into `disks`/`networks` and then cleared.
    pub fn normalized(&self) -> Self {
        let mut d = self.clone();
        let id = d.id.unwrap_or_else(|| d.kind.default_id());
        d.id = Some(id);

        if d.name.is_none() {
            d.name = Some(d.kind.default_name(id));
        }

        if d.disks.is_empty() {
            d.disks = match d.disk_size.as_deref() {
                Some(size) => {
                    let size = size.trim().trim_end_matches(['G', 'g']);
                    BTreeMap::from([(
                        d.kind.root_disk_slot().to_string(),
                        format!("{DEFAULT_STORAGE}:{size}"),
                    )])
                }
                None => d.kind.default_disks(),
            };
        }

        if d.networks.is_empty() {
            d.networks = match d.network.as_deref() {
                Some(net) => BTreeMap::from([("net0".to_string(), net.to_string())]),
                None => d.kind.default_networks(),
            };
        }

        d.disk_size = None;
        d.network = None;
        d
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.node.trim().is_empty() {
            return Err(DescriptorError::MissingNode);
        }
        for (slot, spec) in &self.disks {
            spec.parse::<DiskSpec>()
                .map_err(|source| DescriptorError::InvalidDisk {
                    slot: slot.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Copy without secrets, suitable for echoing back as observed state.
    pub fn redacted(&self) -> Self {
        Self {
            password: None,
            ..self.clone()
        }
    }
}

/// What the reconciler last applied to a guest, plus its run status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    pub id: u32,
    #[serde(default)]
    pub status: ResourceStatus,
    pub spec: ResourceDescriptor,
}

impl ObservedState {
    pub fn new(id: u32, status: ResourceStatus, spec: ResourceDescriptor) -> Self {
        Self { id, status, spec }
    }

    pub fn target(&self) -> ResourceRef {
        ResourceRef::new(self.spec.node.clone(), self.spec.kind, self.id)
    }
}
