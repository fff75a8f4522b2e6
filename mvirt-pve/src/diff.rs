//! Minimal change sets between an applied descriptor and a desired one.
//!
//! Disk changes never travel through the config endpoint: each grown slot
//! becomes its own resize call. Everything else that changed is collected
//! into one config update.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::clients::Params;
use crate::descriptor::{DiskSpec, DiskSpecError, ResourceDescriptor, ResourceKind, features_to_wire};

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("{field} cannot change after creation ({old} -> {new})")]
    Immutable {
        field: &'static str,
        old: String,
        new: String,
    },

    #[error("invalid disk {slot}: {source}")]
    InvalidDisk {
        slot: String,
        #[source]
        source: DiskSpecError,
    },

    #[error("disk {slot} cannot shrink from {old}G to {new}G")]
    Shrink { slot: String, old: u64, new: u64 },

    #[error("disk {slot} cannot move from storage {old} to {new}")]
    StorageMove {
        slot: String,
        old: String,
        new: String,
    },
}

pub type Result<T> = std::result::Result<T, DiffError>;

/// One changed non-disk field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    Name(String),
    Cores(u32),
    Memory(u64),
    Swap(u64),
    Network { slot: String, spec: String },
    Features(BTreeMap<String, String>),
    Startup(String),
    OnBoot(bool),
    /// Remove a key from the guest config.
    Delete(String),
}

/// Changes for the generic config-update call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSet {
    changes: Vec<ConfigChange>,
}

impl UpdateSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &[ConfigChange] {
        &self.changes
    }

    /// Form parameters for `PUT .../config`. Removals are joined into `delete`.
    pub fn to_params(&self, kind: ResourceKind) -> Params {
        let mut params = Params::new();
        let mut deletes = Vec::new();

        for change in &self.changes {
            match change {
                ConfigChange::Name(name) => {
                    params.insert(kind.name_key().to_string(), name.clone());
                }
                ConfigChange::Cores(cores) => {
                    params.insert("cores".to_string(), cores.to_string());
                }
                ConfigChange::Memory(memory) => {
                    params.insert("memory".to_string(), memory.to_string());
                }
                ConfigChange::Swap(swap) => {
                    params.insert("swap".to_string(), swap.to_string());
                }
                ConfigChange::Network { slot, spec } => {
                    params.insert(slot.clone(), spec.clone());
                }
                ConfigChange::Features(features) => {
                    params.insert("features".to_string(), features_to_wire(features));
                }
                ConfigChange::Startup(startup) => {
                    params.insert("startup".to_string(), startup.clone());
                }
                ConfigChange::OnBoot(onboot) => {
                    params.insert("onboot".to_string(), u8::from(*onboot).to_string());
                }
                ConfigChange::Delete(key) => deletes.push(key.as_str()),
            }
        }

        if !deletes.is_empty() {
            params.insert("delete".to_string(), deletes.join(","));
        }
        params
    }
}

/// A disk slot to grow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskResize {
    pub slot: String,
    pub disk: DiskSpec,
    /// Spec to report for the slot once the resize went through. For an
    /// existing slot this keeps the previous options and only swaps the size.
    pub applied: String,
}

impl DiskResize {
    /// Form parameters for `PUT .../resize`.
    pub fn to_params(&self) -> Params {
        Params::from([
            ("disk".to_string(), self.slot.clone()),
            ("size".to_string(), format!("{}G", self.disk.size_gb)),
        ])
    }
}

pub type ResizeSet = Vec<DiskResize>;

/// Result of comparing two descriptors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub updates: UpdateSet,
    pub resizes: ResizeSet,
    /// Disk slots present before but missing now. Detaching is not managed.
    pub detached: Vec<String>,
    /// Slots whose spec text changed without a size change (disk options).
    /// Nothing is sent for them and the previous spec stays applied.
    pub unchanged_size: Vec<String>,
}

impl Diff {
    /// Nothing to send.
    pub fn is_noop(&self) -> bool {
        self.updates.is_empty() && self.resizes.is_empty()
    }
}

/// Compare two normalized descriptors of the same guest.
pub fn diff(old: &ResourceDescriptor, new: &ResourceDescriptor) -> Result<Diff> {
    check_immutable(old, new)?;

    let DiskDiff {
        resizes,
        detached,
        unchanged_size,
    } = diff_disks(&old.disks, &new.disks)?;
    let mut changes = Vec::new();

    if new.name != old.name {
        if let Some(name) = &new.name {
            changes.push(ConfigChange::Name(name.clone()));
        }
    }
    if new.cores != old.cores {
        changes.push(ConfigChange::Cores(new.cores));
    }
    if new.memory != old.memory {
        changes.push(ConfigChange::Memory(new.memory));
    }
    if new.kind == ResourceKind::Lxc && new.swap != old.swap {
        changes.push(ConfigChange::Swap(new.swap));
    }

    for (slot, spec) in &new.networks {
        if old.networks.get(slot) != Some(spec) {
            changes.push(ConfigChange::Network {
                slot: slot.clone(),
                spec: spec.clone(),
            });
        }
    }
    for slot in old.networks.keys() {
        if !new.networks.contains_key(slot) {
            changes.push(ConfigChange::Delete(slot.clone()));
        }
    }

    if new.kind == ResourceKind::Lxc && new.features != old.features {
        if new.features.is_empty() {
            changes.push(ConfigChange::Delete("features".to_string()));
        } else {
            changes.push(ConfigChange::Features(new.features.clone()));
        }
    }

    if new.startup != old.startup {
        match &new.startup {
            Some(startup) => changes.push(ConfigChange::Startup(startup.clone())),
            None => changes.push(ConfigChange::Delete("startup".to_string())),
        }
    }
    if new.onboot != old.onboot {
        match new.onboot {
            Some(onboot) => changes.push(ConfigChange::OnBoot(onboot)),
            None => changes.push(ConfigChange::Delete("onboot".to_string())),
        }
    }

    Ok(Diff {
        updates: UpdateSet { changes },
        resizes,
        detached,
        unchanged_size,
    })
}

fn check_immutable(old: &ResourceDescriptor, new: &ResourceDescriptor) -> Result<()> {
    if old.kind != new.kind {
        return Err(DiffError::Immutable {
            field: "kind",
            old: old.kind.to_string(),
            new: new.kind.to_string(),
        });
    }
    if old.node != new.node {
        return Err(DiffError::Immutable {
            field: "node",
            old: old.node.clone(),
            new: new.node.clone(),
        });
    }
    if let (Some(old_id), Some(new_id)) = (old.id, new.id) {
        if old_id != new_id {
            return Err(DiffError::Immutable {
                field: "id",
                old: old_id.to_string(),
                new: new_id.to_string(),
            });
        }
    }
    if new.kind == ResourceKind::Lxc && old.unprivileged != new.unprivileged {
        return Err(DiffError::Immutable {
            field: "unprivileged",
            old: old.unprivileged.to_string(),
            new: new.unprivileged.to_string(),
        });
    }
    Ok(())
}

struct DiskDiff {
    resizes: ResizeSet,
    detached: Vec<String>,
    unchanged_size: Vec<String>,
}

/// `spec` with its size segment replaced, options kept.
fn with_size(spec: &str, size_gb: u64) -> String {
    let (storage, rest) = spec.split_once(':').unwrap_or((spec, ""));
    match rest.split_once(',') {
        Some((_, options)) => format!("{storage}:{size_gb},{options}"),
        None => format!("{storage}:{size_gb}"),
    }
}

fn diff_disks(
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) -> Result<DiskDiff> {
    let mut resizes = Vec::new();
    let mut unchanged_size = Vec::new();

    for (slot, spec) in new {
        let previous = old.get(slot);
        if previous == Some(spec) {
            continue;
        }

        let disk: DiskSpec = spec.parse().map_err(|source| DiffError::InvalidDisk {
            slot: slot.clone(),
            source,
        })?;

        let Some(previous) = previous else {
            resizes.push(DiskResize {
                slot: slot.clone(),
                disk,
                applied: spec.clone(),
            });
            continue;
        };

        // An unparsable previous spec gives nothing to compare against.
        let Ok(prev) = previous.parse::<DiskSpec>() else {
            resizes.push(DiskResize {
                slot: slot.clone(),
                applied: spec.clone(),
                disk,
            });
            continue;
        };

        if disk.storage != prev.storage {
            return Err(DiffError::StorageMove {
                slot: slot.clone(),
                old: prev.storage,
                new: disk.storage,
            });
        }
        if disk.size_gb < prev.size_gb {
            return Err(DiffError::Shrink {
                slot: slot.clone(),
                old: prev.size_gb,
                new: disk.size_gb,
            });
        }
        if disk.size_gb == prev.size_gb {
            unchanged_size.push(slot.clone());
            continue;
        }

        resizes.push(DiskResize {
            slot: slot.clone(),
            applied: with_size(previous, disk.size_gb),
            disk,
        });
    }

    let detached = old
        .keys()
        .filter(|slot| !new.contains_key(*slot))
        .cloned()
        .collect();

    Ok(DiskDiff {
        resizes,
        detached,
        unchanged_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> ResourceDescriptor {
        let mut d = ResourceDescriptor::new(ResourceKind::Lxc, "pve").with_id(215);
        d.name = Some("new-test-lxc".into());
        d.cores = 2;
        d.memory = 2024;
        d.features.insert("nesting".into(), "1".into());
        d.startup = Some("order=0".into());
        d.onboot = Some(true);
        d.disks.insert("rootfs".into(), "local-lvm:12".into());
        d.normalized()
    }

    #[test]
    fn test_identical_descriptors_are_noop() {
        let d = container();
        let diff = diff(&d, &d.clone()).unwrap();
        assert!(diff.is_noop());
        assert!(diff.updates.is_empty());
        assert!(diff.resizes.is_empty());
        assert!(diff.detached.is_empty());
    }

    #[test]
    fn test_cores_only_change() {
        let old = container();
        let mut new = old.clone();
        new.cores = 3;

        let diff = diff(&old, &new).unwrap();
        assert_eq!(diff.updates.changes(), &[ConfigChange::Cores(3)]);
        assert!(diff.resizes.is_empty());

        let params = diff.updates.to_params(ResourceKind::Lxc);
        assert_eq!(params.len(), 1);
        assert_eq!(params["cores"], "3");
    }

    #[test]
    fn test_disk_growth_goes_to_resize_set_only() {
        let old = container();
        let mut new = old.clone();
        new.disks.insert("rootfs".into(), "local-lvm:20".into());

        let diff = diff(&old, &new).unwrap();
        assert!(diff.updates.is_empty());
        assert_eq!(diff.resizes.len(), 1);
        assert_eq!(diff.resizes[0].slot, "rootfs");
        assert_eq!(diff.resizes[0].disk.size_gb, 20);

        let params = diff.resizes[0].to_params();
        assert_eq!(params["disk"], "rootfs");
        assert_eq!(params["size"], "20G");
    }

    #[test]
    fn test_new_disk_slot_is_resized_and_removed_slot_detached() {
        let mut old = container();
        old.disks.insert("mp1".into(), "local-lvm:4".into());
        let mut new = container();
        new.disks.insert("mp0".into(), "local-lvm:8".into());

        let diff = diff(&old, &new).unwrap();
        assert_eq!(diff.resizes.len(), 1);
        assert_eq!(diff.resizes[0].slot, "mp0");
        assert_eq!(diff.detached, vec!["mp1".to_string()]);
    }

    #[test]
    fn test_disk_shrink_is_rejected() {
        let old = container();
        let mut new = old.clone();
        new.disks.insert("rootfs".into(), "local-lvm:8".into());

        let err = diff(&old, &new).unwrap_err();
        assert!(matches!(err, DiffError::Shrink { old: 12, new: 8, .. }));
    }

    #[test]
    fn test_invalid_disk_size_fails_validation() {
        let old = container();
        let mut new = old.clone();
        new.disks.insert("rootfs".into(), "local-lvm:12G".into());

        let err = diff(&old, &new).unwrap_err();
        assert!(matches!(err, DiffError::InvalidDisk { ref slot, .. } if slot == "rootfs"));
    }

    #[test]
    fn test_features_reserialized_and_cleared() {
        let old = container();
        let mut new = old.clone();
        new.features.insert("keyctl".into(), "1".into());

        let params = diff(&old, &new).unwrap().updates.to_params(ResourceKind::Lxc);
        assert_eq!(params["features"], "keyctl=1,nesting=1");

        new.features.clear();
        let params = diff(&old, &new).unwrap().updates.to_params(ResourceKind::Lxc);
        assert_eq!(params["delete"], "features");
        assert!(!params.contains_key("features"));
    }

    #[test]
    fn test_network_changes_and_removals() {
        let mut old = container();
        old.networks.insert("net1".into(), "name=eth1,bridge=vmbr1".into());
        let mut new = container();
        new.networks
            .insert("net0".into(), "name=eth0,bridge=vmbr2,ip=dhcp".into());
        new.startup = None;

        let params = diff(&old, &new).unwrap().updates.to_params(ResourceKind::Lxc);
        assert_eq!(params["net0"], "name=eth0,bridge=vmbr2,ip=dhcp");
        assert_eq!(params["delete"], "net1,startup");
    }

    #[test]
    fn test_name_and_onboot_wire_keys() {
        let old = container();
        let mut new = old.clone();
        new.name = Some("renamed".into());
        new.onboot = Some(false);

        let params = diff(&old, &new).unwrap().updates.to_params(ResourceKind::Lxc);
        assert_eq!(params["hostname"], "renamed");
        assert_eq!(params["onboot"], "0");
    }

    #[test]
    fn test_vm_ignores_swap_and_features() {
        let old = ResourceDescriptor::new(ResourceKind::Qemu, "pve")
            .with_id(100)
            .normalized();
        let mut new = old.clone();
        new.swap = 2048;
        new.features.insert("nesting".into(), "1".into());
        new.name = Some("db".into());

        let diff = diff(&old, &new).unwrap();
        assert_eq!(diff.updates.changes(), &[ConfigChange::Name("db".into())]);
        assert_eq!(diff.updates.to_params(ResourceKind::Qemu)["name"], "db");
    }

    #[test]
    fn test_immutable_fields_rejected() {
        let old = container();

        let mut new = old.clone();
        new.node = "pve2".into();
        assert!(matches!(
            diff(&old, &new),
            Err(DiffError::Immutable { field: "node", .. })
        ));

        let mut new = old.clone();
        new.unprivileged = false;
        assert!(matches!(
            diff(&old, &new),
            Err(DiffError::Immutable { field: "unprivileged", .. })
        ));

        let mut new = old.clone();
        new.id = Some(216);
        assert!(matches!(
            diff(&old, &new),
            Err(DiffError::Immutable { field: "id", .. })
        ));
    }

    #[test]
    fn test_disk_storage_move_is_rejected() {
        let old = container();
        let mut new = old.clone();
        new.disks.insert("rootfs".into(), "ceph:12,ssd=1".into());

        let err = diff(&old, &new).unwrap_err();
        assert!(matches!(
            err,
            DiffError::StorageMove { ref old, ref new, .. } if old == "local-lvm" && new == "ceph"
        ));
    }

    #[test]
    fn test_disk_option_change_sends_nothing() {
        let old = container();
        let mut new = old.clone();
        new.disks.insert("rootfs".into(), "local-lvm:12,ssd=1".into());

        let diff = diff(&old, &new).unwrap();
        assert!(diff.is_noop());
        assert_eq!(diff.unchanged_size, vec!["rootfs".to_string()]);
    }

    #[test]
    fn test_growth_keeps_previous_options() {
        let mut old = container();
        old.disks.insert("rootfs".into(), "local-lvm:12,ssd=1".into());
        let mut new = old.clone();
        new.disks.insert("rootfs".into(), "local-lvm:16,backup=0".into());
        new.disks.insert("mp0".into(), "local-lvm:4,backup=0".into());

        let diff = diff(&old, &new).unwrap();
        let applied: Vec<(&str, &str)> = diff
            .resizes
            .iter()
            .map(|r| (r.slot.as_str(), r.applied.as_str()))
            .collect();
        assert_eq!(
            applied,
            vec![("mp0", "local-lvm:4,backup=0"), ("rootfs", "local-lvm:16,ssd=1")]
        );
    }
}
