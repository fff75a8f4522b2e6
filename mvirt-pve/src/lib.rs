//! Declarative reconciliation of Proxmox VE guests.
//!
//! Callers describe a VM or container as a [`ResourceDescriptor`]; a
//! [`LifecycleController`] creates it, applies in-place changes, and tears it
//! down again through the PVE HTTP API.

pub mod clients;
pub mod config;
pub mod descriptor;
pub mod diff;
pub mod reconciler;
pub mod wait;

pub use clients::{ApiError, ErrorKind, PveApi, PveClient};
pub use config::{ClientConfig, ReconcilePolicy};
pub use descriptor::{ObservedState, ResourceDescriptor, ResourceKind, ResourceRef, ResourceStatus};
pub use reconciler::{LifecycleController, ReconcileError, Reconciler};
