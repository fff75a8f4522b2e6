//! Reconcilers for Proxmox guests.
//!
//! A reconciler takes a desired descriptor (and, for changes, the state it
//! last produced) and drives the remote guest toward it.

pub mod error;
pub mod lifecycle;

pub use error::{ReconcileError, Result};
pub use lifecycle::LifecycleController;

use async_trait::async_trait;

use crate::descriptor::{ObservedState, ResourceDescriptor, ResourceRef};

/// Create/update/delete entry points callable by any orchestration harness.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Create the guest and report what was applied.
    async fn create(&self, desired: &ResourceDescriptor) -> Result<ObservedState>;

    /// Move guest `id` from `old` to `new`, touching only what changed.
    async fn update(
        &self,
        id: u32,
        old: &ObservedState,
        new: &ResourceDescriptor,
    ) -> Result<ObservedState>;

    /// Stop and destroy the guest.
    async fn delete(&self, target: &ResourceRef) -> Result<()>;
}
