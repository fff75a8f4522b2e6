//! Lifecycle controller - creates, updates and deletes PVE guests.
//!
//! Guest states as seen from here:
//!
//! ```text
//! absent -> creating -> {running | stopped} <-> locked
//!        -> stopping -> stopped -> deleting -> absent
//! ```
//!
//! `locked` can show up from any active state (resize, backup, snapshot) and
//! blocks further changes until the remote operation releases it.

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{ReconcileError, Reconciler, Result};
use crate::clients::{ApiError, Method, Params, PveApi, RunAction};
use crate::config::ReconcilePolicy;
use crate::descriptor::{
    ObservedState, ResourceDescriptor, ResourceKind, ResourceRef, ResourceStatus,
    features_to_wire,
};
use crate::diff;
use crate::wait::{Clock, StatusPoller, TokioClock};

/// Drives one guest at a time through create/update/delete.
///
/// Operations on the same guest must not overlap; the caller serializes them.
pub struct LifecycleController<A, C = TokioClock> {
    api: A,
    clock: C,
    policy: ReconcilePolicy,
}

impl<A: PveApi> LifecycleController<A> {
    pub fn new(api: A) -> Self {
        Self::with_clock(api, TokioClock, ReconcilePolicy::default())
    }
}

impl<A: PveApi, C: Clock> LifecycleController<A, C> {
    pub fn with_clock(api: A, clock: C, policy: ReconcilePolicy) -> Self {
        Self { api, clock, policy }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    fn poller(&self) -> StatusPoller<'_, A, C> {
        StatusPoller::new(&self.api, &self.clock, self.policy.poll_interval)
    }

    /// Current status for reporting; a failed read yields `Unknown`.
    pub async fn refresh_status(&self, target: &ResourceRef) -> ResourceStatus {
        match self.api.current_status(target).await {
            Ok(report) => report.observed(),
            Err(e) => {
                warn!(guest = %target, error = %e, "Failed to read guest status");
                ResourceStatus::Unknown
            }
        }
    }

    async fn run_action(&self, target: &ResourceRef, action: RunAction) -> std::result::Result<(), ApiError> {
        debug!(guest = %target, action = action.as_str(), "Sending run-state action");
        self.api
            .request(Method::POST, &target.action_path(action), None)
            .await
            .map(|_| ())
    }

    /// Stop a running guest ahead of deletion. Nothing here is fatal.
    async fn stop_for_delete(&self, target: &ResourceRef) {
        let report = match self.api.current_status(target).await {
            Ok(report) => report,
            Err(e) => {
                warn!(guest = %target, error = %e, "Could not read status before delete");
                return;
            }
        };
        info!(guest = %target, status = %report.run_status(), "Status before delete");

        if report.run_status() != ResourceStatus::Running {
            return;
        }

        info!(guest = %target, "Stopping guest");
        if let Err(e) = self.run_action(target, RunAction::Stop).await {
            error!(guest = %target, error = %e, "Failed to send stop");
        }

        let poller = self.poller();
        if poller.wait_for_stop(target, self.policy.stop_attempts).await {
            return;
        }

        warn!(guest = %target, "Guest did not stop, sending shutdown");
        match self.run_action(target, RunAction::Shutdown).await {
            Ok(()) => {
                poller
                    .wait_for_stop(target, self.policy.forced_stop_attempts)
                    .await;
            }
            Err(e) => error!(guest = %target, error = %e, "Failed to send shutdown"),
        }
    }

    /// Between delete retries: if the guest is still running, shut it down again.
    async fn stop_before_retry(&self, target: &ResourceRef) {
        match self.api.current_status(target).await {
            Ok(report) if report.run_status() == ResourceStatus::Running => {
                warn!(guest = %target, "Guest still running, sending shutdown again");
                match self.run_action(target, RunAction::Shutdown).await {
                    Ok(()) => {
                        self.poller()
                            .wait_for_stop(target, self.policy.retry_stop_attempts)
                            .await;
                    }
                    Err(e) => debug!(guest = %target, error = %e, "Shutdown before retry failed"),
                }
            }
            Ok(report) => {
                debug!(guest = %target, status = %report.run_status(), "Status before retry");
            }
            Err(e) => debug!(guest = %target, error = %e, "Status read before retry failed"),
        }
    }

    async fn delete_with_retry(&self, target: &ResourceRef) -> Result<()> {
        let max_attempts = self.policy.delete_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self
                .api
                .request(Method::DELETE, &target.guest_path(), None)
                .await
            {
                Ok(_) => {
                    info!(guest = %target, attempt, "Guest deleted");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let wait = self.policy.delete_backoff(attempt);
                    warn!(
                        guest = %target,
                        attempt,
                        max_attempts,
                        wait_secs = wait.as_secs_f64(),
                        error = %e,
                        "Delete failed, retrying"
                    );
                    self.clock.sleep(wait).await;
                    self.stop_before_retry(target).await;
                    attempt += 1;
                }
                Err(source) => {
                    error!(guest = %target, attempt, error = %source, "Failed to delete guest");
                    return Err(ReconcileError::Delete {
                        target: target.clone(),
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }
}

/// Parameters for `POST /nodes/{node}/{kind}`.
fn create_params(desired: &ResourceDescriptor, id: u32) -> Params {
    let kind = desired.kind;
    let mut params = Params::new();

    params.insert("vmid".to_string(), id.to_string());
    params.insert("cores".to_string(), desired.cores.to_string());
    params.insert("memory".to_string(), desired.memory.to_string());
    params.insert(
        kind.name_key().to_string(),
        desired
            .name
            .clone()
            .unwrap_or_else(|| kind.default_name(id)),
    );

    for (slot, spec) in desired.disks.iter().chain(&desired.networks) {
        params.insert(slot.clone(), spec.clone());
    }

    if let Some(startup) = &desired.startup {
        params.insert("startup".to_string(), startup.clone());
    }
    if let Some(onboot) = desired.onboot {
        params.insert("onboot".to_string(), u8::from(onboot).to_string());
    }

    if kind == ResourceKind::Lxc {
        params.insert("swap".to_string(), desired.swap.to_string());
        params.insert(
            "unprivileged".to_string(),
            u8::from(desired.unprivileged).to_string(),
        );
        if !desired.features.is_empty() {
            params.insert("features".to_string(), features_to_wire(&desired.features));
        }
        if let Some(ostemplate) = &desired.ostemplate {
            params.insert("ostemplate".to_string(), ostemplate.clone());
        }
        if let Some(password) = &desired.password {
            params.insert("password".to_string(), password.clone());
        }
        if let Some(keys) = &desired.ssh_public_keys {
            params.insert("ssh-public-keys".to_string(), keys.clone());
        }
    }

    params
}

#[async_trait]
impl<A: PveApi, C: Clock> Reconciler for LifecycleController<A, C> {
    async fn create(&self, desired: &ResourceDescriptor) -> Result<ObservedState> {
        let desired = desired.normalized();
        desired.validate()?;
        let target = desired.target();

        info!(guest = %target, "Creating guest");
        let params = create_params(&desired, target.id);
        self.api
            .request(
                Method::POST,
                &ResourceRef::create_path(&target.node, target.kind),
                Some(&params),
            )
            .await
            .map_err(|source| {
                error!(guest = %target, error = %source, "Failed to create guest");
                ReconcileError::Create {
                    target: target.clone(),
                    source,
                }
            })?;
        info!(guest = %target, "Guest creation submitted");

        let start = desired
            .start_on_create
            .unwrap_or_else(|| target.kind.starts_on_create());
        if start {
            match self.run_action(&target, RunAction::Start).await {
                Ok(()) => {
                    info!(guest = %target, "Guest started after creation");
                    self.clock.sleep(self.policy.start_settle).await;
                }
                Err(e) => {
                    warn!(guest = %target, error = %e, "Failed to start guest after creation");
                }
            }
        }

        let status = self.refresh_status(&target).await;
        info!(guest = %target, %status, "Created guest");
        Ok(ObservedState::new(target.id, status, desired.redacted()))
    }

    async fn update(
        &self,
        id: u32,
        old: &ObservedState,
        new: &ResourceDescriptor,
    ) -> Result<ObservedState> {
        if old.id != id {
            return Err(ReconcileError::IdMismatch {
                expected: id,
                actual: old.id,
            });
        }

        let mut applied_old = old.spec.clone();
        applied_old.id.get_or_insert(id);
        let applied_old = applied_old.normalized();

        let mut desired = new.clone();
        desired.id.get_or_insert(id);
        let desired = desired.normalized();
        desired.validate()?;

        let target = old.target();
        let diff = diff::diff(&applied_old, &desired)?;
        for slot in &diff.detached {
            warn!(guest = %target, %slot, "Disk removed from descriptor, leaving it attached");
        }
        for slot in &diff.unchanged_size {
            warn!(guest = %target, %slot, "Disk options changed without a size change, leaving disk as is");
        }

        // Existing disks report their previous spec until a resize lands.
        let mut applied = desired.clone();
        for (slot, spec) in &applied_old.disks {
            if let Some(entry) = applied.disks.get_mut(slot) {
                entry.clone_from(spec);
            }
        }

        if diff.is_noop() {
            info!(guest = %target, "No changes to apply");
            return Ok(ObservedState::new(id, old.status, applied.redacted()));
        }

        info!(
            guest = %target,
            config_changes = diff.updates.changes().len(),
            resizes = diff.resizes.len(),
            "Updating guest"
        );

        let mut resized = Vec::new();
        for resize in &diff.resizes {
            info!(guest = %target, slot = %resize.slot, size_gb = resize.disk.size_gb, "Resizing disk");
            match self
                .api
                .request(Method::PUT, &target.resize_path(), Some(&resize.to_params()))
                .await
            {
                Ok(_) => {
                    info!(guest = %target, slot = %resize.slot, "Disk resized");
                    applied
                        .disks
                        .insert(resize.slot.clone(), resize.applied.clone());
                    resized.push(resize.slot.as_str());
                }
                Err(e) => {
                    warn!(guest = %target, slot = %resize.slot, error = %e, "Failed to resize disk, skipping");
                    if !applied_old.disks.contains_key(&resize.slot) {
                        applied.disks.remove(&resize.slot);
                    }
                }
            }
        }

        if !diff.updates.is_empty() {
            let params = diff.updates.to_params(target.kind);
            debug!(guest = %target, ?params, "Config update");
            self.api
                .request(Method::PUT, &target.config_path(), Some(&params))
                .await
                .map_err(|source| {
                    error!(
                        guest = %target,
                        error = %source,
                        ?resized,
                        "Failed to update guest config"
                    );
                    ReconcileError::Update {
                        target: target.clone(),
                        source,
                    }
                })?;
        }

        let status = self.refresh_status(&target).await;
        info!(guest = %target, %status, "Updated guest");
        Ok(ObservedState::new(id, status, applied.redacted()))
    }

    async fn delete(&self, target: &ResourceRef) -> Result<()> {
        info!(guest = %target, "Deleting guest");
        let poller = self.poller();

        poller
            .wait_for_unlock(target, self.policy.unlock_attempts)
            .await;
        self.stop_for_delete(target).await;
        // Stop and resize operations can take the lock again.
        poller
            .wait_for_unlock(target, self.policy.unlock_attempts)
            .await;

        self.delete_with_retry(target).await
    }
}
