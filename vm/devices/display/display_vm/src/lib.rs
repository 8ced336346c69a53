// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! VM arbitration for a display controller shared between a primary VM and a
//! trusted VM.
//!
//! The primary VM owns the display hardware from boot. During a trusted
//! session the hardware is handed to the trusted VM: its interrupt lines and
//! I/O memory are lent through the hypervisor resource manager
//! ([`ResourceManager`]) and reclaimed when the session ends. Both sides of
//! the exchange run this crate; which side an instance is on is decided by
//! [`DisplayVm::init_primary`] or [`DisplayVm::init_trusted`].
//!
//! Every ownership operation runs under a single session lock, taken with
//! [`DisplayVm::lock`]. The returned [`VmLock`] hands out the operation table
//! ([`VmOps`]) of the installed role. Resource manager notifications arrive on
//! their own context and are delivered with [`DisplayVm::notify`], which
//! takes the same lock.

#![forbid(unsafe_code)]
#![expect(missing_docs)]

mod client;
mod error;
mod hrm;
mod ledger;
mod primary;
mod request;
mod role;
mod trusted;

#[cfg(test)]
mod tests;

pub use client::ClientStatus;
pub use client::VmClient;
pub use client::VmClientHandle;
pub use client::VmClientRegistry;
pub use error::ClientPhase;
pub use error::Error;
pub use error::Mismatch;
pub use error::Resource;
pub use hrm::HrmEvent;
pub use hrm::ResourceManager;
pub use ledger::NotificationBridge;
pub use ledger::ResourceLedger;
pub use primary::PrimaryVm;
pub use request::RequestPolicy;
pub use role::VmOps;
pub use role::VmRole;
pub use role::VmRoleKind;
pub use trusted::TrustedVm;

use display_vm_defs::config::DisplayVmConfig;
use display_vm_defs::NotificationCookie;
use parking_lot::MappedMutexGuard;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// State shared by every role for the lifetime of the driver.
pub(crate) struct VmContext {
    hrm: Arc<dyn ResourceManager>,
    clients: VmClientRegistry,
    config: DisplayVmConfig,
    policy: RequestPolicy,
}

impl VmContext {
    pub fn hrm(&self) -> &dyn ResourceManager {
        self.hrm.as_ref()
    }

    pub fn clients(&self) -> &VmClientRegistry {
        &self.clients
    }

    pub fn config(&self) -> &DisplayVmConfig {
        &self.config
    }

    pub fn policy(&self) -> &RequestPolicy {
        &self.policy
    }
}

/// What became of a delivered notification.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// The notification matched the pending cookie and was applied.
    Applied,
    /// The notification was stale, unexpected, or arrived while no role was
    /// installed. Nothing changed.
    Dropped,
}

/// The display VM arbitration layer.
pub struct DisplayVm {
    ctx: VmContext,
    role: Mutex<Option<VmRole>>,
    enabled: AtomicBool,
}

impl DisplayVm {
    /// Returns a layer with no role installed.
    pub fn new(hrm: Arc<dyn ResourceManager>, config: DisplayVmConfig) -> Self {
        let policy = RequestPolicy::new(&config.request_policy);
        Self {
            ctx: VmContext {
                hrm,
                clients: VmClientRegistry::new(),
                config,
                policy,
            },
            role: Mutex::new(None),
            enabled: AtomicBool::new(false),
        }
    }

    /// The registry that clients of the display hardware register with.
    pub fn clients(&self) -> &VmClientRegistry {
        self.ctx.clients()
    }

    /// Installs the primary role, tearing down any role already installed.
    pub fn init_primary(&self) {
        self.install(|ctx| VmRole::Primary(PrimaryVm::new(ctx)));
    }

    /// Installs the trusted role, tearing down any role already installed.
    pub fn init_trusted(&self) {
        self.install(|ctx| VmRole::Trusted(TrustedVm::new(ctx)));
    }

    fn install(&self, new_role: impl FnOnce(&VmContext) -> VmRole) {
        let mut role = self.role.lock();
        if let Some(mut old) = role.take() {
            tracing::info!(role = %old.kind(), "replacing vm role");
            old.deinit(&self.ctx);
        }
        let new = role.insert(new_role(&self.ctx));
        self.enabled.store(true, Ordering::Release);
        tracing::info!(role = %new.kind(), "vm layer enabled");
    }

    /// Tears down the installed role, giving back everything it still holds.
    ///
    /// Does nothing if no role is installed.
    pub fn deinit(&self) {
        let mut role = self.role.lock();
        self.enabled.store(false, Ordering::Release);
        if let Some(mut old) = role.take() {
            old.deinit(&self.ctx);
            tracing::info!(role = %old.kind(), "vm layer disabled");
        }
    }

    /// Returns true if a role is installed.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Takes the session lock.
    ///
    /// Returns `None` if no role is installed.
    pub fn lock(&self) -> Option<VmLock<'_>> {
        let guard = MutexGuard::try_map(self.role.lock(), |role| role.as_mut()).ok()?;
        Some(VmLock {
            role: guard,
            ctx: &self.ctx,
        })
    }

    /// Runs `f` against the installed role's operations under the session
    /// lock. Returns `None` if no role is installed.
    pub fn active_ops<R>(&self, f: impl FnOnce(&mut VmOps<'_>) -> R) -> Option<R> {
        let mut lock = self.lock()?;
        Some(f(&mut lock.ops()))
    }

    /// Delivers a resource manager notification.
    ///
    /// A notification that does not match the pending cookie, or that arrives
    /// while the layer is disabled, is dropped. Errors are returned only for
    /// notifications that matched and could not be applied.
    pub fn notify(
        &self,
        cookie: NotificationCookie,
        event: HrmEvent,
    ) -> Result<NotifyOutcome, Error> {
        if !self.is_enabled() {
            tracing::debug!(%cookie, ?event, "notification while disabled");
            return Ok(NotifyOutcome::Dropped);
        }
        let Some(mut lock) = self.lock() else {
            tracing::debug!(%cookie, ?event, "notification with no role installed");
            return Ok(NotifyOutcome::Dropped);
        };
        match lock.ops().on_notification(cookie, event) {
            Ok(()) => Ok(NotifyOutcome::Applied),
            Err(Error::NotificationUnmatched { .. }) => Ok(NotifyOutcome::Dropped),
            Err(err) => Err(err),
        }
    }
}

impl Drop for DisplayVm {
    fn drop(&mut self) {
        self.deinit();
    }
}

/// The held session lock.
pub struct VmLock<'a> {
    role: MappedMutexGuard<'a, VmRole>,
    ctx: &'a VmContext,
}

impl VmLock<'_> {
    /// The operation table of the installed role.
    pub fn ops(&mut self) -> VmOps<'_> {
        VmOps::new(&mut self.role, self.ctx)
    }

    pub fn kind(&self) -> VmRoleKind {
        self.role.kind()
    }

    pub fn ledger(&self) -> &ResourceLedger {
        self.role.ledger()
    }

    /// Releases the session lock.
    pub fn unlock(self) {}
}
