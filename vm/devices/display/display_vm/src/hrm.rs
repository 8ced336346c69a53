// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The boundary to the hypervisor resource manager.

use display_vm_defs::IrqEntry;
use display_vm_defs::IrqLabel;
use display_vm_defs::MemHandle;
use display_vm_defs::NotificationCookie;
use display_vm_defs::SglDesc;
use display_vm_defs::VmId;

/// The hypervisor resource manager, which moves interrupt lines and I/O
/// memory between VMs.
///
/// Every call crosses into another execution context and may block, so these
/// must only be called from a context that can sleep.
pub trait ResourceManager: Send + Sync {
    /// Lends a single interrupt line to `vm`.
    fn lend_irq(&self, vm: VmId, entry: &IrqEntry) -> anyhow::Result<()>;

    /// Reclaims the interrupt lines named by `labels`, in order.
    ///
    /// Returns the labels the resource manager actually handed back.
    fn reclaim_irqs(&self, labels: &[IrqLabel]) -> anyhow::Result<Vec<IrqLabel>>;

    /// Lends the I/O memory described by `sgl` to `vm`.
    fn lend_mem(&self, vm: VmId, sgl: &SglDesc) -> anyhow::Result<MemHandle>;

    /// Reclaims the I/O memory lent under `handle`.
    ///
    /// Returns the handle the resource manager actually reclaimed.
    fn reclaim_mem(&self, handle: MemHandle) -> anyhow::Result<MemHandle>;

    /// Registers for notifications about resources exchanged with `vm`.
    fn register_notifier(&self, vm: VmId) -> anyhow::Result<NotificationCookie>;

    /// Drops a registration made with [`Self::register_notifier`].
    fn unregister_notifier(&self, cookie: NotificationCookie);
}

/// An asynchronous notification delivered by the resource manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HrmEvent {
    /// The peer VM accepted the lent resources.
    Accepted,
    /// The peer VM handed its resources back.
    Returned {
        /// The interrupt labels that came back.
        irqs: Vec<IrqLabel>,
    },
    /// The resource manager is taking the lent resources back.
    Revoked,
}
