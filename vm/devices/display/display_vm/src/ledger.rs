// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bookkeeping of the resources lent to a VM session, and correlation of the
//! resource manager's asynchronous notifications.
//!
//! The ledger holds no policy. Roles decide what to lend and when; the ledger
//! makes sure that every lend has a matching reclaim and that nothing is
//! forgotten when a call fails halfway.

use crate::error::Error;
use crate::error::Mismatch;
use crate::error::Resource;
use crate::hrm::HrmEvent;
use crate::hrm::ResourceManager;
use display_vm_defs::IrqDesc;
use display_vm_defs::IrqEntry;
use display_vm_defs::IrqLabel;
use display_vm_defs::MemHandle;
use display_vm_defs::NotificationCookie;
use display_vm_defs::SglDesc;
use display_vm_defs::VmId;

/// Single-slot table of the notification the session is waiting on.
#[derive(Debug, Default)]
pub struct NotificationBridge {
    pending: Option<NotificationCookie>,
}

impl NotificationBridge {
    /// Records `cookie` as the outstanding notification.
    pub fn register(&mut self, cookie: NotificationCookie) -> Result<(), Error> {
        if let Some(pending) = self.pending {
            return Err(Error::NotificationPending(pending));
        }
        self.pending = Some(cookie);
        Ok(())
    }

    /// The outstanding cookie, if any.
    pub fn pending(&self) -> Option<NotificationCookie> {
        self.pending
    }

    /// Checks that `cookie` is the outstanding one.
    pub fn correlate(&self, cookie: NotificationCookie) -> Result<(), Error> {
        if self.pending != Some(cookie) {
            return Err(Error::NotificationUnmatched {
                cookie,
                pending: self.pending,
            });
        }
        Ok(())
    }

    /// Clears the slot, returning the cookie that was in it.
    pub fn take(&mut self) -> Option<NotificationCookie> {
        self.pending.take()
    }
}

/// The resources currently lent to one VM session.
#[derive(Debug)]
pub struct ResourceLedger {
    vm: VmId,
    lent_irqs: Vec<IrqEntry>,
    io_mem_handle: Option<MemHandle>,
    bridge: NotificationBridge,
    poisoned: bool,
}

impl ResourceLedger {
    /// Returns an empty ledger for resources lent to `vm`.
    pub fn new(vm: VmId) -> Self {
        Self {
            vm,
            lent_irqs: Vec::new(),
            io_mem_handle: None,
            bridge: NotificationBridge::default(),
            poisoned: false,
        }
    }

    /// The VM the resources are lent to.
    pub fn vm(&self) -> VmId {
        self.vm
    }

    /// The number of interrupt lines currently lent.
    pub fn held_irq_count(&self) -> usize {
        self.lent_irqs.len()
    }

    /// The interrupt lines currently lent, in lend order.
    pub fn lent_irqs(&self) -> &[IrqEntry] {
        &self.lent_irqs
    }

    /// The handle of the lent I/O memory, if any.
    pub fn io_mem_handle(&self) -> Option<MemHandle> {
        self.io_mem_handle
    }

    /// The outstanding notification cookie, if any.
    pub fn notification_cookie(&self) -> Option<NotificationCookie> {
        self.bridge.pending()
    }

    /// Returns true once a reclaim has returned something other than what was
    /// lent. Nothing in the ledger can be trusted after that.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Returns true if nothing is lent and no notification is pending.
    pub fn is_clear(&self) -> bool {
        self.lent_irqs.is_empty()
            && self.io_mem_handle.is_none()
            && self.bridge.pending().is_none()
    }

    fn check_poisoned(&self) -> Result<(), Error> {
        if self.poisoned {
            return Err(Error::Poisoned);
        }
        Ok(())
    }

    pub(crate) fn record_mismatch(&mut self, mismatch: Mismatch) -> Error {
        tracing::error!(vm = %self.vm, %mismatch, "resource mismatch, poisoning session");
        self.poisoned = true;
        Error::ResourceMismatch(mismatch)
    }

    /// Poisons the ledger after a lend could not be undone. Resources may
    /// still be lent that nothing here accounts for.
    pub(crate) fn rollback_failed(&mut self, err: Error) -> Error {
        if err.is_session_fatal() {
            return err;
        }
        tracing::error!(
            vm = %self.vm,
            error = &err as &dyn std::error::Error,
            "rollback failed, poisoning session"
        );
        self.poisoned = true;
        Error::RollbackFailed(Box::new(err))
    }

    fn lent_labels(&self) -> Vec<IrqLabel> {
        self.lent_irqs.iter().map(|entry| entry.label).collect()
    }

    /// Lends every line in `irqs`, in order.
    ///
    /// If any lend fails, the lines lent by this call are reclaimed before the
    /// error is returned.
    pub fn lend_irqs(&mut self, hrm: &dyn ResourceManager, irqs: &IrqDesc) -> Result<(), Error> {
        self.check_poisoned()?;
        let start = self.lent_irqs.len();
        for entry in irqs.entries() {
            let result = if self.lent_irqs.iter().any(|e| e.label == entry.label) {
                Err(anyhow::anyhow!("irq already lent"))
            } else {
                hrm.lend_irq(self.vm, entry)
            };
            if let Err(err) = result {
                let err = Error::ResourceLendFailure(Resource::Irq(entry.label), err);
                tracing::warn!(
                    vm = %self.vm,
                    error = &err as &dyn std::error::Error,
                    "irq lend failed, rolling back"
                );
                self.rollback_irqs(hrm, start)?;
                return Err(err);
            }
            tracing::trace!(vm = %self.vm, label = %entry.label, irq = entry.irq, "lent irq");
            self.lent_irqs.push(*entry);
        }
        Ok(())
    }

    /// Reclaims the lines lent since `start`.
    ///
    /// If they cannot all be reclaimed the ledger is poisoned and the
    /// returned error is session fatal.
    fn rollback_irqs(&mut self, hrm: &dyn ResourceManager, start: usize) -> Result<(), Error> {
        if start == self.lent_irqs.len() {
            return Ok(());
        }
        let labels: Vec<_> = self.lent_irqs[start..].iter().map(|e| e.label).collect();
        let confirmed = match hrm.reclaim_irqs(&labels) {
            Ok(confirmed) => confirmed,
            Err(err) => {
                let err = Error::ResourceReclaimFailure(Resource::Irqs, err);
                return Err(self.rollback_failed(err));
            }
        };
        if !same_labels(&labels, &confirmed) {
            return Err(self.record_mismatch(Mismatch::Irqs {
                expected: labels,
                actual: confirmed,
            }));
        }
        self.lent_irqs.truncate(start);
        Ok(())
    }

    /// Reclaims the lent interrupt lines, which must be exactly `expected`.
    ///
    /// On a mismatch the count is left as is and the ledger is poisoned.
    pub fn reclaim_irqs(
        &mut self,
        hrm: &dyn ResourceManager,
        expected: &IrqDesc,
    ) -> Result<(), Error> {
        self.check_poisoned()?;
        let lent = self.lent_labels();
        if !expected.matches_labels(&lent) {
            return Err(self.record_mismatch(Mismatch::Irqs {
                expected: expected.labels(),
                actual: lent,
            }));
        }
        if lent.is_empty() {
            return Ok(());
        }

        let labels = expected.labels();
        let confirmed = hrm
            .reclaim_irqs(&labels)
            .map_err(|err| Error::ResourceReclaimFailure(Resource::Irqs, err))?;
        if !expected.matches_labels(&confirmed) {
            return Err(self.record_mismatch(Mismatch::Irqs {
                expected: labels,
                actual: confirmed,
            }));
        }
        tracing::trace!(vm = %self.vm, count = labels.len(), "reclaimed irqs");
        self.lent_irqs.clear();
        Ok(())
    }

    /// Lends the I/O memory described by `sgl`. Only one region may be lent at
    /// a time.
    pub fn lend_memory(
        &mut self,
        hrm: &dyn ResourceManager,
        sgl: &SglDesc,
    ) -> Result<MemHandle, Error> {
        self.check_poisoned()?;
        if let Some(handle) = self.io_mem_handle {
            return Err(Error::MemoryAlreadyLent(handle));
        }
        let handle = hrm
            .lend_mem(self.vm, sgl)
            .map_err(|err| Error::ResourceLendFailure(Resource::IoMemory, err))?;
        tracing::trace!(vm = %self.vm, %handle, bytes = sgl.total_len(), "lent io memory");
        self.io_mem_handle = Some(handle);
        Ok(handle)
    }

    /// Reclaims the I/O memory lent under `handle`.
    pub fn reclaim_memory(
        &mut self,
        hrm: &dyn ResourceManager,
        handle: MemHandle,
    ) -> Result<(), Error> {
        self.check_poisoned()?;
        if self.io_mem_handle != Some(handle) {
            return Err(self.record_mismatch(Mismatch::Memory {
                expected: self.io_mem_handle,
                actual: handle,
            }));
        }
        let reclaimed = hrm
            .reclaim_mem(handle)
            .map_err(|err| Error::ResourceReclaimFailure(Resource::IoMemory, err))?;
        if reclaimed != handle {
            return Err(self.record_mismatch(Mismatch::Memory {
                expected: Some(handle),
                actual: reclaimed,
            }));
        }
        tracing::trace!(vm = %self.vm, %handle, "reclaimed io memory");
        self.io_mem_handle = None;
        Ok(())
    }

    /// Records `cookie` as the notification this session waits on.
    pub fn register_notification(&mut self, cookie: NotificationCookie) -> Result<(), Error> {
        self.bridge.register(cookie)
    }

    /// Correlates an incoming notification with the pending one.
    ///
    /// A notification that does not match is logged and returned as
    /// [`Error::NotificationUnmatched`]; the ledger is left untouched.
    pub fn on_notification(
        &self,
        cookie: NotificationCookie,
        event: HrmEvent,
    ) -> Result<HrmEvent, Error> {
        if let Err(err) = self.bridge.correlate(cookie) {
            tracing::warn!(
                vm = %self.vm,
                ?event,
                error = &err as &dyn std::error::Error,
                "dropping notification"
            );
            return Err(err);
        }
        Ok(event)
    }

    /// Clears the pending notification, unregistering it with the resource
    /// manager.
    pub fn unregister_notification(&mut self, hrm: &dyn ResourceManager) {
        if let Some(cookie) = self.bridge.take() {
            hrm.unregister_notifier(cookie);
        }
    }

    /// Gives back everything still lent, ignoring the poisoned state, and
    /// empties the ledger. Failures are logged; the bookkeeping is dropped
    /// either way.
    pub(crate) fn teardown(&mut self, hrm: &dyn ResourceManager) {
        self.unregister_notification(hrm);
        if let Some(handle) = self.io_mem_handle.take() {
            if let Err(err) = hrm.reclaim_mem(handle) {
                tracing::error!(
                    vm = %self.vm,
                    %handle,
                    error = err.as_ref() as &dyn std::error::Error,
                    "failed to reclaim io memory at teardown"
                );
            }
        }
        if !self.lent_irqs.is_empty() {
            let labels = self.lent_labels();
            match hrm.reclaim_irqs(&labels) {
                Ok(confirmed) if same_labels(&labels, &confirmed) => {}
                Ok(confirmed) => tracing::error!(
                    vm = %self.vm,
                    expected = ?labels,
                    actual = ?confirmed,
                    "irq set mismatch at teardown"
                ),
                Err(err) => tracing::error!(
                    vm = %self.vm,
                    error = err.as_ref() as &dyn std::error::Error,
                    "failed to reclaim irqs at teardown"
                ),
            }
            self.lent_irqs.clear();
        }
    }
}

fn same_labels(a: &[IrqLabel], b: &[IrqLabel]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}
