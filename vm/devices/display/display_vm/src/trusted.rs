// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The trusted VM role.
//!
//! The trusted VM borrows the display hardware for a session. Acquire lends
//! the interrupt lines and then the I/O memory; release hands them back in
//! the reverse order. If any step of acquire fails, everything lent so far is
//! reclaimed before the error is returned, so no interrupt line is ever left
//! in the trusted VM without the memory it drives.

use crate::error::Error;
use crate::error::Resource;
use crate::hrm::HrmEvent;
use crate::ledger::ResourceLedger;
use crate::role::CommitTracker;
use crate::VmContext;
use display_vm_defs::CommitState;
use display_vm_defs::IrqDesc;
use display_vm_defs::NotificationCookie;
use display_vm_defs::SglDesc;

/// The trusted VM role descriptor.
#[derive(Debug)]
pub struct TrustedVm {
    ledger: ResourceLedger,
    irq_desc: IrqDesc,
    sgl_desc: SglDesc,
    acquired: bool,
    revoked: bool,
    commits: CommitTracker,
    torn_down: bool,
}

impl TrustedVm {
    pub(crate) fn new(ctx: &VmContext) -> Self {
        let config = ctx.config();
        tracing::info!(
            vm = %config.trusted_vm,
            irqs = config.trusted.irqs.len(),
            io_bytes = config.trusted.io_ranges.total_len(),
            "trusted vm layer initialized"
        );
        Self {
            ledger: ResourceLedger::new(config.trusted_vm),
            irq_desc: config.trusted.irqs.clone(),
            sgl_desc: config.trusted.io_ranges.clone(),
            acquired: false,
            revoked: false,
            commits: CommitTracker::default(),
            torn_down: false,
        }
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// The interrupt lines requested on acquire.
    pub fn irq_desc(&self) -> &IrqDesc {
        &self.irq_desc
    }

    /// The I/O memory requested on acquire.
    pub fn sgl_desc(&self) -> &SglDesc {
        &self.sgl_desc
    }

    pub(crate) fn owns_hw(&self) -> bool {
        self.acquired
            && !self.revoked
            && !self.torn_down
            && !self.ledger.is_poisoned()
            && self.ledger.held_irq_count() == self.irq_desc.len()
            && self.ledger.io_mem_handle().is_some()
    }

    pub(crate) fn acquire(&mut self, ctx: &VmContext) -> Result<(), Error> {
        if self.ledger.is_poisoned() {
            return Err(Error::Poisoned);
        }
        if self.acquired {
            if self.revoked {
                return Err(Error::ResourcesOutstanding);
            }
            return Ok(());
        }
        if !self.ledger.is_clear() {
            // A previous release did not finish.
            return Err(Error::ResourcesOutstanding);
        }

        let hrm = ctx.hrm();
        self.ledger.lend_irqs(hrm, &self.irq_desc)?;

        let handle = match self.ledger.lend_memory(hrm, &self.sgl_desc) {
            Ok(handle) => handle,
            Err(err) => return Err(self.abort_acquire(ctx, err)),
        };

        let cookie = match hrm.register_notifier(self.ledger.vm()) {
            Ok(cookie) => cookie,
            Err(err) => {
                let err = Error::ResourceLendFailure(Resource::Notifier, err);
                return Err(self.abort_acquire(ctx, err));
            }
        };
        if let Err(err) = self.ledger.register_notification(cookie) {
            hrm.unregister_notifier(cookie);
            return Err(self.abort_acquire(ctx, err));
        }

        if let Err(err) = ctx.clients().post_acquire() {
            return Err(self.abort_acquire(ctx, err));
        }

        self.acquired = true;
        self.revoked = false;
        self.commits.reset();
        tracing::info!(
            vm = %self.ledger.vm(),
            irqs = self.ledger.held_irq_count(),
            %handle,
            %cookie,
            "trusted vm acquired display hardware"
        );
        Ok(())
    }

    /// Undoes an acquire that failed with `err`. If the undo itself fails,
    /// the session is poisoned and the rollback error is returned instead.
    fn abort_acquire(&mut self, ctx: &VmContext, err: Error) -> Error {
        match self.rollback(ctx) {
            Ok(()) => err,
            Err(fatal) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "acquire failed and could not be rolled back"
                );
                fatal
            }
        }
    }

    /// Reclaims everything an unfinished acquire lent.
    fn rollback(&mut self, ctx: &VmContext) -> Result<(), Error> {
        let hrm = ctx.hrm();
        self.ledger.unregister_notification(hrm);
        if let Some(handle) = self.ledger.io_mem_handle() {
            if let Err(err) = self.ledger.reclaim_memory(hrm, handle) {
                return Err(self.ledger.rollback_failed(err));
            }
        }
        if self.ledger.held_irq_count() != 0 {
            if let Err(err) = self.ledger.reclaim_irqs(hrm, &self.irq_desc) {
                return Err(self.ledger.rollback_failed(err));
            }
        }
        Ok(())
    }

    pub(crate) fn release(&mut self, ctx: &VmContext) -> Result<(), Error> {
        if self.ledger.is_poisoned() {
            return Err(Error::Poisoned);
        }
        if !self.acquired && self.ledger.is_clear() {
            tracing::debug!("trusted vm holds nothing to release");
            return Ok(());
        }

        ctx.clients().check()?;
        ctx.clients().pre_release()?;
        if !self.commits.is_quiesced() {
            tracing::debug!("releasing without a post-commit");
        }

        // No commit may be prepared from here on, even if the reclaim fails.
        self.acquired = false;

        let hrm = ctx.hrm();
        self.ledger.unregister_notification(hrm);
        if let Some(handle) = self.ledger.io_mem_handle() {
            self.ledger.reclaim_memory(hrm, handle)?;
        }
        self.ledger.reclaim_irqs(hrm, &self.irq_desc)?;

        self.revoked = false;
        self.commits.reset();
        tracing::info!(vm = %self.ledger.vm(), "trusted vm released display hardware");
        Ok(())
    }

    pub(crate) fn prepare_commit(&mut self, state: &CommitState) -> Result<(), Error> {
        let owns_hw = self.owns_hw();
        self.commits.prepare(owns_hw, state)
    }

    pub(crate) fn post_commit(&mut self, state: &CommitState) -> Result<(), Error> {
        let owns_hw = self.owns_hw();
        self.commits.post(owns_hw, state)
    }

    pub(crate) fn on_notification(
        &mut self,
        _ctx: &VmContext,
        cookie: NotificationCookie,
        event: HrmEvent,
    ) -> Result<(), Error> {
        match self.ledger.on_notification(cookie, event)? {
            HrmEvent::Accepted => {
                tracing::debug!(%cookie, "display resources accepted");
            }
            HrmEvent::Revoked => {
                tracing::warn!(%cookie, "display resources revoked, reclaim in flight");
                self.revoked = true;
            }
            event @ HrmEvent::Returned { .. } => {
                tracing::warn!(?event, "unexpected notification for trusted vm");
            }
        }
        Ok(())
    }

    pub(crate) fn deinit(&mut self, ctx: &VmContext) {
        if self.torn_down {
            return;
        }
        self.ledger.teardown(ctx.hrm());
        self.acquired = false;
        self.torn_down = true;
        tracing::info!("trusted vm layer deinitialized");
    }
}
