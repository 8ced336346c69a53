// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The primary VM role.
//!
//! The primary VM owns the display hardware from boot, so it never asks the
//! resource manager for anything. Releasing registers for the notification
//! that the trusted VM has handed the hardware back; that notification must
//! return exactly the interrupt lines cached here at init.

use crate::error::Error;
use crate::error::Mismatch;
use crate::error::Resource;
use crate::hrm::HrmEvent;
use crate::ledger::ResourceLedger;
use crate::role::CommitTracker;
use crate::VmContext;
use display_vm_defs::CommitState;
use display_vm_defs::IrqDesc;
use display_vm_defs::NotificationCookie;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum HwState {
    /// The primary VM may program the hardware.
    Owned,
    /// The hardware has been handed to the trusted VM.
    Released,
    /// The trusted VM has handed everything back; waiting for acquire.
    Returned,
}

/// The primary VM role descriptor.
#[derive(Debug)]
pub struct PrimaryVm {
    ledger: ResourceLedger,
    irq_desc: IrqDesc,
    state: HwState,
    commits: CommitTracker,
    torn_down: bool,
}

impl PrimaryVm {
    pub(crate) fn new(ctx: &VmContext) -> Self {
        let config = ctx.config();
        tracing::info!(irqs = config.primary.irqs.len(), "primary vm layer initialized");
        Self {
            ledger: ResourceLedger::new(config.trusted_vm),
            irq_desc: config.primary.irqs.clone(),
            state: HwState::Owned,
            commits: CommitTracker::default(),
            torn_down: false,
        }
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// The interrupt lines the trusted VM must hand back.
    pub fn irq_desc(&self) -> &IrqDesc {
        &self.irq_desc
    }

    pub(crate) fn owns_hw(&self) -> bool {
        self.state == HwState::Owned && !self.ledger.is_poisoned() && !self.torn_down
    }

    pub(crate) fn acquire(&mut self, ctx: &VmContext) -> Result<(), Error> {
        if self.ledger.is_poisoned() {
            return Err(Error::Poisoned);
        }
        match self.state {
            HwState::Owned => Ok(()),
            HwState::Released => Err(Error::ResourcesOutstanding),
            HwState::Returned => {
                ctx.clients().post_acquire()?;
                self.state = HwState::Owned;
                self.commits.reset();
                tracing::info!("primary vm acquired display hardware");
                Ok(())
            }
        }
    }

    pub(crate) fn release(&mut self, ctx: &VmContext) -> Result<(), Error> {
        if self.ledger.is_poisoned() {
            return Err(Error::Poisoned);
        }
        if self.state != HwState::Owned {
            tracing::debug!(state = ?self.state, "primary vm already released");
            return Ok(());
        }

        ctx.clients().check()?;
        ctx.clients().pre_release()?;

        let hrm = ctx.hrm();
        let cookie = match hrm.register_notifier(self.ledger.vm()) {
            Ok(cookie) => cookie,
            Err(err) => {
                ctx.clients().resume_after_abort();
                return Err(Error::ResourceLendFailure(Resource::Notifier, err));
            }
        };
        if let Err(err) = self.ledger.register_notification(cookie) {
            hrm.unregister_notifier(cookie);
            ctx.clients().resume_after_abort();
            return Err(err);
        }

        self.state = HwState::Released;
        self.commits.reset();
        tracing::info!(%cookie, "primary vm released display hardware");
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
        ctx: &VmContext,
        cookie: NotificationCookie,
        event: HrmEvent,
    ) -> Result<(), Error> {
        match self.ledger.on_notification(cookie, event)? {
            HrmEvent::Returned { irqs } => {
                if !self.irq_desc.matches_labels(&irqs) {
                    return Err(self.ledger.record_mismatch(Mismatch::Irqs {
                        expected: self.irq_desc.labels(),
                        actual: irqs,
                    }));
                }
                self.ledger.unregister_notification(ctx.hrm());
                self.state = HwState::Returned;
                tracing::info!(irqs = irqs.len(), "display resources returned to primary vm");
            }
            HrmEvent::Accepted => {
                tracing::debug!("trusted vm accepted display resources");
            }
            event @ HrmEvent::Revoked => {
                tracing::warn!(?event, "unexpected notification for primary vm");
            }
        }
        Ok(())
    }

    pub(crate) fn deinit(&mut self, ctx: &VmContext) {
        if self.torn_down {
            return;
        }
        if self.state == HwState::Released {
            tracing::warn!("primary vm torn down while display hardware is lent out");
        }
        self.ledger.teardown(ctx.hrm());
        self.torn_down = true;
        tracing::info!("primary vm layer deinitialized");
    }
}
