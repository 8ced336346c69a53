// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The VM role descriptors and the operation table dispatched over them.

use crate::error::Error;
use crate::hrm::HrmEvent;
use crate::ledger::ResourceLedger;
use crate::primary::PrimaryVm;
use crate::trusted::TrustedVm;
use crate::VmContext;
use display_vm_defs::config::RequestAction;
use display_vm_defs::CommitState;
use display_vm_defs::NotificationCookie;
use display_vm_defs::RequestState;

/// Which VM this instance of the display driver runs in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VmRoleKind {
    /// The non-secure VM that owns the hardware at boot.
    Primary,
    /// The secure VM that borrows the hardware for a session.
    Trusted,
}

impl std::fmt::Display for VmRoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            VmRoleKind::Primary => "primary",
            VmRoleKind::Trusted => "trusted",
        })
    }
}

/// The installed role descriptor.
#[derive(Debug)]
pub enum VmRole {
    Primary(PrimaryVm),
    Trusted(TrustedVm),
}

impl VmRole {
    pub fn kind(&self) -> VmRoleKind {
        match self {
            VmRole::Primary(_) => VmRoleKind::Primary,
            VmRole::Trusted(_) => VmRoleKind::Trusted,
        }
    }

    pub fn ledger(&self) -> &ResourceLedger {
        match self {
            VmRole::Primary(vm) => vm.ledger(),
            VmRole::Trusted(vm) => vm.ledger(),
        }
    }

    pub fn owns_hw(&self) -> bool {
        match self {
            VmRole::Primary(vm) => vm.owns_hw(),
            VmRole::Trusted(vm) => vm.owns_hw(),
        }
    }

    /// Gives back whatever the role still holds and invalidates it. Calling
    /// this again does nothing.
    pub(crate) fn deinit(&mut self, ctx: &VmContext) {
        match self {
            VmRole::Primary(vm) => vm.deinit(ctx),
            VmRole::Trusted(vm) => vm.deinit(ctx),
        }
    }
}

/// Tracks the commits made during one ownership period.
#[derive(Debug, Default)]
pub(crate) struct CommitTracker {
    prepared: Option<u64>,
    quiesced: bool,
}

impl CommitTracker {
    pub fn prepare(&mut self, owns_hw: bool, state: &CommitState) -> Result<(), Error> {
        if !owns_hw {
            return Err(Error::OwnershipViolation);
        }
        if self.prepared.is_none() {
            tracing::debug!(sequence = state.sequence, "first commit after acquire");
            self.prepared = Some(state.sequence);
        }
        self.quiesced = false;
        Ok(())
    }

    pub fn post(&mut self, owns_hw: bool, state: &CommitState) -> Result<(), Error> {
        if !owns_hw {
            return Err(Error::OwnershipViolation);
        }
        if let Some(prepared) = self.prepared {
            if state.sequence < prepared {
                return Err(Error::StaleCommit {
                    prepared,
                    committed: state.sequence,
                });
            }
        }
        self.quiesced = true;
        Ok(())
    }

    pub fn is_quiesced(&self) -> bool {
        self.quiesced
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// The operation table of the installed role.
///
/// Obtained from a [`VmLock`](crate::VmLock), so every operation runs with the
/// session lock held.
pub struct VmOps<'a> {
    role: &'a mut VmRole,
    ctx: &'a VmContext,
}

impl<'a> VmOps<'a> {
    pub(crate) fn new(role: &'a mut VmRole, ctx: &'a VmContext) -> Self {
        Self { role, ctx }
    }

    pub fn kind(&self) -> VmRoleKind {
        self.role.kind()
    }

    pub fn ledger(&self) -> &ResourceLedger {
        self.role.ledger()
    }

    /// Takes ownership of the hardware for this role.
    pub fn acquire(&mut self) -> Result<(), Error> {
        match self.role {
            VmRole::Primary(vm) => vm.acquire(self.ctx),
            VmRole::Trusted(vm) => vm.acquire(self.ctx),
        }
    }

    /// Gives up ownership of the hardware.
    ///
    /// Clients are polled and told first; nothing is reclaimed unless they
    /// all agree.
    pub fn release(&mut self) -> Result<(), Error> {
        match self.role {
            VmRole::Primary(vm) => vm.release(self.ctx),
            VmRole::Trusted(vm) => vm.release(self.ctx),
        }
    }

    /// Returns true if this role may program the hardware.
    pub fn owns_hw(&self) -> bool {
        self.role.owns_hw()
    }

    /// Called before a commit programs the hardware.
    pub fn prepare_commit(&mut self, state: &CommitState) -> Result<(), Error> {
        let result = match self.role {
            VmRole::Primary(vm) => vm.prepare_commit(state),
            VmRole::Trusted(vm) => vm.prepare_commit(state),
        };
        if let Err(err) = &result {
            tracing::error!(
                role = %self.kind(),
                sequence = state.sequence,
                error = err as &dyn std::error::Error,
                "commit rejected"
            );
        }
        result
    }

    /// Called after the last commit before a planned release.
    pub fn post_commit(&mut self, state: &CommitState) -> Result<(), Error> {
        match self.role {
            VmRole::Primary(vm) => vm.post_commit(state),
            VmRole::Trusted(vm) => vm.post_commit(state),
        }
    }

    /// Polls the registered clients for readiness to release.
    pub fn vm_check(&self) -> Result<(), Error> {
        self.ctx.clients().check()
    }

    /// Tells the registered clients to stop using the hardware.
    pub fn client_pre_release(&self) -> Result<(), Error> {
        self.ctx.clients().pre_release()
    }

    /// Tells the registered clients they may use the hardware again.
    pub fn client_post_acquire(&self) -> Result<(), Error> {
        self.ctx.clients().post_acquire()
    }

    /// Checks that the request transition `old -> new` is legal right now.
    pub fn request_valid(&self, old: RequestState, new: RequestState) -> Result<(), Error> {
        self.ctx
            .policy()
            .validate(old, new, self.owns_hw())
            .map(drop)
    }

    /// Validates `old -> new` and then performs the ownership change it
    /// calls for.
    pub fn apply_request(
        &mut self,
        old: RequestState,
        new: RequestState,
    ) -> Result<RequestAction, Error> {
        let action = self.ctx.policy().validate(old, new, self.owns_hw())?;
        tracing::debug!(role = %self.kind(), %old, %new, ?action, "vm request");
        match action {
            RequestAction::None => {}
            RequestAction::Acquire => self.acquire()?,
            RequestAction::Release => self.release()?,
        }
        Ok(action)
    }

    /// Applies a resource manager notification.
    ///
    /// Notifications that do not match the pending cookie return
    /// [`Error::NotificationUnmatched`] and change nothing.
    pub fn on_notification(
        &mut self,
        cookie: NotificationCookie,
        event: HrmEvent,
    ) -> Result<(), Error> {
        match self.role {
            VmRole::Primary(vm) => vm.on_notification(self.ctx, cookie, event),
            VmRole::Trusted(vm) => vm.on_notification(self.ctx, cookie, event),
        }
    }
}
