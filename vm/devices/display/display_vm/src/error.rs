// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use display_vm_defs::IrqLabel;
use display_vm_defs::MemHandle;
use display_vm_defs::NotificationCookie;
use display_vm_defs::RequestState;
use thiserror::Error;

/// A resource moving between VMs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resource {
    /// An interrupt line.
    Irq(IrqLabel),
    /// A batch of interrupt lines.
    Irqs,
    /// The display I/O memory.
    IoMemory,
    /// A resource manager notifier.
    Notifier,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Irq(label) => write!(f, "irq label {label}"),
            Resource::Irqs => f.write_str("irqs"),
            Resource::IoMemory => f.write_str("io memory"),
            Resource::Notifier => f.write_str("notifier"),
        }
    }
}

/// How a reclaimed resource set differs from the one that was lent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mismatch {
    /// The interrupt labels differ.
    Irqs {
        /// The labels that were lent.
        expected: Vec<IrqLabel>,
        /// The labels that came back.
        actual: Vec<IrqLabel>,
    },
    /// The memory handle differs.
    Memory {
        /// The handle that was lent.
        expected: Option<MemHandle>,
        /// The handle that came back.
        actual: MemHandle,
    },
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mismatch::Irqs { expected, actual } => {
                write!(f, "irq labels {actual:?}, expected {expected:?}")
            }
            Mismatch::Memory { expected, actual } => {
                write!(f, "memory handle {actual}, expected {expected:?}")
            }
        }
    }
}

/// Which client broadcast failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientPhase {
    /// The readiness poll.
    Check,
    /// The pre-release notification.
    PreRelease,
    /// The post-acquire notification.
    PostAcquire,
}

impl std::fmt::Display for ClientPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ClientPhase::Check => "vm check",
            ClientPhase::PreRelease => "pre-release",
            ClientPhase::PostAcquire => "post-acquire",
        })
    }
}

/// Errors from the display VM layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("resource manager rejected lend of {0}")]
    ResourceLendFailure(Resource, #[source] anyhow::Error),
    #[error("resource manager failed to reclaim {0}")]
    ResourceReclaimFailure(Resource, #[source] anyhow::Error),
    #[error("reclaimed resources do not match the lent set: {0}")]
    ResourceMismatch(Mismatch),
    #[error("session resources are suspect, the vm layer must be reinitialized")]
    Poisoned,
    #[error("hardware access attempted without ownership")]
    OwnershipViolation,
    #[error("resources are still lent to the peer vm")]
    ResourcesOutstanding,
    #[error("commit {committed} is older than prepared commit {prepared}")]
    StaleCommit { prepared: u64, committed: u64 },
    #[error("client {0} is not ready to release the hardware")]
    ClientNotReady(String),
    #[error("client {name} failed {phase}")]
    Client {
        name: String,
        phase: ClientPhase,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid vm request transition {old} -> {new}")]
    InvalidTransition {
        old: RequestState,
        new: RequestState,
    },
    #[error("notification cookie {cookie} does not match pending {pending:?}")]
    NotificationUnmatched {
        cookie: NotificationCookie,
        pending: Option<NotificationCookie>,
    },
    #[error("notification {0} already pending")]
    NotificationPending(NotificationCookie),
    #[error("io memory {0} already lent")]
    MemoryAlreadyLent(MemHandle),
    #[error("failed to undo a partial lend, the vm layer must be reinitialized")]
    RollbackFailed(#[source] Box<Error>),
}

impl Error {
    /// Returns true if the error leaves the resource state untrustworthy, so
    /// the role must be torn down and reinitialized rather than retried.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::ResourceMismatch(_) | Error::Poisoned | Error::RollbackFailed(_)
        )
    }
}
