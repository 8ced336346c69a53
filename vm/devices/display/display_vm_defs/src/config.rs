// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration for the display VM layer.
//!
//! The configuration is normally produced from the platform device tree by
//! the embedding driver and handed over as JSON.

use crate::IrqDesc;
use crate::RequestState;
use crate::SglDesc;
use crate::VmId;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Errors loading a [`DisplayVmConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The JSON is malformed or a resource descriptor is invalid.
    #[error("failed to parse display vm config")]
    Parse(#[source] serde_json::Error),
    /// The same interrupt line has a different label in each role.
    #[error("irq {irq} is configured for both roles with different labels")]
    ConflictingIrq {
        /// The mapped interrupt number.
        irq: u32,
    },
    /// The request policy lists a transition twice.
    #[error("duplicate transition {from} -> {to} in request policy")]
    DuplicateTransition {
        /// The request state being left.
        from: RequestState,
        /// The request state being entered.
        to: RequestState,
    },
}

/// Top-level configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DisplayVmConfig {
    /// The VM that resources are lent to during a trusted session.
    pub trusted_vm: VmId,
    /// Resources owned by the primary VM at boot.
    pub primary: PrimaryConfig,
    /// Resources requested by the trusted VM.
    pub trusted: TrustedConfig,
    /// The legal VM request transitions.
    #[serde(default)]
    pub request_policy: RequestPolicyConfig,
}

/// Primary role configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrimaryConfig {
    /// The interrupt lines the primary must get back on reclaim.
    pub irqs: IrqDesc,
}

/// Trusted role configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustedConfig {
    /// Interrupt lines requested on acquire, in request order.
    pub irqs: IrqDesc,
    /// The display I/O memory requested on acquire.
    pub io_ranges: SglDesc,
}

/// The injected VM request transition table.
///
/// An empty table rejects every transition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestPolicyConfig {
    /// The legal transitions.
    pub transitions: Vec<TransitionConfig>,
}

/// One legal VM request transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionConfig {
    /// The request state being left.
    pub from: RequestState,
    /// The request state being entered.
    pub to: RequestState,
    /// The hardware ownership the current role must have.
    #[serde(default)]
    pub requires: OwnershipRequirement,
    /// What accepting the transition does to the role.
    #[serde(default)]
    pub action: RequestAction,
}

/// Hardware ownership precondition of a transition.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipRequirement {
    /// No ownership precondition.
    #[default]
    Any,
    /// The role must own the hardware.
    Owned,
    /// The role must not own the hardware.
    NotOwned,
}

impl OwnershipRequirement {
    /// Returns true if `owns_hw` satisfies the requirement.
    pub fn is_met(&self, owns_hw: bool) -> bool {
        match self {
            OwnershipRequirement::Any => true,
            OwnershipRequirement::Owned => owns_hw,
            OwnershipRequirement::NotOwned => !owns_hw,
        }
    }
}

/// The ownership operation triggered by an accepted transition.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestAction {
    /// Bookkeeping only.
    #[default]
    None,
    /// Take ownership of the hardware.
    Acquire,
    /// Give up ownership of the hardware.
    Release,
}

impl DisplayVmConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the cross-field invariants that the individual types cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for trusted in self.trusted.irqs.entries() {
            if let Some(primary) = self
                .primary
                .irqs
                .entries()
                .iter()
                .find(|primary| primary.irq == trusted.irq)
            {
                if primary.label != trusted.label {
                    return Err(ConfigError::ConflictingIrq { irq: trusted.irq });
                }
            }
        }

        let transitions = &self.request_policy.transitions;
        for (i, t) in transitions.iter().enumerate() {
            if transitions[..i]
                .iter()
                .any(|prev| prev.from == t.from && prev.to == t.to)
            {
                return Err(ConfigError::DuplicateTransition {
                    from: t.from,
                    to: t.to,
                });
            }
        }
        Ok(())
    }
}
