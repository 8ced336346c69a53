// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Validation of VM ownership request transitions.
//!
//! The request states belong to the display subsystem. The table of legal
//! transitions is handed in through configuration, and this module only
//! matches `(old, new)` pairs against it.

use crate::error::Error;
use display_vm_defs::config::RequestAction;
use display_vm_defs::config::RequestPolicyConfig;
use display_vm_defs::config::TransitionConfig;
use display_vm_defs::RequestState;

/// The table of legal request transitions.
#[derive(Clone, Debug, Default)]
pub struct RequestPolicy {
    transitions: Vec<TransitionConfig>,
}

impl RequestPolicy {
    /// Builds the policy from configuration.
    pub fn new(config: &RequestPolicyConfig) -> Self {
        Self {
            transitions: config.transitions.clone(),
        }
    }

    /// Looks up the transition `old -> new` and checks its ownership
    /// precondition against `owns_hw`.
    ///
    /// Returns the action the transition calls for. Has no side effects.
    pub fn validate(
        &self,
        old: RequestState,
        new: RequestState,
        owns_hw: bool,
    ) -> Result<RequestAction, Error> {
        let rule = self
            .transitions
            .iter()
            .find(|t| t.from == old && t.to == new)
            .filter(|t| t.requires.is_met(owns_hw))
            .ok_or(Error::InvalidTransition { old, new })?;
        Ok(rule.action)
    }
}
