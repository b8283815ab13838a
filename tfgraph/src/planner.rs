//! Per-instance change policy
//!
//! Decides the action for every managed resource instance from its prior
//! state object, config presence, lifecycle flags, removed blocks and plan
//! mode. Destruction protection has two layers: for current instances the
//! latest configuration wins, while deposed and expansion-orphaned objects
//! honor the state's recorded flag as a one-way latch, because the current
//! configuration can no longer reach those objects. A `removed {}` block
//! restores the operator's voice and overrides both.

use crate::config::Lifecycle;
use crate::state::{ObjectStatus, ResourceInstanceObject};

/// The action planned for one resource instance object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    NoOp,
    Create,
    Read,
    Update,
    Delete,
    /// Remove from state without calling the provider's delete path.
    Forget,
    DeleteThenCreate,
    ForgetThenCreate,
}

impl ChangeAction {
    pub fn is_replace(&self) -> bool {
        matches!(self, ChangeAction::DeleteThenCreate | ChangeAction::ForgetThenCreate)
    }

    pub fn destroys(&self) -> bool {
        matches!(self, ChangeAction::Delete | ChangeAction::DeleteThenCreate)
    }

    pub fn forgets(&self) -> bool {
        matches!(self, ChangeAction::Forget | ChangeAction::ForgetThenCreate)
    }
}

/// The overall mode a plan runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    Normal,
    Destroy,
    RefreshOnly,
}

/// Decision inputs for a current (non-deposed) instance object.
pub struct CurrentInstanceInput<'a> {
    pub prior: Option<&'a ResourceInstanceObject>,
    /// The declaration exists and this instance is within its expansion.
    pub in_config: bool,
    /// Lifecycle of the declaration; meaningful only with `in_config`.
    pub lifecycle: Lifecycle,
    /// A `removed {}` block addresses this resource, with its destroy flag.
    pub removed_destroy: Option<bool>,
    pub mode: PlanMode,
    /// The provider demanded replacement, or the object is tainted.
    pub needs_replace: bool,
    /// The planned value differs from the prior value.
    pub has_changes: bool,
}

/// The action for a current instance object.
pub fn plan_current_action(input: &CurrentInstanceInput<'_>) -> ChangeAction {
    // removed{} is the operator's explicit instruction; it overrides both
    // the config lifecycle and the state flag.
    if let Some(destroy) = input.removed_destroy {
        if input.prior.is_none() {
            return ChangeAction::NoOp;
        }
        return if destroy {
            ChangeAction::Delete
        } else {
            ChangeAction::Forget
        };
    }

    if !input.in_config {
        // Orphan: config absent or the instance fell out of the expansion.
        // The state flag is the only voice left.
        let Some(prior) = input.prior else {
            return ChangeAction::NoOp;
        };
        return if prior.skip_destroy {
            ChangeAction::Forget
        } else {
            ChangeAction::Delete
        };
    }

    match input.mode {
        PlanMode::Destroy => {
            if input.prior.is_none() {
                return ChangeAction::NoOp;
            }
            if input.lifecycle.destroy {
                ChangeAction::Delete
            } else {
                ChangeAction::Forget
            }
        }
        PlanMode::RefreshOnly => ChangeAction::NoOp,
        PlanMode::Normal => {
            if !input.lifecycle.enabled {
                let Some(prior) = input.prior else {
                    return ChangeAction::NoOp;
                };
                if !input.lifecycle.destroy {
                    return ChangeAction::Forget;
                }
                // destroy=true: the state flag still protects the retired
                // instance.
                return if prior.skip_destroy {
                    ChangeAction::Forget
                } else {
                    ChangeAction::Delete
                };
            }

            let Some(prior) = input.prior else {
                return ChangeAction::Create;
            };
            let needs_replace =
                input.needs_replace || prior.status == ObjectStatus::Tainted;
            if needs_replace {
                return if input.lifecycle.destroy {
                    ChangeAction::DeleteThenCreate
                } else {
                    ChangeAction::ForgetThenCreate
                };
            }
            if input.has_changes {
                ChangeAction::Update
            } else {
                ChangeAction::NoOp
            }
        }
    }
}

/// Decision inputs for a deposed object.
pub struct DeposedInput {
    /// The deposed object's recorded flag.
    pub skip_destroy: bool,
    /// Lifecycle destroy flag of the current declaration, if one exists.
    pub config_destroy: Option<bool>,
    pub removed_destroy: Option<bool>,
}

/// The action for a deposed object. Deposed objects never create; the only
/// question is delete versus forget.
pub fn plan_deposed_action(input: &DeposedInput) -> ChangeAction {
    if let Some(destroy) = input.removed_destroy {
        return if destroy {
            ChangeAction::Delete
        } else {
            ChangeAction::Forget
        };
    }

    match input.config_destroy {
        Some(false) => ChangeAction::Forget,
        // With destroy allowed (or the declaration gone entirely), the
        // state flag is a one-way latch protecting the deposed object.
        Some(true) | None => {
            if input.skip_destroy {
                ChangeAction::Forget
            } else {
                ChangeAction::Delete
            }
        }
    }
}
