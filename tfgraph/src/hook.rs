//! Lifecycle hooks
//!
//! Observers receive a fixed set of notifications during a walk. Each
//! returns a `HookAction`: `Halt` aborts the in-flight action the executor
//! was about to take, but never cancels the whole walk.

use std::sync::Arc;

use async_trait::async_trait;

use crate::addrs::AbsResourceInstance;
use crate::error::EngineError;
use crate::planner::ChangeAction;
use crate::state::State;
use crate::types::DynamicValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    Halt,
}

pub type HookResult = std::result::Result<HookAction, EngineError>;

fn proceed() -> HookResult {
    Ok(HookAction::Continue)
}

/// The notification surface. Every method defaults to `Continue`, so
/// observers implement only what they watch.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn pre_diff(
        &self,
        _addr: &AbsResourceInstance,
        _prior: &DynamicValue,
        _proposed: &DynamicValue,
    ) -> HookResult {
        proceed()
    }

    async fn post_diff(&self, _addr: &AbsResourceInstance, _action: ChangeAction) -> HookResult {
        proceed()
    }

    async fn pre_apply(
        &self,
        _addr: &AbsResourceInstance,
        _action: ChangeAction,
        _prior: &DynamicValue,
        _planned: &DynamicValue,
    ) -> HookResult {
        proceed()
    }

    async fn post_apply(
        &self,
        _addr: &AbsResourceInstance,
        _new_value: &DynamicValue,
        _error: Option<&str>,
    ) -> HookResult {
        proceed()
    }

    async fn pre_refresh(&self, _addr: &AbsResourceInstance, _prior: &DynamicValue) -> HookResult {
        proceed()
    }

    async fn post_refresh(&self, _addr: &AbsResourceInstance, _new: &DynamicValue) -> HookResult {
        proceed()
    }

    async fn pre_provision_instance(&self, _addr: &AbsResourceInstance) -> HookResult {
        proceed()
    }

    async fn post_provision_instance(&self, _addr: &AbsResourceInstance) -> HookResult {
        proceed()
    }

    async fn provision_output(&self, _addr: &AbsResourceInstance, _line: &str) -> HookResult {
        proceed()
    }

    async fn pre_import_state(&self, _addr: &AbsResourceInstance, _id: &str) -> HookResult {
        proceed()
    }

    async fn post_import_state(
        &self,
        _addr: &AbsResourceInstance,
        _imported: usize,
    ) -> HookResult {
        proceed()
    }

    async fn pre_forget(&self, _addr: &AbsResourceInstance) -> HookResult {
        proceed()
    }

    async fn post_forget(&self, _addr: &AbsResourceInstance) -> HookResult {
        proceed()
    }

    async fn state_value_change(
        &self,
        _addr: &AbsResourceInstance,
        _value: &DynamicValue,
    ) -> HookResult {
        proceed()
    }

    /// Delivered exactly once when a user-initiated stop begins.
    async fn stopping(&self) -> HookResult {
        proceed()
    }

    async fn post_state_update(&self, _state: &State) -> HookResult {
        proceed()
    }
}

/// Fans every notification out to registered observers in registration
/// order. The first `Halt` (or error) wins.
#[derive(Default)]
pub struct HookMux {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookMux {
    pub fn new(hooks: Vec<Arc<dyn Hook>>) -> Self {
        Self { hooks }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

macro_rules! fan_out {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {{
        for hook in &$self.hooks {
            match hook.$method($($arg),*).await? {
                HookAction::Continue => {}
                HookAction::Halt => return Ok(HookAction::Halt),
            }
        }
        Ok(HookAction::Continue)
    }};
}

#[async_trait]
impl Hook for HookMux {
    async fn pre_diff(
        &self,
        addr: &AbsResourceInstance,
        prior: &DynamicValue,
        proposed: &DynamicValue,
    ) -> HookResult {
        fan_out!(self, pre_diff(addr, prior, proposed))
    }

    async fn post_diff(&self, addr: &AbsResourceInstance, action: ChangeAction) -> HookResult {
        fan_out!(self, post_diff(addr, action))
    }

    async fn pre_apply(
        &self,
        addr: &AbsResourceInstance,
        action: ChangeAction,
        prior: &DynamicValue,
        planned: &DynamicValue,
    ) -> HookResult {
        fan_out!(self, pre_apply(addr, action, prior, planned))
    }

    async fn post_apply(
        &self,
        addr: &AbsResourceInstance,
        new_value: &DynamicValue,
        error: Option<&str>,
    ) -> HookResult {
        fan_out!(self, post_apply(addr, new_value, error))
    }

    async fn pre_refresh(&self, addr: &AbsResourceInstance, prior: &DynamicValue) -> HookResult {
        fan_out!(self, pre_refresh(addr, prior))
    }

    async fn post_refresh(&self, addr: &AbsResourceInstance, new: &DynamicValue) -> HookResult {
        fan_out!(self, post_refresh(addr, new))
    }

    async fn pre_provision_instance(&self, addr: &AbsResourceInstance) -> HookResult {
        fan_out!(self, pre_provision_instance(addr))
    }

    async fn post_provision_instance(&self, addr: &AbsResourceInstance) -> HookResult {
        fan_out!(self, post_provision_instance(addr))
    }

    async fn provision_output(&self, addr: &AbsResourceInstance, line: &str) -> HookResult {
        fan_out!(self, provision_output(addr, line))
    }

    async fn pre_import_state(&self, addr: &AbsResourceInstance, id: &str) -> HookResult {
        fan_out!(self, pre_import_state(addr, id))
    }

    async fn post_import_state(&self, addr: &AbsResourceInstance, imported: usize) -> HookResult {
        fan_out!(self, post_import_state(addr, imported))
    }

    async fn pre_forget(&self, addr: &AbsResourceInstance) -> HookResult {
        fan_out!(self, pre_forget(addr))
    }

    async fn post_forget(&self, addr: &AbsResourceInstance) -> HookResult {
        fan_out!(self, post_forget(addr))
    }

    async fn state_value_change(
        &self,
        addr: &AbsResourceInstance,
        value: &DynamicValue,
    ) -> HookResult {
        fan_out!(self, state_value_change(addr, value))
    }

    async fn stopping(&self) -> HookResult {
        fan_out!(self, stopping())
    }

    async fn post_state_update(&self, state: &State) -> HookResult {
        fan_out!(self, post_state_update(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{InstanceKey, ModuleInstance, Resource};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        calls: AtomicUsize,
        halt_on_pre_apply: bool,
    }

    #[async_trait]
    impl Hook for CountingHook {
        async fn pre_apply(
            &self,
            _addr: &AbsResourceInstance,
            _action: ChangeAction,
            _prior: &DynamicValue,
            _planned: &DynamicValue,
        ) -> HookResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.halt_on_pre_apply {
                Ok(HookAction::Halt)
            } else {
                Ok(HookAction::Continue)
            }
        }
    }

    fn addr() -> AbsResourceInstance {
        AbsResourceInstance {
            module: ModuleInstance::root(),
            resource: Resource::managed("aws_instance", "x"),
            key: InstanceKey::None,
        }
    }

    #[tokio::test]
    async fn mux_calls_hooks_in_registration_order() {
        let first = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
            halt_on_pre_apply: false,
        });
        let second = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
            halt_on_pre_apply: false,
        });
        let mux = HookMux::new(vec![first.clone(), second.clone()]);

        let action = mux
            .pre_apply(
                &addr(),
                ChangeAction::Create,
                &DynamicValue::null(),
                &DynamicValue::null(),
            )
            .await
            .unwrap();

        assert_eq!(action, HookAction::Continue);
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn halt_stops_fan_out() {
        let first = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
            halt_on_pre_apply: true,
        });
        let second = Arc::new(CountingHook {
            calls: AtomicUsize::new(0),
            halt_on_pre_apply: false,
        });
        let mux = HookMux::new(vec![first.clone(), second.clone()]);

        let action = mux
            .pre_apply(
                &addr(),
                ChangeAction::Create,
                &DynamicValue::null(),
                &DynamicValue::null(),
            )
            .await
            .unwrap();

        assert_eq!(action, HookAction::Halt);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn default_methods_continue() {
        struct Silent;
        impl Hook for Silent {}

        let mux = HookMux::new(vec![Arc::new(Silent)]);
        let action = mux.stopping().await.unwrap();
        assert_eq!(action, HookAction::Continue);
    }
}
