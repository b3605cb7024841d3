//! Components and the hook surface they render with.
//!
//! Each component instance owns an indexed slot array. Every hook call during
//! render consumes the next slot, so an instance must call the same hooks in
//! the same order on every tick. A slot holding a different hook kind than
//! the call expects fails with [`ContextError::HookOrder`].

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::com::{Com, TickState};
use crate::context::ExecutionContext;
use crate::error::ContextError;
use crate::node::ComponentNode;
use crate::render::SemanticNode;
use crate::state::{Computed, Disposable, Signal, StateValue};

/// A reusable piece of agent behavior.
///
/// Lifecycle per instance: `on_mount` once before the first render,
/// `on_tick_start` at the start of every later tick, `render` every tick,
/// `on_unmount` once when the instance leaves the tree.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn on_mount(&self, _com: &Com) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_tick_start(&self, _com: &Com, _tick: &TickState) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_unmount(&self, _com: &Com) -> anyhow::Result<()> {
        Ok(())
    }

    /// Produces this component's subtree. `children` arrive already rendered.
    async fn render(
        &self,
        cx: &mut RenderContext<'_>,
        props: &Value,
        children: Children,
    ) -> anyhow::Result<Vec<ComponentNode>>;
}

/// A component's children, rendered before the component itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Children {
    nodes: Vec<SemanticNode>,
}

impl Children {
    pub(crate) fn new(nodes: Vec<SemanticNode>) -> Self {
        Self { nodes }
    }

    pub fn nodes(&self) -> &[SemanticNode] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Plain text across all children.
    pub fn text(&self) -> String {
        self.nodes.iter().map(SemanticNode::plain_text).collect()
    }

    /// Splices the rendered children back into the tree.
    pub fn into_node(self) -> ComponentNode {
        ComponentNode::prerendered(self.nodes)
    }
}

type TickCallback = Arc<dyn Fn(&Com, &TickState) + Send + Sync>;

enum HookSlot {
    Signal(Box<dyn Any + Send + Sync>, Box<dyn Disposable>),
    Computed(Box<dyn Any + Send + Sync>),
    ComState { key: String, signal: Box<dyn Any + Send + Sync> },
    Init,
    TickStart(TickCallback),
}

impl HookSlot {
    fn kind(&self) -> &'static str {
        match self {
            HookSlot::Signal(..) => "use_signal",
            HookSlot::Computed(_) => "use_computed",
            HookSlot::ComState { .. } => "use_com_state",
            HookSlot::Init => "use_init",
            HookSlot::TickStart(_) => "use_tick_start",
        }
    }
}

/// Per-instance state the compiler keeps between ticks.
pub(crate) struct Instance {
    pub(crate) component: Arc<dyn Component>,
    slots: Vec<HookSlot>,
}

impl Instance {
    pub(crate) fn new(component: Arc<dyn Component>) -> Self {
        Self {
            component,
            slots: Vec::new(),
        }
    }

    pub(crate) fn tick_callbacks(&self) -> Vec<TickCallback> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                HookSlot::TickStart(callback) => Some(callback.clone()),
                _ => None,
            })
            .collect()
    }

    /// Releases component-local signals. Shared slots stay in the COM.
    pub(crate) fn dispose(&mut self) {
        for slot in self.slots.drain(..) {
            if let HookSlot::Signal(_, handle) = slot {
                handle.dispose();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

/// Hook surface available while a component renders.
pub struct RenderContext<'a> {
    com: &'a Com,
    execution: &'a ExecutionContext,
    tick: u32,
    instance: &'a mut Instance,
    cursor: usize,
    component_name: String,
}

impl<'a> RenderContext<'a> {
    pub(crate) fn new(
        com: &'a Com,
        execution: &'a ExecutionContext,
        tick: u32,
        instance: &'a mut Instance,
    ) -> Self {
        let component_name = instance.component.name().to_string();
        Self {
            com,
            execution,
            tick,
            instance,
            cursor: 0,
            component_name,
        }
    }

    pub fn com(&self) -> &Com {
        self.com
    }

    pub fn execution(&self) -> &ExecutionContext {
        self.execution
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    fn order_error(&self, expected: &'static str) -> ContextError {
        ContextError::HookOrder {
            component: self.component_name.clone(),
            slot: self.cursor,
            expected,
        }
    }

    /// Returns the existing slot at the cursor, or `None` on first render.
    fn next_slot(&mut self, expected: &'static str) -> Result<Option<&mut HookSlot>, ContextError> {
        let index = self.cursor;
        self.cursor += 1;
        match self.instance.slots.get(index).map(HookSlot::kind) {
            None => Ok(None),
            Some(kind) if kind == expected => Ok(self.instance.slots.get_mut(index)),
            Some(_) => {
                self.cursor = index;
                Err(self.order_error(expected))
            }
        }
    }

    fn push_slot(&mut self, slot: HookSlot) -> Result<(), ContextError> {
        // A slot can only be appended right after the existing ones.
        if self.cursor != self.instance.slots.len() + 1 {
            self.cursor -= 1;
            return Err(self.order_error(slot.kind()));
        }
        self.instance.slots.push(slot);
        Ok(())
    }

    /// Component-local signal, initialized on first render and disposed on unmount.
    pub fn use_signal<T: StateValue>(
        &mut self,
        init: impl FnOnce() -> T,
    ) -> Result<Signal<T>, ContextError> {
        let existing = match self.next_slot("use_signal")? {
            Some(HookSlot::Signal(value, _)) => Some(value.downcast_ref::<Signal<T>>().cloned()),
            _ => None,
        };
        if let Some(found) = existing {
            return found.ok_or_else(|| self.type_error("use_signal"));
        }
        let signal = Signal::new(init());
        self.push_slot(HookSlot::Signal(
            Box::new(signal.clone()),
            Box::new(signal.clone()),
        ))?;
        Ok(signal)
    }

    /// Memoized derived value. `compute` is captured on first render only.
    pub fn use_computed<T: StateValue>(
        &mut self,
        compute: impl Fn() -> T + Send + Sync + 'static,
    ) -> Result<Computed<T>, ContextError> {
        let existing = match self.next_slot("use_computed")? {
            Some(HookSlot::Computed(value)) => Some(value.downcast_ref::<Computed<T>>().cloned()),
            _ => None,
        };
        if let Some(found) = existing {
            return found.ok_or_else(|| self.type_error("use_computed"));
        }
        let computed = Computed::new(compute);
        self.push_slot(HookSlot::Computed(Box::new(computed.clone())))?;
        Ok(computed)
    }

    /// Shared signal bound to `key` in the COM.
    pub fn use_com_state<T: StateValue + Serialize>(
        &mut self,
        key: &str,
        init: impl FnOnce() -> T,
    ) -> Result<Signal<T>, ContextError> {
        let existing = match self.next_slot("use_com_state")? {
            Some(HookSlot::ComState { key: bound, signal }) => {
                Some((bound == key, signal.downcast_ref::<Signal<T>>().cloned()))
            }
            _ => None,
        };
        match existing {
            Some((true, found)) => found.ok_or_else(|| ContextError::TypeMismatch {
                key: key.to_string(),
            }),
            Some((false, _)) => {
                // Same slot, new key: rebind.
                let signal = self.com.state(key, init)?;
                if let Some(slot) = self.instance.slots.get_mut(self.cursor - 1) {
                    *slot = HookSlot::ComState {
                        key: key.to_string(),
                        signal: Box::new(signal.clone()),
                    };
                }
                Ok(signal)
            }
            None => {
                let signal = self.com.state(key, init)?;
                self.push_slot(HookSlot::ComState {
                    key: key.to_string(),
                    signal: Box::new(signal.clone()),
                })?;
                Ok(signal)
            }
        }
    }

    /// Runs `init` once, on the instance's first render, and awaits it.
    pub async fn use_init<F, Fut>(&mut self, init: F) -> anyhow::Result<()>
    where
        F: FnOnce(Com) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if self.next_slot("use_init")?.is_some() {
            return Ok(());
        }
        self.push_slot(HookSlot::Init)?;
        init(self.com.clone()).await
    }

    /// Registers a callback for the start of every later tick. The latest
    /// closure passed wins.
    pub fn use_tick_start(
        &mut self,
        callback: impl Fn(&Com, &TickState) + Send + Sync + 'static,
    ) -> Result<(), ContextError> {
        let callback: TickCallback = Arc::new(callback);
        if let Some(slot) = self.next_slot("use_tick_start")? {
            *slot = HookSlot::TickStart(callback);
            return Ok(());
        }
        self.push_slot(HookSlot::TickStart(callback))
    }

    fn type_error(&self, expected: &'static str) -> ContextError {
        ContextError::HookOrder {
            component: self.component_name.clone(),
            slot: self.cursor.saturating_sub(1),
            expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    #[async_trait]
    impl Component for Probe {
        fn name(&self) -> &str {
            "Probe"
        }

        async fn render(
            &self,
            _cx: &mut RenderContext<'_>,
            _props: &Value,
            _children: Children,
        ) -> anyhow::Result<Vec<ComponentNode>> {
            Ok(Vec::new())
        }
    }

    fn instance() -> Instance {
        Instance::new(Arc::new(Probe))
    }

    #[test]
    fn test_signal_slot_survives_rerender() {
        let com = Com::new(Vec::new());
        let exec = ExecutionContext::new();
        let mut inst = instance();

        let first = {
            let mut cx = RenderContext::new(&com, &exec, 1, &mut inst);
            let s = cx.use_signal(|| 1).unwrap();
            s.set(5);
            s
        };
        let second = {
            let mut cx = RenderContext::new(&com, &exec, 2, &mut inst);
            cx.use_signal(|| 1).unwrap()
        };
        assert!(first.ptr_eq(&second));
        assert_eq!(second.get(), 5);
        assert_eq!(inst.slot_count(), 1);
    }

    #[test]
    fn test_hook_order_violation() {
        let com = Com::new(Vec::new());
        let exec = ExecutionContext::new();
        let mut inst = instance();
        {
            let mut cx = RenderContext::new(&com, &exec, 1, &mut inst);
            cx.use_signal(|| 0).unwrap();
        }
        let mut cx = RenderContext::new(&com, &exec, 2, &mut inst);
        let err = cx.use_com_state("k", || 0).unwrap_err();
        assert_eq!(
            err,
            ContextError::HookOrder {
                component: "Probe".to_string(),
                slot: 0,
                expected: "use_com_state",
            }
        );
    }

    #[test]
    fn test_com_state_is_shared_and_survives_dispose() {
        let com = Com::new(Vec::new());
        let exec = ExecutionContext::new();
        let mut a = instance();
        let mut b = instance();
        let local = {
            let mut cx = RenderContext::new(&com, &exec, 1, &mut a);
            let shared = cx.use_com_state("count", || 1).unwrap();
            shared.set(2);
            cx.use_signal(|| "local".to_string()).unwrap()
        };
        let seen = {
            let mut cx = RenderContext::new(&com, &exec, 1, &mut b);
            cx.use_com_state("count", || 100).unwrap()
        };
        assert_eq!(seen.get(), 2);

        a.dispose();
        assert!(local.try_get().is_err());
        assert_eq!(com.get("count"), Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn test_use_init_runs_once() {
        let com = Com::new(Vec::new());
        let exec = ExecutionContext::new();
        let mut inst = instance();
        for tick in 1..=3 {
            let mut cx = RenderContext::new(&com, &exec, tick, &mut inst);
            cx.use_init(|com| async move {
                let runs = com.state("runs", || 0)?;
                runs.update(|n| n + 1);
                Ok(())
            })
            .await
            .unwrap();
        }
        assert_eq!(com.get("runs"), Some(serde_json::json!(1)));
    }

    #[test]
    fn test_tick_callbacks_keep_latest_closure() {
        let com = Com::new(Vec::new());
        let exec = ExecutionContext::new();
        let mut inst = instance();
        for tick in 1..=2_u32 {
            let mut cx = RenderContext::new(&com, &exec, tick, &mut inst);
            cx.use_tick_start(move |com, _state| {
                com.set("last", serde_json::json!(tick)).unwrap();
            })
            .unwrap();
        }
        let callbacks = inst.tick_callbacks();
        assert_eq!(callbacks.len(), 1);
        callbacks[0](&com, &com.tick_state());
        assert_eq!(com.get("last"), Some(serde_json::json!(2)));
    }
}
