//! Forward hooks on model sub-components.
//!
//! A [`HookPoint`] marks a place inside a model where activations can be observed. Registering
//! a hook returns a [`HookHandle`]; [`Hook`] and [`Hooks`] own handles and detach them when
//! dropped, so instrumentation never outlives the scope that attached it.

use candle::{Result, Tensor};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// One forward pass through an instrumented module.
pub struct Activation<'a> {
    pub module: &'a str,
    pub input: &'a Tensor,
    pub output: &'a Tensor,
}

type ForwardHook = Rc<RefCell<dyn FnMut(&Activation<'_>) -> Result<()>>>;

#[derive(Default)]
struct Registry {
    next_id: usize,
    hooks: Vec<(usize, ForwardHook)>,
}

/// An instrumentation site. Clones share the same set of registered hooks.
#[derive(Clone)]
pub struct HookPoint {
    name: Rc<str>,
    registry: Rc<RefCell<Registry>>,
}

impl HookPoint {
    pub fn new(name: &str) -> Self {
        Self {
            name: Rc::from(name),
            registry: Rc::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_hooks(&self) -> usize {
        self.registry.borrow().hooks.len()
    }

    pub fn register_forward_hook<F>(&self, f: F) -> HookHandle
    where
        F: FnMut(&Activation<'_>) -> Result<()> + 'static,
    {
        let mut registry = self.registry.borrow_mut();
        let id = registry.next_id;
        registry.next_id += 1;
        let hook: ForwardHook = Rc::new(RefCell::new(f));
        registry.hooks.push((id, hook));
        HookHandle {
            id,
            registry: Rc::downgrade(&self.registry),
        }
    }

    /// Runs every registered hook in registration order.
    pub fn fire(&self, input: &Tensor, output: &Tensor) -> Result<()> {
        // Snapshot so a hook may detach itself (or others) while running.
        let hooks: Vec<ForwardHook> = self
            .registry
            .borrow()
            .hooks
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        let activation = Activation {
            module: &self.name,
            input,
            output,
        };
        for hook in hooks {
            (&mut *hook.borrow_mut())(&activation)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookPoint")
            .field("name", &self.name)
            .field("num_hooks", &self.num_hooks())
            .finish()
    }
}

/// Detaches one registered hook. Removing twice is a no-op.
pub struct HookHandle {
    id: usize,
    registry: Weak<RefCell<Registry>>,
}

impl HookHandle {
    pub fn remove(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.borrow_mut().hooks.retain(|(id, _)| *id != self.id);
        }
    }
}

/// A single attached hook, released on [`Hook::remove`] or drop.
pub struct Hook {
    module: String,
    handle: Option<HookHandle>,
}

impl Hook {
    pub fn new<F>(point: &HookPoint, f: F) -> Self
    where
        F: FnMut(&Activation<'_>) -> Result<()> + 'static,
    {
        Self {
            module: point.name().to_string(),
            handle: Some(point.register_forward_hook(f)),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn is_attached(&self) -> bool {
        self.handle.is_some()
    }

    pub fn remove(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.remove();
        }
    }
}

impl Drop for Hook {
    fn drop(&mut self) {
        self.remove()
    }
}

/// Hooks sharing one callback, one per hook point. The callback receives the hook's index.
pub struct Hooks {
    hooks: Vec<Hook>,
}

impl Hooks {
    pub fn new<F>(points: &[HookPoint], f: F) -> Self
    where
        F: FnMut(usize, &Activation<'_>) -> Result<()> + 'static,
    {
        let f = Rc::new(RefCell::new(f));
        let hooks = points
            .iter()
            .enumerate()
            .map(|(idx, point)| {
                let f = f.clone();
                Hook::new(point, move |act: &Activation<'_>| (&mut *f.borrow_mut())(idx, act))
            })
            .collect();
        Self { hooks }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Hook> {
        self.hooks.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Hook> {
        self.hooks.get_mut(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Hook> {
        self.hooks.iter()
    }

    /// Releases the hook at `idx`, then evicts it. Panics if `idx` is out of bounds.
    pub fn remove(&mut self, idx: usize) -> Hook {
        self.hooks[idx].remove();
        self.hooks.remove(idx)
    }

    pub fn release(&mut self) {
        for hook in self.hooks.iter_mut() {
            hook.remove();
        }
    }
}

impl Drop for Hooks {
    fn drop(&mut self) {
        self.release()
    }
}

impl<'a> IntoIterator for &'a Hooks {
    type Item = &'a Hook;
    type IntoIter = std::slice::Iter<'a, Hook>;

    fn into_iter(self) -> Self::IntoIter {
        self.hooks.iter()
    }
}
