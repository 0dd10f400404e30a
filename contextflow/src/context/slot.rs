//! Typed thread-local context slots.
//!
//! A [`ContextSlot`] is the stock [`ContextManager`]: it keeps one stack of
//! activation frames per thread. Activating pushes a frame, closing the top
//! frame pops it (along with frames beneath it that were already closed), and
//! the active value is whatever the top frame holds.

use super::{ActiveContext, ContextManager, ContextManagers, ContextValue};
use crate::errors::ContextflowError;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

static NEXT_SLOT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Token of the frame created by `replace` on an empty stack. No handle owns it.
const BASE_TOKEN: u64 = 0;

struct Frame {
    token: u64,
    value: Option<ContextValue>,
    closed: bool,
}

thread_local! {
    static FRAMES: RefCell<HashMap<u64, Vec<Frame>>> = RefCell::new(HashMap::new());
}

/// Runs `f` against this thread's frame stacks.
///
/// Anything `f` removes must be returned and dropped by the caller, so that
/// value destructors never run while the stacks are borrowed.
fn with_frames<R>(
    slot: &str,
    f: impl FnOnce(&mut HashMap<u64, Vec<Frame>>) -> R,
) -> Result<R, ContextflowError> {
    FRAMES
        .try_with(|frames| f(&mut frames.borrow_mut()))
        .map_err(|_| ContextflowError::manager(slot, "thread-local context storage was destroyed"))
}

/// A typed, thread-local piece of context.
///
/// # Example
///
/// ```rust
/// use contextflow::prelude::*;
///
/// let user = ContextSlot::<String>::register("user");
/// let _guard = user.set("alice".to_string());
///
/// let snapshot = ContextSnapshot::capture();
/// let seen = std::thread::spawn(move || snapshot.run(|| user.get_cloned()))
///     .join()
///     .unwrap();
/// assert_eq!(seen.as_deref(), Some("alice"));
/// ```
pub struct ContextSlot<T> {
    id: u64,
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ContextSlot<T> {
    /// Creates an unregistered slot.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            _marker: PhantomData,
        }
    }

    /// Creates a slot and registers it with the global registry.
    #[must_use]
    pub fn register(name: impl Into<String>) -> Arc<Self> {
        let slot = Arc::new(Self::new(name));
        ContextManagers::global().register(slot.clone());
        slot
    }

    /// Returns the slot name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value active on the current thread.
    #[must_use]
    pub fn get(&self) -> Option<Arc<T>> {
        self.top_value()
            .ok()
            .flatten()
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Returns a clone of the value active on the current thread.
    #[must_use]
    pub fn get_cloned(&self) -> Option<T>
    where
        T: Clone,
    {
        self.get().map(|value| value.as_ref().clone())
    }

    /// Makes `value` active until the returned guard is closed or dropped.
    pub fn set(&self, value: T) -> SlotGuard {
        let value: ContextValue = Arc::new(value);
        match self.push(Some(value)) {
            Ok(scope) => SlotGuard { scope: Some(scope) },
            Err(err) => {
                error!(slot = %self.name, error = %err, "Failed to set context value");
                SlotGuard { scope: None }
            }
        }
    }

    /// Replaces the active value without scoping, returning the previous one.
    pub fn replace(&self, value: Option<T>) -> Option<Arc<T>> {
        let value = value.map(|v| Arc::new(v) as ContextValue);
        let previous = with_frames(&self.name, |frames| {
            let stack = frames.entry(self.id).or_default();
            match stack.last_mut() {
                Some(frame) => std::mem::replace(&mut frame.value, value),
                None => {
                    stack.push(Frame {
                        token: BASE_TOKEN,
                        value,
                        closed: false,
                    });
                    None
                }
            }
        });
        match previous {
            Ok(previous) => previous.and_then(|v| v.downcast::<T>().ok()),
            Err(err) => {
                error!(slot = %self.name, error = %err, "Failed to replace context value");
                None
            }
        }
    }

    fn top_value(&self) -> Result<Option<ContextValue>, ContextflowError> {
        with_frames(&self.name, |frames| {
            frames
                .get(&self.id)
                .and_then(|stack| stack.last())
                .and_then(|frame| frame.value.clone())
        })
    }

    fn push(&self, value: Option<ContextValue>) -> Result<SlotScope, ContextflowError> {
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        with_frames(&self.name, |frames| {
            frames.entry(self.id).or_default().push(Frame {
                token,
                value,
                closed: false,
            });
        })?;
        trace!(slot = %self.name, token, "Activated context frame");
        Ok(SlotScope {
            slot_id: self.id,
            name: self.name.clone(),
            token,
        })
    }
}

impl<T: Send + Sync + 'static> ContextManager for ContextSlot<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn active_value(&self) -> Result<Option<ContextValue>, ContextflowError> {
        self.top_value()
    }

    fn activate(
        &self,
        value: Option<ContextValue>,
    ) -> Result<Box<dyn ActiveContext>, ContextflowError> {
        if let Some(ref value) = value {
            if !value.is::<T>() {
                return Err(ContextflowError::manager(
                    &self.name,
                    format!("value is not a {}", std::any::type_name::<T>()),
                ));
            }
        }
        Ok(Box::new(self.push(value)?))
    }

    fn clear(&self) -> Result<(), ContextflowError> {
        let removed = with_frames(&self.name, |frames| frames.remove(&self.id))?;
        drop(removed);
        Ok(())
    }
}

impl<T> fmt::Debug for ContextSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSlot")
            .field("name", &self.name)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

/// Undo handle for one activation frame.
struct SlotScope {
    slot_id: u64,
    name: String,
    token: u64,
}

impl SlotScope {
    fn restore(&self) -> Result<(), ContextflowError> {
        let (found, popped) = with_frames(&self.name, |frames| {
            let Some(stack) = frames.get_mut(&self.slot_id) else {
                return (false, Vec::new());
            };
            let Some(position) = stack.iter().rposition(|frame| frame.token == self.token) else {
                return (false, Vec::new());
            };
            stack[position].closed = true;

            let mut popped = Vec::new();
            while stack.last().is_some_and(|frame| frame.closed) {
                popped.extend(stack.pop());
            }
            if stack.is_empty() {
                frames.remove(&self.slot_id);
            }
            (true, popped)
        })?;

        if !found {
            debug!(slot = %self.name, token = self.token, "Context frame already cleared");
        } else if popped.is_empty() {
            debug!(slot = %self.name, token = self.token, "Context frame closed out of order");
        }
        drop(popped);
        Ok(())
    }
}

impl ActiveContext for SlotScope {
    fn close(self: Box<Self>) -> Result<(), ContextflowError> {
        self.restore()
    }
}

/// Restores a slot's previous value when closed or dropped.
#[must_use = "the value is deactivated as soon as the guard is dropped"]
pub struct SlotGuard {
    scope: Option<SlotScope>,
}

impl SlotGuard {
    /// Restores the previous value.
    pub fn close(mut self) -> Result<(), ContextflowError> {
        self.scope.take().map_or(Ok(()), |scope| scope.restore())
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            if let Err(err) = scope.restore() {
                error!(slot = %scope.name, error = %err, "Failed to restore context value");
            }
        }
    }
}

impl fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotGuard")
            .field("slot", &self.scope.as_ref().map(|s| s.name.as_str()))
            .finish()
    }
}
