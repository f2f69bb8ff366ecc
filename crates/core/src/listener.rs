//! Invocation listeners.

use std::sync::Arc;

use crate::invocation::InvocationContext;

/// Object notified around every call of a hooked function.
///
/// Both callbacks default to no-ops so a listener may implement only the
/// side it cares about. Callbacks run on the thread that invoked the hooked
/// function and must not panic across the boundary; report problems through
/// [`InvocationContext::set_system_error`] or by logging.
pub trait Listener: Send + Sync {
    fn on_enter(&self, _ctx: &mut InvocationContext<'_>) {}
    fn on_leave(&self, _ctx: &mut InvocationContext<'_>) {}
}

type Callback = Box<dyn Fn(&mut InvocationContext<'_>) + Send + Sync>;

/// Adapts a pair of closures into a [`Listener`], the way a script runtime
/// builds listeners from user callbacks.
#[derive(Default)]
pub struct ClosureListener {
    enter: Option<Callback>,
    leave: Option<Callback>,
}

impl ClosureListener {
    pub fn new<E, L>(enter: E, leave: L) -> Arc<dyn Listener>
    where
        E: Fn(&mut InvocationContext<'_>) + Send + Sync + 'static,
        L: Fn(&mut InvocationContext<'_>) + Send + Sync + 'static,
    {
        Arc::new(Self {
            enter: Some(Box::new(enter)),
            leave: Some(Box::new(leave)),
        })
    }

    pub fn on_enter<E>(enter: E) -> Arc<dyn Listener>
    where
        E: Fn(&mut InvocationContext<'_>) + Send + Sync + 'static,
    {
        Arc::new(Self {
            enter: Some(Box::new(enter)),
            leave: None,
        })
    }

    pub fn on_leave<L>(leave: L) -> Arc<dyn Listener>
    where
        L: Fn(&mut InvocationContext<'_>) + Send + Sync + 'static,
    {
        Arc::new(Self {
            enter: None,
            leave: Some(Box::new(leave)),
        })
    }
}

impl Listener for ClosureListener {
    fn on_enter(&self, ctx: &mut InvocationContext<'_>) {
        if let Some(enter) = &self.enter {
            enter(ctx);
        }
    }

    fn on_leave(&self, ctx: &mut InvocationContext<'_>) {
        if let Some(leave) = &self.leave {
            leave(ctx);
        }
    }
}

/// One attachment of a listener to a target function.
pub(crate) struct ListenerEntry {
    pub(crate) listener: Arc<dyn Listener>,
    /// Opaque pointer handed back through `listener_function_data`.
    pub(crate) function_data: *mut std::ffi::c_void,
    /// Index into the per-frame scratch slots, if one was available.
    pub(crate) slot: Option<usize>,
}

// SAFETY: function_data is an opaque pointer the caller promised to keep
// valid and shareable for the lifetime of the attachment
unsafe impl Send for ListenerEntry {}
unsafe impl Sync for ListenerEntry {}

impl ListenerEntry {
    /// Stable identity of the underlying listener object.
    pub(crate) fn identity(&self) -> *const () {
        Arc::as_ptr(&self.listener) as *const ()
    }
}
