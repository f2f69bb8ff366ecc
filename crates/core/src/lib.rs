//! divert core - inline function interception for native code.
//!
//! The interceptor patches the prologue of a target function with a short
//! branch into generated trampolines that save CPU state, dispatch listener
//! callbacks around the call, and optionally divert execution to a
//! replacement function. Displaced prologue bytes are relocated by the
//! per-architecture engines in `divert-arch`.
//!
//! # Example
//!
//! ```ignore
//! use divert_core::{ClosureListener, Interceptor};
//!
//! let interceptor = Interceptor::obtain();
//! let listener = ClosureListener::on_enter(|ctx| {
//!     tracing::info!("called with {}", ctx.nth_argument(0));
//! });
//! unsafe {
//!     interceptor.attach(target_fn as usize, &listener, std::ptr::null_mut())?;
//! }
//! ```

pub mod alloc;
pub mod config;
pub mod error;
pub mod segment;

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
mod backend;
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
mod interceptor;
#[cfg(target_arch = "x86_64")]
mod trap;
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub mod invocation;
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub mod listener;

pub use config::{ConfigError, CoreConfig};
pub use error::{AttachError, HookError, ReplaceError};

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub use interceptor::Interceptor;
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub use invocation::{
    CpuContext, InvocationContext, PointCut, MAX_CALL_DEPTH, MAX_LISTENERS_PER_FUNCTION,
    MAX_LISTENER_DATA,
};
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub use listener::{ClosureListener, Listener};

/// Typed wrapper for a replacement hook with proper original calling.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub struct TypedReplacement<F> {
    name: &'static str,
    replacement: F,
    target: parking_lot::RwLock<Option<usize>>,
    original: parking_lot::RwLock<Option<*const ()>>,
}

// SAFETY: the raw original pointer is only produced by the interceptor and
// is immutable once installed
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
unsafe impl<F: Send> Send for TypedReplacement<F> {}
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
unsafe impl<F: Sync> Sync for TypedReplacement<F> {}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
impl<F: Copy> TypedReplacement<F> {
    pub const fn new(name: &'static str, replacement: F) -> Self {
        Self {
            name,
            replacement,
            target: parking_lot::RwLock::new(None),
            original: parking_lot::RwLock::new(None),
        }
    }

    /// Install the replacement at `target`.
    ///
    /// # Safety
    /// `target` must be the entry of a function whose signature matches `F`.
    pub unsafe fn install(&self, target: usize) -> Result<(), ReplaceError> {
        let replacement = unsafe { *(&self.replacement as *const F as *const *const ()) };
        let original = Interceptor::obtain().replace(
            target,
            replacement as *const std::ffi::c_void,
            std::ptr::null_mut(),
        )?;
        *self.target.write() = Some(target);
        *self.original.write() = Some(original as *const ());
        tracing::info!("{} installed at {target:#x}", self.name);
        Ok(())
    }

    /// Pointer for calling the original function; `None` until installed.
    pub fn original_ptr(&self) -> Option<*const ()> {
        *self.original.read()
    }

    pub fn is_installed(&self) -> bool {
        self.target.read().is_some()
    }

    /// Restore the original function.
    pub fn remove(&self) {
        if let Some(target) = self.target.write().take() {
            Interceptor::obtain().revert(target);
        }
        *self.original.write() = None;
    }
}

/// Declare a typed replacement hook.
///
/// ```ignore
/// replace_hook! {
///     /// Make open() fail closed.
///     pub static OPEN_HOOK: extern "C" fn(*const c_char, i32) -> i32 = my_open;
/// }
///
/// extern "C" fn my_open(path: *const c_char, flags: i32) -> i32 {
///     let original: extern "C" fn(*const c_char, i32) -> i32 =
///         unsafe { std::mem::transmute(OPEN_HOOK.original_ptr().unwrap()) };
///     original(path, flags)
/// }
/// ```
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[macro_export]
macro_rules! replace_hook {
    (
        $(#[$meta:meta])*
        pub static $name:ident: $fnty:ty = $replacement:ident;
    ) => {
        $(#[$meta])*
        pub static $name: std::sync::LazyLock<$crate::TypedReplacement<$fnty>> =
            std::sync::LazyLock::new(|| {
                $crate::TypedReplacement::new(stringify!($name), $replacement as $fnty)
            });
    };
}
