//! C-compatible surface for embedding the interceptor.
//!
//! This is the contract the scripting layer programs against: listeners are
//! pairs of nullable function pointers, attachments are identified by opaque
//! 64-bit ids, and every structural operation returns one of the stable
//! status codes. Callbacks receive a `DivertInvocation*` that is only valid
//! for the duration of the callback.

use std::ffi::{c_char, c_void, CStr};
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use slotmap::{new_key_type, Key, KeyData, SlotMap};

use divert_core::{
    AttachError, ClosureListener, Interceptor, InvocationContext, Listener, ReplaceError,
};

/// Opaque invocation handle passed to C callbacks.
#[repr(C)]
pub struct DivertInvocation {
    _private: [u8; 0],
}

/// Callback pair; either side may be null.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DivertListenerCallbacks {
    pub on_enter: Option<unsafe extern "C" fn(*mut DivertInvocation, *mut c_void)>,
    pub on_leave: Option<unsafe extern "C" fn(*mut DivertInvocation, *mut c_void)>,
}

/// Status codes of `divert_attach`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivertAttachStatus {
    Ok = 0,
    WrongSignature = 1,
    AlreadyAttached = 2,
    PolicyViolation = 3,
}

/// Status codes of `divert_replace`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivertReplaceStatus {
    Ok = 0,
    WrongSignature = 1,
    AlreadyReplaced = 2,
}

new_key_type! {
    struct AttachmentKey;
}

struct Attachment {
    listener: Arc<dyn Listener>,
}

static ATTACHMENTS: LazyLock<RwLock<SlotMap<AttachmentKey, Attachment>>> =
    LazyLock::new(|| RwLock::new(SlotMap::with_key()));

/// Initialise logging. `filter` is a tracing env-filter expression; null
/// means "use RUST_LOG or the config file". Safe to call more than once.
///
/// # Safety
/// `filter`, when non-null, must point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn divert_init(filter: *const c_char) {
    let filter = if filter.is_null() {
        divert_core::CoreConfig::load_or_default()
            .log_filter
            .unwrap_or_else(|| "warn".into())
    } else {
        CStr::from_ptr(filter).to_string_lossy().into_owned()
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .try_init();

    tracing::debug!("divert initialised");
}

/// Detach everything and restore every patched prologue.
#[no_mangle]
pub extern "C" fn divert_shutdown() {
    Interceptor::obtain().detach_all();
    ATTACHMENTS.write().clear();
    tracing::debug!("divert shut down");
}

/// Attach a listener to `target`. On success `out_id` receives the
/// attachment id used for `divert_detach`.
///
/// # Safety
/// `target` must be a hookable function entry; callback pointers must stay
/// valid until detached.
#[no_mangle]
pub unsafe extern "C" fn divert_attach(
    target: *mut c_void,
    callbacks: DivertListenerCallbacks,
    data: *mut c_void,
    out_id: *mut u64,
) -> DivertAttachStatus {
    struct SendPtr(*mut c_void);
    unsafe impl Send for SendPtr {}
    unsafe impl Sync for SendPtr {}
    impl SendPtr {
        fn get(&self) -> *mut c_void {
            self.0
        }
    }

    let enter_cb = callbacks.on_enter;
    let leave_cb = callbacks.on_leave;
    let enter_data = SendPtr(data);
    let leave_data = SendPtr(data);

    let listener: Arc<dyn Listener> = ClosureListener::new(
        move |ctx: &mut InvocationContext<'_>| {
            if let Some(cb) = enter_cb {
                unsafe { cb(ctx as *mut InvocationContext as *mut DivertInvocation, enter_data.get()) };
            }
        },
        move |ctx: &mut InvocationContext<'_>| {
            if let Some(cb) = leave_cb {
                unsafe { cb(ctx as *mut InvocationContext as *mut DivertInvocation, leave_data.get()) };
            }
        },
    );

    match Interceptor::obtain().attach(target as usize, &listener, data) {
        Ok(()) => {
            let key = ATTACHMENTS.write().insert(Attachment { listener });
            if !out_id.is_null() {
                *out_id = key.data().as_ffi();
            }
            DivertAttachStatus::Ok
        }
        Err(AttachError::WrongSignature) => DivertAttachStatus::WrongSignature,
        Err(AttachError::AlreadyAttached) => DivertAttachStatus::AlreadyAttached,
        Err(AttachError::PolicyViolation) => DivertAttachStatus::PolicyViolation,
    }
}

/// Detach a previous attachment. Unknown ids are ignored.
#[no_mangle]
pub extern "C" fn divert_detach(id: u64) {
    let attachment = ATTACHMENTS
        .write()
        .remove(AttachmentKey::from(KeyData::from_ffi(id)));
    if let Some(attachment) = attachment {
        Interceptor::obtain().detach(&attachment.listener);
    }
}

/// Replace `target` with `replacement`; `out_original` receives the address
/// the replacement can call to reach the original.
///
/// # Safety
/// `target` and `replacement` must be functions with identical signatures.
#[no_mangle]
pub unsafe extern "C" fn divert_replace(
    target: *mut c_void,
    replacement: *mut c_void,
    data: *mut c_void,
    out_original: *mut *mut c_void,
) -> DivertReplaceStatus {
    match Interceptor::obtain().replace(target as usize, replacement, data) {
        Ok(original) => {
            if !out_original.is_null() {
                *out_original = original as *mut c_void;
            }
            DivertReplaceStatus::Ok
        }
        Err(ReplaceError::WrongSignature) => DivertReplaceStatus::WrongSignature,
        Err(ReplaceError::AlreadyReplaced) => DivertReplaceStatus::AlreadyReplaced,
    }
}

/// Remove any replacement at `target`.
#[no_mangle]
pub extern "C" fn divert_revert(target: *mut c_void) {
    Interceptor::obtain().revert(target as usize);
}

#[no_mangle]
pub extern "C" fn divert_begin_transaction() {
    Interceptor::obtain().begin_transaction();
}

#[no_mangle]
pub extern "C" fn divert_end_transaction() {
    Interceptor::obtain().end_transaction();
}

#[no_mangle]
pub extern "C" fn divert_ignore_current_thread() {
    Interceptor::obtain().ignore_current_thread();
}

#[no_mangle]
pub extern "C" fn divert_unignore_current_thread() {
    Interceptor::obtain().unignore_current_thread();
}

#[no_mangle]
pub extern "C" fn divert_ignore_other_threads() {
    Interceptor::obtain().ignore_other_threads();
}

#[no_mangle]
pub extern "C" fn divert_unignore_other_threads() {
    Interceptor::obtain().unignore_other_threads();
}

/// Map a return address that points into a leave trampoline back to the
/// real caller (for backtraces collected inside callbacks).
#[no_mangle]
pub extern "C" fn divert_translate_return_address(address: *mut c_void) -> *mut c_void {
    Interceptor::translate_return_address(address as usize) as *mut c_void
}

// --- invocation accessors ------------------------------------------------

unsafe fn ctx<'a>(invocation: *mut DivertInvocation) -> &'a mut InvocationContext<'a> {
    &mut *(invocation as *mut InvocationContext)
}

/// # Safety
/// `invocation` must be the pointer handed to the current callback.
#[no_mangle]
pub unsafe extern "C" fn divert_invocation_nth_argument(
    invocation: *mut DivertInvocation,
    n: u32,
) -> usize {
    ctx(invocation).nth_argument(n as usize)
}

/// # Safety
/// As [`divert_invocation_nth_argument`].
#[no_mangle]
pub unsafe extern "C" fn divert_invocation_replace_nth_argument(
    invocation: *mut DivertInvocation,
    n: u32,
    value: usize,
) {
    ctx(invocation).replace_nth_argument(n as usize, value);
}

/// # Safety
/// As [`divert_invocation_nth_argument`].
#[no_mangle]
pub unsafe extern "C" fn divert_invocation_return_value(
    invocation: *mut DivertInvocation,
) -> usize {
    ctx(invocation).return_value()
}

/// # Safety
/// As [`divert_invocation_nth_argument`].
#[no_mangle]
pub unsafe extern "C" fn divert_invocation_replace_return_value(
    invocation: *mut DivertInvocation,
    value: usize,
) {
    ctx(invocation).replace_return_value(value);
}

/// # Safety
/// As [`divert_invocation_nth_argument`].
#[no_mangle]
pub unsafe extern "C" fn divert_invocation_return_address(
    invocation: *mut DivertInvocation,
) -> *mut c_void {
    ctx(invocation).return_address() as *mut c_void
}

/// # Safety
/// As [`divert_invocation_nth_argument`].
#[no_mangle]
pub unsafe extern "C" fn divert_invocation_thread_id(invocation: *mut DivertInvocation) -> u64 {
    ctx(invocation).thread_id()
}

/// # Safety
/// As [`divert_invocation_nth_argument`].
#[no_mangle]
pub unsafe extern "C" fn divert_invocation_depth(invocation: *mut DivertInvocation) -> usize {
    ctx(invocation).depth()
}

/// # Safety
/// As [`divert_invocation_nth_argument`].
#[no_mangle]
pub unsafe extern "C" fn divert_invocation_system_error(
    invocation: *mut DivertInvocation,
) -> i32 {
    ctx(invocation).system_error()
}

/// # Safety
/// As [`divert_invocation_nth_argument`].
#[no_mangle]
pub unsafe extern "C" fn divert_invocation_set_system_error(
    invocation: *mut DivertInvocation,
    value: i32,
) {
    ctx(invocation).set_system_error(value);
}

/// Mutable pointer to the saved CPU context.
///
/// # Safety
/// As [`divert_invocation_nth_argument`].
#[no_mangle]
pub unsafe extern "C" fn divert_invocation_cpu_context(
    invocation: *mut DivertInvocation,
) -> *mut c_void {
    ctx(invocation).cpu_context() as *mut divert_core::CpuContext as *mut c_void
}

/// Per-invocation scratch shared between enter and leave; null if `size` is
/// too large or no slot was free.
///
/// # Safety
/// As [`divert_invocation_nth_argument`].
#[no_mangle]
pub unsafe extern "C" fn divert_invocation_data(
    invocation: *mut DivertInvocation,
    size: usize,
) -> *mut c_void {
    ctx(invocation).listener_invocation_data(size) as *mut c_void
}

/// Per-thread scratch for this listener.
///
/// # Safety
/// As [`divert_invocation_nth_argument`].
#[no_mangle]
pub unsafe extern "C" fn divert_invocation_thread_data(
    invocation: *mut DivertInvocation,
    size: usize,
) -> *mut c_void {
    ctx(invocation).listener_thread_data(size) as *mut c_void
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_ids_roundtrip() {
        let key = ATTACHMENTS.write().insert(Attachment {
            listener: ClosureListener::on_enter(|_| {}),
        });
        let id = key.data().as_ffi();
        let back = AttachmentKey::from(KeyData::from_ffi(id));
        assert_eq!(back, key);
        ATTACHMENTS.write().remove(back);
    }

    #[test]
    fn status_codes_match_the_contract() {
        assert_eq!(DivertAttachStatus::Ok as i32, 0);
        assert_eq!(DivertAttachStatus::WrongSignature as i32, 1);
        assert_eq!(DivertAttachStatus::AlreadyAttached as i32, 2);
        assert_eq!(DivertAttachStatus::PolicyViolation as i32, 3);
        assert_eq!(DivertReplaceStatus::AlreadyReplaced as i32, 2);
    }
}
