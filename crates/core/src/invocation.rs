//! Per-thread invocation state and the context handed to listeners.
//!
//! Each thread owns a fixed-capacity stack of invocation frames, created
//! lazily on the first hooked call and kept for the life of the process.
//! Frames live in a preallocated arena so the hot path never touches the
//! heap.

use std::cell::Cell;
use std::ffi::c_void;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::listener::ListenerEntry;

#[cfg(target_arch = "aarch64")]
pub use divert_arch::arm64::{CpuContext, VecReg, CPU_CONTEXT_SIZE};
#[cfg(target_arch = "x86_64")]
pub use divert_arch::x86::{CpuContext, Xmm, CPU_CONTEXT_SIZE};

/// Maximum depth of nested hooked calls per thread. Overflow is a hard
/// failure: the frame arena cannot move while generated code holds pointers
/// into it, so the process aborts instead of growing.
pub const MAX_CALL_DEPTH: usize = 512;

/// Per-frame scratch slots available to listeners on one target.
pub const MAX_LISTENERS_PER_FUNCTION: usize = 4;

/// Size of each listener scratch block, per invocation and per thread.
pub const MAX_LISTENER_DATA: usize = 64;

/// Fixed number of per-thread listener data slots. The table is fixed-size
/// so a detaching thread can clear owner marks without racing a reallocation
/// on the owning thread.
const MAX_THREAD_DATA_SLOTS: usize = 16;

/// Which side of the call a callback is observing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointCut {
    Enter,
    Leave,
}

/// One record on a thread's invocation stack.
pub(crate) struct InvocationFrame {
    /// Leave-trampoline address; recognises this frame in return-address
    /// translation.
    pub trampoline_ret_addr: usize,
    /// Where the hooked function's caller actually lives.
    pub caller_ret_addr: usize,
    /// The hooked function this frame belongs to.
    pub function: usize,
    /// Listener set snapshotted at entry, so an attach racing this call is
    /// either fully visible or not at all.
    pub listeners: Option<Arc<Vec<Arc<ListenerEntry>>>>,
    pub calling_replacement: bool,
    pub replacement_data: *mut c_void,
    /// Live trampoline-stack context; valid only while a callback runs.
    pub live_cpu: *mut CpuContext,
    /// Snapshot taken when transferring to a replacement.
    pub cpu_snapshot: CpuContext,
    /// Staged errno value carried across the dispatch.
    pub system_error: i32,
    pub depth: usize,
    /// Entry-to-leave scratch, one block per listener slot.
    pub invocation_data: [[u8; MAX_LISTENER_DATA]; MAX_LISTENERS_PER_FUNCTION],
}

impl Default for InvocationFrame {
    fn default() -> Self {
        Self {
            trampoline_ret_addr: 0,
            caller_ret_addr: 0,
            function: 0,
            listeners: None,
            calling_replacement: false,
            replacement_data: std::ptr::null_mut(),
            live_cpu: std::ptr::null_mut(),
            cpu_snapshot: CpuContext::default(),
            system_error: 0,
            depth: 0,
            invocation_data: [[0; MAX_LISTENER_DATA]; MAX_LISTENERS_PER_FUNCTION],
        }
    }
}

/// Fixed-capacity stack of invocation frames.
pub(crate) struct InvocationStack {
    frames: Box<[InvocationFrame]>,
    len: usize,
}

impl InvocationStack {
    fn new() -> Self {
        let mut frames = Vec::new();
        frames.resize_with(MAX_CALL_DEPTH, InvocationFrame::default);
        Self {
            frames: frames.into_boxed_slice(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn push(
        &mut self,
        function: usize,
        caller_ret_addr: usize,
        trampoline_ret_addr: usize,
    ) -> &mut InvocationFrame {
        if self.len == self.frames.len() {
            tracing::error!(
                depth = self.len,
                "invocation stack overflow; aborting process"
            );
            std::process::abort();
        }
        let depth = self.len;
        self.len += 1;

        let frame = &mut self.frames[depth];
        frame.trampoline_ret_addr = trampoline_ret_addr;
        frame.caller_ret_addr = caller_ret_addr;
        frame.function = function;
        frame.listeners = None;
        frame.calling_replacement = false;
        frame.replacement_data = std::ptr::null_mut();
        frame.live_cpu = std::ptr::null_mut();
        frame.system_error = 0;
        frame.depth = depth;
        for slot in frame.invocation_data.iter_mut() {
            slot.fill(0);
        }
        frame
    }

    pub fn pop(&mut self) -> usize {
        debug_assert!(self.len > 0);
        self.len -= 1;
        let frame = &mut self.frames[self.len];
        frame.listeners = None; // release the snapshot
        frame.live_cpu = std::ptr::null_mut();
        frame.caller_ret_addr
    }

    pub fn peek_mut(&mut self) -> Option<&mut InvocationFrame> {
        if self.len == 0 {
            None
        } else {
            Some(&mut self.frames[self.len - 1])
        }
    }

    /// Map a leave-trampoline return address back to the real caller so
    /// backtraces taken inside listeners stay honest. Unknown addresses come
    /// back unchanged.
    pub fn translate(&self, return_address: usize) -> usize {
        for frame in self.frames[..self.len].iter() {
            if frame.trampoline_ret_addr == return_address {
                return frame.caller_ret_addr;
            }
        }
        return_address
    }
}

struct ThreadDataSlot {
    owner: AtomicPtr<()>,
    data: [u8; MAX_LISTENER_DATA],
}

/// Everything the interceptor keeps per thread.
pub(crate) struct InterceptorThreadContext {
    pub stack: InvocationStack,
    /// Hooks are bypassed while this is non-zero.
    pub ignore_level: u32,
    /// Re-entrancy guard: non-zero while the interceptor is on this thread's
    /// stack, so hooks hit from inside dispatch fall through to the original.
    pub guard: u32,
    thread_data: Box<[ThreadDataSlot]>,
}

impl InterceptorThreadContext {
    fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with(MAX_THREAD_DATA_SLOTS, || ThreadDataSlot {
            owner: AtomicPtr::new(std::ptr::null_mut()),
            data: [0; MAX_LISTENER_DATA],
        });
        Self {
            stack: InvocationStack::new(),
            ignore_level: 0,
            guard: 0,
            thread_data: slots.into_boxed_slice(),
        }
    }

    /// Thread-lifetime scratch for one listener, zeroed on first use.
    pub fn listener_thread_data(&mut self, owner: *const (), size: usize) -> *mut u8 {
        if size > MAX_LISTENER_DATA {
            return std::ptr::null_mut();
        }
        let mut free = None;
        for slot in self.thread_data.iter_mut() {
            let current = slot.owner.load(Ordering::Acquire);
            if current == owner as *mut () {
                return slot.data.as_mut_ptr();
            }
            if current.is_null() && free.is_none() {
                free = Some(slot);
            }
        }
        match free {
            Some(slot) => {
                slot.data.fill(0);
                slot.owner.store(owner as *mut (), Ordering::Release);
                slot.data.as_mut_ptr()
            }
            None => std::ptr::null_mut(),
        }
    }

    fn forget_listener_data(&self, owner: *const ()) {
        for slot in self.thread_data.iter() {
            // only the mark is cleared; the table is fixed-size so this is
            // safe against the owning thread reading concurrently
            let _ = slot.owner.compare_exchange(
                owner as *mut (),
                std::ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }
}

struct RegisteredContext(*mut InterceptorThreadContext);
// SAFETY: only forget_listener_data (atomic owner marks) crosses threads
unsafe impl Send for RegisteredContext {}

static THREAD_CONTEXTS: Mutex<Vec<RegisteredContext>> = Mutex::new(Vec::new());

thread_local! {
    static CURRENT_CONTEXT: Cell<*mut InterceptorThreadContext> =
        const { Cell::new(std::ptr::null_mut()) };
}

/// The calling thread's interceptor context, created on first use. Contexts
/// live until process exit.
pub(crate) fn current_thread_context() -> *mut InterceptorThreadContext {
    CURRENT_CONTEXT.with(|cell| {
        let mut ptr = cell.get();
        if ptr.is_null() {
            ptr = Box::into_raw(Box::new(InterceptorThreadContext::new()));
            THREAD_CONTEXTS.lock().push(RegisteredContext(ptr));
            cell.set(ptr);
        }
        ptr
    })
}

/// Drop a detached listener's thread-local scratch on every thread.
pub(crate) fn forget_listener_data_all(owner: *const ()) {
    for ctx in THREAD_CONTEXTS.lock().iter() {
        unsafe { (*ctx.0).forget_listener_data(owner) };
    }
}

// --- architecture helpers ----------------------------------------------

/// Address of the hooked function's caller, as saved in the context.
#[cfg(target_arch = "x86_64")]
pub(crate) fn caller_ret_addr(cpu: &CpuContext) -> usize {
    unsafe { *(cpu.rsp as *const usize) }
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn set_caller_ret_addr(cpu: &mut CpuContext, value: usize) {
    unsafe { *(cpu.rsp as *mut usize) = value };
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn set_resume_pc(cpu: &mut CpuContext, value: usize) {
    cpu.rip = value as u64;
}

#[cfg(target_arch = "aarch64")]
pub(crate) fn caller_ret_addr(cpu: &CpuContext) -> usize {
    cpu.lr as usize
}

#[cfg(target_arch = "aarch64")]
pub(crate) fn set_caller_ret_addr(cpu: &mut CpuContext, value: usize) {
    cpu.lr = value as u64;
}

#[cfg(target_arch = "aarch64")]
pub(crate) fn set_resume_pc(cpu: &mut CpuContext, value: usize) {
    cpu.pc = value as u64;
}

#[cfg(all(target_arch = "x86_64", not(windows)))]
fn argument_slot(cpu: &mut CpuContext, n: usize) -> Result<&mut u64, *mut u64> {
    match n {
        0 => Ok(&mut cpu.rdi),
        1 => Ok(&mut cpu.rsi),
        2 => Ok(&mut cpu.rdx),
        3 => Ok(&mut cpu.rcx),
        4 => Ok(&mut cpu.r8),
        5 => Ok(&mut cpu.r9),
        n => Err(unsafe { (cpu.rsp as *mut u64).add(n - 5) }),
    }
}

#[cfg(all(target_arch = "x86_64", windows))]
fn argument_slot(cpu: &mut CpuContext, n: usize) -> Result<&mut u64, *mut u64> {
    match n {
        0 => Ok(&mut cpu.rcx),
        1 => Ok(&mut cpu.rdx),
        2 => Ok(&mut cpu.r8),
        3 => Ok(&mut cpu.r9),
        // stack arguments start past the shadow space
        n => Err(unsafe { (cpu.rsp as *mut u64).add(n + 1) }),
    }
}

#[cfg(target_arch = "aarch64")]
fn argument_slot(cpu: &mut CpuContext, n: usize) -> Result<&mut u64, *mut u64> {
    if n < 8 {
        Ok(&mut cpu.x[n])
    } else {
        Err(unsafe { (cpu.sp as *mut u64).add(n - 8) })
    }
}

#[cfg(target_arch = "x86_64")]
fn return_value_slot(cpu: &mut CpuContext) -> &mut u64 {
    &mut cpu.rax
}

#[cfg(target_arch = "aarch64")]
fn return_value_slot(cpu: &mut CpuContext) -> &mut u64 {
    &mut cpu.x[0]
}

// --- thread id and errno ------------------------------------------------

pub(crate) fn current_thread_id() -> u64 {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::syscall(libc::SYS_gettid) as u64
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    unsafe {
        let mut tid = 0u64;
        libc::pthread_threadid_np(std::ptr::null_mut(), &mut tid);
        tid
    }
    #[cfg(windows)]
    unsafe {
        windows::Win32::System::Threading::GetCurrentThreadId() as u64
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", windows)))]
    {
        // stable fallback: the pthread handle
        unsafe { libc::pthread_self() as u64 }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn system_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn set_system_errno(value: i32) {
    unsafe { *libc::__errno_location() = value };
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub(crate) fn system_errno() -> i32 {
    unsafe { *libc::__error() }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub(crate) fn set_system_errno(value: i32) {
    unsafe { *libc::__error() = value };
}

#[cfg(windows)]
pub(crate) fn system_errno() -> i32 {
    unsafe { windows::Win32::Foundation::GetLastError().0 as i32 }
}

#[cfg(windows)]
pub(crate) fn set_system_errno(value: i32) {
    unsafe {
        windows::Win32::Foundation::SetLastError(windows::Win32::Foundation::WIN32_ERROR(
            value as u32,
        ))
    };
}

// --- the context handed to callbacks ------------------------------------

/// Read/write view of one invocation, valid only for the duration of the
/// callback (or replacement) it was handed to.
pub struct InvocationContext<'a> {
    pub(crate) point_cut: PointCut,
    pub(crate) cpu: *mut CpuContext,
    pub(crate) frame: *mut InvocationFrame,
    pub(crate) thread: *mut InterceptorThreadContext,
    /// The listener entry being dispatched; null for replacement contexts.
    pub(crate) entry: *const ListenerEntry,
    pub(crate) _marker: PhantomData<&'a mut CpuContext>,
}

impl InvocationContext<'_> {
    /// Which side of the call this context observes.
    pub fn point_cut(&self) -> PointCut {
        self.point_cut
    }

    /// Address of the hooked function.
    pub fn function(&self) -> usize {
        unsafe { (*self.frame).function }
    }

    /// The n-th integer argument per the platform calling convention. Valid
    /// during `on_enter`; afterwards argument registers have been clobbered
    /// by the function body, so this reports zero and flags the misuse.
    pub fn nth_argument(&mut self, n: usize) -> usize {
        if self.point_cut != PointCut::Enter {
            self.set_system_error(libc::EINVAL);
            return 0;
        }
        unsafe {
            match argument_slot(&mut *self.cpu, n) {
                Ok(slot) => *slot as usize,
                Err(stack) => *stack as usize,
            }
        }
    }

    /// Overwrite the n-th argument. Valid during `on_enter`.
    pub fn replace_nth_argument(&mut self, n: usize, value: usize) {
        if self.point_cut != PointCut::Enter {
            self.set_system_error(libc::EINVAL);
            return;
        }
        unsafe {
            match argument_slot(&mut *self.cpu, n) {
                Ok(slot) => *slot = value as u64,
                Err(stack) => *stack = value as u64,
            }
        }
    }

    /// The function's return value. Valid during `on_leave`.
    pub fn return_value(&mut self) -> usize {
        if self.point_cut != PointCut::Leave {
            self.set_system_error(libc::EINVAL);
            return 0;
        }
        unsafe { *return_value_slot(&mut *self.cpu) as usize }
    }

    /// Overwrite the return value. Valid during `on_leave`.
    pub fn replace_return_value(&mut self, value: usize) {
        if self.point_cut != PointCut::Leave {
            self.set_system_error(libc::EINVAL);
            return;
        }
        unsafe { *return_value_slot(&mut *self.cpu) = value as u64 };
    }

    /// The saved register block. Mutations become visible to the function
    /// when the trampoline restores state.
    pub fn cpu_context(&mut self) -> &mut CpuContext {
        unsafe { &mut *self.cpu }
    }

    /// Where the hooked function will really return to.
    pub fn return_address(&self) -> usize {
        unsafe { (*self.frame).caller_ret_addr }
    }

    pub fn thread_id(&self) -> u64 {
        current_thread_id()
    }

    /// Number of hooked frames beneath this one on the current thread.
    pub fn depth(&self) -> usize {
        unsafe { (*self.frame).depth }
    }

    /// The errno value as the hooked function saw it; restored after the
    /// callback returns.
    pub fn system_error(&self) -> i32 {
        unsafe { (*self.frame).system_error }
    }

    pub fn set_system_error(&mut self, value: i32) {
        unsafe { (*self.frame).system_error = value };
    }

    /// The opaque pointer supplied at attach (or at replace, for
    /// replacement contexts).
    pub fn listener_function_data(&self) -> *mut c_void {
        unsafe {
            if self.entry.is_null() {
                (*self.frame).replacement_data
            } else {
                (*self.entry).function_data
            }
        }
    }

    /// Zero-initialised scratch shared between `on_enter` and the matching
    /// `on_leave`. Null if `size` exceeds the slot size or no slot was free
    /// at attach time.
    pub fn listener_invocation_data(&mut self, size: usize) -> *mut u8 {
        if size > MAX_LISTENER_DATA || self.entry.is_null() {
            self.set_system_error(libc::EINVAL);
            return std::ptr::null_mut();
        }
        let slot = unsafe { (*self.entry).slot };
        match slot {
            Some(index) => unsafe { (*self.frame).invocation_data[index].as_mut_ptr() },
            None => {
                self.set_system_error(libc::EINVAL);
                std::ptr::null_mut()
            }
        }
    }

    /// Zero-initialised scratch with thread lifetime, shared across calls.
    pub fn listener_thread_data(&mut self, size: usize) -> *mut u8 {
        if self.entry.is_null() {
            self.set_system_error(libc::EINVAL);
            return std::ptr::null_mut();
        }
        let owner = unsafe { (*self.entry).identity() };
        let data = unsafe { (*self.thread).listener_thread_data(owner, size) };
        if data.is_null() {
            self.set_system_error(libc::EINVAL);
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_depth_tracks_nesting() {
        let mut stack = InvocationStack::new();
        let first = stack.push(0x1000, 0xAAAA, 0xBBBB);
        assert_eq!(first.depth, 0);
        let second = stack.push(0x2000, 0xCCCC, 0xDDDD);
        assert_eq!(second.depth, 1);
        assert_eq!(stack.len(), 2);

        assert_eq!(stack.pop(), 0xCCCC);
        assert_eq!(stack.pop(), 0xAAAA);
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn translate_recognises_trampoline_addresses() {
        let mut stack = InvocationStack::new();
        stack.push(0x1000, 0xAAAA, 0xBBBB);
        assert_eq!(stack.translate(0xBBBB), 0xAAAA);
        assert_eq!(stack.translate(0x1234), 0x1234);
        stack.pop();
        assert_eq!(stack.translate(0xBBBB), 0xBBBB);
    }

    #[test]
    fn frames_reset_scratch_on_push() {
        let mut stack = InvocationStack::new();
        let frame = stack.push(0x1000, 0, 0);
        frame.invocation_data[0][0] = 0x5A;
        stack.pop();
        let frame = stack.push(0x1000, 0, 0);
        assert_eq!(frame.invocation_data[0][0], 0);
    }

    #[test]
    fn thread_data_slots_are_per_owner() {
        let mut ctx = InterceptorThreadContext::new();
        let a = 0x10usize as *const ();
        let b = 0x20usize as *const ();

        let slot_a = ctx.listener_thread_data(a, 16);
        let slot_b = ctx.listener_thread_data(b, 16);
        assert!(!slot_a.is_null());
        assert!(!slot_b.is_null());
        assert_ne!(slot_a, slot_b);

        // stable for the same owner
        assert_eq!(ctx.listener_thread_data(a, 16), slot_a);

        // freed slots are recycled zeroed
        unsafe { *slot_a = 0x77 };
        ctx.forget_listener_data(a);
        let again = ctx.listener_thread_data(a, 16);
        assert_eq!(again, slot_a);
        assert_eq!(unsafe { *again }, 0);
    }

    #[test]
    fn oversized_thread_data_is_refused() {
        let mut ctx = InterceptorThreadContext::new();
        let owner = 0x30usize as *const ();
        assert!(ctx
            .listener_thread_data(owner, MAX_LISTENER_DATA + 1)
            .is_null());
    }

    #[cfg(all(target_arch = "x86_64", not(windows)))]
    #[test]
    fn sysv_arguments_come_from_registers_then_stack() {
        // fake stack: [return address, arg6, arg7]
        let fake_stack: [u64; 3] = [0xDEAD, 600, 700];
        let mut cpu = CpuContext::default();
        cpu.rdi = 0;
        cpu.rsi = 100;
        cpu.rdx = 200;
        cpu.rcx = 300;
        cpu.r8 = 400;
        cpu.r9 = 500;
        cpu.rsp = fake_stack.as_ptr() as u64;

        let mut frame = InvocationFrame::default();
        let thread = current_thread_context();
        let mut ctx = InvocationContext {
            point_cut: PointCut::Enter,
            cpu: &mut cpu,
            frame: &mut frame,
            thread,
            entry: std::ptr::null(),
            _marker: PhantomData,
        };

        assert_eq!(ctx.nth_argument(1), 100);
        assert_eq!(ctx.nth_argument(5), 500);
        assert_eq!(ctx.nth_argument(6), 600);
        assert_eq!(ctx.nth_argument(7), 700);

        ctx.replace_nth_argument(1, 111);
        assert_eq!(cpu.rsi, 111);
    }
}
