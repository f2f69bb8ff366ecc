//! The interceptor: public API surface and state machine.
//!
//! One mutex serialises structural operations (attach/detach/replace/revert
//! and transaction commit). Listener dispatch never takes that mutex: the
//! hot path reads an `Arc` snapshot of the listener list, so an attach
//! racing a call is either fully visible to that invocation or not at all.

use std::collections::{BTreeMap, HashMap};
use std::ffi::c_void;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::alloc::{CodeAllocator, CodeSlice};
use crate::backend;
use crate::config::CoreConfig;
use crate::error::{AttachError, HookError, ReplaceError};
use crate::invocation::{
    self, caller_ret_addr, current_thread_context, current_thread_id, set_caller_ret_addr,
    set_resume_pc, set_system_errno, system_errno, CpuContext, InvocationContext,
    InvocationFrame, PointCut, MAX_LISTENERS_PER_FUNCTION,
};
use crate::listener::{Listener, ListenerEntry};
use crate::segment::{self, CodeSegment};

/// Everything the interceptor keeps about one hooked function.
pub(crate) struct FunctionRecord {
    pub function_address: usize,
    pub trampoline_slice: Option<CodeSlice>,
    pub overwritten_prologue: [u8; 32],
    pub overwritten_prologue_len: usize,
    /// Redirector bytes, precomputed when the trampolines are built.
    pub redirect_code: [u8; 32],
    pub redirect_len: usize,
    pub on_enter_trampoline: *const u8,
    pub on_leave_trampoline: *const u8,
    /// The relocated prologue; also the address a replacement uses to reach
    /// the original.
    pub on_invoke_trampoline: *const u8,
    pub listeners: RwLock<Arc<Vec<Arc<ListenerEntry>>>>,
    pub replacement: AtomicPtr<c_void>,
    pub replacement_data: AtomicPtr<c_void>,
    pub activated: AtomicBool,
    /// Threads currently inside this record's trampolines. Non-zero forbids
    /// freeing the code slice.
    pub usage_counter: AtomicUsize,
}

// SAFETY: raw pointers are into the record's own code slice or caller-owned
// opaque data; all mutation is serialised by the structural mutex or atomic
unsafe impl Send for FunctionRecord {}
unsafe impl Sync for FunctionRecord {}

impl FunctionRecord {
    fn new(function_address: usize) -> Self {
        Self {
            function_address,
            trampoline_slice: None,
            overwritten_prologue: [0; 32],
            overwritten_prologue_len: 0,
            redirect_code: [0; 32],
            redirect_len: 0,
            on_enter_trampoline: std::ptr::null(),
            on_leave_trampoline: std::ptr::null(),
            on_invoke_trampoline: std::ptr::null(),
            listeners: RwLock::new(Arc::new(Vec::new())),
            replacement: AtomicPtr::new(std::ptr::null_mut()),
            replacement_data: AtomicPtr::new(std::ptr::null_mut()),
            activated: AtomicBool::new(false),
            usage_counter: AtomicUsize::new(0),
        }
    }

    fn has_listener(&self, identity: *const ()) -> bool {
        self.listeners.read().iter().any(|e| e.identity() == identity)
    }

    fn is_empty(&self) -> bool {
        self.listeners.read().is_empty() && self.replacement.load(Ordering::Acquire).is_null()
    }
}

struct RecordPtr(*mut FunctionRecord);

// SAFETY: records are heap-pinned and only destroyed after the usage counter
// drains
unsafe impl Send for RecordPtr {}

#[derive(Clone, Copy)]
enum WriteKind {
    Activate,
    Deactivate,
}

struct PrologueWrite {
    record: *mut FunctionRecord,
    kind: WriteKind,
}

// SAFETY: as RecordPtr
unsafe impl Send for PrologueWrite {}

/// Batches structural edits so every affected code page goes through exactly
/// one protection cycle.
struct Transaction {
    level: u32,
    /// page address -> ordered writes within that page
    pending_writes: BTreeMap<usize, Vec<PrologueWrite>>,
    pending_destroy: Vec<RecordPtr>,
}

impl Transaction {
    fn new() -> Self {
        Self {
            level: 0,
            pending_writes: BTreeMap::new(),
            pending_destroy: Vec::new(),
        }
    }

    fn schedule_prologue_write(&mut self, record: *mut FunctionRecord, kind: WriteKind) {
        let (address, len) = unsafe {
            ((*record).function_address, (*record).overwritten_prologue_len)
        };
        let start_page = segment::page_start(address);
        let end_page = segment::page_start(address + len - 1);

        self.pending_writes
            .entry(start_page)
            .or_default()
            .push(PrologueWrite { record, kind });
        if end_page != start_page {
            // the write spills over; the second page needs its own
            // protection cycle even though the write is applied once
            self.pending_writes.entry(end_page).or_default();
        }
    }
}

struct State {
    records: HashMap<usize, RecordPtr>,
    allocator: CodeAllocator,
    transaction: Transaction,
}

/// The function interceptor. One instance per process, obtained with
/// [`Interceptor::obtain`].
pub struct Interceptor {
    state: Mutex<State>,
    /// When non-zero, only this thread id gets listener callbacks.
    selected_thread: AtomicU64,
    force_staged_commit: bool,
}

static THE_INTERCEPTOR: LazyLock<Interceptor> = LazyLock::new(|| {
    let config = CoreConfig::load_or_default();
    Interceptor {
        state: Mutex::new(State {
            records: HashMap::new(),
            allocator: CodeAllocator::new(config.code_slice_size, config.slices_per_slab),
            transaction: Transaction::new(),
        }),
        selected_thread: AtomicU64::new(0),
        force_staged_commit: config.force_staged_commit,
    }
});

impl Interceptor {
    /// The process-wide interceptor, initialised on first use.
    pub fn obtain() -> &'static Interceptor {
        &THE_INTERCEPTOR
    }

    /// Hook `target` so `listener` observes every call.
    ///
    /// # Safety
    /// `target` must be the entry of a real function with a standard
    /// prologue; `data` must stay valid until the listener is detached.
    pub unsafe fn attach(
        &self,
        target: usize,
        listener: &Arc<dyn Listener>,
        data: *mut c_void,
    ) -> Result<(), AttachError> {
        self.ignore_current_thread();
        let result = {
            let mut state = self.state.lock();
            state.transaction.level += 1;
            let result = self.attach_locked(&mut state, target, listener, data);
            self.finish_transaction(state);
            result
        };
        self.unignore_current_thread();
        result
    }

    fn attach_locked(
        &self,
        state: &mut State,
        target: usize,
        listener: &Arc<dyn Listener>,
        data: *mut c_void,
    ) -> Result<(), AttachError> {
        let target = resolve(state, target);
        let record = self
            .instrument(state, target)
            .map_err(HookError::into_attach)?;
        let record = unsafe { &*record };

        let identity = Arc::as_ptr(listener) as *const ();
        if record.has_listener(identity) {
            return Err(AttachError::AlreadyAttached);
        }

        let current = record.listeners.read().clone();
        let slot = (0..MAX_LISTENERS_PER_FUNCTION)
            .find(|i| !current.iter().any(|e| e.slot == Some(*i)));
        if slot.is_none() {
            tracing::warn!(
                "no invocation-data slot left at {target:#x}; listener_invocation_data will be null"
            );
        }

        let mut entries = (*current).clone();
        entries.push(Arc::new(ListenerEntry {
            listener: Arc::clone(listener),
            function_data: data,
            slot,
        }));
        *record.listeners.write() = Arc::new(entries);

        tracing::info!("listener attached at {target:#x}");
        Ok(())
    }

    /// Remove every hook registered by `listener`. Silent if absent.
    pub fn detach(&self, listener: &Arc<dyn Listener>) {
        self.ignore_current_thread();
        {
            let mut state = self.state.lock();
            state.transaction.level += 1;

            let identity = Arc::as_ptr(listener) as *const ();
            let mut emptied = Vec::new();
            for (&address, record) in state.records.iter() {
                let record = unsafe { &*record.0 };
                if !record.has_listener(identity) {
                    continue;
                }
                let remaining: Vec<_> = record
                    .listeners
                    .read()
                    .iter()
                    .filter(|e| e.identity() != identity)
                    .cloned()
                    .collect();
                let now_empty =
                    remaining.is_empty() && record.replacement.load(Ordering::Acquire).is_null();
                *record.listeners.write() = Arc::new(remaining);
                if now_empty {
                    emptied.push(address);
                }
            }
            for address in emptied {
                let record = state.records.remove(&address).expect("record exists");
                state
                    .transaction
                    .schedule_prologue_write(record.0, WriteKind::Deactivate);
                state.transaction.pending_destroy.push(record);
                tracing::info!("hook at {address:#x} removed");
            }

            invocation::forget_listener_data_all(identity);
            self.finish_transaction(state);
        }
        self.unignore_current_thread();
    }

    /// Divert calls of `target` to `replacement`. Returns the address the
    /// replacement can call to reach the original.
    ///
    /// # Safety
    /// `target` and `replacement` must be functions with identical
    /// signatures; `data` must stay valid until reverted.
    pub unsafe fn replace(
        &self,
        target: usize,
        replacement: *const c_void,
        data: *mut c_void,
    ) -> Result<*const c_void, ReplaceError> {
        let mut state = self.state.lock();
        state.transaction.level += 1;

        let target = resolve(&state, target);
        let result = self
            .instrument(&mut state, target)
            .map_err(HookError::into_replace)
            .and_then(|record| {
                let record = unsafe { &*record };
                if !record.replacement.load(Ordering::Acquire).is_null() {
                    return Err(ReplaceError::AlreadyReplaced);
                }
                record.replacement_data.store(data, Ordering::Release);
                record
                    .replacement
                    .store(replacement as *mut c_void, Ordering::Release);
                tracing::info!("replacement installed at {target:#x}");
                Ok(record.on_invoke_trampoline as *const c_void)
            });

        self.finish_transaction(state);
        result
    }

    /// Remove any replacement installed at `target`. Silent if absent.
    pub fn revert(&self, target: usize) {
        let mut state = self.state.lock();
        state.transaction.level += 1;

        let target = resolve(&state, target);
        if let Some(record_ptr) = state.records.get(&target).map(|r| r.0) {
            let record = unsafe { &*record_ptr };
            record
                .replacement
                .store(std::ptr::null_mut(), Ordering::Release);
            record
                .replacement_data
                .store(std::ptr::null_mut(), Ordering::Release);
            if record.is_empty() {
                let record = state.records.remove(&target).expect("record exists");
                state
                    .transaction
                    .schedule_prologue_write(record.0, WriteKind::Deactivate);
                state.transaction.pending_destroy.push(record);
            }
            tracing::info!("replacement at {target:#x} reverted");
        }

        self.finish_transaction(state);
    }

    /// Detach every listener and replacement in one transaction, restoring
    /// all patched prologues.
    pub fn detach_all(&self) {
        let mut state = self.state.lock();
        state.transaction.level += 1;
        let addresses: Vec<usize> = state.records.keys().copied().collect();
        for address in addresses {
            let record = state.records.remove(&address).expect("record exists");
            unsafe {
                *(*record.0).listeners.write() = Arc::new(Vec::new());
                (*record.0)
                    .replacement
                    .store(std::ptr::null_mut(), Ordering::Release);
            }
            state
                .transaction
                .schedule_prologue_write(record.0, WriteKind::Deactivate);
            state.transaction.pending_destroy.push(record);
        }
        self.finish_transaction(state);
    }

    /// Group subsequent operations into one page-protection cycle. Nesting
    /// is counted; the commit happens on the outermost end.
    pub fn begin_transaction(&self) {
        self.state.lock().transaction.level += 1;
    }

    pub fn end_transaction(&self) {
        let state = self.state.lock();
        if state.transaction.level == 0 {
            tracing::warn!("end_transaction without matching begin");
            return;
        }
        self.finish_transaction(state);
    }

    /// Bypass hooks on the calling thread until the matching unignore.
    /// Nesting composes.
    pub fn ignore_current_thread(&self) {
        unsafe { (*current_thread_context()).ignore_level += 1 };
    }

    pub fn unignore_current_thread(&self) {
        unsafe {
            let thread = &mut *current_thread_context();
            debug_assert!(thread.ignore_level > 0);
            thread.ignore_level = thread.ignore_level.saturating_sub(1);
        }
    }

    /// Deliver listener callbacks only on the calling thread.
    pub fn ignore_other_threads(&self) {
        self.selected_thread
            .store(current_thread_id(), Ordering::Relaxed);
    }

    pub fn unignore_other_threads(&self) {
        self.selected_thread.store(0, Ordering::Relaxed);
    }

    /// The topmost active invocation on this thread, if any. Valid only for
    /// the duration of the surrounding callback or replacement.
    pub fn current_invocation() -> Option<InvocationContext<'static>> {
        let thread = current_thread_context();
        unsafe {
            let frame = (*thread).stack.peek_mut()? as *mut InvocationFrame;
            let cpu = if (*frame).calling_replacement {
                &mut (*frame).cpu_snapshot as *mut CpuContext
            } else {
                (*frame).live_cpu
            };
            if cpu.is_null() {
                return None;
            }
            Some(InvocationContext {
                point_cut: PointCut::Enter,
                cpu,
                frame,
                thread,
                entry: std::ptr::null(),
                _marker: PhantomData,
            })
        }
    }

    /// Map a return address that points into a leave trampoline back to the
    /// real caller, for honest backtraces.
    pub fn translate_return_address(return_address: usize) -> usize {
        unsafe { (*current_thread_context()).stack.translate(return_address) }
    }

    // --- internals ------------------------------------------------------

    fn instrument(
        &self,
        state: &mut State,
        target: usize,
    ) -> Result<*mut FunctionRecord, HookError> {
        if let Some(record) = state.records.get(&target) {
            return Ok(record.0);
        }

        if !segment::rwx_supported() && !CodeSegment::is_supported() {
            return Err(HookError::PatchingForbidden);
        }

        let reachable = backend::can_relocate_target(target);
        if reachable < backend::REDIRECT_SIZE {
            return Err(HookError::Unsupportable(target, "entry bytes not relocatable"));
        }

        let record = Box::into_raw(Box::new(FunctionRecord::new(target)));
        if let Err(err) = backend::create_trampoline(unsafe { &mut *record }, &state.allocator) {
            drop(unsafe { Box::from_raw(record) });
            return Err(err);
        }

        state
            .transaction
            .schedule_prologue_write(record, WriteKind::Activate);
        state.records.insert(target, RecordPtr(record));

        tracing::debug!(
            "instrumented {target:#x} ({} bytes displaced)",
            unsafe { (*record).overwritten_prologue_len }
        );
        Ok(record)
    }

    /// Leave the transaction; at the outermost level, apply all pending
    /// prologue writes with one protection cycle per page and then drain the
    /// destruction queue (outside the lock, since trampolines must idle).
    fn finish_transaction(&self, mut state: MutexGuard<'_, State>) {
        state.transaction.level -= 1;
        if state.transaction.level > 0 {
            return;
        }

        state.allocator.commit();

        if state.transaction.pending_writes.is_empty()
            && state.transaction.pending_destroy.is_empty()
        {
            return;
        }

        let writes = std::mem::take(&mut state.transaction.pending_writes);
        let destroy = std::mem::take(&mut state.transaction.pending_destroy);
        let page_size = segment::page_size();

        let staged = self.force_staged_commit || !segment::rwx_supported();
        if !staged {
            self.commit_in_place(&writes, page_size);
        } else if CodeSegment::is_supported() {
            self.commit_staged(&writes, page_size);
        } else if !writes.is_empty() {
            tracing::error!("no code patching strategy available; writes dropped");
        }

        drop(state);

        for record in destroy {
            wait_for_idle_trampoline(unsafe { &*record.0 });
            let mut boxed = unsafe { Box::from_raw(record.0) };
            backend::destroy_trampoline(&mut boxed);
            drop(boxed);
        }
    }

    fn commit_in_place(&self, writes: &BTreeMap<usize, Vec<PrologueWrite>>, page_size: usize) {
        for &page in writes.keys() {
            let result = unsafe {
                region::protect(
                    page as *const u8,
                    page_size,
                    region::Protection::READ_WRITE_EXECUTE,
                )
            };
            if let Err(err) = result {
                tracing::error!("mprotect of page {page:#x} failed: {err}");
                return;
            }
        }

        for pending in writes.values() {
            for write in pending {
                apply_write(write, unsafe { (*write.record).function_address } as *mut u8, true);
            }
        }

        for &page in writes.keys() {
            let result = unsafe {
                region::protect(page as *const u8, page_size, region::Protection::READ_EXECUTE)
            };
            if let Err(err) = result {
                tracing::warn!("restoring protection of page {page:#x} failed: {err}");
            }
            segment::flush_icache(page as *mut u8, page_size);
        }
    }

    fn commit_staged(&self, writes: &BTreeMap<usize, Vec<PrologueWrite>>, page_size: usize) {
        let segment = match CodeSegment::new(writes.len() * page_size) {
            Ok(segment) => segment,
            Err(err) => {
                tracing::error!(%err, "cannot build code segment; writes dropped");
                return;
            }
        };

        for (index, (&page, pending)) in writes.iter().enumerate() {
            let staging = unsafe { segment.writable_base().add(index * page_size) };
            unsafe {
                std::ptr::copy_nonoverlapping(page as *const u8, staging, page_size);
            }
            for write in pending {
                let offset = unsafe { (*write.record).function_address } - page;
                apply_write(write, unsafe { staging.add(offset) }, false);
            }
        }

        if let Err(err) = segment.realize() {
            tracing::error!(%err, "segment realize failed");
            return;
        }
        for (index, &page) in writes.keys().enumerate() {
            if let Err(err) = segment.map(index * page_size, page_size, page) {
                tracing::error!("mapping segment over page {page:#x} failed: {err}");
            }
        }
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        self.detach_all();
    }
}

fn apply_write(write: &PrologueWrite, prologue: *mut u8, live: bool) {
    let record = unsafe { &*write.record };
    match write.kind {
        WriteKind::Activate => {
            backend::activate(record, prologue, live);
            record.activated.store(true, Ordering::Release);
        }
        WriteKind::Deactivate => {
            backend::deactivate(record, prologue, live);
            record.activated.store(false, Ordering::Release);
        }
    }
}

/// Follow any redirect already installed at `address` so hooking a hooked
/// address lands on the real function.
fn resolve(state: &State, mut address: usize) -> usize {
    for _ in 0..16 {
        if state.records.contains_key(&address) {
            return address;
        }
        match backend::resolve_redirect(address) {
            Some(next) => address = next,
            None => break,
        }
    }
    address
}

/// Spin until no thread is inside the record's trampolines. The extra yield
/// covers the window between the counter drop and the final `ret`.
fn wait_for_idle_trampoline(record: &FunctionRecord) {
    while record.usage_counter.load(Ordering::Acquire) != 0 {
        std::thread::yield_now();
    }
    std::thread::yield_now();
}

// --- the hot path --------------------------------------------------------

/// Called by the entry trampoline with the saved CPU context. Returns the
/// next hop: the replacement, or the relocated prologue. Never blocks on the
/// structural mutex.
pub(crate) unsafe extern "C" fn divert_begin_invocation(
    record: *mut FunctionRecord,
    cpu: *mut CpuContext,
) -> *const u8 {
    let record = &*record;
    let thread = current_thread_context();

    // held for the whole trapped window; released by the matching leave or
    // on any bypass below
    record.usage_counter.fetch_add(1, Ordering::AcqRel);

    if (*thread).guard > 0 {
        record.usage_counter.fetch_sub(1, Ordering::Release);
        return record.on_invoke_trampoline;
    }
    (*thread).guard += 1;

    // a replacement calling its own target reaches the original
    if let Some(top) = (*thread).stack.peek_mut() {
        if top.calling_replacement && top.function == record.function_address {
            (*thread).guard -= 1;
            record.usage_counter.fetch_sub(1, Ordering::Release);
            return record.on_invoke_trampoline;
        }
    }

    let saved_errno = system_errno();

    let interceptor = Interceptor::obtain();
    let mut invoke_listeners = (*thread).ignore_level == 0;
    if invoke_listeners {
        let selected = interceptor.selected_thread.load(Ordering::Relaxed);
        if selected != 0 {
            invoke_listeners = selected == current_thread_id();
        }
    }

    let replacement = record.replacement.load(Ordering::Acquire);
    let will_trap = !replacement.is_null() || invoke_listeners;
    if !will_trap {
        (*thread).guard -= 1;
        record.usage_counter.fetch_sub(1, Ordering::Release);
        return record.on_invoke_trampoline;
    }

    let caller_ret = caller_ret_addr(&*cpu);
    let frame = (*thread).stack.push(
        record.function_address,
        caller_ret,
        record.on_leave_trampoline as usize,
    ) as *mut InvocationFrame;
    (*frame).system_error = saved_errno;
    (*frame).live_cpu = cpu;
    set_resume_pc(&mut *cpu, caller_ret);

    if invoke_listeners {
        let snapshot = record.listeners.read().clone();
        for entry in snapshot.iter() {
            let mut ctx = InvocationContext {
                point_cut: PointCut::Enter,
                cpu,
                frame,
                thread,
                entry: Arc::as_ptr(entry),
                _marker: PhantomData,
            };
            entry.listener.on_enter(&mut ctx);
        }
        (*frame).listeners = Some(snapshot);
    }

    set_system_errno((*frame).system_error);

    // trap the return: the leave trampoline takes the caller's place
    set_caller_ret_addr(&mut *cpu, record.on_leave_trampoline as usize);

    let next_hop = if !replacement.is_null() {
        (*frame).calling_replacement = true;
        (*frame).replacement_data = record.replacement_data.load(Ordering::Acquire);
        (*frame).cpu_snapshot = (*cpu).clone();
        replacement as *const u8
    } else {
        record.on_invoke_trampoline
    };

    (*thread).guard -= 1;
    next_hop
}

/// Called by the leave trampoline. Returns the real caller return address.
pub(crate) unsafe extern "C" fn divert_end_invocation(
    record: *mut FunctionRecord,
    cpu: *mut CpuContext,
) -> *const u8 {
    let record = &*record;
    let thread = current_thread_context();
    (*thread).guard += 1;

    let saved_errno = system_errno();

    let frame = match (*thread).stack.peek_mut() {
        Some(frame) => frame as *mut InvocationFrame,
        None => {
            // an unmatched leave means the stack is corrupt; there is no
            // way to recover the caller address
            tracing::error!("leave trampoline without a frame; aborting");
            std::process::abort();
        }
    };
    (*frame).system_error = saved_errno;
    (*frame).live_cpu = cpu;
    let caller_ret = (*frame).caller_ret_addr;
    set_resume_pc(&mut *cpu, caller_ret);

    if let Some(snapshot) = (*frame).listeners.clone() {
        for entry in snapshot.iter().rev() {
            let mut ctx = InvocationContext {
                point_cut: PointCut::Leave,
                cpu,
                frame,
                thread,
                entry: Arc::as_ptr(entry),
                _marker: PhantomData,
            };
            entry.listener.on_leave(&mut ctx);
        }
    }

    set_system_errno((*frame).system_error);

    (*thread).stack.pop();
    record.usage_counter.fetch_sub(1, Ordering::Release);
    (*thread).guard -= 1;
    caller_ret as *const u8
}
