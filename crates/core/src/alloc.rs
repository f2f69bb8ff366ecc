//! Executable code allocation.
//!
//! Hands out fixed-size slices from slabs placed within branch range of a
//! target address, so a single short branch can reach the trampoline. Freed
//! slices go back to a per-slab freelist; slabs are never unmapped.
//!
//! Where the OS forbids W^X, slabs stay writable while a transaction is open
//! and `commit()` flips them back to executable-only.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::HookError;
use crate::segment;

/// Placement constraint for a slice.
#[derive(Debug, Clone, Copy)]
pub struct NearSpec {
    /// Address the redirect branch will be emitted at.
    pub near: usize,
    /// Maximum distance the branch can cover.
    pub range: usize,
}

struct Slab {
    base: *mut u8,
    size: usize,
    /// Offsets of freed slices, reused before fresh space.
    free: Vec<usize>,
    /// High-water mark for never-used space.
    next_fresh: usize,
    /// Only meaningful on W^X systems: the slab is currently RW.
    writable: bool,
    /// Touched since the last commit.
    dirty: bool,
}

// SAFETY: slabs are only reachable through the allocator mutex
unsafe impl Send for Slab {}

struct AllocatorInner {
    slabs: BTreeMap<usize, Slab>,
    slice_size: usize,
    slab_size: usize,
}

/// Allocator for executable trampoline slices.
#[derive(Clone)]
pub struct CodeAllocator {
    inner: Arc<Mutex<AllocatorInner>>,
}

/// One executable slice. Freeing is O(1) and happens on drop.
pub struct CodeSlice {
    ptr: NonNull<u8>,
    len: usize,
    slab_base: usize,
    inner: Arc<Mutex<AllocatorInner>>,
}

// SAFETY: the pointed-to slab outlives every slice and all bookkeeping is
// behind the allocator mutex
unsafe impl Send for CodeSlice {}
unsafe impl Sync for CodeSlice {}

impl CodeSlice {
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for CodeSlice {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if let Some(slab) = inner.slabs.get_mut(&self.slab_base) {
            slab.free.push(self.ptr.as_ptr() as usize - self.slab_base);
        }
    }
}

impl CodeAllocator {
    pub fn new(slice_size: usize, slices_per_slab: usize) -> Self {
        let page = region::page::size();
        let raw = slice_size * slices_per_slab.max(1);
        let slab_size = raw.div_ceil(page) * page;
        Self {
            inner: Arc::new(Mutex::new(AllocatorInner {
                slabs: BTreeMap::new(),
                slice_size,
                slab_size,
            })),
        }
    }

    pub fn slice_size(&self) -> usize {
        self.inner.lock().slice_size
    }

    /// Allocate one slice, optionally within branch range of a target.
    pub fn alloc_slice(&self, spec: Option<NearSpec>) -> Result<CodeSlice, HookError> {
        let mut inner = self.inner.lock();
        let slice_size = inner.slice_size;

        // an existing slab with room within range?
        let mut found = None;
        for (&base, slab) in inner.slabs.iter_mut() {
            if !slab.free.is_empty() || slab.next_fresh + slice_size <= slab.size {
                if spec.map_or(true, |s| slab_in_range(base, slab.size, s)) {
                    found = Some(base);
                    break;
                }
            }
        }

        let base = match found {
            Some(base) => base,
            None => {
                let slab_size = inner.slab_size;
                let base = map_slab(spec, slab_size)?;
                inner.slabs.insert(
                    base as usize,
                    Slab {
                        base,
                        size: slab_size,
                        free: Vec::new(),
                        next_fresh: 0,
                        writable: segment::rwx_supported(),
                        dirty: false,
                    },
                );
                base as usize
            }
        };

        let slab = inner.slabs.get_mut(&base).unwrap();
        if !slab.writable {
            // W^X: open the slab for writing until the next commit
            unsafe {
                region::protect(slab.base, slab.size, region::Protection::READ_WRITE)
                    .map_err(|e| HookError::MemoryProtection(e.to_string()))?;
            }
            slab.writable = true;
        }
        slab.dirty = true;

        let offset = match slab.free.pop() {
            Some(offset) => offset,
            None => {
                let offset = slab.next_fresh;
                slab.next_fresh += slice_size;
                offset
            }
        };
        let ptr = unsafe { NonNull::new_unchecked(slab.base.add(offset)) };

        Ok(CodeSlice {
            ptr,
            len: slice_size,
            slab_base: base,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Flush deferred protection changes: on W^X systems writable slabs
    /// return to executable-only; instruction caches are flushed for every
    /// slab touched since the last commit.
    pub fn commit(&self) {
        let rwx = segment::rwx_supported();
        let mut inner = self.inner.lock();
        for slab in inner.slabs.values_mut() {
            if !slab.dirty {
                continue;
            }
            if !rwx && slab.writable {
                let result = unsafe {
                    region::protect(slab.base, slab.size, region::Protection::READ_EXECUTE)
                };
                if let Err(err) = result {
                    tracing::error!(%err, "failed to re-protect code slab");
                    continue;
                }
                slab.writable = false;
            }
            segment::flush_icache(slab.base, slab.size);
            slab.dirty = false;
        }
    }
}

fn slab_in_range(base: usize, size: usize, spec: NearSpec) -> bool {
    let lo = base.abs_diff(spec.near);
    let hi = (base + size).abs_diff(spec.near);
    lo.max(hi) < spec.range
}

#[cfg(unix)]
fn map_slab(spec: Option<NearSpec>, slab_size: usize) -> Result<*mut u8, HookError> {
    use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
    use std::num::NonZeroUsize;

    let prot = if segment::rwx_supported() {
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC
    } else {
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
    };
    let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
    let length = NonZeroUsize::new(slab_size).expect("slab size");

    if let Some(spec) = spec {
        let step = slab_size * 8;
        let reach = spec.range.saturating_sub(slab_size);
        let search_start = spec.near.saturating_sub(reach);
        let search_end = spec.near.saturating_add(reach);

        for hint in (search_start..search_end).step_by(step) {
            let Some(hint) = NonZeroUsize::new(hint) else {
                continue;
            };
            let Ok(ptr) = (unsafe { mmap_anonymous(Some(hint), length, prot, flags) }) else {
                continue;
            };
            let base = ptr.as_ptr() as *mut u8;
            if slab_in_range(base as usize, slab_size, spec) {
                return Ok(base);
            }
            // the kernel placed it too far away
            unsafe {
                let _ = munmap(ptr, slab_size);
            }
        }

        // last try without a hint; the address space may happen to cooperate
        if let Ok(ptr) = unsafe { mmap_anonymous(None, length, prot, flags) } {
            let base = ptr.as_ptr() as *mut u8;
            if slab_in_range(base as usize, slab_size, spec) {
                return Ok(base);
            }
            unsafe {
                let _ = munmap(ptr, slab_size);
            }
        }

        tracing::error!(near = spec.near, range = spec.range, "no slab within branch range");
        return Err(HookError::OutOfNearCodeSpace(spec.near));
    }

    let ptr = unsafe { mmap_anonymous(None, length, prot, flags) }
        .map_err(|e| HookError::MemoryProtection(e.to_string()))?;
    Ok(ptr.as_ptr() as *mut u8)
}

#[cfg(windows)]
fn map_slab(spec: Option<NearSpec>, slab_size: usize) -> Result<*mut u8, HookError> {
    use windows::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    };

    unsafe {
        if let Some(spec) = spec {
            let step = slab_size * 8;
            let reach = spec.range.saturating_sub(slab_size);
            let search_start = spec.near.saturating_sub(reach);
            let search_end = spec.near.saturating_add(reach);

            for hint in (search_start..search_end).step_by(step) {
                if hint == 0 {
                    continue;
                }
                let ptr = VirtualAlloc(
                    Some(hint as *const std::ffi::c_void),
                    slab_size,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_EXECUTE_READWRITE,
                );
                if ptr.is_null() {
                    continue;
                }
                if slab_in_range(ptr as usize, slab_size, spec) {
                    return Ok(ptr as *mut u8);
                }
                let _ = VirtualFree(ptr, 0, MEM_RELEASE);
            }
            tracing::error!(near = spec.near, "no slab within branch range");
            return Err(HookError::OutOfNearCodeSpace(spec.near));
        }

        let ptr = VirtualAlloc(None, slab_size, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE);
        if ptr.is_null() {
            return Err(HookError::MemoryProtection("VirtualAlloc failed".into()));
        }
        Ok(ptr as *mut u8)
    }
}
