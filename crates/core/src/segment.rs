//! Making code memory executable.
//!
//! Two strategies, used consistently per transaction:
//!
//! 1. RWX pages: write in place, then flush the instruction cache.
//! 2. Dual mapping: back the region with an anonymous memfd, emit into a
//!    writable view, and publish by mapping an executable view of the same
//!    pages over the destination.
//!
//! The second path is how prologue writes land on platforms where the text
//! segment can never be made writable+executable at once.

use std::sync::OnceLock;

use crate::error::HookError;

/// One dual-mapped staging segment.
#[cfg(unix)]
pub struct CodeSegment {
    fd: std::os::fd::OwnedFd,
    writable: std::ptr::NonNull<libc::c_void>,
    size: usize,
}

#[cfg(unix)]
impl CodeSegment {
    /// Reserve `size` bytes (page-rounded) of staging memory.
    pub fn new(size: usize) -> Result<Self, HookError> {
        use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
        use nix::sys::mman::{mmap, MapFlags, ProtFlags};
        use std::num::NonZeroUsize;

        let size = size.div_ceil(page_size()) * page_size();
        let name = c"divert-code-segment";
        let fd = memfd_create(name, MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(|e| HookError::MemoryProtection(e.to_string()))?;
        nix::unistd::ftruncate(&fd, size as i64)
            .map_err(|e| HookError::MemoryProtection(e.to_string()))?;

        let length = NonZeroUsize::new(size).expect("segment size");
        let writable = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| HookError::MemoryProtection(e.to_string()))?;

        Ok(Self { fd, writable, size })
    }

    /// Base of the writable view.
    pub fn writable_base(&self) -> *mut u8 {
        self.writable.as_ptr() as *mut u8
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Finish writing: the staging view becomes read-only so nothing can
    /// mutate the pages between here and `map`.
    pub fn realize(&self) -> Result<(), HookError> {
        unsafe {
            region::protect(self.writable_base(), self.size, region::Protection::READ)
                .map_err(|e| HookError::MemoryProtection(e.to_string()))
        }
    }

    /// Map `len` bytes at `src_offset` executable over `dst`.
    pub fn map(&self, src_offset: usize, len: usize, dst: usize) -> Result<(), HookError> {
        use nix::sys::mman::{mmap, MapFlags, ProtFlags};
        use std::num::NonZeroUsize;

        let length = NonZeroUsize::new(len).expect("map length");
        let addr = NonZeroUsize::new(dst).expect("map target");
        unsafe {
            mmap(
                Some(addr),
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
                MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
                &self.fd,
                src_offset as libc::off_t,
            )
        }
        .map_err(|e| HookError::MemoryProtection(e.to_string()))?;
        flush_icache(dst as *mut u8, len);
        Ok(())
    }

    /// Whether this platform can build dual-mapped segments at all.
    pub fn is_supported() -> bool {
        static SUPPORTED: OnceLock<bool> = OnceLock::new();
        *SUPPORTED.get_or_init(|| CodeSegment::new(page_size()).is_ok())
    }
}

#[cfg(unix)]
impl Drop for CodeSegment {
    fn drop(&mut self) {
        unsafe {
            let _ = nix::sys::mman::munmap(self.writable, self.size);
        }
        // fd closes with OwnedFd
    }
}

#[cfg(windows)]
pub struct CodeSegment;

#[cfg(windows)]
impl CodeSegment {
    pub fn new(_size: usize) -> Result<Self, HookError> {
        Err(HookError::PatchingForbidden)
    }

    pub fn writable_base(&self) -> *mut u8 {
        std::ptr::null_mut()
    }

    pub fn size(&self) -> usize {
        0
    }

    pub fn realize(&self) -> Result<(), HookError> {
        Ok(())
    }

    pub fn map(&self, _src_offset: usize, _len: usize, _dst: usize) -> Result<(), HookError> {
        Err(HookError::PatchingForbidden)
    }

    /// Windows always allows RWX pages, so the staged path is never needed.
    pub fn is_supported() -> bool {
        false
    }
}

/// System page size.
pub fn page_size() -> usize {
    region::page::size()
}

/// Round an address down to its containing page.
pub fn page_start(address: usize) -> usize {
    address & !(page_size() - 1)
}

/// Whether the OS will hand out writable+executable pages.
#[cfg(unix)]
pub fn rwx_supported() -> bool {
    use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
    use std::num::NonZeroUsize;

    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| {
        let length = NonZeroUsize::new(page_size()).expect("page size");
        match unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        } {
            Ok(ptr) => {
                unsafe {
                    let _ = munmap(ptr, page_size());
                }
                true
            }
            Err(_) => false,
        }
    })
}

#[cfg(windows)]
pub fn rwx_supported() -> bool {
    true
}

/// Flush the instruction cache for freshly written code.
#[cfg(target_arch = "x86_64")]
pub fn flush_icache(_ptr: *mut u8, _len: usize) {
    // x86 keeps caches coherent for self-modifying code; the publish
    // ordering is handled by the patching protocol itself
}

#[cfg(target_arch = "x86")]
pub fn flush_icache(_ptr: *mut u8, _len: usize) {}

#[cfg(any(target_arch = "aarch64", target_arch = "arm"))]
pub fn flush_icache(ptr: *mut u8, len: usize) {
    extern "C" {
        // compiler-rt / libgcc builtin
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }
    unsafe {
        __clear_cache(ptr as *mut libc::c_char, ptr.add(len) as *mut libc::c_char);
    }
}

#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "arm"
)))]
pub fn flush_icache(_ptr: *mut u8, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_math() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert_eq!(page_start(page + 123), page);
    }

    #[cfg(unix)]
    #[test]
    fn dual_map_roundtrip() {
        if !CodeSegment::is_supported() {
            return;
        }
        let segment = CodeSegment::new(page_size()).unwrap();
        let payload = [0xC3u8, 0x90, 0x90, 0x90];
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), segment.writable_base(), 4);
        }
        segment.realize().unwrap();

        // map the executable view over a scratch reservation
        use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};
        use std::num::NonZeroUsize;
        let scratch = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(page_size()).unwrap(),
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .unwrap();
        let dst = scratch.as_ptr() as usize;
        segment.map(0, page_size(), dst).unwrap();

        let mapped = unsafe { std::slice::from_raw_parts(dst as *const u8, 4) };
        assert_eq!(mapped, &payload);
    }
}
