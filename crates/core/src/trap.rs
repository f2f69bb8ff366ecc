//! Resuming threads that fetch a half-patched prologue.
//!
//! The x86 live-patch protocol parks `int3` on the target's first byte while
//! the rest of the redirect is written. A thread that executes the trap in
//! that window raises SIGTRAP; the handler rewinds its PC onto the trap byte
//! so it re-executes, spinning in fault-and-retry until the final byte lands
//! and the thread sails into the finished redirect (or restored prologue).
//!
//! Traps that are not ours are chained to whatever handler was installed
//! before.

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod imp {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;

    static PATCH_BASE: AtomicUsize = AtomicUsize::new(0);
    static PATCH_LEN: AtomicUsize = AtomicUsize::new(0);
    static OLD_HANDLER: OnceLock<libc::sigaction> = OnceLock::new();

    /// Marks one prologue as in-flux for the duration of the write.
    pub(crate) struct PatchGuard;

    pub(crate) fn begin_patch(base: usize, len: usize) -> PatchGuard {
        install_handler();
        PATCH_LEN.store(len, Ordering::SeqCst);
        PATCH_BASE.store(base, Ordering::SeqCst);
        PatchGuard
    }

    impl Drop for PatchGuard {
        fn drop(&mut self) {
            PATCH_BASE.store(0, Ordering::SeqCst);
            PATCH_LEN.store(0, Ordering::SeqCst);
        }
    }

    fn install_handler() {
        static INSTALLED: OnceLock<()> = OnceLock::new();
        INSTALLED.get_or_init(|| unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = trap_handler as usize;
            action.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut action.sa_mask);
            let mut previous: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(libc::SIGTRAP, &action, &mut previous) == 0 {
                let _ = OLD_HANDLER.set(previous);
            } else {
                tracing::warn!("SIGTRAP handler could not be installed");
            }
        });
    }

    unsafe extern "C" fn trap_handler(
        signal: i32,
        info: *mut libc::siginfo_t,
        context: *mut libc::c_void,
    ) {
        let ucontext = &mut *(context as *mut libc::ucontext_t);
        let rip = ucontext.uc_mcontext.gregs[libc::REG_RIP as usize] as usize;
        // int3 reports the PC after the one-byte trap
        let trap_site = rip.wrapping_sub(1);

        let base = PATCH_BASE.load(Ordering::SeqCst);
        let len = PATCH_LEN.load(Ordering::SeqCst);
        if base != 0 && trap_site >= base && trap_site < base + len {
            ucontext.uc_mcontext.gregs[libc::REG_RIP as usize] = trap_site as i64;
            return;
        }

        // not our patch window: chain
        let Some(previous) = OLD_HANDLER.get().copied() else {
            return;
        };
        if previous.sa_sigaction == libc::SIG_DFL {
            libc::signal(libc::SIGTRAP, libc::SIG_DFL);
            libc::raise(libc::SIGTRAP);
        } else if previous.sa_sigaction == libc::SIG_IGN {
            // ignored
        } else if previous.sa_flags & libc::SA_SIGINFO != 0 {
            let handler: extern "C" fn(i32, *mut libc::siginfo_t, *mut libc::c_void) =
                std::mem::transmute(previous.sa_sigaction);
            handler(signal, info, context);
        } else {
            let handler: extern "C" fn(i32) = std::mem::transmute(previous.sa_sigaction);
            handler(signal);
        }
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
#[allow(dead_code)]
mod imp {
    /// No trap window on this platform: either patches are a single aligned
    /// store, or publication goes through the dual-mapping path.
    pub(crate) struct PatchGuard;

    pub(crate) fn begin_patch(_base: usize, _len: usize) -> PatchGuard {
        PatchGuard
    }
}

pub(crate) use imp::{begin_patch, PatchGuard};
