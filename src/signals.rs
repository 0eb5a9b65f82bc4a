//! Signal plumbing shared by the reaper and the sampler.
//!
//! Everything reachable from a handler in here is async-signal-safe: handlers
//! are plain `sigaction` callbacks, masks are per-thread, and diagnostics are
//! formatted into a stack buffer and written with a single `write(2)`.

use std::fmt;
use std::io::Error;
use std::mem;

use anyhow::{bail, Result};

pub type SigInfoHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Install `handler` for `sig` with `SA_SIGINFO | SA_RESTART | extra_flags`.
///
/// `sig` itself is masked while the handler runs, plus anything in `also_mask`.
pub fn install_handler(
    sig: libc::c_int,
    handler: SigInfoHandler,
    extra_flags: libc::c_int,
    also_mask: &[libc::c_int],
) -> Result<()> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler as libc::sighandler_t;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART | extra_flags;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaddset(&mut sa.sa_mask, sig);
        for other in also_mask {
            libc::sigaddset(&mut sa.sa_mask, *other);
        }
        if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
            bail!(
                "Failed to install handler for signal {}: {}",
                sig,
                Error::last_os_error()
            );
        }
    }
    Ok(())
}

/// Put `sig` back to its default disposition.
pub fn restore_default(sig: libc::c_int) {
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}

fn sigset_of(sigs: &[libc::c_int]) -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        for sig in sigs {
            libc::sigaddset(&mut set, *sig);
        }
        set
    }
}

/// Blocks a set of signals for the calling thread until dropped, then
/// restores the previous mask.
pub struct SignalBlock {
    old: libc::sigset_t,
}

impl SignalBlock {
    pub fn new(sigs: &[libc::c_int]) -> Self {
        let set = sigset_of(sigs);
        let mut old: libc::sigset_t = unsafe { mem::zeroed() };
        unsafe {
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old);
        }
        SignalBlock { old }
    }

    /// Atomically install the mask that was active before this block and
    /// sleep until a handler runs.
    ///
    /// Signals that arrived while blocked are delivered immediately, so a
    /// check-then-suspend loop never misses a wake-up.
    pub fn suspend(&self) {
        unsafe {
            libc::sigsuspend(&self.old);
        }
    }

    /// Whether `sig` was already blocked before this guard.
    pub fn was_blocked(&self, sig: libc::c_int) -> bool {
        unsafe { libc::sigismember(&self.old, sig) == 1 }
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut());
        }
    }
}

/// Clear the signal mask of the calling thread. Used in a freshly forked
/// child, which otherwise inherits the parent's blocked signals across exec.
pub fn unblock_all() {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
    }
}

/// A fixed-capacity formatting buffer that never allocates.
///
/// Formatting past the end fails with [`fmt::Error`]; whatever fit is kept.
pub struct FixedBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> FixedBuf<N> {
    pub const fn new() -> Self {
        FixedBuf {
            buf: [0; N],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl<const N: usize> Default for FixedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let room = N - self.len;
        let take = bytes.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        self.len += take;
        if take < bytes.len() {
            return Err(fmt::Error);
        }
        Ok(())
    }
}

/// Write a formatted line to stderr from a signal handler.
pub fn write_stderr(args: fmt::Arguments<'_>) {
    let mut buf = FixedBuf::<256>::new();
    let _ = fmt::Write::write_fmt(&mut buf, args);
    let _ = fmt::Write::write_str(&mut buf, "\n");
    let bytes = buf.as_bytes();
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
        );
    }
}

/// Report a fatal error from a handler and terminate without unwinding or
/// running atexit hooks.
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    write_stderr(args);
    unsafe { libc::_exit(1) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fixed_buf_formats_without_allocating() {
        let mut buf = FixedBuf::<32>::new();
        write!(buf, "{},{}", "bench", 42u64).unwrap();
        assert_eq!(buf.as_bytes(), b"bench,42");
        assert_eq!(buf.len(), 8);
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_fixed_buf_overflow_keeps_prefix() {
        let mut buf = FixedBuf::<4>::new();
        assert!(write!(buf, "abcdef").is_err());
        assert_eq!(buf.as_bytes(), b"abcd");
    }

    static USR1_HITS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn count_usr1(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
        USR1_HITS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_blocked_signal_is_delivered_on_unblock() {
        install_handler(libc::SIGUSR1, count_usr1, 0, &[]).unwrap();
        let before = USR1_HITS.load(Ordering::SeqCst);
        {
            let block = SignalBlock::new(&[libc::SIGUSR1]);
            assert!(!block.was_blocked(libc::SIGUSR1));
            unsafe {
                libc::pthread_kill(libc::pthread_self(), libc::SIGUSR1);
            }
            assert_eq!(USR1_HITS.load(Ordering::SeqCst), before);
        }
        assert_eq!(USR1_HITS.load(Ordering::SeqCst), before + 1);
        restore_default(libc::SIGUSR1);
    }
}
