//! Exclusive byte-range locks on the share file.
//!
//! One `fcntl(F_SETLKW)` write lock per page region is the only mutual
//! exclusion in the system; every blocking wait in the engine happens inside
//! [`acquire`]. POSIX record locks are per (process, file): within one
//! process they do not exclude, and closing any descriptor on the file drops
//! them all, so a `Cache` handle keeps its descriptor open for its lifetime
//! and cross-thread serialization is the caller's business.
//!
//! With a deadlock timer, [`acquire`] arms `alarm()` before blocking so a
//! peer that died holding a lock cannot wedge this process forever. The
//! SIGALRM handler is a no-op installed without `SA_RESTART`, which is what
//! makes the blocked `fcntl` return `EINTR` instead of resuming.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Once;

/// Seconds the deadlock-catch timer allows a lock wait to block.
pub const DEADLOCK_TIMEOUT_SECS: u32 = 10;

static SIGALRM_HANDLER: Once = Once::new();

extern "C" fn on_alarm(_sig: libc::c_int) {}

fn install_sigalrm_handler() {
    SIGALRM_HANDLER.call_once(|| unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = on_alarm as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = 0;
        libc::sigaction(libc::SIGALRM, &sa, std::ptr::null_mut());
    });
}

fn flock(l_type: libc::c_short, offset: u64, len: u64) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = l_type;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = offset as libc::off_t;
    fl.l_len = len as libc::off_t;
    fl
}

/// Block until the exclusive lock over `[offset, offset+len)` is held.
///
/// `len == 0` locks from `offset` to the end of the file, per fcntl
/// convention. Without a deadlock timer the wait restarts across benign
/// signal interruptions; with one, interruption by the expired timer fails
/// the acquisition with `TimedOut`.
pub fn acquire(fd: RawFd, offset: u64, len: u64, catch_deadlocks: bool) -> io::Result<()> {
    let fl = flock(libc::F_WRLCK as libc::c_short, offset, len);

    let old_alarm = if catch_deadlocks {
        install_sigalrm_handler();
        Some(unsafe { libc::alarm(DEADLOCK_TIMEOUT_SECS) })
    } else {
        None
    };

    loop {
        let res = unsafe { libc::fcntl(fd, libc::F_SETLKW, &fl) };
        if res == 0 {
            if let Some(old) = old_alarm {
                unsafe { libc::alarm(old) };
            }
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            match old_alarm {
                // No timer: restart the wait.
                None => continue,
                Some(old) => {
                    // Timer still pending means some other signal fired;
                    // re-arm the remainder and keep waiting.
                    let left = unsafe { libc::alarm(0) };
                    if left > 0 {
                        unsafe { libc::alarm(left) };
                        continue;
                    }
                    unsafe { libc::alarm(old) };
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("lock wait exceeded {DEADLOCK_TIMEOUT_SECS}s deadlock timer"),
                    ));
                }
            }
        }

        if let Some(old) = old_alarm {
            unsafe { libc::alarm(old) };
        }
        return Err(err);
    }
}

/// Release the lock over `[offset, offset+len)`.
pub fn release(fd: RawFd, offset: u64, len: u64) -> io::Result<()> {
    let fl = flock(libc::F_UNLCK as libc::c_short, offset, len);
    let res = unsafe { libc::fcntl(fd, libc::F_SETLKW, &fl) };
    if res == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
