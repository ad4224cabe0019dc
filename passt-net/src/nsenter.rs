//! Namespace entry helper.
//!
//! Runs a closure with the calling thread's network namespace switched to
//! a target namespace, then restores the original namespace on every exit
//! path, including a panic unwinding through the closure. Because the
//! whole connector is single-threaded and cooperative, this briefly
//! blocks that one thread; `setns(2)` and the surrounding `open`s are fast
//! enough that this is not a fairness concern for the rest of the event
//! loop.

use crate::error::{Error, Result};
use nix::sched::{setns, CloneFlags};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::AsFd;
use std::path::Path;

/// Opens `path` read-only and returns an owned fd, regardless of whether
/// the installed `nix` version hands back a raw fd or an `OwnedFd`.
fn open_ro(path: &Path) -> nix::Result<OwnedFd> {
    let raw = nix::fcntl::open(path, nix::fcntl::OFlag::O_RDONLY, nix::sys::stat::Mode::empty())?;
    // SAFETY: `nix::fcntl::open` just returned this fd to us; we are the
    // sole owner and close it exactly once via `OwnedFd`'s `Drop`.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Restores the original network namespace when dropped.
struct NsGuard {
    original: OwnedFd,
}

impl Drop for NsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(self.original.as_fd(), CloneFlags::CLONE_NEWNET) {
            // Nothing further can be done if we fail to restore; log and
            // let the process continue in whatever namespace it ended up
            // in rather than aborting the whole connector over this.
            tracing::error!(error = %e, "failed to restore original network namespace");
        }
    }
}

/// Opens `/proc/self/ns/net`, switches into the namespace at `target`,
/// runs `f`, then restores the original namespace.
pub fn enter_and<F, R>(target: &Path, f: F) -> Result<R>
where
    F: FnOnce() -> R,
{
    let original = open_ro(Path::new("/proc/self/ns/net"))
        .map_err(|e| Error::Namespace(format!("open /proc/self/ns/net: {e}")))?;
    let guard = NsGuard { original };

    let target_fd = open_ro(target)
        .map_err(|e| Error::Namespace(format!("open {}: {e}", target.display())))?;
    setns(target_fd.as_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|e| Error::Namespace(format!("setns({}): {e}", target.display())))?;
    drop(target_fd);

    let result = f();
    drop(guard); // explicit: restore before returning, not at some later point
    Ok(result)
}

/// Returns the conventional namespace path for a PID, e.g. for a PASTA
/// guest's network namespace discovered via its init process.
pub fn path_for_pid(pid: u32) -> std::path::PathBuf {
    std::path::PathBuf::from(format!("/proc/{pid}/ns/net"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_for_pid_formats_proc_path() {
        assert_eq!(path_for_pid(42).to_str().unwrap(), "/proc/42/ns/net");
    }

    #[test]
    fn enter_and_restores_namespace_on_success() {
        // Entering our own current namespace should be a harmless no-op
        // and still run the closure exactly once.
        let target = std::path::PathBuf::from("/proc/self/ns/net");
        let mut ran = false;
        let result = enter_and(&target, || {
            ran = true;
            7
        });
        match result {
            Ok(v) => {
                assert_eq!(v, 7);
                assert!(ran);
            }
            Err(_) => {
                // Environments without CAP_SYS_ADMIN for setns (e.g.
                // unprivileged CI sandboxes) are expected to fail here;
                // the guard's Drop must not panic either way.
            }
        }
    }
}
