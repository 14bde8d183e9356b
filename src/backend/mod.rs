//! Platform engines.
//!
//! Each supported OS provides one [`Controller`] implementation wrapping its
//! native process-control primitives (ptrace on Linux, Mach task APIs on
//! macOS, debug/thread APIs on Windows). The orchestration in `lib.rs` is
//! written once against this contract and never touches an OS API directly.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::{Process, Result};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(windows)]
mod windows;

/// Addresses of the target's dynamic-loader primitives, expressed in the
/// target's address space.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoaderSymbols {
    /// `dlopen` equivalent.
    pub open: u64,
    /// `dlclose` equivalent.
    pub close: u64,
    /// `dlsym` equivalent; `None` where symbol calls are not part of the
    /// platform contract (Windows).
    pub resolve: Option<u64>,
    /// `dlerror` equivalent, for retrieving the loader's own diagnostic.
    pub error: Option<u64>,
    /// Second argument passed to `open`; unix loaders take mode flags,
    /// `LoadLibraryW` takes nothing.
    pub open_flags: Option<u64>,
    /// `dlclose` reports success with zero, `FreeLibrary` with non-zero.
    pub close_ok_is_zero: bool,
}

/// One attached target process, driven through its platform's primitives.
///
/// Implementations hold the platform handle and (on Linux/macOS) the saved
/// execution state exclusively; dropping the controller without `detach` must
/// still leave the target runnable, which `Attachment`'s `Drop` guarantees by
/// calling `detach` on every exit path.
///
/// Deliberately not `Send`: ptrace ties the attachment to the attaching
/// thread, so a controller lives and dies on the thread that opened it.
pub(crate) trait Controller {
    /// Read `len` bytes at a target virtual address.
    fn read_bytes(&mut self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// Write bytes at a target virtual address.
    fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// Allocate scratch memory in the target for staging call arguments.
    fn allocate_scratch(&mut self, len: usize) -> Result<u64>;

    /// Release scratch memory obtained from [`allocate_scratch`].
    ///
    /// [`allocate_scratch`]: Controller::allocate_scratch
    fn free_scratch(&mut self, addr: u64, len: usize) -> Result<()>;

    /// Execute `func(args…)` inside the target and return its result,
    /// restoring the target's prior execution state afterwards.
    fn remote_call(&mut self, func: u64, args: &[u64]) -> Result<u64>;

    /// Locate the target's dynamic-loader primitives.
    fn loader(&mut self) -> Result<LoaderSymbols>;

    /// Encode a library path the way the target's loader expects it staged.
    fn encode_library_path(&self, path: &Path) -> Result<Vec<u8>>;

    /// Turn the loader's raw return value into a durable module handle.
    ///
    /// The unix loaders hand back the handle directly; Windows truncates it
    /// to a 32-bit thread exit code, so the engine re-derives the module base
    /// from the target's module list.
    fn normalize_module_handle(&mut self, raw: u64, path: &Path) -> Result<u64>;

    /// Restore the target to a runnable, unmodified state and release the
    /// platform handle. Called exactly once.
    fn detach(&mut self) -> Result<()>;
}

/// Open a controller for `process` on the current platform.
pub(crate) fn open(process: Process, remote_call_timeout: Duration) -> Result<Box<dyn Controller>> {
    #[cfg(target_os = "linux")]
    {
        linux::open(process, remote_call_timeout)
    }
    #[cfg(target_os = "macos")]
    {
        macos::open(process, remote_call_timeout)
    }
    #[cfg(windows)]
    {
        windows::open(process, remote_call_timeout)
    }
}

/// Wall-clock bound for one remote call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    end: Instant,
}

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        Self {
            end: Instant::now() + timeout,
        }
    }

    pub(crate) fn expired(&self) -> bool {
        Instant::now() >= self.end
    }
}

/// Read a NUL-terminated string out of the target, bounded by `max_len`.
pub(crate) fn read_remote_cstring(
    controller: &mut dyn Controller,
    addr: u64,
    max_len: usize,
) -> Result<String> {
    let data = controller.read_bytes(addr, max_len)?;
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    Ok(String::from_utf8_lossy(&data[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_expires() {
        let deadline = Deadline::after(Duration::from_millis(0));
        assert!(deadline.expired());
        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(!deadline.expired());
    }
}
