//! Cross-platform shared-library injection into running processes.
//!
//! This crate attaches to a target process with the platform's native
//! process-control primitives (ptrace on Linux, Mach task APIs on macOS,
//! remote threads on Windows), makes the target load a shared library through
//! its own dynamic loader, optionally invokes an exported symbol inside it,
//! and can unload the library and detach cleanly.
//!
//! # Quickstart
//! ```no_run
//! use remote_inject::{Attachment, Library, Process};
//!
//! let process = Process::from_pid(1234)?;
//! let library = Library::from_path("/path/to/libagent.so")?;
//!
//! let mut attachment = Attachment::attach(process)?;
//! let handle = attachment.inject(&library)?;
//! attachment.uninject(handle)?;
//! attachment.detach()?;
//! # Ok::<(), remote_inject::Error>(())
//! ```
//!
//! # One-shot injection
//! ```no_run
//! use remote_inject::{inject, Library, Process};
//!
//! let process = Process::from_pid(1234)?;
//! let library = Library::from_path("/path/to/libagent.so")?;
//! let handle = inject(process, &library)?;
//! # let _ = handle;
//! # Ok::<(), remote_inject::Error>(())
//! ```
//!
//! # Calling into the injected library (Unix)
//! ```no_run
//! use remote_inject::{Attachment, Library, Process};
//!
//! let process = Process::from_pid(1234)?;
//! let library = Library::from_path("/path/to/libagent.so")?;
//! let mut attachment = Attachment::attach(process)?;
//! let handle = attachment.inject(&library)?;
//! # #[cfg(unix)]
//! attachment.call(&handle, "agent_entry")?;
//! attachment.detach()?;
//! # Ok::<(), remote_inject::Error>(())
//! ```
//!
//! Every operation is synchronous: the calling thread blocks until the target
//! responds or the configured timeout elapses. Attachments to different
//! targets may be driven from different threads, but each [`Attachment`] is
//! tied to the thread that created it (ptrace pins the tracing relationship
//! to the attaching thread), which is why it is not `Send`.

mod backend;
mod error;
mod library;
mod process;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub use error::{Error, Result};
pub use library::Library;
pub use process::Process;

/// Tuning knobs for [`Attachment::attach_with_options`].
#[derive(Debug, Clone, Copy)]
pub struct AttachOptions {
    remote_call_timeout: Duration,
}

impl AttachOptions {
    /// Options with the default remote-call timeout (five seconds).
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the wait for the target to return from one remote call.
    ///
    /// An unresponsive target fails the call with a timeout error instead of
    /// blocking the caller forever.
    pub fn remote_call_timeout(mut self, timeout: Duration) -> Self {
        self.remote_call_timeout = timeout;
        self
    }
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            remote_call_timeout: Duration::from_secs(5),
        }
    }
}

/// Attach to a running process with default options.
///
/// # Examples
/// ```no_run
/// use remote_inject::{attach, Process};
///
/// let process = Process::from_pid(1234)?;
/// let attachment = attach(process)?;
/// # let _ = attachment;
/// # Ok::<(), remote_inject::Error>(())
/// ```
pub fn attach(process: Process) -> Result<Attachment> {
    Attachment::attach(process)
}

/// Inject a library into a process in one shot.
///
/// Attaches, loads the library, invokes the library's entrypoint when one is
/// set (Unix), and detaches again, returning the raw loader handle for
/// diagnostics. The handle is not usable after the detach; keep an
/// [`Attachment`] open instead if you intend to [`uninject`] later.
///
/// [`uninject`]: Attachment::uninject
///
/// # Examples
/// ```no_run
/// use remote_inject::{inject, Library, Process};
///
/// let handle = inject(
///     Process::from_pid(1234)?,
///     &Library::from_path("/path/to/libagent.so")?,
/// )?;
/// # let _ = handle;
/// # Ok::<(), remote_inject::Error>(())
/// ```
pub fn inject(process: Process, library: &Library) -> Result<u64> {
    inject_guarded(process, library, false)
}

/// Inject a library, let its load-time side effects run, then unload it
/// again before detaching.
///
/// # Examples
/// ```no_run
/// use remote_inject::{inject_transient, Library, Process};
///
/// inject_transient(
///     Process::from_pid(1234)?,
///     &Library::from_path("/path/to/libagent.so")?,
/// )?;
/// # Ok::<(), remote_inject::Error>(())
/// ```
pub fn inject_transient(process: Process, library: &Library) -> Result<()> {
    inject_guarded(process, library, true).map(|_| ())
}

fn inject_guarded(process: Process, library: &Library, unload: bool) -> Result<u64> {
    let mut attachment = Attachment::attach(process)?;
    let outcome = run_injection(&mut attachment, library, unload);
    let detached = attachment.detach();
    let handle = outcome?;
    detached?;
    Ok(handle)
}

fn run_injection(attachment: &mut Attachment, library: &Library, unload: bool) -> Result<u64> {
    #[cfg(not(unix))]
    if library.entrypoint().is_some() {
        return Err(Error::not_supported(
            "entrypoint calls are only available on Unix targets",
        ));
    }

    let handle = attachment.inject(library)?;

    #[cfg(unix)]
    if let Some(entrypoint) = library.entrypoint() {
        let symbol = entrypoint
            .to_str()
            .map_err(|_| Error::invalid_input("entrypoint symbol is not valid UTF-8"))?;
        attachment.call(&handle, symbol)?;
    }

    let raw = handle.raw();
    if unload {
        attachment.uninject(handle)?;
    }
    Ok(raw)
}

static NEXT_ATTACHMENT_ID: AtomicU64 = AtomicU64::new(1);

/// A live control session over one target process.
///
/// The attachment exclusively owns the platform handle (and, on Linux, the
/// saved register snapshot); dropping it detaches on a best-effort basis so a
/// panicking caller never leaves the target stopped. Call [`detach`] to
/// observe detach errors; a second call fails with an already-detached error
/// rather than misbehaving.
///
/// [`detach`]: Attachment::detach
#[derive(Debug)]
pub struct Attachment {
    controller: ControllerBox,
    process: Process,
    id: u64,
    detached: bool,
    last_error: Option<String>,
}

struct ControllerBox(Box<dyn backend::Controller>);

impl std::fmt::Debug for ControllerBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Controller(..)")
    }
}

/// Opaque token for one library loaded into a target.
///
/// Only meaningful to the attachment that produced it; it is consumed by
/// [`Attachment::uninject`] whether or not the unload succeeds.
#[derive(Debug)]
pub struct ModuleHandle {
    raw: u64,
    attachment: u64,
}

impl ModuleHandle {
    /// The loader's raw handle value, for diagnostics only.
    pub fn raw(&self) -> u64 {
        self.raw
    }
}

impl Attachment {
    /// Attach to a running process with default options.
    ///
    /// # Examples
    /// ```no_run
    /// use remote_inject::{Attachment, Process};
    ///
    /// let attachment = Attachment::attach(Process::from_pid(1234)?)?;
    /// # let _ = attachment;
    /// # Ok::<(), remote_inject::Error>(())
    /// ```
    pub fn attach(process: Process) -> Result<Attachment> {
        Self::attach_with_options(process, AttachOptions::default())
    }

    /// Attach to a running process.
    ///
    /// # Examples
    /// ```no_run
    /// use std::time::Duration;
    /// use remote_inject::{AttachOptions, Attachment, Process};
    ///
    /// let options = AttachOptions::new().remote_call_timeout(Duration::from_secs(2));
    /// let attachment = Attachment::attach_with_options(Process::from_pid(1234)?, options)?;
    /// # let _ = attachment;
    /// # Ok::<(), remote_inject::Error>(())
    /// ```
    pub fn attach_with_options(process: Process, options: AttachOptions) -> Result<Attachment> {
        let controller = backend::open(process, options.remote_call_timeout)?;
        Ok(Attachment {
            controller: ControllerBox(controller),
            process,
            id: NEXT_ATTACHMENT_ID.fetch_add(1, Ordering::Relaxed),
            detached: false,
            last_error: None,
        })
    }

    /// Return the target process handle.
    pub fn process(&self) -> Process {
        self.process
    }

    /// Load a shared library into the target through its own dynamic loader.
    ///
    /// The library path is staged into scratch memory inside the target, the
    /// loader primitive is invoked remotely, and the scratch memory is
    /// released again on success and on every failure path.
    pub fn inject(&mut self, library: &Library) -> Result<ModuleHandle> {
        let result = self.inject_inner(library);
        self.record(result)
    }

    /// Invoke `symbol()` inside an injected library (Unix only).
    ///
    /// The symbol is resolved with the target's own `dlsym` equivalent and
    /// called with no arguments; a null resolution fails without calling
    /// anything.
    #[cfg(unix)]
    pub fn call(&mut self, handle: &ModuleHandle, symbol: &str) -> Result<()> {
        let result = self.call_inner(handle, symbol);
        self.record(result)
    }

    /// Unload an injected library.
    ///
    /// The handle is consumed regardless of the outcome; the target's loader
    /// does not hand out a second chance at a handle it has already rejected.
    pub fn uninject(&mut self, handle: ModuleHandle) -> Result<()> {
        let result = self.uninject_inner(&handle);
        self.record(result)
    }

    /// Restore the target to a runnable state and release the platform
    /// handle.
    ///
    /// A second call fails with an already-detached error.
    pub fn detach(&mut self) -> Result<()> {
        if self.detached {
            let result = Err(Error::already_detached());
            return self.record(result);
        }
        // The platform handle is released exactly once, even when the detach
        // itself reports a failure.
        self.detached = true;
        let result = self.controller.0.detach();
        self.record(result)
    }

    /// The message of the most recent failing operation on this attachment.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.last_error = Some(err.to_string());
        }
        result
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.detached {
            return Err(Error::already_detached());
        }
        Ok(())
    }

    fn ensure_owned(&self, handle: &ModuleHandle) -> Result<()> {
        if handle.attachment != self.id {
            return Err(Error::invalid_input(
                "module handle belongs to a different attachment",
            ));
        }
        Ok(())
    }

    fn inject_inner(&mut self, library: &Library) -> Result<ModuleHandle> {
        self.ensure_attached()?;
        let path_bytes = self.controller.0.encode_library_path(library.path())?;
        let loader = self.controller.0.loader()?;

        let scratch = self.controller.0.allocate_scratch(path_bytes.len())?;
        let staged = self.controller.0.write_bytes(scratch, &path_bytes);
        let called = staged.and_then(|_| {
            let args = match loader.open_flags {
                Some(flags) => vec![scratch, flags],
                None => vec![scratch],
            };
            self.controller.0.remote_call(loader.open, &args)
        });
        let handle = match called {
            Ok(0) => Err(match self.loader_diagnostic(&loader) {
                Some(message) => {
                    Error::remote_call_failed(format!("target loader reported: {message}"))
                }
                None => Error::remote_call_failed("target loader returned null for the library"),
            }),
            Ok(raw) => self.controller.0.normalize_module_handle(raw, library.path()),
            Err(err) => Err(err),
        };
        // Scratch is released on success and failure alike; the interesting
        // error is the injection outcome, not the cleanup.
        let freed = self.controller.0.free_scratch(scratch, path_bytes.len());

        let raw = handle?;
        freed?;
        Ok(ModuleHandle {
            raw,
            attachment: self.id,
        })
    }

    #[cfg(unix)]
    fn call_inner(&mut self, handle: &ModuleHandle, symbol: &str) -> Result<()> {
        use std::ffi::CString;

        self.ensure_attached()?;
        self.ensure_owned(handle)?;
        let loader = self.controller.0.loader()?;
        let resolve = loader.resolve.ok_or_else(|| {
            Error::not_supported("the target's loader exposes no symbol resolution")
        })?;

        let name = CString::new(symbol)
            .map_err(|_| Error::invalid_input("symbol name contains NUL"))?;
        let name_bytes = name.as_bytes_with_nul();

        let scratch = self.controller.0.allocate_scratch(name_bytes.len())?;
        let resolved = self
            .controller
            .0
            .write_bytes(scratch, name_bytes)
            .and_then(|_| {
                self.controller
                    .0
                    .remote_call(resolve, &[handle.raw, scratch])
            });
        let freed = self.controller.0.free_scratch(scratch, name_bytes.len());

        let address = resolved?;
        freed?;
        if address == 0 {
            return Err(Error::symbol_not_found(symbol));
        }

        self.controller.0.remote_call(address, &[])?;
        Ok(())
    }

    fn uninject_inner(&mut self, handle: &ModuleHandle) -> Result<()> {
        self.ensure_attached()?;
        self.ensure_owned(handle)?;
        let loader = self.controller.0.loader()?;

        let raw = self.controller.0.remote_call(loader.close, &[handle.raw])?;
        let unloaded = if loader.close_ok_is_zero {
            raw == 0
        } else {
            raw != 0
        };
        if !unloaded {
            return Err(match self.loader_diagnostic(&loader) {
                Some(message) => {
                    Error::unload_failed(format!("target loader refused the unload: {message}"))
                }
                None => Error::unload_failed(format!(
                    "target loader refused to unload the module ({raw:#x})"
                )),
            });
        }
        Ok(())
    }

    /// Ask the target's loader for its own error string, if it has one.
    fn loader_diagnostic(&mut self, loader: &backend::LoaderSymbols) -> Option<String> {
        let error_fn = loader.error?;
        let message_ptr = self.controller.0.remote_call(error_fn, &[]).ok()?;
        if message_ptr == 0 {
            return None;
        }
        backend::read_remote_cstring(&mut *self.controller.0, message_ptr, 512).ok()
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if !self.detached {
            // Never leave the target stopped because the caller unwound.
            let _ = self.controller.0.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_is_nonzero() {
        let options = AttachOptions::default();
        assert!(options.remote_call_timeout > Duration::ZERO);
    }

    #[test]
    fn module_handle_exposes_raw_value() {
        let handle = ModuleHandle {
            raw: 0x7f00_0000_1000,
            attachment: 7,
        };
        assert_eq!(handle.raw(), 0x7f00_0000_1000);
    }
}
