use std::fmt;
use std::fmt::Display;

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKind {
    InvalidInput,
    NotSupported,
    ProcessNotFound,
    PermissionDenied,
    AlreadyTraced,
    AlreadyDetached,
    ArchitectureMismatch,
    LibraryNotFound,
    InvalidRemoteAddress,
    RemoteCallTimeout,
    UnexpectedSignal,
    LoaderNotFound,
    SymbolNotFound,
    RemoteCallFailed,
    UnloadFailed,
    Io,
    Os,
}

/// Error type for this crate.
///
/// This is intentionally a struct to minimize breaking changes over time, and
/// only exposes its message via `Display` plus a stable integer [`code`] for
/// callers that need to match on failure classes across an FFI-style boundary.
///
/// [`code`]: Error::code
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub(crate) fn invalid_input(msg: impl Display) -> Self {
        Self::new(ErrorKind::InvalidInput, msg)
    }

    // Only constructed on hosts where an engine capability is missing.
    #[allow(dead_code)]
    pub(crate) fn not_supported(msg: impl Display) -> Self {
        Self::new(ErrorKind::NotSupported, msg)
    }

    pub(crate) fn process_not_found(pid: i32) -> Self {
        Self::new(
            ErrorKind::ProcessNotFound,
            format_args!("process not found: {pid}"),
        )
    }

    pub(crate) fn permission_denied(msg: impl Display) -> Self {
        Self::new(ErrorKind::PermissionDenied, msg)
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn already_traced(pid: i32, tracer: i32) -> Self {
        Self::new(
            ErrorKind::AlreadyTraced,
            format_args!("process {pid} is already traced by pid {tracer}"),
        )
    }

    pub(crate) fn already_detached() -> Self {
        Self::new(ErrorKind::AlreadyDetached, "attachment is already detached")
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn architecture_mismatch(msg: impl Display) -> Self {
        Self::new(ErrorKind::ArchitectureMismatch, msg)
    }

    pub(crate) fn library_not_found(path: impl Display) -> Self {
        Self::new(
            ErrorKind::LibraryNotFound,
            format_args!("could not find library: {path}"),
        )
    }

    pub(crate) fn invalid_remote_address(addr: u64, msg: impl Display) -> Self {
        Self::new(
            ErrorKind::InvalidRemoteAddress,
            format_args!("invalid remote address {addr:#x}: {msg}"),
        )
    }

    pub(crate) fn remote_call_timeout(msg: impl Display) -> Self {
        Self::new(ErrorKind::RemoteCallTimeout, msg)
    }

    pub(crate) fn unexpected_signal(msg: impl Display) -> Self {
        Self::new(ErrorKind::UnexpectedSignal, msg)
    }

    pub(crate) fn loader_not_found(msg: impl Display) -> Self {
        Self::new(ErrorKind::LoaderNotFound, msg)
    }

    pub(crate) fn symbol_not_found(name: impl Display) -> Self {
        Self::new(
            ErrorKind::SymbolNotFound,
            format_args!("symbol not found in target: {name}"),
        )
    }

    pub(crate) fn remote_call_failed(msg: impl Display) -> Self {
        Self::new(ErrorKind::RemoteCallFailed, msg)
    }

    pub(crate) fn unload_failed(msg: impl Display) -> Self {
        Self::new(ErrorKind::UnloadFailed, msg)
    }

    pub(crate) fn os(msg: impl Display) -> Self {
        Self::new(ErrorKind::Os, msg)
    }

    pub(crate) fn from_io(err: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    fn new(kind: ErrorKind, msg: impl Display) -> Self {
        Self {
            kind,
            message: msg.to_string(),
            source: None,
        }
    }

    /// Stable integer code for this error class.
    ///
    /// Codes are negative and never reassigned, so bindings that surface a
    /// numeric error alongside the message can match on them across
    /// releases (process not found is -3, library not found is -6,
    /// permission denied is -8).
    pub fn code(&self) -> i32 {
        match self.kind {
            ErrorKind::Os => -1,
            ErrorKind::InvalidInput => -2,
            ErrorKind::ProcessNotFound => -3,
            ErrorKind::LoaderNotFound => -4,
            ErrorKind::AlreadyTraced => -5,
            ErrorKind::LibraryNotFound | ErrorKind::Io => -6,
            ErrorKind::InvalidRemoteAddress => -7,
            ErrorKind::PermissionDenied => -8,
            ErrorKind::NotSupported => -9,
            ErrorKind::ArchitectureMismatch => -10,
            ErrorKind::UnexpectedSignal => -11,
            ErrorKind::AlreadyDetached => -12,
            ErrorKind::RemoteCallTimeout => -13,
            ErrorKind::SymbolNotFound => -14,
            ErrorKind::RemoteCallFailed => -15,
            ErrorKind::UnloadFailed => -16,
        }
    }

    /// Returns true if the target process was not found.
    pub fn is_process_not_found(&self) -> bool {
        self.kind == ErrorKind::ProcessNotFound
    }

    /// Returns true if the error was caused by insufficient permissions.
    pub fn is_permission_denied(&self) -> bool {
        self.kind == ErrorKind::PermissionDenied
    }

    /// Returns true if another tracer already holds the target.
    pub fn is_already_traced(&self) -> bool {
        self.kind == ErrorKind::AlreadyTraced
    }

    /// Returns true if the attachment was already detached.
    pub fn is_already_detached(&self) -> bool {
        self.kind == ErrorKind::AlreadyDetached
    }

    /// Returns true if the target's architecture does not match the injector's.
    pub fn is_architecture_mismatch(&self) -> bool {
        self.kind == ErrorKind::ArchitectureMismatch
    }

    /// Returns true if the library file could not be found.
    pub fn is_library_not_found(&self) -> bool {
        self.kind == ErrorKind::LibraryNotFound
    }

    /// Returns true if a remote address was rejected by the target's OS.
    pub fn is_invalid_remote_address(&self) -> bool {
        self.kind == ErrorKind::InvalidRemoteAddress
    }

    /// Returns true if a remote call did not complete within the configured bound.
    pub fn is_remote_call_timeout(&self) -> bool {
        self.kind == ErrorKind::RemoteCallTimeout
    }

    /// Returns true if the target took an unrelated signal during a remote call.
    ///
    /// This is fatal to the attachment: the only remaining safe operation is
    /// a best-effort detach.
    pub fn is_unexpected_signal(&self) -> bool {
        self.kind == ErrorKind::UnexpectedSignal
    }

    /// Returns true if no dynamic-loader image was found in the target.
    pub fn is_loader_not_found(&self) -> bool {
        self.kind == ErrorKind::LoaderNotFound
    }

    /// Returns true if a symbol could not be resolved in the target.
    pub fn is_symbol_not_found(&self) -> bool {
        self.kind == ErrorKind::SymbolNotFound
    }

    /// Returns true if the target's loader reported a failure return.
    pub fn is_remote_call_failed(&self) -> bool {
        self.kind == ErrorKind::RemoteCallFailed
    }

    /// Returns true if the target's loader refused to unload the module.
    pub fn is_unload_failed(&self) -> bool {
        self.kind == ErrorKind::UnloadFailed
    }

    /// Returns true if this operation is not supported on the current platform.
    pub fn is_not_supported(&self) -> bool {
        self.kind == ErrorKind::NotSupported
    }

    /// Returns true if the input was rejected before reaching the target.
    pub fn is_invalid_input(&self) -> bool {
        self.kind == ErrorKind::InvalidInput
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            source: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::from_io(err)
    }
}
