use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Reference to a shared library on disk that can be injected into a target.
///
/// The stored path is the path *as the target process will resolve it*. For
/// ordinary targets that is also a path the injector can see; for targets
/// running inside a container or chroot jail, use [`from_path_in_root`] so
/// existence checks go through the target's root (e.g. `/proc/<pid>/root`).
///
/// [`from_path_in_root`]: Library::from_path_in_root
#[derive(Clone, Debug)]
pub struct Library {
    path: PathBuf,
    process_root: Option<PathBuf>,
    entrypoint: Option<CString>,
}

impl Library {
    /// Create from an existing library path.
    ///
    /// # Examples
    /// ```no_run
    /// # use remote_inject::Library;
    /// let lib = Library::from_path("/path/to/libagent.so")?;
    /// # Ok::<(), remote_inject::Error>(())
    /// ```
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Library> {
        let library = Library {
            path: path.as_ref().to_path_buf(),
            process_root: None,
            entrypoint: None,
        };
        library.check_exists()?;
        Ok(library)
    }

    /// Create from a target-visible library path, validated through the
    /// target's filesystem root.
    ///
    /// `root` is the injector-visible path of the target's root directory,
    /// typically `/proc/<pid>/root` for containerized targets on Linux. The
    /// bare path is what gets staged into the target; it does not need to
    /// exist in the injector's own filesystem.
    ///
    /// # Examples
    /// ```no_run
    /// # use remote_inject::Library;
    /// let lib = Library::from_path_in_root("/usr/lib/libagent.so", "/proc/1234/root")?;
    /// # Ok::<(), remote_inject::Error>(())
    /// ```
    pub fn from_path_in_root<P, R>(path: P, root: R) -> Result<Library>
    where
        P: AsRef<Path>,
        R: AsRef<Path>,
    {
        let library = Library {
            path: path.as_ref().to_path_buf(),
            process_root: Some(root.as_ref().to_path_buf()),
            entrypoint: None,
        };
        library.check_exists()?;
        Ok(library)
    }

    /// Name the exported symbol the convenience injection path invokes after
    /// the library has been loaded (Unix only).
    ///
    /// # Examples
    /// ```no_run
    /// # use remote_inject::Library;
    /// use std::ffi::CString;
    /// let lib = Library::from_path("/path/to/libagent.so")?
    ///     .with_entrypoint(CString::new("agent_entry").unwrap());
    /// # Ok::<(), remote_inject::Error>(())
    /// ```
    pub fn with_entrypoint(mut self, entrypoint: impl Into<CString>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    /// Return the entrypoint symbol name, if one was set.
    pub fn entrypoint(&self) -> Option<&CStr> {
        self.entrypoint.as_deref()
    }

    /// Return the target-visible library path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the path the injector itself uses to check the file, which goes
    /// through the process root when one is set.
    pub fn resolved_path(&self) -> PathBuf {
        match &self.process_root {
            Some(root) => join_process_root(root, &self.path),
            None => self.path.clone(),
        }
    }

    fn check_exists(&self) -> Result<()> {
        let resolved = self.resolved_path();
        match std::fs::metadata(&resolved) {
            Ok(meta) if meta.is_file() => Ok(()),
            Ok(_) => Err(Error::invalid_input("library path must be a file")),
            Err(_) => Err(Error::library_not_found(resolved.display())),
        }
    }
}

/// Join a target-visible path onto the target's root directory, the way the
/// target's loader would resolve it from outside: absolute paths are
/// re-rooted, relative ones appended.
fn join_process_root(root: &Path, path: &Path) -> PathBuf {
    let mut joined = root.to_path_buf();
    for component in path.components() {
        use std::path::Component;
        match component {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                joined.pop();
            }
            Component::Normal(part) => joined.push(part),
        }
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_reroots_absolute_paths() {
        let cases = [
            ("/proc/123/root", "/tmp/some/lib.so", "/proc/123/root/tmp/some/lib.so"),
            ("/proc/123/root/", "/tmp/some/lib.so", "/proc/123/root/tmp/some/lib.so"),
            ("/proc/123/root", "tmp/some/lib.so", "/proc/123/root/tmp/some/lib.so"),
            ("/proc/123/root/", "tmp/some/lib.so", "/proc/123/root/tmp/some/lib.so"),
        ];
        for (root, path, expected) in cases {
            assert_eq!(
                join_process_root(Path::new(root), Path::new(path)),
                PathBuf::from(expected),
                "root={root} path={path}"
            );
        }
    }

    #[test]
    fn join_normalizes_parent_components() {
        assert_eq!(
            join_process_root(Path::new("/proc/123/root"), Path::new("/tmp/../lib.so")),
            PathBuf::from("/proc/123/root/lib.so"),
        );
    }
}
