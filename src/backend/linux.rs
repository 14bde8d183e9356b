//! Linux engine: ptrace-driven remote calls.
//!
//! The target is stopped for the whole attachment (attach delivers SIGSTOP,
//! detach resumes it); remote calls briefly let it run again with a patched
//! trap so control returns to the injector:
//!
//! 1. snapshot registers, patch a trap over the byte at the stopped `rip`
//! 2. point `rip` at the callee, load SysV argument registers, push the trap
//!    address as the return address
//! 3. continue, wait for the trap, read the return register
//! 4. restore the patched byte and the register snapshot
//!
//! Scratch memory for staging arguments comes from a remote `mmap` syscall
//! driven by the same machinery with a `syscall; int3` stub.

use std::time::Duration;

use crate::backend::Controller;
use crate::{Process, Result};

#[cfg(target_arch = "x86_64")]
pub(super) fn open(process: Process, remote_call_timeout: Duration) -> Result<Box<dyn Controller>> {
    x86_64::LinuxController::attach(process, remote_call_timeout)
        .map(|controller| Box::new(controller) as Box<dyn Controller>)
}

#[cfg(not(target_arch = "x86_64"))]
pub(super) fn open(_process: Process, _remote_call_timeout: Duration) -> Result<Box<dyn Controller>> {
    Err(crate::Error::not_supported(
        "remote calls on Linux are implemented for x86_64 targets only",
    ))
}

#[cfg(target_arch = "x86_64")]
mod x86_64 {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use nix::errno::Errno;
    use nix::sys::ptrace;
    use nix::sys::signal::Signal;
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
    use nix::unistd::Pid;
    use tracing::debug;

    use super::maps::{self, MapRegion};
    use crate::backend::{Controller, Deadline, LoaderSymbols};
    use crate::{Error, Process, Result};

    /// System V AMD64 red zone: leaf frames may use this much stack below
    /// `rsp`, so staged data must stay clear of it.
    const RED_ZONE: u64 = 128;

    /// `int3`.
    const TRAP: u8 = 0xcc;

    /// `syscall; int3`.
    const SYSCALL_STUB: [u8; 3] = [0x0f, 0x05, TRAP];

    const SYS_MMAP: u64 = 9;
    const SYS_MUNMAP: u64 = 11;

    pub(super) struct LinuxController {
        pid: Pid,
        timeout: Duration,
        saved_regs: libc::user_regs_struct,
        loader: Option<LoaderSymbols>,
        /// Set when an aborted remote call left the target in an unknown
        /// state; every operation except detach is refused afterwards.
        poisoned: bool,
    }

    impl LinuxController {
        pub(super) fn attach(process: Process, timeout: Duration) -> Result<Self> {
            let raw_pid = process.pid();
            check_architecture(raw_pid)?;
            check_not_traced(raw_pid)?;

            let pid = Pid::from_raw(raw_pid);
            ptrace::attach(pid).map_err(|errno| attach_error(raw_pid, errno))?;

            match waitpid(pid, None) {
                Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {}
                Ok(other) => {
                    let _ = ptrace::detach(pid, None);
                    return Err(Error::os(format!(
                        "unexpected status after attach: {other:?}"
                    )));
                }
                Err(errno) => {
                    let _ = ptrace::detach(pid, None);
                    return Err(Error::os(format!("waitpid after attach: {errno}")));
                }
            }

            let saved_regs = ptrace::getregs(pid).map_err(|errno| {
                let _ = ptrace::detach(pid, None);
                Error::os(format!("failed to snapshot registers: {errno}"))
            })?;

            debug!(pid = raw_pid, "attached to target");
            Ok(Self {
                pid,
                timeout,
                saved_regs,
                loader: None,
                poisoned: false,
            })
        }

        fn ensure_usable(&self) -> Result<()> {
            if self.poisoned {
                return Err(Error::unexpected_signal(
                    "attachment is poisoned by an aborted remote call; detach it",
                ));
            }
            Ok(())
        }

        fn read_word(&self, addr: u64) -> Result<u64> {
            ptrace::read(self.pid, addr as ptrace::AddressType)
                .map(|word| word as u64)
                .map_err(|errno| memory_error(addr, errno))
        }

        fn write_word(&self, addr: u64, word: u64) -> Result<()> {
            ptrace::write(self.pid, addr as ptrace::AddressType, word as libc::c_long)
                .map_err(|errno| memory_error(addr, errno))
        }

        /// Patch `bytes` over target code, returning the original word for
        /// restoration. The patch must fit in one word.
        fn patch_code(&self, addr: u64, bytes: &[u8]) -> Result<u64> {
            debug_assert!(bytes.len() <= 8);
            let original = self.read_word(addr)?;
            let mut patched = original.to_ne_bytes();
            patched[..bytes.len()].copy_from_slice(bytes);
            self.write_word(addr, u64::from_ne_bytes(patched))?;
            Ok(original)
        }

        /// Resume the target and wait for it to hit the expected trap.
        ///
        /// Any stop that is not the trap poisons the attachment: the target's
        /// registers no longer match any state we can safely restore mid-call.
        fn run_to_trap(&mut self, expected_rip: u64) -> Result<libc::user_regs_struct> {
            ptrace::cont(self.pid, None)
                .map_err(|errno| Error::os(format!("failed to resume target: {errno}")))?;

            let deadline = Deadline::after(self.timeout);
            let status = loop {
                match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => {
                        if deadline.expired() {
                            self.poisoned = true;
                            // Stop it again so detach has something to restore.
                            let _ = nix::sys::signal::kill(self.pid, Signal::SIGSTOP);
                            let _ = waitpid(self.pid, None);
                            return Err(Error::remote_call_timeout(format!(
                                "target did not return from remote call within {:?}",
                                self.timeout
                            )));
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Ok(status) => break status,
                    Err(errno) => {
                        self.poisoned = true;
                        return Err(Error::os(format!("waitpid during remote call: {errno}")));
                    }
                }
            };

            match status {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    let regs = ptrace::getregs(self.pid)
                        .map_err(|errno| Error::os(format!("getregs after trap: {errno}")))?;
                    // int3 leaves rip one past the trap byte.
                    if regs.rip == expected_rip {
                        Ok(regs)
                    } else {
                        self.poisoned = true;
                        Err(Error::unexpected_signal(format!(
                            "target trapped at {:#x}, expected {:#x}",
                            regs.rip, expected_rip
                        )))
                    }
                }
                WaitStatus::Stopped(_, signal) => {
                    self.poisoned = true;
                    Err(Error::unexpected_signal(format!(
                        "target received {signal} during remote call"
                    )))
                }
                WaitStatus::Exited(_, code) => {
                    self.poisoned = true;
                    Err(Error::os(format!("target exited with code {code} during remote call")))
                }
                WaitStatus::Signaled(_, signal, _) => {
                    self.poisoned = true;
                    Err(Error::os(format!("target was killed by {signal} during remote call")))
                }
                other => {
                    self.poisoned = true;
                    Err(Error::os(format!("unexpected wait status: {other:?}")))
                }
            }
        }

        /// Drive one remote syscall through a `syscall; int3` stub patched
        /// over the bytes at the stopped instruction pointer.
        fn remote_syscall(&mut self, number: u64, args: [u64; 6]) -> Result<u64> {
            self.ensure_usable()?;
            let stub_addr = self.saved_regs.rip;
            let original = self.patch_code(stub_addr, &SYSCALL_STUB)?;

            let mut regs = self.saved_regs;
            regs.rip = stub_addr;
            regs.rax = number;
            regs.rdi = args[0];
            regs.rsi = args[1];
            regs.rdx = args[2];
            regs.r10 = args[3];
            regs.r8 = args[4];
            regs.r9 = args[5];
            // A syscall interrupted by our attach would otherwise be rewound
            // and restarted when we resume with modified registers.
            regs.orig_rax = u64::MAX;

            let result = ptrace::setregs(self.pid, regs)
                .map_err(|errno| Error::os(format!("setregs for remote syscall: {errno}")))
                .and_then(|_| self.run_to_trap(stub_addr + SYSCALL_STUB.len() as u64));

            // The call outcome is the interesting error; restore failures
            // only matter when the call itself succeeded.
            let restored = self.restore(stub_addr, original);
            let regs_after = result?;
            restored?;

            let ret = regs_after.rax;
            if ret > u64::MAX - 4095 {
                let errno = Errno::from_raw((ret as i64).unsigned_abs() as i32);
                return Err(Error::os(format!("remote syscall {number} failed: {errno}")));
            }
            Ok(ret)
        }

        /// Put the patched code word and the attach-time registers back.
        fn restore(&mut self, patch_addr: u64, original: u64) -> Result<()> {
            let code = self.write_word(patch_addr, original);
            let regs = ptrace::setregs(self.pid, self.saved_regs)
                .map_err(|errno| Error::os(format!("failed to restore registers: {errno}")));
            if code.is_err() || regs.is_err() {
                self.poisoned = true;
            }
            code?;
            regs
        }

        fn resolve_loader(&mut self) -> Result<LoaderSymbols> {
            let pid = self.pid.as_raw();
            let regions = maps::read(pid)?;

            for region in loader_candidates(&regions) {
                let base = match maps::image_base(&regions, &region.path) {
                    Some(base) => base,
                    None => continue,
                };
                // Read the image through the target's root so containerized
                // targets resolve their own libc, not the injector's.
                let image_path = PathBuf::from(format!("/proc/{pid}/root{}", region.path));
                let offsets = match elf_loader_offsets(&image_path) {
                    Ok(Some(offsets)) => offsets,
                    _ => continue,
                };

                debug!(
                    pid,
                    image = %region.path,
                    base = format_args!("{base:#x}"),
                    "resolved loader primitives"
                );
                return Ok(LoaderSymbols {
                    open: base + offsets.open,
                    close: base + offsets.close,
                    resolve: Some(base + offsets.resolve),
                    error: offsets.error.map(|offset| base + offset),
                    open_flags: Some(libc::RTLD_LAZY as u64),
                    close_ok_is_zero: true,
                });
            }

            Err(Error::loader_not_found(
                "no dynamic loader image found in target (statically linked?)",
            ))
        }
    }

    impl Controller for LinuxController {
        fn read_bytes(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
            let mut data = vec![0u8; len];
            let mut offset = 0;
            while offset + 8 <= len {
                let word = self.read_word(addr + offset as u64)?;
                data[offset..offset + 8].copy_from_slice(&word.to_ne_bytes());
                offset += 8;
            }
            if offset < len {
                // Trailing partial word: re-read overlapping the tail rather
                // than reading past the end of the range.
                let tail = len - offset;
                if len >= 8 {
                    let word = self.read_word(addr + (len - 8) as u64)?;
                    data[len - 8..].copy_from_slice(&word.to_ne_bytes());
                } else {
                    let word = self.read_word(addr)?;
                    data[..tail].copy_from_slice(&word.to_ne_bytes()[..tail]);
                }
            }
            Ok(data)
        }

        fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<()> {
            let mut chunks = data.chunks_exact(8);
            let mut offset = 0;
            for chunk in &mut chunks {
                let word = u64::from_ne_bytes(chunk.try_into().expect("chunk is 8 bytes"));
                self.write_word(addr + offset, word)?;
                offset += 8;
            }

            let tail = chunks.remainder();
            if !tail.is_empty() {
                // Read-modify-write so bytes beyond the buffer stay intact.
                let mut word = self.read_word(addr + offset)?.to_ne_bytes();
                word[..tail.len()].copy_from_slice(tail);
                self.write_word(addr + offset, u64::from_ne_bytes(word))?;
            }
            Ok(())
        }

        fn allocate_scratch(&mut self, len: usize) -> Result<u64> {
            let addr = self.remote_syscall(
                SYS_MMAP,
                [
                    0,
                    len as u64,
                    (libc::PROT_READ | libc::PROT_WRITE) as u64,
                    (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64,
                    u64::MAX,
                    0,
                ],
            )?;
            debug!(addr = format_args!("{addr:#x}"), len, "allocated scratch in target");
            Ok(addr)
        }

        fn free_scratch(&mut self, addr: u64, len: usize) -> Result<()> {
            self.remote_syscall(SYS_MUNMAP, [addr, len as u64, 0, 0, 0, 0])?;
            Ok(())
        }

        fn remote_call(&mut self, func: u64, args: &[u64]) -> Result<u64> {
            self.ensure_usable()?;
            if args.len() > 6 {
                return Err(Error::invalid_input(
                    "remote calls support at most 6 register arguments",
                ));
            }

            let trap_addr = self.saved_regs.rip;
            let original = self.patch_code(trap_addr, &[TRAP])?;

            let mut regs = self.saved_regs;
            // Steer clear of the red zone, align, then push the return
            // address; entry convention wants rsp ≡ 8 (mod 16) at the callee.
            let mut rsp = (self.saved_regs.rsp - RED_ZONE) & !0xf;
            rsp -= 8;
            let setup = self.write_word(rsp, trap_addr);

            regs.rsp = rsp;
            regs.rip = func;
            regs.rax = 0; // %al carries the vector-register count for varargs
            regs.orig_rax = u64::MAX;
            for (reg, value) in [
                &mut regs.rdi,
                &mut regs.rsi,
                &mut regs.rdx,
                &mut regs.rcx,
                &mut regs.r8,
                &mut regs.r9,
            ]
            .into_iter()
            .zip(args)
            {
                *reg = *value;
            }

            debug!(
                func = format_args!("{func:#x}"),
                args = args.len(),
                "issuing remote call"
            );
            let result = setup
                .and_then(|_| {
                    ptrace::setregs(self.pid, regs)
                        .map_err(|errno| Error::os(format!("setregs for remote call: {errno}")))
                })
                // int3 stops with rip one past the trap byte.
                .and_then(|_| self.run_to_trap(trap_addr + 1));

            let restored = self.restore(trap_addr, original);
            let regs_after = result?;
            restored?;
            Ok(regs_after.rax)
        }

        fn loader(&mut self) -> Result<LoaderSymbols> {
            self.ensure_usable()?;
            if let Some(loader) = self.loader {
                return Ok(loader);
            }
            let loader = self.resolve_loader()?;
            self.loader = Some(loader);
            Ok(loader)
        }

        fn encode_library_path(&self, path: &Path) -> Result<Vec<u8>> {
            CString::new(path.as_os_str().as_bytes())
                .map(CString::into_bytes_with_nul)
                .map_err(|_| Error::invalid_input("library path contains NUL"))
        }

        fn normalize_module_handle(&mut self, raw: u64, _path: &Path) -> Result<u64> {
            Ok(raw)
        }

        fn detach(&mut self) -> Result<()> {
            // Best-effort register restore even when poisoned; the snapshot
            // is the last state known to be runnable.
            let restore = ptrace::setregs(self.pid, self.saved_regs);
            let detach = ptrace::detach(self.pid, None);
            debug!(pid = self.pid.as_raw(), "detached from target");
            match (restore, detach) {
                (Ok(()), Ok(())) => Ok(()),
                (Err(errno), _) | (_, Err(errno)) => {
                    Err(Error::os(format!("detach from target failed: {errno}")))
                }
            }
        }
    }

    /// Offsets of the loader primitives inside one loader image file.
    struct LoaderOffsets {
        open: u64,
        close: u64,
        resolve: u64,
        error: Option<u64>,
    }

    /// Deduplicated loader images in probe order: libdl first (pre-2.34 glibc
    /// exports dl* there), then libc, then the musl loader.
    fn loader_candidates(regions: &[MapRegion]) -> Vec<&MapRegion> {
        let rank = |path: &str| {
            let name = path.rsplit('/').next().unwrap_or(path);
            if name.starts_with("libdl") {
                0
            } else if name.starts_with("libc.so") || name.starts_with("libc-") {
                1
            } else {
                2
            }
        };

        let mut candidates: Vec<&MapRegion> = Vec::new();
        for region in regions {
            if maps::is_loader_image(&region.path)
                && !candidates.iter().any(|seen| seen.path == region.path)
            {
                candidates.push(region);
            }
        }
        candidates.sort_by_key(|region| rank(&region.path));
        candidates
    }

    fn elf_loader_offsets(path: &Path) -> Result<Option<LoaderOffsets>> {
        use object::{Object, ObjectSymbol};

        let data = std::fs::read(path)?;
        let file = object::File::parse(&*data)
            .map_err(|err| Error::os(format!("failed to parse {}: {err}", path.display())))?;

        let find = |names: &[&str]| -> Option<u64> {
            for wanted in names {
                for symbol in file.dynamic_symbols() {
                    if symbol.address() != 0 && symbol.name().is_ok_and(|name| name == *wanted) {
                        return Some(symbol.address());
                    }
                }
            }
            None
        };

        let open = find(&["dlopen", "__libc_dlopen_mode"]);
        let close = find(&["dlclose", "__libc_dlclose"]);
        let resolve = find(&["dlsym", "__libc_dlsym"]);
        let (Some(open), Some(close), Some(resolve)) = (open, close, resolve) else {
            return Ok(None);
        };

        Ok(Some(LoaderOffsets {
            open,
            close,
            resolve,
            error: find(&["dlerror"]),
        }))
    }

    fn check_architecture(pid: i32) -> Result<()> {
        const ELFCLASS64: u8 = 2;
        const EM_X86_64: u16 = 62;

        // Best effort: unreadable /proc/pid/exe means attach will fail with a
        // clearer error of its own.
        let Ok(header) = std::fs::read(format!("/proc/{pid}/exe")) else {
            return Ok(());
        };
        if header.len() < 20 || &header[..4] != b"\x7fELF" {
            return Ok(());
        }

        let class = header[4];
        let machine = u16::from_le_bytes([header[18], header[19]]);
        if class != ELFCLASS64 || machine != EM_X86_64 {
            return Err(Error::architecture_mismatch(format!(
                "target {pid} is not an x86_64 process (ELF class {class}, machine {machine})"
            )));
        }
        Ok(())
    }

    fn check_not_traced(pid: i32) -> Result<()> {
        let status = match std::fs::read_to_string(format!("/proc/{pid}/status")) {
            Ok(status) => status,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::process_not_found(pid));
            }
            Err(err) => return Err(Error::from(err)),
        };

        let tracer = status
            .lines()
            .find_map(|line| line.strip_prefix("TracerPid:"))
            .and_then(|rest| rest.trim().parse::<i32>().ok())
            .unwrap_or(0);
        if tracer != 0 {
            return Err(Error::already_traced(pid, tracer));
        }
        Ok(())
    }

    fn attach_error(pid: i32, errno: Errno) -> Error {
        match errno {
            Errno::ESRCH => Error::process_not_found(pid),
            Errno::EPERM => Error::permission_denied(format!(
                "ptrace attach to {pid} denied; injecting usually needs the same uid or \
                 CAP_SYS_PTRACE, and /proc/sys/kernel/yama/ptrace_scope may restrict it further"
            )),
            other => Error::os(format!("ptrace attach to {pid} failed: {other}")),
        }
    }

    fn memory_error(addr: u64, errno: Errno) -> Error {
        match errno {
            Errno::EIO | Errno::EFAULT => {
                Error::invalid_remote_address(addr, "target rejected the access")
            }
            Errno::ESRCH => Error::os("target process is gone"),
            other => Error::os(format!("target memory access at {addr:#x} failed: {other}")),
        }
    }
}

/// `/proc/pid/maps` parsing, shared by the controller and kept separate for
/// testability.
mod maps {
    use crate::{Error, Result};

    #[derive(Debug, Clone)]
    pub(super) struct MapRegion {
        pub start: u64,
        pub offset: u64,
        pub path: String,
    }

    pub(super) fn read(pid: i32) -> Result<Vec<MapRegion>> {
        let content = std::fs::read_to_string(format!("/proc/{pid}/maps"))
            .map_err(|err| Error::os(format!("failed to read maps of {pid}: {err}")))?;
        Ok(parse(&content))
    }

    pub(super) fn parse(content: &str) -> Vec<MapRegion> {
        content.lines().filter_map(parse_line).collect()
    }

    fn parse_line(line: &str) -> Option<MapRegion> {
        // 7f8a12000000-7f8a12022000 r--p 00000000 08:01 2345678  /usr/lib/libc.so.6
        let mut parts = line.splitn(6, char::is_whitespace);
        let addr_range = parts.next()?;
        let _perms = parts.next()?;
        let offset = parts.next()?;
        let _dev = parts.next()?;
        let _inode = parts.next()?;
        let path = parts.next().unwrap_or("").trim().to_string();

        let (start, _end) = addr_range.split_once('-')?;
        Some(MapRegion {
            start: u64::from_str_radix(start, 16).ok()?,
            offset: u64::from_str_radix(offset, 16).ok()?,
            path,
        })
    }

    /// Lowest mapping of the image with file offset zero: the ELF load base.
    pub(super) fn image_base(regions: &[MapRegion], path: &str) -> Option<u64> {
        regions
            .iter()
            .filter(|region| region.path == path && region.offset == 0)
            .map(|region| region.start)
            .min()
    }

    /// Does this mapping belong to an image that can host the dynamic-loader
    /// primitives? Covers glibc (libc.so.6, libc-2.x.so, libdl) and musl
    /// (libc.musl-*, ld-musl-*).
    pub(super) fn is_loader_image(path: &str) -> bool {
        let name = match path.rsplit('/').next() {
            Some(name) if !name.is_empty() => name,
            _ => return false,
        };
        name.starts_with("libdl.so")
            || name.starts_with("libdl-")
            || name.starts_with("libc.so")
            || name.starts_with("libc-")
            || name.starts_with("libc.musl")
            || name.starts_with("ld-musl-")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const SAMPLE: &str = "\
564756400000-564756401000 r--p 00000000 08:01 1234567  /usr/bin/target
564756401000-564756402000 r-xp 00001000 08:01 1234567  /usr/bin/target
7f8a12000000-7f8a12022000 r--p 00000000 08:01 2345678  /usr/lib/x86_64-linux-gnu/libc.so.6
7f8a12022000-7f8a121b7000 r-xp 00022000 08:01 2345678  /usr/lib/x86_64-linux-gnu/libc.so.6
7ffd5e371000-7ffd5e392000 rw-p 00000000 00:00 0        [stack]
7ffd5e3f6000-7ffd5e3f8000 r-xp 00000000 00:00 0        [vdso]";

        #[test]
        fn parses_paths_and_offsets() {
            let regions = parse(SAMPLE);
            assert_eq!(regions.len(), 6);
            assert_eq!(regions[0].path, "/usr/bin/target");
            assert_eq!(regions[3].offset, 0x22000);
            assert_eq!(regions[4].path, "[stack]");
        }

        #[test]
        fn image_base_picks_lowest_zero_offset_mapping() {
            let regions = parse(SAMPLE);
            assert_eq!(
                image_base(&regions, "/usr/lib/x86_64-linux-gnu/libc.so.6"),
                Some(0x7f8a12000000)
            );
            assert_eq!(image_base(&regions, "/missing"), None);
        }

        #[test]
        fn loader_image_matching() {
            assert!(is_loader_image("/usr/lib/x86_64-linux-gnu/libc.so.6"));
            assert!(is_loader_image("/lib/libc-2.31.so"));
            assert!(is_loader_image("/lib/ld-musl-x86_64.so.1"));
            assert!(is_loader_image("/usr/lib/libdl.so.2"));
            assert!(!is_loader_image("/usr/lib/libssl.so.3"));
            assert!(!is_loader_image("[vdso]"));
            assert!(!is_loader_image(""));
        }
    }
}
