//! macOS engine: Mach task primitives.
//!
//! Attach takes the target's task port (`task_for_pid`) and suspends the
//! task; existing threads are never touched, so there is no register state to
//! save. A remote call runs on a brand-new Mach thread executing a small
//! stub: call the function, store the result, raise a done flag, park. The
//! task is resumed only while the injector polls the flag, then suspended
//! again, so the "stopped for injector" view matches the other platforms.
//!
//! The dyld shared cache is mapped at one common slide for every process in a
//! boot session, so the injector's own `dlopen`/`dlsym`/`dlclose`/`dlerror`
//! addresses are valid in the target. `task_for_pid` fails for most targets
//! under System Integrity Protection unless the injector runs privileged and
//! suitably entitled; that is a platform policy boundary surfaced as a
//! permission error, not a bug.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

use mach2::kern_return::{
    KERN_INVALID_ADDRESS, KERN_PROTECTION_FAILURE, KERN_SUCCESS, kern_return_t,
};
use mach2::mach_port::mach_port_deallocate;
use mach2::port::mach_port_t;
use mach2::task::{task_resume, task_suspend};
use mach2::traps::{mach_task_self, task_for_pid};
use mach2::vm::{
    mach_vm_allocate, mach_vm_deallocate, mach_vm_protect, mach_vm_read_overwrite, mach_vm_write,
};
use mach2::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ};
use mach2::vm_statistics::VM_FLAGS_ANYWHERE;
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};
use tracing::debug;

use crate::backend::{Controller, Deadline, LoaderSymbols};
use crate::{Error, Process, Result};

/// One page for the stub code (mapped read+execute once written).
const STUB_REGION: u64 = 16 * 1024;
/// Stack handed to the remote thread; the result and done slots live at its
/// base, far below the stack top, because the stub page is not writable.
const STACK_REGION: u64 = 512 * 1024;
const RESULT_SLOT: u64 = 0;
const DONE_SLOT: u64 = 8;

mod ffi {
    use mach2::kern_return::kern_return_t;
    use mach2::message::mach_msg_type_number_t;
    use mach2::port::mach_port_t;

    // Not bound by mach2; declared the way the kernel exports them.
    unsafe extern "C" {
        pub fn thread_create_running(
            parent_task: mach_port_t,
            flavor: libc::c_int,
            new_state: *const u32,
            new_state_count: mach_msg_type_number_t,
            child_act: *mut mach_port_t,
        ) -> kern_return_t;

        pub fn thread_terminate(target_act: mach_port_t) -> kern_return_t;
    }

    pub const X86_THREAD_STATE64: libc::c_int = 4;
    pub const ARM_THREAD_STATE64: libc::c_int = 6;

    /// `x86_thread_state64_t`.
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct X86ThreadState64 {
        pub rax: u64,
        pub rbx: u64,
        pub rcx: u64,
        pub rdx: u64,
        pub rdi: u64,
        pub rsi: u64,
        pub rbp: u64,
        pub rsp: u64,
        pub r8: u64,
        pub r9: u64,
        pub r10: u64,
        pub r11: u64,
        pub r12: u64,
        pub r13: u64,
        pub r14: u64,
        pub r15: u64,
        pub rip: u64,
        pub rflags: u64,
        pub cs: u64,
        pub fs: u64,
        pub gs: u64,
    }

    /// `arm_thread_state64_t`.
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ArmThreadState64 {
        pub x: [u64; 29],
        pub fp: u64,
        pub lr: u64,
        pub sp: u64,
        pub pc: u64,
        pub cpsr: u32,
        pub flags: u32,
    }
}

pub(super) fn open(process: Process, remote_call_timeout: Duration) -> Result<Box<dyn Controller>> {
    MacController::attach(process, remote_call_timeout)
        .map(|controller| Box::new(controller) as Box<dyn Controller>)
}

struct MacController {
    task: mach_port_t,
    pid: i32,
    timeout: Duration,
    poisoned: bool,
}

impl MacController {
    fn attach(process: Process, timeout: Duration) -> Result<Self> {
        let pid = process.pid();
        let mut task: mach_port_t = 0;
        let kr = unsafe { task_for_pid(mach_task_self(), pid, &mut task) };
        if kr != KERN_SUCCESS {
            // KERN_FAILURE is what SIP-protected and other-uid targets yield.
            return Err(Error::permission_denied(format!(
                "task_for_pid({pid}) failed ({kr}); injection on macOS needs root and is \
                 refused for SIP-protected targets"
            )));
        }

        let kr = unsafe { task_suspend(task) };
        if kr != KERN_SUCCESS {
            unsafe { mach_port_deallocate(mach_task_self(), task) };
            return Err(kern_error(kr, "task_suspend"));
        }

        debug!(pid, task, "attached to target task");
        Ok(Self {
            task,
            pid,
            timeout,
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

    fn allocate(&self, size: u64) -> Result<u64> {
        let mut addr: mach_vm_address_t = 0;
        let kr = unsafe { mach_vm_allocate(self.task, &mut addr, size, VM_FLAGS_ANYWHERE) };
        if kr != KERN_SUCCESS {
            return Err(kern_error(kr, "mach_vm_allocate"));
        }
        Ok(addr)
    }

    fn deallocate(&self, addr: u64, size: u64) -> Result<()> {
        let kr = unsafe { mach_vm_deallocate(self.task, addr, size) };
        if kr != KERN_SUCCESS {
            return Err(kern_error(kr, "mach_vm_deallocate"));
        }
        Ok(())
    }

    /// Write the call stub for the host architecture and return the initial
    /// thread state pointing at it. The slot addresses ride in callee-saved
    /// registers so they survive the call itself.
    #[cfg(target_arch = "x86_64")]
    fn write_stub(
        &mut self,
        page: u64,
        stack: u64,
        func: u64,
        args: &[u64],
    ) -> Result<(Vec<u32>, libc::c_int)> {
        // call *%rax; mov %rax, (%r12); movq $1, (%r13); jmp .
        let code: &[u8] = &[
            0xff, 0xd0, // call *%rax
            0x49, 0x89, 0x04, 0x24, // mov %rax, (%r12)
            0x49, 0xc7, 0x45, 0x00, 0x01, 0x00, 0x00, 0x00, // movq $1, 0(%r13)
            0xeb, 0xfe, // jmp .
        ];
        self.write_bytes(page, code)?;

        let mut state = ffi::X86ThreadState64 {
            rip: page,
            rax: func,
            r12: stack + RESULT_SLOT,
            r13: stack + DONE_SLOT,
            // Callee entry convention wants rsp ≡ 8 (mod 16); the call in the
            // stub pushes the return address onto an aligned top.
            rsp: (stack + STACK_REGION - 64) & !0xf,
            ..Default::default()
        };
        let mut regs = [
            &mut state.rdi,
            &mut state.rsi,
            &mut state.rdx,
            &mut state.rcx,
            &mut state.r8,
            &mut state.r9,
        ];
        for (reg, value) in regs.iter_mut().zip(args) {
            **reg = *value;
        }

        Ok((raw_state(&state), ffi::X86_THREAD_STATE64))
    }

    #[cfg(target_arch = "aarch64")]
    fn write_stub(
        &mut self,
        page: u64,
        stack: u64,
        func: u64,
        args: &[u64],
    ) -> Result<(Vec<u32>, libc::c_int)> {
        // blr x9; str x0, [x19]; movz x12, #1; str x12, [x20]; b .
        let code: [u32; 5] = [
            0xd63f0120, // blr x9
            0xf9000260, // str x0, [x19]
            0xd280002c, // movz x12, #1
            0xf900028c, // str x12, [x20]
            0x14000000, // b .
        ];
        let mut bytes = Vec::with_capacity(code.len() * 4);
        for word in code {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        self.write_bytes(page, &bytes)?;

        let mut state = ffi::ArmThreadState64 {
            pc: page,
            sp: (stack + STACK_REGION - 64) & !0xf,
            ..Default::default()
        };
        state.x[9] = func;
        state.x[19] = stack + RESULT_SLOT;
        state.x[20] = stack + DONE_SLOT;
        for (slot, value) in state.x.iter_mut().zip(args) {
            *slot = *value;
        }

        Ok((raw_state(&state), ffi::ARM_THREAD_STATE64))
    }
}

fn raw_state<T: Copy>(state: &T) -> Vec<u32> {
    let words = std::mem::size_of::<T>() / 4;
    let mut raw = vec![0u32; words];
    unsafe {
        std::ptr::copy_nonoverlapping(state as *const T as *const u32, raw.as_mut_ptr(), words);
    }
    raw
}

impl Controller for MacController {
    fn read_bytes(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; len];
        let mut out_size: mach_vm_size_t = 0;
        let kr = unsafe {
            mach_vm_read_overwrite(
                self.task,
                addr,
                len as mach_vm_size_t,
                data.as_mut_ptr() as mach_vm_address_t,
                &mut out_size,
            )
        };
        if kr != KERN_SUCCESS {
            return Err(memory_error(addr, kr));
        }
        data.truncate(out_size as usize);
        Ok(data)
    }

    fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let kr = unsafe {
            mach_vm_write(
                self.task,
                addr,
                data.as_ptr() as usize,
                data.len() as u32,
            )
        };
        if kr != KERN_SUCCESS {
            return Err(memory_error(addr, kr));
        }
        Ok(())
    }

    fn allocate_scratch(&mut self, len: usize) -> Result<u64> {
        self.ensure_usable()?;
        let addr = self.allocate(len as u64)?;
        debug!(addr = format_args!("{addr:#x}"), len, "allocated scratch in target");
        Ok(addr)
    }

    fn free_scratch(&mut self, addr: u64, len: usize) -> Result<()> {
        self.deallocate(addr, len as u64)
    }

    fn remote_call(&mut self, func: u64, args: &[u64]) -> Result<u64> {
        self.ensure_usable()?;
        if args.len() > 6 {
            return Err(Error::invalid_input(
                "remote calls support at most 6 register arguments",
            ));
        }

        let page = self.allocate(STUB_REGION)?;
        let stack = match self.allocate(STACK_REGION) {
            Ok(stack) => stack,
            Err(err) => {
                let _ = self.deallocate(page, STUB_REGION);
                return Err(err);
            }
        };

        let outcome = self.run_stub(page, stack, func, args);

        let _ = self.deallocate(stack, STACK_REGION);
        let _ = self.deallocate(page, STUB_REGION);
        outcome
    }

    fn loader(&mut self) -> Result<LoaderSymbols> {
        // Shared-cache images sit at the same slide in every process, so our
        // own resolved addresses hold in the target.
        let resolve_own = |name: &std::ffi::CStr| -> Option<u64> {
            let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
            (!addr.is_null()).then_some(addr as u64)
        };

        let open = resolve_own(c"dlopen");
        let close = resolve_own(c"dlclose");
        let (Some(open), Some(close)) = (open, close) else {
            return Err(Error::loader_not_found(
                "dlopen/dlclose not resolvable in the shared cache",
            ));
        };

        Ok(LoaderSymbols {
            open,
            close,
            resolve: resolve_own(c"dlsym"),
            error: resolve_own(c"dlerror"),
            open_flags: Some(libc::RTLD_LAZY as u64),
            close_ok_is_zero: true,
        })
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
        let kr = unsafe { task_resume(self.task) };
        unsafe { mach_port_deallocate(mach_task_self(), self.task) };
        debug!(pid = self.pid, "detached from target task");
        if kr != KERN_SUCCESS {
            return Err(kern_error(kr, "task_resume"));
        }
        Ok(())
    }
}

impl MacController {
    fn run_stub(&mut self, page: u64, stack: u64, func: u64, args: &[u64]) -> Result<u64> {
        let (state, flavor) = self.write_stub(page, stack, func, args)?;

        let kr = unsafe {
            mach_vm_protect(self.task, page, STUB_REGION, 0, VM_PROT_READ | VM_PROT_EXECUTE)
        };
        if kr != KERN_SUCCESS {
            return Err(kern_error(kr, "mach_vm_protect"));
        }

        let mut thread: mach_port_t = 0;
        let kr = unsafe {
            ffi::thread_create_running(
                self.task,
                flavor,
                state.as_ptr(),
                state.len() as u32,
                &mut thread,
            )
        };
        if kr != KERN_SUCCESS {
            return Err(kern_error(kr, "thread_create_running"));
        }

        debug!(
            func = format_args!("{func:#x}"),
            args = args.len(),
            "issuing remote call"
        );

        // The task stays suspended while attached; let it run just long
        // enough for the stub thread to finish.
        let kr = unsafe { task_resume(self.task) };
        if kr != KERN_SUCCESS {
            unsafe { ffi::thread_terminate(thread) };
            return Err(kern_error(kr, "task_resume"));
        }

        let deadline = Deadline::after(self.timeout);
        let result = loop {
            let done = match self.read_bytes(stack + DONE_SLOT, 8) {
                Ok(done) => done,
                Err(err) => break Err(err),
            };
            if done.len() == 8 && u64::from_le_bytes(done.try_into().expect("8 bytes")) != 0 {
                break self.read_bytes(stack + RESULT_SLOT, 8).and_then(|result| {
                    result
                        .try_into()
                        .map(u64::from_le_bytes)
                        .map_err(|_| Error::os("short read of result slot"))
                });
            }
            if deadline.expired() {
                self.poisoned = true;
                break Err(Error::remote_call_timeout(format!(
                    "target did not return from remote call within {:?}",
                    self.timeout
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        unsafe {
            ffi::thread_terminate(thread);
            mach_port_deallocate(mach_task_self(), thread);
            task_suspend(self.task);
        }
        result
    }
}

fn kern_error(kr: kern_return_t, what: &str) -> Error {
    Error::os(format!("{what} failed: kern_return {kr}"))
}

fn memory_error(addr: u64, kr: kern_return_t) -> Error {
    match kr {
        KERN_INVALID_ADDRESS | KERN_PROTECTION_FAILURE => {
            Error::invalid_remote_address(addr, format!("kern_return {kr}"))
        }
        other => Error::os(format!("target memory access at {addr:#x} failed: kern_return {other}")),
    }
}
