//! Windows engine: remote threads.
//!
//! No register juggling here: `CreateRemoteThread` runs the desired function
//! with a single pointer argument and the thread exit code is the return
//! value. `kernel32` is mapped at the same base in every process of a boot
//! session, so the injector's own `LoadLibraryW`/`FreeLibrary` addresses are
//! valid in the target. The exit code truncates the returned HMODULE to 32
//! bits, so after a successful load the real module base is re-derived from
//! the target's module list.
//!
//! There is no `dlsym`-equivalent exposed here; symbol calls are a Unix-only
//! part of the contract.

use std::ffi::c_void;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

use tracing::debug;
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER, GetLastError, HANDLE, HMODULE,
    MAX_PATH, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE, VirtualAllocEx, VirtualFreeEx,
};
use windows_sys::Win32::System::ProcessStatus::{
    K32EnumProcessModulesEx, K32GetModuleFileNameExW, LIST_MODULES_ALL,
};
use windows_sys::Win32::System::Threading::{
    CreateRemoteThread, GetExitCodeThread, OpenProcess, PROCESS_CREATE_THREAD,
    PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION, PROCESS_VM_READ, PROCESS_VM_WRITE,
    WaitForSingleObject,
};

use crate::backend::{Controller, LoaderSymbols};
use crate::{Error, Process, Result};

pub(super) fn open(process: Process, remote_call_timeout: Duration) -> Result<Box<dyn Controller>> {
    WindowsController::attach(process, remote_call_timeout)
        .map(|controller| Box::new(controller) as Box<dyn Controller>)
}

struct WindowsController {
    handle: HANDLE,
    pid: i32,
    timeout: Duration,
}

impl WindowsController {
    fn attach(process: Process, timeout: Duration) -> Result<Self> {
        let pid = process.pid();
        let access = PROCESS_CREATE_THREAD
            | PROCESS_QUERY_INFORMATION
            | PROCESS_VM_OPERATION
            | PROCESS_VM_WRITE
            | PROCESS_VM_READ;
        let handle = unsafe { OpenProcess(access, 0, pid as u32) };
        if handle.is_null() {
            let err = unsafe { GetLastError() };
            return Err(match err {
                ERROR_ACCESS_DENIED => Error::permission_denied(format!(
                    "OpenProcess({pid}) denied; injection needs an elevated or same-user token"
                )),
                ERROR_INVALID_PARAMETER => Error::process_not_found(pid),
                other => Error::os(format!("OpenProcess({pid}) failed: error {other}")),
            });
        }

        debug!(pid, "attached to target process");
        Ok(Self {
            handle,
            pid,
            timeout,
        })
    }

    fn module_by_path(&self, path: &Path) -> Result<Option<u64>> {
        let wanted = match path.file_name() {
            Some(name) => name.to_string_lossy().to_lowercase(),
            None => return Ok(None),
        };

        let mut modules = [std::ptr::null_mut::<c_void>() as HMODULE; 1024];
        let mut needed: u32 = 0;
        let ok = unsafe {
            K32EnumProcessModulesEx(
                self.handle,
                modules.as_mut_ptr(),
                std::mem::size_of_val(&modules) as u32,
                &mut needed,
                LIST_MODULES_ALL,
            )
        };
        if ok == 0 {
            return Err(Error::os(format!(
                "EnumProcessModules failed: error {}",
                unsafe { GetLastError() }
            )));
        }

        let count = (needed as usize / std::mem::size_of::<HMODULE>()).min(modules.len());
        for &module in &modules[..count] {
            let mut name = [0u16; MAX_PATH as usize];
            let len = unsafe {
                K32GetModuleFileNameExW(self.handle, module, name.as_mut_ptr(), name.len() as u32)
            };
            if len == 0 {
                continue;
            }
            let name = String::from_utf16_lossy(&name[..len as usize]).to_lowercase();
            if name.rsplit(['\\', '/']).next() == Some(wanted.as_str()) {
                return Ok(Some(module as u64));
            }
        }
        Ok(None)
    }
}

impl Controller for WindowsController {
    fn read_bytes(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; len];
        let mut read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                self.handle,
                addr as *const c_void,
                data.as_mut_ptr() as *mut c_void,
                len,
                &mut read,
            )
        };
        if ok == 0 {
            return Err(Error::invalid_remote_address(addr, format!(
                "ReadProcessMemory failed: error {}",
                unsafe { GetLastError() }
            )));
        }
        data.truncate(read);
        Ok(data)
    }

    fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let mut written = 0usize;
        let ok = unsafe {
            WriteProcessMemory(
                self.handle,
                addr as *const c_void,
                data.as_ptr() as *const c_void,
                data.len(),
                &mut written,
            )
        };
        if ok == 0 || written != data.len() {
            return Err(Error::invalid_remote_address(addr, format!(
                "WriteProcessMemory failed: error {}",
                unsafe { GetLastError() }
            )));
        }
        Ok(())
    }

    fn allocate_scratch(&mut self, len: usize) -> Result<u64> {
        let addr = unsafe {
            VirtualAllocEx(
                self.handle,
                std::ptr::null(),
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
        };
        if addr.is_null() {
            return Err(Error::os(format!(
                "VirtualAllocEx failed: error {}",
                unsafe { GetLastError() }
            )));
        }
        debug!(addr = format_args!("{:#x}", addr as u64), len, "allocated scratch in target");
        Ok(addr as u64)
    }

    fn free_scratch(&mut self, addr: u64, _len: usize) -> Result<()> {
        // MEM_RELEASE frees the whole allocation; the size must be zero.
        let ok = unsafe { VirtualFreeEx(self.handle, addr as *mut c_void, 0, MEM_RELEASE) };
        if ok == 0 {
            return Err(Error::os(format!(
                "VirtualFreeEx failed: error {}",
                unsafe { GetLastError() }
            )));
        }
        Ok(())
    }

    fn remote_call(&mut self, func: u64, args: &[u64]) -> Result<u64> {
        if args.len() > 1 {
            return Err(Error::invalid_input(
                "remote threads take at most one pointer argument",
            ));
        }
        let parameter = args.first().copied().unwrap_or(0) as *mut c_void;

        let start = unsafe {
            std::mem::transmute::<usize, unsafe extern "system" fn(*mut c_void) -> u32>(
                func as usize,
            )
        };
        let thread = unsafe {
            CreateRemoteThread(
                self.handle,
                std::ptr::null(),
                0,
                Some(start),
                parameter,
                0,
                std::ptr::null_mut(),
            )
        };
        if thread.is_null() {
            return Err(Error::os(format!(
                "CreateRemoteThread failed: error {}",
                unsafe { GetLastError() }
            )));
        }

        debug!(func = format_args!("{func:#x}"), "issuing remote call");
        let timeout_ms = self.timeout.as_millis().min(u32::MAX as u128) as u32;
        let wait = unsafe { WaitForSingleObject(thread, timeout_ms) };
        let result = match wait {
            WAIT_OBJECT_0 => {
                let mut exit_code: u32 = 0;
                let ok = unsafe { GetExitCodeThread(thread, &mut exit_code) };
                if ok == 0 {
                    Err(Error::os(format!(
                        "GetExitCodeThread failed: error {}",
                        unsafe { GetLastError() }
                    )))
                } else {
                    Ok(exit_code as u64)
                }
            }
            WAIT_TIMEOUT => Err(Error::remote_call_timeout(format!(
                "remote thread did not finish within {:?}",
                self.timeout
            ))),
            _ => Err(Error::os(format!(
                "WaitForSingleObject failed: error {}",
                unsafe { GetLastError() }
            ))),
        };

        unsafe { CloseHandle(thread) };
        result
    }

    fn loader(&mut self) -> Result<LoaderSymbols> {
        // kernel32 shares one base across processes; our addresses hold in
        // the target.
        let kernel32: Vec<u16> = "kernel32.dll\0".encode_utf16().collect();
        let module = unsafe { GetModuleHandleW(kernel32.as_ptr()) };
        if module.is_null() {
            return Err(Error::loader_not_found("kernel32.dll is not mapped"));
        }

        let proc = |name: &[u8]| -> Option<u64> {
            let addr = unsafe { GetProcAddress(module, name.as_ptr()) };
            addr.map(|f| f as usize as u64)
        };

        let (Some(open), Some(close)) = (proc(b"LoadLibraryW\0"), proc(b"FreeLibrary\0")) else {
            return Err(Error::loader_not_found(
                "LoadLibraryW/FreeLibrary not exported by kernel32",
            ));
        };

        Ok(LoaderSymbols {
            open,
            close,
            resolve: None,
            error: None,
            open_flags: None,
            close_ok_is_zero: false,
        })
    }

    fn encode_library_path(&self, path: &Path) -> Result<Vec<u8>> {
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
        if wide[..wide.len() - 1].contains(&0) {
            return Err(Error::invalid_input("library path contains NUL"));
        }
        let mut bytes = Vec::with_capacity(wide.len() * 2);
        for unit in wide {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        Ok(bytes)
    }

    fn normalize_module_handle(&mut self, raw: u64, path: &Path) -> Result<u64> {
        // The thread exit code truncated the HMODULE; prefer the real base.
        match self.module_by_path(path)? {
            Some(module) => Ok(module),
            None => Ok(raw),
        }
    }

    fn detach(&mut self) -> Result<()> {
        let ok = unsafe { CloseHandle(self.handle) };
        debug!(pid = self.pid, "detached from target process");
        if ok == 0 {
            return Err(Error::os(format!(
                "CloseHandle failed: error {}",
                unsafe { GetLastError() }
            )));
        }
        Ok(())
    }
}
