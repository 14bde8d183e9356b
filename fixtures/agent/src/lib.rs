//! Test agent: proves that injected code runs inside the *target*, not the
//! injector.
//!
//! The load-time constructor writes a known literal to the target's stdout;
//! the exported entry writes a stamp file named by an environment variable of
//! the target process. The agent deliberately avoids TLS so the loader can
//! fully unload it on dlclose.

#[cfg(unix)]
const LOAD_MESSAGE: &[u8] = b"Let it be green\n";

#[cfg(unix)]
unsafe extern "C" fn on_load() {
    // Raw fd 1 so the bytes land on the target's stdout exactly once.
    unsafe {
        libc::write(
            1,
            LOAD_MESSAGE.as_ptr() as *const libc::c_void,
            LOAD_MESSAGE.len(),
        );
    }
}

#[cfg(target_os = "linux")]
#[used]
#[unsafe(link_section = ".init_array")]
static ON_LOAD: unsafe extern "C" fn() = on_load;

#[cfg(target_os = "macos")]
#[used]
#[unsafe(link_section = "__DATA,__mod_init_func")]
static ON_LOAD: unsafe extern "C" fn() = on_load;

#[unsafe(no_mangle)]
pub extern "C" fn agent_entry() {
    if let Ok(path) = std::env::var("REMOTE_INJECT_STAMP") {
        if !path.is_empty() {
            let _ = std::fs::write(path, b"ok");
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::ffi::c_void;

    const DLL_PROCESS_ATTACH: u32 = 1;

    #[unsafe(no_mangle)]
    #[allow(non_snake_case)]
    extern "system" fn DllMain(_module: *mut c_void, reason: u32, _reserved: *mut c_void) -> i32 {
        if reason == DLL_PROCESS_ATTACH {
            use std::io::Write;
            let _ = std::io::stdout().write_all(b"Let it be green\n");
            let _ = std::io::stdout().flush();
        }
        1
    }
}
