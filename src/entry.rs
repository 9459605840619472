//! # Windows Entry
//!
//! `DllMain` of the runtime module and the routine the host entry point is redirected to.
//!
//! On process attach the config is read, the logger is set up, and the entry point of the
//! host executable is hooked to `coreinject_dispatch`. The dispatch routine saves the
//! argument registers, calls [`fire_from_dispatch`], restores the registers and the stack
//! pointer, and jumps to the returned address. The host entry point therefore starts with
//! exactly the stack and registers it would have started with.

use std::ffi::c_void;
use std::path::Path;

use tracing::{error, warn};
use windows_sys::Win32::Foundation::{BOOL, HINSTANCE, TRUE};
use windows_sys::Win32::System::LibraryLoader::DisableThreadLibraryCalls;
use windows_sys::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

use crate::addr::Addr;
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::errors::{InjectError, Result};
use crate::image::ImageView;
use crate::logging::setup_logger;
use crate::runtime::{self, fire_from_dispatch};

// rsp is 8 off a 16 byte boundary on entry, 4 pushes keep it that way and the 40 bytes of
// shadow space and padding align it for the call
#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".globl coreinject_dispatch",
    "coreinject_dispatch:",
    "push rcx",
    "push rdx",
    "push r8",
    "push r9",
    "sub rsp, 40",
    "call {fire}",
    "add rsp, 40",
    "pop r9",
    "pop r8",
    "pop rdx",
    "pop rcx",
    "jmp rax",
    fire = sym fire_from_dispatch,
);

#[cfg(target_arch = "x86")]
std::arch::global_asm!(
    ".globl _coreinject_dispatch",
    "_coreinject_dispatch:",
    "call {fire}",
    "jmp eax",
    fire = sym fire_from_dispatch,
);

extern "C" {
    fn coreinject_dispatch();
}

/// Address of the routine the host entry point is redirected to
pub fn dispatch_address() -> Addr {
    Addr::from(coreinject_dispatch as usize)
}

/// Stops the thread attach and detach notifications for `module`
fn disable_thread_notifications(module: HINSTANCE) -> Result<()> {
    // SAFETY: only changes the loader bookkeeping of the module
    if unsafe { DisableThreadLibraryCalls(module) } == 0 {
        return Err(InjectError::last_os_error("DisableThreadLibraryCalls"));
    }
    Ok(())
}

fn attach_host() -> Result<()> {
    let (config, config_err) = match Config::load(Path::new(DEFAULT_CONFIG_PATH)) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    if let Err(e) = setup_logger(&config) {
        eprintln!("coreinject: {e}");
    }
    if let Some(e) = config_err {
        warn!("could not read {DEFAULT_CONFIG_PATH}, using defaults: {e}");
    }

    runtime::attach(config)?;
    let image = ImageView::host()?;
    // SAFETY: DllMain of a module loaded before the host entry point ran
    unsafe { runtime::install(&image, dispatch_address()) }
}

#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn DllMain(module: HINSTANCE, reason: u32, _reserved: *mut c_void) -> BOOL {
    match reason {
        DLL_PROCESS_ATTACH => {
            if let Err(e) = disable_thread_notifications(module) {
                warn!("thread notifications stay enabled: {e}");
            }
            if let Err(e) = attach_host() {
                error!("could not attach to the host: {e}");
            }
        }
        DLL_PROCESS_DETACH => {
            if let Err(e) = runtime::detach() {
                error!("could not detach from the host: {e}");
            }
        }
        _ => (),
    }
    TRUE
}
