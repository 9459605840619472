//! Discovery and dynamic loading of plugin modules.

use std::ffi::{c_void, CStr};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use super::{EntryPoints, LifecycleFn, MessageFn, Plugin, ReloadFn};
use crate::errors::{InjectError, Result};

/// File extension of plugin modules built for this architecture
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_EXTENSION: &str = ".ci64";
/// File extension of plugin modules built for this architecture
#[cfg(target_pointer_width = "32")]
pub const DEFAULT_EXTENSION: &str = ".ci32";

/// Something that produces the plugins to load at startup
pub trait PluginSource {
    /// Loads all plugins this source knows about
    ///
    /// Plugins that fail to load are logged and skipped.
    fn load_plugins(&mut self) -> Vec<Plugin>;
}

impl PluginSource for Vec<Plugin> {
    fn load_plugins(&mut self) -> Vec<Plugin> {
        std::mem::take(self)
    }
}

/// Loads every module with a given extension from one directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySource {
    pub dir: PathBuf,
    pub extension: String,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }
}

impl PluginSource for DirectorySource {
    fn load_plugins(&mut self) -> Vec<Plugin> {
        discover(&self.dir, &self.extension)
            .into_iter()
            .filter_map(|path| match load(&path) {
                Ok(plugin) => {
                    info!("loaded plugin {} from {}", plugin.name(), path.display());
                    Some(plugin)
                }
                Err(e) => {
                    error!("{e}");
                    None
                }
            })
            .collect()
    }
}

/// Lists the regular files directly inside `dir` whose name ends with `extension`, sorted
///
/// A missing or unreadable directory is logged and yields no files.
pub fn discover(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("no plugins loaded, cannot read {}: {e}", dir.display());
            return Vec::new();
        }
    };

    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().ends_with(extension))
        })
        .collect();
    found.sort();
    debug!("found {} plugin modules in {}", found.len(), dir.display());
    found
}

/// Loads the module at `path` and resolves its entry points
pub fn load(path: &Path) -> Result<Plugin> {
    let module = sys::open(path).map_err(|reason| InjectError::PluginLoad {
        path: path.to_path_buf(),
        reason,
    })?;

    // SAFETY: the exports of a plugin module have the documented signatures
    let entry = unsafe { resolve_entry_points(|name| sys::symbol(module, name)) };
    debug!("entry points of {}: {entry:?}", path.display());
    Ok(Plugin::from_module(path, module, entry))
}

/// Looks up the entry points of a module, `onEvent` standing in for a missing `onMessage`
///
/// # Safety
///
/// Every address `lookup` returns must be a function with the signature of its export.
unsafe fn resolve_entry_points(lookup: impl Fn(&CStr) -> Option<*mut c_void>) -> EntryPoints {
    EntryPoints {
        on_startup: resolve::<LifecycleFn>(&lookup, c"onStartup"),
        on_initialized: resolve::<LifecycleFn>(&lookup, c"onInitialized"),
        on_reload: resolve::<ReloadFn>(&lookup, c"onReload"),
        on_message: resolve::<MessageFn>(&lookup, c"onMessage")
            .or_else(|| resolve::<MessageFn>(&lookup, c"onEvent")),
    }
}

unsafe fn resolve<F: Copy>(
    lookup: impl Fn(&CStr) -> Option<*mut c_void>,
    name: &CStr,
) -> Option<F> {
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*mut c_void>());
    let symbol = lookup(name)?;
    Some(std::mem::transmute_copy::<*mut c_void, F>(&symbol))
}

#[cfg(target_os = "linux")]
mod sys {
    use std::ffi::{c_void, CStr, CString};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use nix::libc;

    use crate::plugins::ModuleHandle;

    fn last_error() -> String {
        // SAFETY: dlerror returns null or a valid C string owned by libc
        let err = unsafe { libc::dlerror() };
        if err.is_null() {
            return "unknown dynamic loader error".to_string();
        }
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }

    pub(super) fn open(path: &Path) -> Result<ModuleHandle, String> {
        let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|e| e.to_string())?;
        // SAFETY: cpath is a valid C string, the module is never closed
        let raw = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        ModuleHandle::new(raw).ok_or_else(last_error)
    }

    pub(super) fn symbol(module: ModuleHandle, name: &CStr) -> Option<*mut c_void> {
        // SAFETY: module came from dlopen and is never closed
        let symbol = unsafe { libc::dlsym(module.as_raw(), name.as_ptr()) };
        (!symbol.is_null()).then_some(symbol)
    }
}

#[cfg(windows)]
mod sys {
    use std::ffi::{c_void, CStr};
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;

    use windows_sys::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};

    use crate::plugins::ModuleHandle;

    pub(super) fn open(path: &Path) -> Result<ModuleHandle, String> {
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
        // SAFETY: wide is null terminated, the module is never freed
        let raw = unsafe { LoadLibraryW(wide.as_ptr()) };
        ModuleHandle::new(raw).ok_or_else(|| std::io::Error::last_os_error().to_string())
    }

    pub(super) fn symbol(module: ModuleHandle, name: &CStr) -> Option<*mut c_void> {
        // SAFETY: module came from LoadLibraryW and is never freed
        let f = unsafe { GetProcAddress(module.as_raw(), name.as_ptr().cast()) }?;
        Some(f as *mut c_void)
    }
}
