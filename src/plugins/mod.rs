//! # Plugin System
//!
//! Tracks the plugin modules loaded into the host and delivers lifecycle and message events
//! to them.
//!
//! A plugin is a dynamic module that exports any subset of four C entry points:
//!
//! | Export          | Signature                              | Called                            |
//! |-----------------|----------------------------------------|-----------------------------------|
//! | `onStartup`     | `fn(hot_reload: bool)`                 | after loading, before the host runs |
//! | `onInitialized` | `fn(hot_reload: bool)`                 | when the host reports it is ready |
//! | `onReload`      | `fn(previous: *mut c_void)`            | on the fresh module of a hot reload |
//! | `onMessage`     | `fn(data: *const c_void, len: u32) -> bool` | for every broadcast message   |
//!
//! `onEvent` is accepted as an alias of `onMessage`.
//!
//! The [`PluginRegistry`] only ever grows. A hot reload replaces a plugin in place, but the
//! previous module stays loaded because the fresh module may still refer to it.
//!
//! Callbacks are made on a snapshot of the registry (see [`PluginRegistry::snapshot`]), so a
//! plugin that broadcasts from inside a callback does not need the registry to be unlocked.

use std::ffi::c_void;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::errors::{InjectError, Result};

pub mod loader;

/// `onStartup` and `onInitialized`
pub type LifecycleFn = extern "C" fn(hot_reload: bool);
/// `onReload`
pub type ReloadFn = extern "C" fn(previous: *mut c_void);
/// `onMessage` or `onEvent`
pub type MessageFn = extern "C" fn(data: *const c_void, len: u32) -> bool;

/// The exports a plugin provides, each one optional
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryPoints {
    pub on_startup: Option<LifecycleFn>,
    pub on_initialized: Option<LifecycleFn>,
    pub on_reload: Option<ReloadFn>,
    pub on_message: Option<MessageFn>,
}

/// Handle of a loaded plugin module
///
/// Plugin modules are never unloaded, the handle stays valid for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(NonNull<c_void>);

// module handles are process wide and usable from any thread
unsafe impl Send for ModuleHandle {}
unsafe impl Sync for ModuleHandle {}

impl ModuleHandle {
    pub(crate) fn new(raw: *mut c_void) -> Option<Self> {
        NonNull::new(raw).map(Self)
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// A loaded plugin
#[derive(Debug)]
pub struct Plugin {
    name: String,
    path: Option<PathBuf>,
    module: Option<ModuleHandle>,
    entry: EntryPoints,
}

impl Plugin {
    /// Creates a plugin from entry points linked into this process
    pub fn from_entry_points(name: impl Into<String>, entry: EntryPoints) -> Self {
        Self {
            name: name.into(),
            path: None,
            module: None,
            entry,
        }
    }

    pub(crate) fn from_module(path: &Path, module: ModuleHandle, entry: EntryPoints) -> Self {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            name,
            path: Some(path.to_path_buf()),
            module: Some(module),
            entry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn module(&self) -> Option<ModuleHandle> {
        self.module
    }

    pub fn entry_points(&self) -> &EntryPoints {
        &self.entry
    }

    pub fn on_startup(&self, hot_reload: bool) {
        if let Some(f) = self.entry.on_startup {
            trace!("{}: onStartup({hot_reload})", self.name);
            f(hot_reload);
        }
    }

    pub fn on_initialized(&self, hot_reload: bool) {
        if let Some(f) = self.entry.on_initialized {
            trace!("{}: onInitialized({hot_reload})", self.name);
            f(hot_reload);
        }
    }

    pub fn on_reload(&self, previous: Option<ModuleHandle>) {
        if let Some(f) = self.entry.on_reload {
            let raw = previous.map_or(std::ptr::null_mut(), |m| m.as_raw());
            trace!("{}: onReload({raw:?})", self.name);
            f(raw);
        }
    }

    /// Hands `payload` to the message handler, returns whether the plugin consumed it
    pub fn on_message(&self, payload: &[u8]) -> bool {
        let Some(f) = self.entry.on_message else {
            return false;
        };
        let Ok(len) = u32::try_from(payload.len()) else {
            warn!("message of {} bytes is too large for {}", payload.len(), self.name);
            return false;
        };
        f(payload.as_ptr().cast(), len)
    }
}

/// Delivers `payload` to the plugins in order, stops at the first one that consumes it
///
/// Returns whether any plugin consumed the message.
pub fn broadcast(plugins: &[Arc<Plugin>], payload: &[u8]) -> bool {
    for plugin in plugins {
        if plugin.on_message(payload) {
            trace!("message of {} bytes consumed by {}", payload.len(), plugin.name());
            return true;
        }
    }
    false
}

/// Calls `onStartup` of every plugin
pub fn notify_startup(plugins: &[Arc<Plugin>], hot_reload: bool) {
    plugins.iter().for_each(|p| p.on_startup(hot_reload));
}

/// Calls `onInitialized` of every plugin
pub fn notify_initialized(plugins: &[Arc<Plugin>], hot_reload: bool) {
    plugins.iter().for_each(|p| p.on_initialized(hot_reload));
}

/// Runs the callbacks of a hot reload on the fresh plugin
///
/// `onReload` receives the module of the replaced plugin, then the fresh plugin is started
/// and initialized as a hot reload.
pub fn notify_reload(previous: &Plugin, fresh: &Plugin) {
    fresh.on_reload(previous.module());
    fresh.on_startup(true);
    fresh.on_initialized(true);
}

/// The loaded plugins, in load order
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a plugin
    pub fn register(&mut self, plugin: Plugin) -> Arc<Plugin> {
        info!("registered plugin {}", plugin.name());
        let plugin = Arc::new(plugin);
        self.plugins.push(plugin.clone());
        plugin
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Plugin>> {
        self.plugins.iter().find(|p| p.name() == name).cloned()
    }

    /// A copy of the plugin list to call into without holding on to the registry
    pub fn snapshot(&self) -> Vec<Arc<Plugin>> {
        self.plugins.clone()
    }

    /// See [`broadcast`]
    pub fn broadcast(&self, payload: &[u8]) -> bool {
        broadcast(&self.plugins, payload)
    }

    /// See [`notify_startup`]
    pub fn notify_startup(&self, hot_reload: bool) {
        notify_startup(&self.plugins, hot_reload);
    }

    /// See [`notify_initialized`]
    pub fn notify_initialized(&self, hot_reload: bool) {
        notify_initialized(&self.plugins, hot_reload);
    }

    /// Replaces the plugin called `name` in place without calling into either plugin
    ///
    /// Returns the replaced and the fresh plugin.
    pub fn replace(&mut self, name: &str, fresh: Plugin) -> Result<(Arc<Plugin>, Arc<Plugin>)> {
        let slot = self
            .plugins
            .iter_mut()
            .find(|p| p.name() == name)
            .ok_or_else(|| InjectError::UnknownPlugin(name.to_string()))?;
        let fresh = Arc::new(fresh);
        let previous = std::mem::replace(slot, fresh.clone());
        debug!("replaced plugin {name} with {}", fresh.name());
        Ok((previous, fresh))
    }

    /// Hot reloads the plugin called `name`
    ///
    /// The plugin is replaced in place, then [`notify_reload`] runs on the fresh plugin.
    pub fn reload(&mut self, name: &str, fresh: Plugin) -> Result<Arc<Plugin>> {
        let (previous, fresh) = self.replace(name, fresh)?;
        notify_reload(&previous, &fresh);
        Ok(fresh)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    // the test plugins share statics, run the tests that use them one at a time
    static SERIAL: Mutex<()> = Mutex::new(());

    static CALLS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static LAST_LEN: AtomicUsize = AtomicUsize::new(0);
    static RELOADED_WITH: AtomicUsize = AtomicUsize::new(0);

    fn record(call: &'static str) {
        CALLS.lock().unwrap().push(call);
    }

    fn take_calls() -> Vec<&'static str> {
        std::mem::take(&mut *CALLS.lock().unwrap())
    }

    extern "C" fn first_message(_data: *const c_void, len: u32) -> bool {
        record("first");
        LAST_LEN.store(len as usize, Ordering::SeqCst);
        false
    }

    extern "C" fn second_message(_data: *const c_void, _len: u32) -> bool {
        record("second");
        true
    }

    extern "C" fn third_message(_data: *const c_void, _len: u32) -> bool {
        record("third");
        true
    }

    extern "C" fn startup(hot_reload: bool) {
        record(if hot_reload { "startup hot" } else { "startup" });
    }

    extern "C" fn initialized(hot_reload: bool) {
        record(if hot_reload { "initialized hot" } else { "initialized" });
    }

    extern "C" fn reload(previous: *mut c_void) {
        record("reload");
        RELOADED_WITH.store(previous as usize, Ordering::SeqCst);
    }

    fn messenger(name: &str, on_message: MessageFn) -> Plugin {
        Plugin::from_entry_points(
            name,
            EntryPoints {
                on_message: Some(on_message),
                ..Default::default()
            },
        )
    }

    fn lifecycle(name: &str) -> Plugin {
        Plugin::from_entry_points(
            name,
            EntryPoints {
                on_startup: Some(startup),
                on_initialized: Some(initialized),
                on_reload: Some(reload),
                on_message: None,
            },
        )
    }

    #[test]
    fn test_broadcast_stops_at_first_consumer() {
        let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        take_calls();

        let mut registry = PluginRegistry::new();
        registry.register(messenger("a", first_message));
        registry.register(messenger("b", second_message));
        registry.register(messenger("c", third_message));

        assert!(registry.broadcast(b"hello"));
        assert_eq!(take_calls(), vec!["first", "second"]);
        assert_eq!(LAST_LEN.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_broadcast_without_consumer() {
        let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        take_calls();

        let mut registry = PluginRegistry::new();
        registry.register(lifecycle("quiet"));
        registry.register(messenger("a", first_message));
        assert!(!registry.broadcast(&[]));
        assert_eq!(take_calls(), vec!["first"]);
        assert!(!PluginRegistry::new().broadcast(b"x"));
    }

    #[test]
    fn test_notify_reaches_every_plugin() {
        let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        take_calls();

        let mut registry = PluginRegistry::new();
        registry.register(lifecycle("one"));
        registry.register(messenger("no lifecycle", first_message));
        registry.register(lifecycle("two"));

        registry.notify_startup(false);
        registry.notify_initialized(false);
        assert_eq!(
            take_calls(),
            vec!["startup", "startup", "initialized", "initialized"]
        );
    }

    #[test]
    fn test_reload_passes_previous_module() {
        let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        take_calls();

        let previous = ModuleHandle::new(0x7000_0000usize as *mut c_void).unwrap();
        let mut registry = PluginRegistry::new();
        registry.register(Plugin::from_module(
            Path::new("/plugins/game.ci64"),
            previous,
            EntryPoints::default(),
        ));
        registry.register(lifecycle("other"));
        assert_eq!(registry.names(), vec!["game", "other"]);

        let fresh = registry.reload("game", lifecycle("game")).unwrap();
        assert_eq!(RELOADED_WITH.load(Ordering::SeqCst), 0x7000_0000);
        assert_eq!(
            take_calls(),
            vec!["reload", "startup hot", "initialized hot"]
        );
        assert_eq!(registry.len(), 2);
        assert!(Arc::ptr_eq(&registry.get("game").unwrap(), &fresh));
        assert_eq!(registry.names(), vec!["game", "other"]);
    }

    #[test]
    fn test_reload_unknown_plugin() {
        let mut registry = PluginRegistry::new();
        assert!(matches!(
            registry.reload("missing", Plugin::from_entry_points("missing", EntryPoints::default())),
            Err(InjectError::UnknownPlugin(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut registry = PluginRegistry::new();
        registry.register(Plugin::from_entry_points("a", EntryPoints::default()));
        let snapshot = registry.snapshot();
        registry.register(Plugin::from_entry_points("b", EntryPoints::default()));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 2);
    }
}
