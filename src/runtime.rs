//! # Runtime Module
//!
//! The process wide state of coreinject and the C interface other modules call into.
//!
//! There is one [`Runtime`] per process. It is created by [`attach`] when the runtime module
//! is loaded into the host, and dropped by [`detach`] when it is unloaded. All state lives in a
//! single lock, and no plugin is ever called while that lock is held: plugins may call
//! [`Broadcastmessage`] from inside any of their callbacks.
//!
//! ## Exports
//!
//! | Symbol                 | Signature                                  |
//! |------------------------|--------------------------------------------|
//! | `Broadcastmessage`     | `fn(data: *const c_void, len: u32) -> bool`|
//! | `onInitializationdone` | `fn()`                                     |

use std::ffi::c_void;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info};

use crate::addr::Addr;
use crate::bootstrap::{retrigger_tls, Bootstrapper, Phase};
use crate::config::Config;
use crate::errors::{InjectError, Result};
use crate::image::ImageView;
use crate::plugins::loader::{DirectorySource, PluginSource};
use crate::plugins::{self, Plugin, PluginRegistry};

static RUNTIME: Mutex<Option<Runtime>> = Mutex::new(None);

/// Everything coreinject keeps for the lifetime of the host
#[derive(Debug)]
pub struct Runtime {
    config: Config,
    bootstrap: Bootstrapper,
    registry: PluginRegistry,
}

impl Runtime {
    fn new(config: Config) -> Self {
        Self {
            bootstrap: Bootstrapper::new(config.retrigger_tls),
            registry: PluginRegistry::new(),
            config,
        }
    }
}

fn lock() -> Result<MutexGuard<'static, Option<Runtime>>> {
    RUNTIME.lock().map_err(|_| InjectError::Poisoned("runtime"))
}

fn with_runtime<R>(f: impl FnOnce(&mut Runtime) -> Result<R>) -> Result<R> {
    let mut guard = lock()?;
    let runtime = guard.as_mut().ok_or(InjectError::NotAttached)?;
    f(runtime)
}

/// Creates the runtime of this process
pub fn attach(config: Config) -> Result<()> {
    let mut guard = lock()?;
    if guard.is_some() {
        return Err(InjectError::AlreadyAttached);
    }
    debug!("attaching with {config:?}");
    *guard = Some(Runtime::new(config));
    Ok(())
}

/// Hooks the entry point of `image` so that it lands in `dispatch`
///
/// # Errors
///
/// * [`InjectError::NotAttached`] without a runtime
/// * errors of [`Bootstrapper::install`]
///
/// # Safety
///
/// See [`Bootstrapper::install`].
pub unsafe fn install(image: &ImageView, dispatch: Addr) -> Result<()> {
    with_runtime(|rt| rt.bootstrap.install(image, dispatch))
}

/// Drops the runtime, undoing a bootstrap that never fired
///
/// Loaded plugin modules stay loaded. Does nothing if no runtime exists.
pub fn detach() -> Result<()> {
    let Some(mut runtime) = lock()?.take() else {
        return Ok(());
    };
    runtime.bootstrap.teardown()?;
    debug!("detached, {} plugins stay loaded", runtime.registry.len());
    Ok(())
}

/// Loads and starts the plugins from the configured directory and restores the host
///
/// Returns the entry point the host continues at.
pub fn fire() -> Result<Addr> {
    let mut source = with_runtime(|rt| {
        Ok(DirectorySource::new(
            rt.config.plugin_dir.clone(),
            rt.config.plugin_extension.clone(),
        ))
    })?;
    fire_with(&mut source)
}

/// Loads and starts the plugins of `source` and restores the host
///
/// The plugins are registered and their `onStartup` runs with `hot_reload == false` while
/// the entry point is still hooked. Only then the entry point and the TLS callback are
/// restored. A second call fails with [`InjectError::AlreadyFired`] and loads nothing.
///
/// # Errors
///
/// * [`InjectError::NotAttached`] without a runtime
/// * errors of [`Bootstrapper::begin_fire`] and [`Bootstrapper::restore`]
pub fn fire_with(source: &mut dyn PluginSource) -> Result<Addr> {
    with_runtime(|rt| rt.bootstrap.begin_fire())?;

    let loaded = source.load_plugins();
    let fresh: Vec<Arc<Plugin>> =
        with_runtime(|rt| Ok(loaded.into_iter().map(|p| rt.registry.register(p)).collect()))?;
    info!("starting {} plugins", fresh.len());
    plugins::notify_startup(&fresh, false);

    let (entry, retrigger) = with_runtime(|rt| {
        let retrigger = rt.bootstrap.needs_tls_retrigger();
        Ok((rt.bootstrap.restore()?, retrigger))
    })?;
    if retrigger {
        retrigger_tls()?;
    }
    Ok(entry)
}

/// Called by the dispatch routine in place of the host entry point
///
/// Returns the address to continue at. If firing failed, the host image is restored as far
/// as possible; without an entry point to continue at the process is aborted.
pub extern "C" fn fire_from_dispatch() -> usize {
    match fire() {
        Ok(entry) => entry.usize(),
        Err(e) => {
            error!("bootstrap failed: {e}");
            let entry = with_runtime(|rt| {
                rt.bootstrap.teardown()?;
                Ok(rt.bootstrap.entry_point())
            });
            match entry {
                Ok(Some(entry)) => entry.usize(),
                Ok(None) | Err(_) => {
                    error!("no entry point to continue at, aborting");
                    std::process::abort()
                }
            }
        }
    }
}

/// The bootstrap phase, if a runtime exists
pub fn phase() -> Option<Phase> {
    lock().ok()?.as_ref().map(|rt| rt.bootstrap.phase())
}

/// Adds a plugin that is linked into this process
pub fn register(plugin: Plugin) -> Result<()> {
    with_runtime(|rt| {
        rt.registry.register(plugin);
        Ok(())
    })
}

/// Names of all registered plugins, in load order
pub fn plugin_names() -> Result<Vec<String>> {
    with_runtime(|rt| Ok(rt.registry.names()))
}

fn snapshot() -> Vec<Arc<Plugin>> {
    with_runtime(|rt| Ok(rt.registry.snapshot())).unwrap_or_default()
}

/// Delivers `payload` to the plugins until one consumes it
///
/// Without a runtime nobody consumes the message.
pub fn broadcast(payload: &[u8]) -> bool {
    plugins::broadcast(&snapshot(), payload)
}

/// Tells every plugin that the host finished its initialization
pub fn initialization_done() {
    let current = snapshot();
    debug!("host initialized, notifying {} plugins", current.len());
    plugins::notify_initialized(&current, false);
}

/// Hot reloads the plugin called `name` with `fresh`
///
/// # Errors
///
/// * [`InjectError::NotAttached`] without a runtime
/// * [`InjectError::UnknownPlugin`] if no plugin is called `name`
pub fn reload(name: &str, fresh: Plugin) -> Result<()> {
    let (previous, fresh) = with_runtime(|rt| rt.registry.replace(name, fresh))?;
    plugins::notify_reload(&previous, &fresh);
    Ok(())
}

/// Broadcasts a message to the plugins, returns whether one consumed it
///
/// # Safety
///
/// `data` must be null or point to `len` readable bytes.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "C" fn Broadcastmessage(data: *const c_void, len: u32) -> bool {
    if data.is_null() {
        return broadcast(&[]);
    }
    broadcast(std::slice::from_raw_parts(data.cast::<u8>(), len as usize))
}

/// Tells the plugins that the host finished its initialization
#[no_mangle]
#[allow(non_snake_case)]
pub extern "C" fn onInitializationdone() {
    initialization_done();
}
