//! # Bootstrap Module
//!
//! Gets control of the host executable before its own code runs, loads the plugins, and then
//! gives control back as if nothing had happened.
//!
//! The runtime is loaded into the host before the host's entry point was executed. At that
//! point two pieces of host code are still pending: the TLS callback of the executable, which
//! the platform calls for every new thread, and the entry point. [`Bootstrapper::install`]
//! neutralizes both:
//!
//! 1. The first TLS callback pointer is saved and zeroed, so no host code runs early.
//! 2. A [`StompHook`] redirects the entry point to a dispatch routine.
//!
//! When the host reaches its entry point, the dispatch routine fires the bootstrap through
//! [`crate::runtime::fire_with`]: plugins are loaded and started while the hook is still in
//! place, then the entry point and the TLS callback are restored and the dispatch routine
//! continues at the original entry.
//!
//! ```text
//! Unattached --install--> Installed --begin_fire--> Fired --restore--> Restored
//! ```
//!
//! The bootstrap fires at most once. Plugin startup always happens before the entry point
//! is restored.

use std::fmt::Display;
use std::mem::size_of;

use tracing::{debug, error, info, trace, warn};

use crate::addr::Addr;
use crate::errors::{InjectError, Result};
use crate::image::ImageView;
use crate::patch::patch_bytes;
use crate::stomp::StompHook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Nothing is hooked
    Unattached,
    /// The entry point is hooked and the TLS callback is disabled
    Installed,
    /// The hook was reached, plugins are being loaded
    Fired,
    /// The entry point and the TLS callback are back to their original state
    Restored,
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The state of the entry point and TLS takeover
#[derive(Debug)]
pub struct Bootstrapper {
    phase: Phase,
    entry: Option<Addr>,
    entry_hook: Option<StompHook>,
    tls_slot: Option<Addr>,
    saved_tls_callback: Option<Addr>,
    retrigger_tls: bool,
}

impl Bootstrapper {
    /// Creates an unattached bootstrapper
    ///
    /// If `retrigger_tls` is set, restoring starts and joins a throwaway thread so the
    /// platform runs the restored TLS callback once.
    pub fn new(retrigger_tls: bool) -> Self {
        Self {
            phase: Phase::Unattached,
            entry: None,
            entry_hook: None,
            tls_slot: None,
            saved_tls_callback: None,
            retrigger_tls,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The entry point of the host image, once installed
    pub fn entry_point(&self) -> Option<Addr> {
        self.entry
    }

    /// The TLS callback that was disabled, while it is disabled
    pub fn saved_tls_callback(&self) -> Option<Addr> {
        self.saved_tls_callback
    }

    /// Disables the TLS callback of `image` and hooks its entry point to `dispatch`
    ///
    /// An image without TLS callbacks is normal. An image without entry point is logged and
    /// left alone, the bootstrap then stays [`Phase::Unattached`].
    ///
    /// # Errors
    ///
    /// * [`InjectError::AlreadyInstalled`] if this bootstrapper was installed before
    /// * errors of [`ImageView`] for malformed headers
    /// * errors of patching the TLS slot or hooking the entry point; nothing stays modified
    ///
    /// # Safety
    ///
    /// `image` must be the image of this process whose entry point did not run yet, and no
    /// other thread may execute its entry point while it is hooked. `dispatch` must be a
    /// routine that can stand in for the entry point.
    pub unsafe fn install(&mut self, image: &ImageView, dispatch: Addr) -> Result<()> {
        if self.phase != Phase::Unattached {
            return Err(InjectError::AlreadyInstalled);
        }

        let Some(entry) = image.entry_point()? else {
            warn!("image at {} has no entry point, nothing to hook", image.base());
            return Ok(());
        };

        match image.tls_callback_slot()? {
            Some(slot) => {
                let callback = image.read_pointer(slot)?;
                if callback.is_null() {
                    debug!("TLS callback array at {slot} is empty");
                } else {
                    patch_bytes(slot, &[0u8; size_of::<usize>()])?;
                    debug!("disabled TLS callback {callback} at {slot}");
                    self.tls_slot = Some(slot);
                    self.saved_tls_callback = Some(callback);
                }
            }
            None => debug!("image has no TLS callbacks"),
        }

        let mut hook = StompHook::new(entry);
        if let Err(e) = hook.install(dispatch) {
            if let Err(restore_err) = self.restore_tls() {
                error!("could not restore the TLS callback after a failed install: {restore_err}");
            }
            return Err(e);
        }

        info!("hooked entry point {entry} to {dispatch}");
        self.entry = Some(entry);
        self.entry_hook = Some(hook);
        self.phase = Phase::Installed;
        Ok(())
    }

    /// Marks the bootstrap as fired, so that it cannot fire a second time
    ///
    /// # Errors
    ///
    /// * [`InjectError::AlreadyFired`] if the bootstrap fired before
    /// * [`InjectError::NotInstalled`] if it was never installed
    pub fn begin_fire(&mut self) -> Result<()> {
        match self.phase {
            Phase::Installed => {
                self.phase = Phase::Fired;
                trace!("bootstrap fired");
                Ok(())
            }
            Phase::Fired | Phase::Restored => Err(InjectError::AlreadyFired),
            Phase::Unattached => Err(InjectError::NotInstalled(self.phase.to_string())),
        }
    }

    /// Removes the entry hook and writes the TLS callback back
    ///
    /// Returns the entry point the host should continue at.
    ///
    /// # Errors
    ///
    /// * [`InjectError::NotInstalled`] unless the bootstrap has fired
    /// * errors of patching the entry point or the TLS slot
    pub fn restore(&mut self) -> Result<Addr> {
        if self.phase != Phase::Fired {
            return Err(InjectError::NotInstalled(self.phase.to_string()));
        }
        let entry = self
            .entry
            .ok_or_else(|| InjectError::NotInstalled(self.phase.to_string()))?;

        if let Some(hook) = self.entry_hook.as_mut() {
            hook.remove()?;
        }
        self.entry_hook = None;
        self.restore_tls()?;
        self.phase = Phase::Restored;
        info!("restored entry point {entry}");
        Ok(entry)
    }

    /// Whether the host should get a throwaway thread after restoring
    pub fn needs_tls_retrigger(&self) -> bool {
        self.retrigger_tls && self.tls_slot.is_some()
    }

    /// Undoes an install that never fired
    ///
    /// Does nothing once the host was restored.
    pub fn teardown(&mut self) -> Result<()> {
        match self.phase {
            Phase::Unattached | Phase::Restored => Ok(()),
            Phase::Installed | Phase::Fired => {
                if let Some(hook) = self.entry_hook.as_mut() {
                    hook.remove()?;
                }
                self.entry_hook = None;
                self.restore_tls()?;
                self.phase = Phase::Restored;
                debug!("bootstrap torn down");
                Ok(())
            }
        }
    }

    fn restore_tls(&mut self) -> Result<()> {
        let (Some(slot), Some(callback)) = (self.tls_slot, self.saved_tls_callback) else {
            return Ok(());
        };
        // SAFETY: the slot was read from the host image at install and zeroed by us
        unsafe { patch_bytes(slot, &callback.usize().to_ne_bytes())? };
        self.saved_tls_callback = None;
        debug!("restored TLS callback {callback} at {slot}");
        Ok(())
    }
}

impl Drop for Bootstrapper {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            error!("could not tear down the bootstrap: {e}");
        }
    }
}

/// Starts and joins a thread that does nothing
///
/// Thread creation makes the platform run the TLS callbacks of the host for the new thread.
/// This only approximates the process start, where the callbacks run for the main thread.
pub fn retrigger_tls() -> Result<()> {
    let handle = std::thread::Builder::new()
        .name("tls-retrigger".to_string())
        .spawn(|| trace!("TLS retrigger thread running"))?;
    if handle.join().is_err() {
        warn!("TLS retrigger thread panicked");
    }
    Ok(())
}

#[cfg(all(test, target_os = "linux", target_arch = "x86_64"))]
mod test {
    use super::*;
    use crate::stomp::{jump_stub, MAX_STUB_LEN};
    use crate::test_utils::{SyntheticImage, ENTRY_CODE, ENTRY_RVA, TLS_CALLBACKS_RVA};

    const DISPATCH: usize = 0x4242_4242;
    const CALLBACK: usize = 0x5151_5151;

    fn installed(image: &SyntheticImage, retrigger: bool) -> Bootstrapper {
        let mut boot = Bootstrapper::new(retrigger);
        unsafe { boot.install(&image.view(), Addr::from(DISPATCH)) }.unwrap();
        boot
    }

    #[test]
    fn test_install_hooks_entry_and_disables_tls() {
        let image = SyntheticImage::build(Some(Addr::from(CALLBACK)));
        let boot = installed(&image, false);

        let entry = image.addr() + ENTRY_RVA;
        assert_eq!(boot.phase(), Phase::Installed);
        assert_eq!(boot.entry_point(), Some(entry));
        assert_eq!(
            image.bytes(ENTRY_RVA, MAX_STUB_LEN),
            jump_stub(entry, Addr::from(DISPATCH)).as_slice()
        );
        assert_eq!(image.read_pointer(TLS_CALLBACKS_RVA), Addr::NULL);
        assert_eq!(boot.saved_tls_callback(), Some(Addr::from(CALLBACK)));
    }

    #[test]
    fn test_restore_brings_back_entry_and_tls() {
        let image = SyntheticImage::build(Some(Addr::from(CALLBACK)));
        let mut boot = installed(&image, true);

        boot.begin_fire().unwrap();
        assert_eq!(boot.phase(), Phase::Fired);
        assert!(boot.needs_tls_retrigger());
        assert_eq!(boot.restore().unwrap(), image.addr() + ENTRY_RVA);
        assert_eq!(boot.phase(), Phase::Restored);
        assert_eq!(image.bytes(ENTRY_RVA, ENTRY_CODE.len()), &ENTRY_CODE);
        assert_eq!(image.read_pointer(TLS_CALLBACKS_RVA), Addr::from(CALLBACK));
        assert_eq!(boot.saved_tls_callback(), None);
    }

    #[test]
    fn test_begin_fire_only_once() {
        let image = SyntheticImage::build(None);
        let mut boot = installed(&image, true);
        assert!(!boot.needs_tls_retrigger());

        boot.begin_fire().unwrap();
        assert!(matches!(boot.begin_fire(), Err(InjectError::AlreadyFired)));
        boot.restore().unwrap();
        assert!(matches!(boot.begin_fire(), Err(InjectError::AlreadyFired)));
        assert!(matches!(boot.restore(), Err(InjectError::NotInstalled(_))));
        assert_eq!(boot.phase(), Phase::Restored);
    }

    #[test]
    fn test_fire_before_install() {
        let mut boot = Bootstrapper::new(false);
        assert!(matches!(boot.begin_fire(), Err(InjectError::NotInstalled(_))));
        assert!(matches!(boot.restore(), Err(InjectError::NotInstalled(_))));
        assert_eq!(boot.phase(), Phase::Unattached);
    }

    #[test]
    fn test_second_install_is_rejected() {
        let image = SyntheticImage::build(None);
        let mut boot = installed(&image, false);
        assert!(matches!(
            unsafe { boot.install(&image.view(), Addr::from(DISPATCH)) },
            Err(InjectError::AlreadyInstalled)
        ));
    }

    #[test]
    fn test_teardown_and_drop_restore_the_image() {
        let image = SyntheticImage::build(Some(Addr::from(CALLBACK)));
        let mut boot = installed(&image, false);
        boot.teardown().unwrap();
        assert_eq!(boot.phase(), Phase::Restored);
        assert_eq!(image.bytes(ENTRY_RVA, ENTRY_CODE.len()), &ENTRY_CODE);
        assert_eq!(image.read_pointer(TLS_CALLBACKS_RVA), Addr::from(CALLBACK));

        {
            let _boot = installed(&image, false);
            assert_eq!(image.read_pointer(TLS_CALLBACKS_RVA), Addr::NULL);
        }
        assert_eq!(image.bytes(ENTRY_RVA, ENTRY_CODE.len()), &ENTRY_CODE);
        assert_eq!(image.read_pointer(TLS_CALLBACKS_RVA), Addr::from(CALLBACK));
    }
}
