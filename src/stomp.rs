//! # Stomp Hook Module
//!
//! Redirects a code address to a trampoline by overwriting its first bytes with a jump.
//!
//! A [`StompHook`] saves the bytes at its target, writes an unconditional jump to the
//! trampoline in their place and can later write the saved bytes back. The hook works like a
//! breakpoint that jumps instead of trapping: it knows whether it is installed, refuses to be
//! installed twice, and removes itself when dropped.
//!
//! The jump sequence is selected per architecture at compile time:
//!
//! | Architecture | Sequence                            | Length |
//! |--------------|-------------------------------------|--------|
//! | x86-64       | `jmp qword ptr [rip+0]` + address   | 14     |
//! | x86          | `jmp rel32`                         | 5      |

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Mutex;

use tracing::{error, trace, warn};

use crate::addr::Addr;
use crate::disassemble::DisplacedCode;
use crate::errors::{InjectError, Result};
use crate::patch::PatchRegion;

/// Length of the jump stub written by a [`StompHook`]
#[cfg(target_arch = "x86_64")]
pub const MAX_STUB_LEN: usize = 14;
/// Length of the jump stub written by a [`StompHook`]
#[cfg(target_arch = "x86")]
pub const MAX_STUB_LEN: usize = 5;

/// Targets that currently have an installed hook, at most one hook per target
static HOOKED_TARGETS: Mutex<BTreeSet<Addr>> = Mutex::new(BTreeSet::new());

/// A fixed capacity buffer for jump stubs and the bytes they replace
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SavedBytes {
    buf: [u8; MAX_STUB_LEN],
    len: usize,
}

impl SavedBytes {
    /// Copies up to [`MAX_STUB_LEN`] bytes from `data`
    pub fn from_slice(data: &[u8]) -> Self {
        let len = data.len().min(MAX_STUB_LEN);
        let mut buf = [0; MAX_STUB_LEN];
        buf[..len].copy_from_slice(&data[..len]);
        Self { buf, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Debug for SavedBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x?}", self.as_slice())
    }
}

/// Encodes an unconditional jump located at `at` that lands on `to`
#[cfg(target_arch = "x86_64")]
pub fn jump_stub(_at: Addr, to: Addr) -> SavedBytes {
    let mut stub = [0u8; MAX_STUB_LEN];
    // jmp qword ptr [rip+0]
    stub[..6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    stub[6..].copy_from_slice(&to.u64().to_le_bytes());
    SavedBytes::from_slice(&stub)
}

/// Encodes an unconditional jump located at `at` that lands on `to`
#[cfg(target_arch = "x86")]
pub fn jump_stub(at: Addr, to: Addr) -> SavedBytes {
    let mut stub = [0u8; MAX_STUB_LEN];
    // jmp rel32
    stub[0] = 0xe9;
    let rel = to.usize().wrapping_sub(at.usize() + MAX_STUB_LEN) as u32;
    stub[1..].copy_from_slice(&rel.to_le_bytes());
    SavedBytes::from_slice(&stub)
}

fn claim_target(target: Addr) -> Result<()> {
    let mut targets = HOOKED_TARGETS
        .lock()
        .map_err(|_| InjectError::Poisoned("hooked targets"))?;
    if !targets.insert(target) {
        return Err(InjectError::TargetAlreadyHooked(target));
    }
    Ok(())
}

fn release_target(target: Addr) {
    match HOOKED_TARGETS.lock() {
        Ok(mut targets) => {
            targets.remove(&target);
        }
        Err(_) => error!("could not release hooked target {target}: lock poisoned"),
    }
}

/// A jump from a target address to a trampoline, written over the target's first bytes
///
/// The target and the trampoline must stay valid while the hook is installed. The hook does
/// not own either of them.
///
/// # Examples
///
/// ```no_run
/// use coreinject::addr::Addr;
/// use coreinject::stomp::StompHook;
///
/// extern "C" fn replacement() -> u32 {
///     2
/// }
///
/// # fn target_address() -> Addr { Addr::NULL }
/// let mut hook = StompHook::new(target_address());
/// unsafe { hook.install(Addr::from(replacement as usize)) }.unwrap();
/// // every call to the target now lands in `replacement`
/// hook.remove().unwrap();
/// ```
#[derive(Debug)]
pub struct StompHook {
    target: Addr,
    trampoline: Option<Addr>,
    saved: Option<SavedBytes>,
}

impl StompHook {
    pub fn new(target: Addr) -> Self {
        Self {
            target,
            trampoline: None,
            saved: None,
        }
    }

    #[inline]
    pub fn is_installed(&self) -> bool {
        self.saved.is_some()
    }

    pub fn target(&self) -> Addr {
        self.target
    }

    pub fn trampoline(&self) -> Option<Addr> {
        self.trampoline
    }

    /// The original bytes of the target, while the hook is installed
    pub fn saved_bytes(&self) -> Option<&SavedBytes> {
        self.saved.as_ref()
    }

    /// Redirects the target to `trampoline`
    ///
    /// # Errors
    ///
    /// * [`InjectError::HookAlreadyInstalled`] if this hook is installed already
    /// * [`InjectError::TargetAlreadyHooked`] if another hook redirects the same target
    /// * any error of [`PatchRegion`] if the target could not be patched
    ///
    /// # Safety
    ///
    /// The first [`MAX_STUB_LEN`] bytes at the target must be mapped code of this process
    /// that no thread is executing while the hook is written. `trampoline` must be a function
    /// with the same signature and calling convention as the target.
    pub unsafe fn install(&mut self, trampoline: Addr) -> Result<()> {
        if self.is_installed() {
            return Err(InjectError::HookAlreadyInstalled(self.target));
        }
        claim_target(self.target)?;

        let stub = jump_stub(self.target, trampoline);
        let mut region = match PatchRegion::acquire(self.target, stub.len()) {
            Ok(r) => r,
            Err(e) => {
                release_target(self.target);
                return Err(e);
            }
        };

        let saved = SavedBytes::from_slice(region.bytes());
        let displaced = DisplacedCode::analyze(saved.as_slice(), self.target);
        trace!("displaced code at {}:\n{displaced}", self.target);
        if displaced.splits_instruction {
            warn!(
                "the hook at {} splits an instruction, only {} of {} bytes are complete",
                self.target, displaced.complete_len, displaced.code_len
            );
        }

        if let Err(e) = region.write(0, stub.as_slice()) {
            release_target(self.target);
            return Err(e);
        }
        self.saved = Some(saved);
        self.trampoline = Some(trampoline);
        region.release()?;

        trace!("hooked {} -> {trampoline}", self.target);
        Ok(())
    }

    /// Writes the original bytes back to the target
    ///
    /// Does nothing if the hook is not installed.
    ///
    /// # Errors
    ///
    /// Fails if the target could not be patched. The hook stays installed in that case.
    pub fn remove(&mut self) -> Result<()> {
        let Some(saved) = self.saved else {
            return Ok(());
        };

        // SAFETY: install checked the target, and the saved bytes are the target's own
        let mut region = unsafe { PatchRegion::acquire(self.target, saved.len())? };
        region.write(0, saved.as_slice())?;
        self.saved = None;
        self.trampoline = None;
        release_target(self.target);
        region.release()?;

        trace!("unhooked {}", self.target);
        Ok(())
    }

    /// Keeps the hook installed for the rest of the process lifetime
    pub fn leak(self) {
        std::mem::forget(self);
    }
}

impl Drop for StompHook {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            error!("could not remove the hook at {} while dropping: {e}", self.target);
        }
    }
}

#[cfg(all(test, target_os = "linux", target_arch = "x86_64"))]
mod test {
    use super::*;
    use crate::test_utils::ScratchPage;

    // mov eax, 1; ret; padded with nops
    const RETURN_ONE: [u8; 16] = [
        0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
        0x90,
    ];

    extern "C" fn return_two() -> u32 {
        2
    }

    fn call(page: &ScratchPage) -> u32 {
        let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(page.addr().usize()) };
        f()
    }

    #[test]
    fn test_jump_stub_encoding() {
        let stub = jump_stub(Addr::NULL, Addr::from(0x1122334455667788usize));
        assert_eq!(
            stub.as_slice(),
            &[0xff, 0x25, 0, 0, 0, 0, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(stub.len(), MAX_STUB_LEN);
    }

    #[test]
    fn test_saved_bytes_capacity() {
        let saved = SavedBytes::from_slice(&[7; 32]);
        assert_eq!(saved.len(), MAX_STUB_LEN);
        assert!(SavedBytes::from_slice(&[]).is_empty());
    }

    #[test]
    fn test_hook_redirects_calls() {
        let page = ScratchPage::with_code(&RETURN_ONE);
        assert_eq!(call(&page), 1);

        let mut hook = StompHook::new(page.addr());
        unsafe { hook.install(Addr::from(return_two as usize)) }.unwrap();
        assert_eq!(call(&page), 2);

        hook.remove().unwrap();
        assert_eq!(call(&page), 1);
    }

    #[test]
    fn test_install_remove_roundtrip() {
        let page = ScratchPage::with_code(&RETURN_ONE);
        let before = page.bytes(0, RETURN_ONE.len()).to_vec();

        let mut hook = StompHook::new(page.addr());
        unsafe { hook.install(Addr::from(0xdead_beef_usize)) }.unwrap();
        assert!(hook.is_installed());
        assert_eq!(hook.saved_bytes().unwrap().as_slice(), &before[..MAX_STUB_LEN]);
        assert_ne!(page.bytes(0, MAX_STUB_LEN), &before[..MAX_STUB_LEN]);

        hook.remove().unwrap();
        assert!(!hook.is_installed());
        assert_eq!(page.bytes(0, RETURN_ONE.len()), &before[..]);
    }

    #[test]
    fn test_remove_without_install_is_noop() {
        let page = ScratchPage::with_code(&RETURN_ONE);
        let mut hook = StompHook::new(page.addr());
        hook.remove().unwrap();
        hook.remove().unwrap();
        assert_eq!(page.bytes(0, RETURN_ONE.len()), &RETURN_ONE);
    }

    #[test]
    fn test_double_install_is_rejected() {
        let page = ScratchPage::with_code(&RETURN_ONE);
        let mut hook = StompHook::new(page.addr());
        unsafe { hook.install(Addr::from(0x1000usize)) }.unwrap();
        assert!(matches!(
            unsafe { hook.install(Addr::from(0x2000usize)) },
            Err(InjectError::HookAlreadyInstalled(_))
        ));
        // the saved bytes are still the original ones
        assert_eq!(hook.saved_bytes().unwrap().as_slice(), &RETURN_ONE[..MAX_STUB_LEN]);
        hook.remove().unwrap();
        assert_eq!(page.bytes(0, RETURN_ONE.len()), &RETURN_ONE);
    }

    #[test]
    fn test_second_hook_on_same_target_is_rejected() {
        let page = ScratchPage::with_code(&RETURN_ONE);
        let mut first = StompHook::new(page.addr());
        let mut second = StompHook::new(page.addr());
        unsafe { first.install(Addr::from(0x1000usize)) }.unwrap();
        assert!(matches!(
            unsafe { second.install(Addr::from(0x2000usize)) },
            Err(InjectError::TargetAlreadyHooked(_))
        ));

        first.remove().unwrap();
        unsafe { second.install(Addr::from(0x2000usize)) }.unwrap();
        second.remove().unwrap();
    }

    #[test]
    fn test_drop_removes_hook() {
        let page = ScratchPage::with_code(&RETURN_ONE);
        {
            let mut hook = StompHook::new(page.addr());
            unsafe { hook.install(Addr::from(return_two as usize)) }.unwrap();
            assert_eq!(call(&page), 2);
        }
        assert_eq!(call(&page), 1);
    }
}
