//! # Hardware Breakpoint Module
//!
//! Watches memory accesses with the x86 debug registers.
//!
//! Every thread has four address registers (`dr0`-`dr3`) and one control register (`dr7`).
//! A watch occupies one of the four slots: its address goes into the slot's address register,
//! and the access kind and width are encoded into the slot's 2-bit fields of the control
//! register, next to the slot's local enable bit.
//!
//! The register state of a running thread is undefined to read, so every change is done
//! while the thread is suspended. [`BreakpointManager`] brackets each operation with a
//! suspend and a resume, and resumes a thread it suspended on every exit path, even when a
//! later step failed.
//!
//! Platform access to threads is abstracted by [`ThreadControl`]:
//!
//! - [`windows::WindowsThread`] for threads of this process on Windows
//! - [`ptrace::TracedThread`] for ptrace tracees on Linux
//!
//! Two callers changing the watches of the same thread at the same time race with each
//! other; such calls must be serialized by the callers.

use std::fmt::Display;

use serde::Serialize;
use tracing::{debug, error, trace};

use crate::addr::Addr;
use crate::errors::{InjectError, Result};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod ptrace;
#[cfg(windows)]
pub mod windows;

/// Number of hardware watch slots per thread
pub const SLOT_COUNT: usize = 4;

const CONDITION_SHIFT: usize = 16;
const LENGTH_SHIFT: usize = 18;
const SLOT_FIELD_STRIDE: usize = 4;

/// Which kind of access triggers a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AccessKind {
    /// Data reads; the hardware cannot watch reads alone, so this also triggers on writes
    Read,
    /// Data writes
    Write,
    /// Data reads and writes
    ReadWrite,
    /// Instruction fetches
    Execute,
}

impl AccessKind {
    /// The value of the 2-bit condition field for this access kind
    pub fn condition_bits(self) -> usize {
        match self {
            AccessKind::Execute => 0b00,
            AccessKind::Write => 0b01,
            AccessKind::Read | AccessKind::ReadWrite => 0b11,
        }
    }

    fn from_condition_bits(bits: usize) -> Option<Self> {
        match bits {
            0b00 => Some(AccessKind::Execute),
            0b01 => Some(AccessKind::Write),
            0b11 => Some(AccessKind::ReadWrite),
            _ => None,
        }
    }
}

/// How many bytes a watch covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WatchWidth {
    One = 1,
    Two = 2,
    Four = 4,
    Eight = 8,
}

impl WatchWidth {
    /// The value of the 2-bit length field for this width
    ///
    /// Width 8 is encoded as `0b10`, all other widths as `width - 1`.
    pub fn length_bits(self) -> usize {
        match self {
            WatchWidth::Eight => 0b10,
            other => (other as usize - 1) & 0b11,
        }
    }

    fn from_length_bits(bits: usize) -> Self {
        match bits {
            0b00 => WatchWidth::One,
            0b01 => WatchWidth::Two,
            0b10 => WatchWidth::Eight,
            _ => WatchWidth::Four,
        }
    }

    pub fn bytes(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for WatchWidth {
    type Error = InjectError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WatchWidth::One),
            2 => Ok(WatchWidth::Two),
            4 => Ok(WatchWidth::Four),
            8 => Ok(WatchWidth::Eight),
            other => Err(InjectError::InvalidWatchWidth(other)),
        }
    }
}

/// A change to the watches of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchRequest {
    /// Arm a free slot for the address
    Set {
        address: Addr,
        access: AccessKind,
        width: WatchWidth,
    },
    /// Disarm the slot watching the address, if any
    Remove { address: Addr },
}

/// An armed watch slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Watch {
    pub slot: usize,
    pub address: Addr,
    pub access: AccessKind,
    pub width: WatchWidth,
}

impl Display for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dr{}: {} ({:?}, {} bytes)",
            self.slot,
            self.address,
            self.access,
            self.width.bytes()
        )
    }
}

/// The debug registers of one thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DebugRegisters {
    /// `dr0` to `dr3`
    pub address: [usize; SLOT_COUNT],
    /// `dr7`
    pub control: usize,
}

#[inline]
fn set_bits(register: &mut usize, low: usize, count: usize, value: usize) {
    let mask = ((1 << count) - 1) << low;
    *register = (*register & !mask) | ((value << low) & mask);
}

#[inline]
fn get_bits(register: usize, low: usize, count: usize) -> usize {
    (register >> low) & ((1 << count) - 1)
}

impl DebugRegisters {
    pub fn is_armed(&self, slot: usize) -> bool {
        get_bits(self.control, slot * 2, 1) == 1
    }

    /// The lowest slot whose local enable bit is clear
    pub fn free_slot(&self) -> Option<usize> {
        (0..SLOT_COUNT).find(|slot| !self.is_armed(*slot))
    }

    /// Arms the lowest free slot
    ///
    /// # Errors
    ///
    /// * [`InjectError::InvalidExecuteWidth`] for execute watches wider than one byte
    /// * [`InjectError::NoFreeSlot`] if all slots are armed
    pub fn arm(&mut self, address: Addr, access: AccessKind, width: WatchWidth) -> Result<Watch> {
        if access == AccessKind::Execute && width != WatchWidth::One {
            return Err(InjectError::InvalidExecuteWidth(width.bytes() as u8));
        }
        let slot = self.free_slot().ok_or(InjectError::NoFreeSlot)?;

        let fields = slot * SLOT_FIELD_STRIDE;
        set_bits(&mut self.control, CONDITION_SHIFT + fields, 2, access.condition_bits());
        set_bits(&mut self.control, LENGTH_SHIFT + fields, 2, width.length_bits());
        set_bits(&mut self.control, slot * 2, 1, 1);
        self.address[slot] = address.usize();

        Ok(Watch {
            slot,
            address,
            access,
            width,
        })
    }

    /// Disarms the armed slot that watches exactly `address`
    ///
    /// Returns the watch that was removed, or [`None`] if no slot watches the address.
    pub fn disarm(&mut self, address: Addr) -> Option<Watch> {
        let slot = (0..SLOT_COUNT)
            .find(|slot| self.is_armed(*slot) && self.address[*slot] == address.usize())?;
        let watch = self.watch(slot);

        let fields = slot * SLOT_FIELD_STRIDE;
        set_bits(&mut self.control, slot * 2, 1, 0);
        set_bits(&mut self.control, CONDITION_SHIFT + fields, 2, 0);
        set_bits(&mut self.control, LENGTH_SHIFT + fields, 2, 0);
        self.address[slot] = 0;

        watch
    }

    /// Decodes the watch in `slot`, if the slot is armed
    pub fn watch(&self, slot: usize) -> Option<Watch> {
        if slot >= SLOT_COUNT || !self.is_armed(slot) {
            return None;
        }
        let fields = slot * SLOT_FIELD_STRIDE;
        // the I/O condition (0b10) is never armed by us, report it as a data watch
        let access = AccessKind::from_condition_bits(get_bits(
            self.control,
            CONDITION_SHIFT + fields,
            2,
        ))
        .unwrap_or(AccessKind::ReadWrite);
        Some(Watch {
            slot,
            address: Addr::from(self.address[slot]),
            access,
            width: WatchWidth::from_length_bits(get_bits(self.control, LENGTH_SHIFT + fields, 2)),
        })
    }

    /// All armed slots
    pub fn watches(&self) -> Vec<Watch> {
        (0..SLOT_COUNT).filter_map(|slot| self.watch(slot)).collect()
    }
}

/// Platform access to the debug registers of one thread
pub trait ThreadControl {
    /// Suspends the thread
    fn suspend(&mut self) -> Result<()>;

    /// Resumes a thread previously suspended with [`ThreadControl::suspend`]
    fn resume(&mut self) -> Result<()>;

    /// Reads the debug registers of the suspended thread
    fn get_debug_registers(&mut self) -> Result<DebugRegisters>;

    /// Writes the debug registers of the suspended thread
    fn set_debug_registers(&mut self, regs: &DebugRegisters) -> Result<()>;

    /// Whether this is the thread that is calling
    ///
    /// A thread cannot suspend itself, so operations on the calling thread are run on a
    /// short lived helper thread.
    fn is_current_thread(&self) -> bool {
        false
    }
}

/// Allocates and frees hardware watch slots of one thread
#[derive(Debug)]
pub struct BreakpointManager<T: ThreadControl + Send> {
    thread: T,
}

impl<T: ThreadControl + Send> BreakpointManager<T> {
    pub fn new(thread: T) -> Self {
        Self { thread }
    }

    pub fn thread(&self) -> &T {
        &self.thread
    }

    pub fn into_inner(self) -> T {
        self.thread
    }

    /// Watches `address` in the lowest free slot of the thread
    ///
    /// # Errors
    ///
    /// * [`InjectError::NoFreeSlot`] if all four slots are armed; nothing is changed then
    /// * [`InjectError::InvalidExecuteWidth`] for execute watches wider than one byte
    /// * the platform error of a failed suspend, register access or resume
    pub fn set(&mut self, address: Addr, access: AccessKind, width: WatchWidth) -> Result<Watch> {
        let watch = self.suspended(|thread| {
            let mut regs = thread.get_debug_registers()?;
            trace!("debug registers before set: {regs:x?}");
            let watch = regs.arm(address, access, width)?;
            thread.set_debug_registers(&regs)?;
            Ok(watch)
        })?;
        debug!("armed {watch}");
        Ok(watch)
    }

    /// Stops watching `address`
    ///
    /// Returns the removed watch, or [`None`] if no slot watches the address. Removal never
    /// fails because the slots are full.
    pub fn remove(&mut self, address: Addr) -> Result<Option<Watch>> {
        let watch = self.suspended(|thread| {
            let mut regs = thread.get_debug_registers()?;
            let Some(watch) = regs.disarm(address) else {
                return Ok(None);
            };
            thread.set_debug_registers(&regs)?;
            Ok(Some(watch))
        })?;
        match &watch {
            Some(w) => debug!("disarmed {w}"),
            None => debug!("no watch at {address} to remove"),
        }
        Ok(watch)
    }

    /// Applies a [`WatchRequest`]
    pub fn apply(&mut self, request: WatchRequest) -> Result<Option<Watch>> {
        match request {
            WatchRequest::Remove { address } => self.remove(address),
            WatchRequest::Set {
                address,
                access,
                width,
            } => self.set(address, access, width).map(Some),
        }
    }

    /// All armed watches of the thread
    pub fn watches(&mut self) -> Result<Vec<Watch>> {
        self.suspended(|thread| Ok(thread.get_debug_registers()?.watches()))
    }

    fn suspended<R: Send>(&mut self, f: impl FnOnce(&mut T) -> Result<R> + Send) -> Result<R> {
        if self.thread.is_current_thread() {
            let thread = &mut self.thread;
            return std::thread::scope(|s| {
                s.spawn(move || bracket(thread, f))
                    .join()
                    .unwrap_or_else(|_| Err(InjectError::Poisoned("watch helper thread")))
            });
        }
        bracket(&mut self.thread, f)
    }
}

/// Runs `f` while `thread` is suspended and resumes it afterwards, also when `f` failed
fn bracket<T: ThreadControl, R>(thread: &mut T, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
    thread.suspend()?;
    let result = f(thread);
    let resumed = thread.resume();
    match (result, resumed) {
        (Ok(r), Ok(())) => Ok(r),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(resume_err)) => {
            error!("could not resume the thread after a failure: {resume_err}");
            Err(e)
        }
    }
}
