//! Debug register access for ptrace tracees on Linux.
//!
//! The kernel exposes the debug registers of a tracee in the `u_debugreg` array of its user
//! area, which is read and written with `PTRACE_PEEKUSER` and `PTRACE_POKEUSER`.

use std::mem::{offset_of, size_of};

use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use tracing::trace;

use super::{DebugRegisters, ThreadControl, SLOT_COUNT};
use crate::errors::Result;

const CONTROL_REGISTER: usize = 7;

fn debugreg_offset(index: usize) -> ptrace::AddressType {
    (offset_of!(libc::user, u_debugreg) + index * size_of::<libc::c_ulong>()) as ptrace::AddressType
}

/// A thread that this process traces
///
/// Suspending a tracee that is already in a ptrace stop does nothing, and resuming only
/// continues a tracee that was stopped by [`ThreadControl::suspend`].
///
/// Only tracees attached with [`TracedThread::seize`] can be interrupted in place. A running
/// tracee attached with `PTRACE_TRACEME` or `PTRACE_ATTACH` is stopped with `SIGSTOP`
/// instead, which stops its whole thread group.
#[derive(Debug)]
pub struct TracedThread {
    pid: Pid,
    stopped_by_us: bool,
}

impl TracedThread {
    /// Wraps a thread that is already traced by the calling thread, seized or not
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            stopped_by_us: false,
        }
    }

    /// Starts tracing `pid` without stopping it
    pub fn seize(pid: Pid) -> Result<Self> {
        ptrace::seize(pid, ptrace::Options::empty())?;
        Ok(Self::new(pid))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn is_stopped(&self) -> Result<bool> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", self.pid))?;
        // the command name may contain spaces and parentheses, the state follows the last ')'
        let state = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next());
        Ok(matches!(state, Some('t' | 'T')))
    }
}

impl ThreadControl for TracedThread {
    fn suspend(&mut self) -> Result<()> {
        if self.is_stopped()? {
            trace!("tracee {} is already stopped", self.pid);
            self.stopped_by_us = false;
            return Ok(());
        }
        match ptrace::interrupt(self.pid) {
            Ok(()) => (),
            // PTRACE_INTERRUPT only works on seized tracees
            Err(Errno::EIO) => {
                trace!("tracee {} was not seized, stopping it with SIGSTOP", self.pid);
                kill(self.pid, Signal::SIGSTOP)?;
            }
            Err(e) => return Err(e.into()),
        }
        waitpid(self.pid, Some(WaitPidFlag::__WALL))?;
        self.stopped_by_us = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        if self.stopped_by_us {
            ptrace::cont(self.pid, None)?;
            self.stopped_by_us = false;
        }
        Ok(())
    }

    fn get_debug_registers(&mut self) -> Result<DebugRegisters> {
        let mut regs = DebugRegisters::default();
        for (index, address) in regs.address.iter_mut().enumerate() {
            *address = ptrace::read_user(self.pid, debugreg_offset(index))? as usize;
        }
        regs.control = ptrace::read_user(self.pid, debugreg_offset(CONTROL_REGISTER))? as usize;
        Ok(regs)
    }

    fn set_debug_registers(&mut self, regs: &DebugRegisters) -> Result<()> {
        // the kernel validates dr7 against the addresses, so disable everything first
        ptrace::write_user(self.pid, debugreg_offset(CONTROL_REGISTER), 0)?;
        for index in 0..SLOT_COUNT {
            ptrace::write_user(
                self.pid,
                debugreg_offset(index),
                regs.address[index] as libc::c_long,
            )?;
        }
        ptrace::write_user(
            self.pid,
            debugreg_offset(CONTROL_REGISTER),
            regs.control as libc::c_long,
        )?;
        Ok(())
    }
}
