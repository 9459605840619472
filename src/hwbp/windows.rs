//! Debug register access for threads of this process on Windows.

use windows_sys::Win32::Foundation::{CloseHandle, FALSE, HANDLE};
use windows_sys::Win32::System::Diagnostics::Debug::{GetThreadContext, SetThreadContext, CONTEXT};
use windows_sys::Win32::System::Threading::{
    GetCurrentThreadId, OpenThread, ResumeThread, SuspendThread, THREAD_GET_CONTEXT,
    THREAD_QUERY_INFORMATION, THREAD_SET_CONTEXT, THREAD_SUSPEND_RESUME,
};

#[cfg(target_arch = "x86_64")]
use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT_DEBUG_REGISTERS_AMD64 as CONTEXT_DEBUG_REGISTERS;
#[cfg(target_arch = "x86")]
use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT_DEBUG_REGISTERS_X86 as CONTEXT_DEBUG_REGISTERS;

use super::{DebugRegisters, ThreadControl};
use crate::errors::{InjectError, Result};

const SUSPEND_FAILED: u32 = u32::MAX;

/// A thread of this process, opened with the rights needed to change its debug registers
#[derive(Debug)]
pub struct WindowsThread {
    handle: HANDLE,
    id: u32,
    current: bool,
}

// thread handles can be used from any thread
unsafe impl Send for WindowsThread {}

impl WindowsThread {
    /// Opens the thread with the id `thread_id`
    pub fn open(thread_id: u32) -> Result<Self> {
        // SAFETY: plain system call, the handle is checked below
        let handle = unsafe {
            OpenThread(
                THREAD_GET_CONTEXT
                    | THREAD_SET_CONTEXT
                    | THREAD_SUSPEND_RESUME
                    | THREAD_QUERY_INFORMATION,
                FALSE,
                thread_id,
            )
        };
        if handle.is_null() {
            return Err(InjectError::last_os_error("OpenThread"));
        }
        // SAFETY: plain system call
        let current = thread_id == unsafe { GetCurrentThreadId() };
        Ok(Self {
            handle,
            id: thread_id,
            current,
        })
    }

    /// Opens the calling thread
    pub fn current() -> Result<Self> {
        // SAFETY: plain system call
        Self::open(unsafe { GetCurrentThreadId() })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn context(&self) -> Result<CONTEXT> {
        // SAFETY: CONTEXT is plain data, all zero is a valid value
        let mut ctx: CONTEXT = unsafe { std::mem::zeroed() };
        ctx.ContextFlags = CONTEXT_DEBUG_REGISTERS;
        // SAFETY: the handle has THREAD_GET_CONTEXT, ctx is properly aligned
        if unsafe { GetThreadContext(self.handle, &mut ctx) } == 0 {
            return Err(InjectError::last_os_error("GetThreadContext"));
        }
        Ok(ctx)
    }
}

impl ThreadControl for WindowsThread {
    fn suspend(&mut self) -> Result<()> {
        // SAFETY: the handle has THREAD_SUSPEND_RESUME
        if unsafe { SuspendThread(self.handle) } == SUSPEND_FAILED {
            return Err(InjectError::last_os_error("SuspendThread"));
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        // SAFETY: the handle has THREAD_SUSPEND_RESUME
        if unsafe { ResumeThread(self.handle) } == SUSPEND_FAILED {
            return Err(InjectError::last_os_error("ResumeThread"));
        }
        Ok(())
    }

    fn get_debug_registers(&mut self) -> Result<DebugRegisters> {
        let ctx = self.context()?;
        Ok(DebugRegisters {
            address: [
                ctx.Dr0 as usize,
                ctx.Dr1 as usize,
                ctx.Dr2 as usize,
                ctx.Dr3 as usize,
            ],
            control: ctx.Dr7 as usize,
        })
    }

    fn set_debug_registers(&mut self, regs: &DebugRegisters) -> Result<()> {
        let mut ctx = self.context()?;
        ctx.Dr0 = regs.address[0] as _;
        ctx.Dr1 = regs.address[1] as _;
        ctx.Dr2 = regs.address[2] as _;
        ctx.Dr3 = regs.address[3] as _;
        ctx.Dr7 = regs.control as _;
        ctx.ContextFlags = CONTEXT_DEBUG_REGISTERS;
        // SAFETY: the handle has THREAD_SET_CONTEXT, only the debug registers are written
        if unsafe { SetThreadContext(self.handle, &ctx) } == 0 {
            return Err(InjectError::last_os_error("SetThreadContext"));
        }
        Ok(())
    }

    fn is_current_thread(&self) -> bool {
        self.current
    }
}

impl Drop for WindowsThread {
    fn drop(&mut self) {
        // SAFETY: the handle was opened by us and is closed exactly once
        unsafe {
            CloseHandle(self.handle);
        }
    }
}
