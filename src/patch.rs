//! # Patch Module
//!
//! Provides reversible in-place patching of memory in this process.
//!
//! A [`PatchRegion`] makes a range of memory writable and executable and remembers the
//! protection the range had before. When the region is released (explicitly with
//! [`PatchRegion::release`] or implicitly when it is dropped), the previous protection is
//! restored for exactly the same range. Every other component that changes code goes through
//! this module.
//!
//! Protection changes act on whole pages and are not transactional: overlapping regions that
//! are held at the same time restore each other's protection in an undefined order, so callers
//! must not do that.

use tracing::{error, trace};

use crate::addr::Addr;
use crate::errors::{InjectError, Result};

pub use self::sys::RawProtection;

/// The memory protection of a range before it was patched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protection(RawProtection);

impl Protection {
    pub fn raw(&self) -> RawProtection {
        self.0
    }
}

/// The protection one part of a patched range had before it was acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedProtection {
    pub addr: Addr,
    pub len: usize,
    pub protection: Protection,
}

/// A range of memory that is temporarily writable and executable
///
/// Created with [`PatchRegion::acquire`]. While the region is alive its bytes can be
/// overwritten with [`PatchRegion::write`]. The previous protection of every mapping the
/// range touches is restored on [`PatchRegion::release`] or on drop.
#[derive(Debug)]
pub struct PatchRegion {
    addr: Addr,
    len: usize,
    previous: Vec<SavedProtection>,
}

impl PatchRegion {
    /// Makes `len` bytes at `addr` writable and executable
    ///
    /// A failed protection change is never retried.
    ///
    /// # Safety
    ///
    /// The range must be mapped memory of this process, and nothing else may change the
    /// protection of the covering pages until the region is released.
    pub unsafe fn acquire(addr: Addr, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(InjectError::EmptyPatch(addr));
        }
        let previous: Vec<SavedProtection> = sys::unprotect(addr, len)?
            .into_iter()
            .map(|(addr, len, prot)| SavedProtection {
                addr,
                len,
                protection: Protection(prot),
            })
            .collect();
        trace!("unprotected {len} bytes at {addr}, previous protection: {previous:?}");
        Ok(Self {
            addr,
            len,
            previous,
        })
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// The protection of each part of the covering pages before the region was acquired
    pub fn previous_protection(&self) -> &[SavedProtection] {
        &self.previous
    }

    /// The current bytes of the region
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: acquire requires the range to be mapped, and it is readable now
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr::<u8>(), self.len) }
    }

    /// Overwrites bytes of the region, starting at `offset`
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset.checked_add(data.len()).map_or(true, |end| end > self.len) {
            return Err(InjectError::PatchOutOfBounds {
                offset,
                len: data.len(),
                region: self.len,
            });
        }
        trace!("writing {:02x?} to {}", data, self.addr + offset);
        // SAFETY: the range is mapped and writable while the region is acquired
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.addr + offset).as_mut_ptr::<u8>(),
                data.len(),
            );
        }
        Ok(())
    }

    pub fn release(mut self) -> Result<()> {
        self.restore()
    }

    fn restore(&mut self) -> Result<()> {
        if self.previous.is_empty() {
            return Ok(());
        }
        for saved in std::mem::take(&mut self.previous) {
            sys::reprotect(saved.addr, saved.len, saved.protection.0)?;
            trace!(
                "restored protection {:?} of {} bytes at {}",
                saved.protection,
                saved.len,
                saved.addr
            );
        }
        sys::flush_instruction_cache(self.addr, self.len)
    }
}

impl Drop for PatchRegion {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            error!("could not restore the protection at {}: {e}", self.addr);
        }
    }
}

/// Overwrites `data.len()` bytes at `addr` and returns the bytes that were there before
///
/// # Safety
///
/// See [`PatchRegion::acquire`]. Additionally, no thread may be executing the patched bytes
/// while they are being written.
pub unsafe fn patch_bytes(addr: Addr, data: &[u8]) -> Result<Vec<u8>> {
    let mut region = PatchRegion::acquire(addr, data.len())?;
    let original = region.bytes().to_vec();
    region.write(0, data)?;
    region.release()?;
    Ok(original)
}

/// The protection of the mapping that contains `addr`
pub fn protection_at(addr: Addr) -> Result<Protection> {
    sys::protection_at(addr).map(Protection)
}

#[cfg(target_os = "linux")]
mod sys {
    use std::ptr::NonNull;

    use nix::sys::mman::{mprotect, ProtFlags};
    use nix::unistd::{sysconf, SysconfVar};
    use proc_maps::MapRange;

    use crate::addr::Addr;
    use crate::errors::{InjectError, Result};

    pub type RawProtection = ProtFlags;

    pub(super) fn page_size() -> usize {
        match sysconf(SysconfVar::PAGE_SIZE) {
            Ok(Some(n)) if n > 0 => n as usize,
            _ => 0x1000,
        }
    }

    fn maps() -> Result<Vec<MapRange>> {
        let mut maps = proc_maps::get_process_maps(std::process::id() as proc_maps::Pid)?;
        maps.sort_by_key(|m| m.start());
        Ok(maps)
    }

    fn flags(range: &MapRange) -> ProtFlags {
        let mut flags = ProtFlags::PROT_NONE;
        if range.is_read() {
            flags |= ProtFlags::PROT_READ;
        }
        if range.is_write() {
            flags |= ProtFlags::PROT_WRITE;
        }
        if range.is_exec() {
            flags |= ProtFlags::PROT_EXEC;
        }
        flags
    }

    pub fn protection_at(addr: Addr) -> Result<ProtFlags> {
        maps()?
            .iter()
            .find(|m| m.start() <= addr.usize() && addr.usize() < m.start() + m.size())
            .map(flags)
            .ok_or(InjectError::NotMapped(addr))
    }

    fn set(addr: Addr, len: usize, prot: ProtFlags) -> Result<()> {
        let page = page_size();
        let start = addr.align_down(page);
        let end = (addr + len).align_up(page);
        let ptr = NonNull::new(start.raw_pointer()).ok_or(InjectError::NotMapped(addr))?;
        // SAFETY: the caller of PatchRegion::acquire guarantees that the pages are mapped
        unsafe { mprotect(ptr, end - start, prot) }.map_err(|e| InjectError::ProtectionChange {
            addr,
            len,
            source: e.into(),
        })
    }

    /// Saves the protection of every mapping overlapping the covering pages, then makes
    /// them writable and executable
    pub fn unprotect(addr: Addr, len: usize) -> Result<Vec<(Addr, usize, ProtFlags)>> {
        let page = page_size();
        let start = addr.align_down(page);
        let end = (addr + len).align_up(page);

        let mut saved = Vec::new();
        let mut covered = start;
        for m in maps()? {
            let m_start = Addr::from(m.start());
            let m_end = m_start + m.size();
            if m_end <= start || m_start >= end {
                continue;
            }
            let from = m_start.max(start);
            let to = m_end.min(end);
            if from != covered {
                return Err(InjectError::NotMapped(covered));
            }
            saved.push((from, to - from, flags(&m)));
            covered = to;
        }
        if covered != end {
            return Err(InjectError::NotMapped(covered));
        }

        set(
            addr,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
        )?;
        Ok(saved)
    }

    pub fn reprotect(addr: Addr, len: usize, prot: ProtFlags) -> Result<()> {
        set(addr, len, prot)
    }

    pub fn flush_instruction_cache(_addr: Addr, _len: usize) -> Result<()> {
        // x86 keeps instruction and data caches coherent
        Ok(())
    }
}

#[cfg(windows)]
mod sys {
    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Memory::{
        VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READWRITE,
        PAGE_PROTECTION_FLAGS,
    };
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    use crate::addr::Addr;
    use crate::errors::{InjectError, Result};

    pub type RawProtection = PAGE_PROTECTION_FLAGS;

    fn query(addr: Addr) -> Result<MEMORY_BASIC_INFORMATION> {
        // SAFETY: MEMORY_BASIC_INFORMATION is plain old data
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let written = unsafe {
            VirtualQuery(
                addr.as_ptr(),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            return Err(InjectError::last_os_error("VirtualQuery"));
        }
        Ok(info)
    }

    pub fn protection_at(addr: Addr) -> Result<PAGE_PROTECTION_FLAGS> {
        query(addr).map(|info| info.Protect)
    }

    fn set(addr: Addr, len: usize, prot: PAGE_PROTECTION_FLAGS) -> Result<PAGE_PROTECTION_FLAGS> {
        let mut old: PAGE_PROTECTION_FLAGS = 0;
        // SAFETY: the caller of PatchRegion::acquire guarantees that the pages are mapped
        if unsafe { VirtualProtect(addr.as_ptr(), len, prot, &mut old) } == 0 {
            return Err(InjectError::ProtectionChange {
                addr,
                len,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(old)
    }

    /// Saves the protection of every region the range touches, then makes the range
    /// writable and executable
    pub fn unprotect(
        addr: Addr,
        len: usize,
    ) -> Result<Vec<(Addr, usize, PAGE_PROTECTION_FLAGS)>> {
        let end = addr + len;
        let mut saved = Vec::new();
        let mut cursor = addr;
        while cursor < end {
            let info = query(cursor)?;
            let region_end = Addr::from(info.BaseAddress) + info.RegionSize;
            if region_end <= cursor {
                return Err(InjectError::NotMapped(cursor));
            }
            let to = region_end.min(end);
            saved.push((cursor, to - cursor, info.Protect));
            cursor = to;
        }
        set(addr, len, PAGE_EXECUTE_READWRITE)?;
        Ok(saved)
    }

    pub fn reprotect(addr: Addr, len: usize, prot: PAGE_PROTECTION_FLAGS) -> Result<()> {
        set(addr, len, prot).map(|_| ())
    }

    pub fn flush_instruction_cache(addr: Addr, len: usize) -> Result<()> {
        // SAFETY: flushing only affects caches, the range was just patched by us
        if unsafe { FlushInstructionCache(GetCurrentProcess(), addr.as_ptr(), len) } == 0 {
            return Err(InjectError::last_os_error("FlushInstructionCache"));
        }
        Ok(())
    }
}

#[cfg(all(test, target_os = "linux"))]
mod test {
    use nix::sys::mman::ProtFlags;

    use super::*;
    use crate::test_utils::ScratchPage;

    #[test]
    fn test_acquire_restores_previous_protection() {
        let page = ScratchPage::new(false);
        let addr = page.addr() + 0x10;
        assert_eq!(
            protection_at(addr).unwrap().raw(),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        );

        let region = unsafe { PatchRegion::acquire(addr, 14) }.unwrap();
        assert_eq!(
            protection_at(addr).unwrap().raw(),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC
        );
        region.release().unwrap();

        assert_eq!(
            protection_at(addr).unwrap().raw(),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        );
    }

    #[test]
    fn test_drop_restores_protection() {
        let page = ScratchPage::new(false);
        {
            let mut region = unsafe { PatchRegion::acquire(page.addr(), 4) }.unwrap();
            region.write(0, &[1, 2, 3, 4]).unwrap();
        }
        assert_eq!(page.bytes(0, 4), &[1, 2, 3, 4]);
        assert!(!protection_at(page.addr())
            .unwrap()
            .raw()
            .contains(ProtFlags::PROT_EXEC));
    }

    #[test]
    fn test_write_out_of_bounds() {
        let page = ScratchPage::new(false);
        let mut region = unsafe { PatchRegion::acquire(page.addr(), 4) }.unwrap();
        assert!(matches!(
            region.write(2, &[0; 4]),
            Err(InjectError::PatchOutOfBounds { offset: 2, len: 4, region: 4 })
        ));
        assert_eq!(region.bytes(), &[0; 4]);
    }

    #[test]
    fn test_empty_patch_is_rejected() {
        let page = ScratchPage::new(false);
        assert!(matches!(
            unsafe { PatchRegion::acquire(page.addr(), 0) },
            Err(InjectError::EmptyPatch(_))
        ));
    }

    #[test]
    fn test_patch_bytes_returns_original() {
        let page = ScratchPage::new(false);
        unsafe { patch_bytes(page.addr(), &[0xaa, 0xbb]) }.unwrap();
        let original = unsafe { patch_bytes(page.addr(), &[0xcc, 0xdd]) }.unwrap();
        assert_eq!(original, vec![0xaa, 0xbb]);
        assert_eq!(page.bytes(0, 2), &[0xcc, 0xdd]);
    }

    #[test]
    fn test_release_restores_each_page() {
        let pages = ScratchPage::with_len(0x2000, false);
        pages.protect(0, 0x1000, ProtFlags::PROT_READ | ProtFlags::PROT_EXEC);
        let first = pages.addr();
        let second = pages.addr() + 0x1000;

        let region = unsafe { PatchRegion::acquire(first + 0xff8, 14) }.unwrap();
        assert_eq!(region.previous_protection().len(), 2);
        assert_eq!(
            protection_at(second).unwrap().raw(),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC
        );
        region.release().unwrap();

        assert_eq!(
            protection_at(first).unwrap().raw(),
            ProtFlags::PROT_READ | ProtFlags::PROT_EXEC
        );
        assert_eq!(
            protection_at(second).unwrap().raw(),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        );
    }

    #[test]
    fn test_page_size() {
        let page = sys::page_size();
        assert!(page.is_power_of_two());
        assert!(page >= 0x1000);
    }

    #[test]
    fn test_unmapped_address() {
        assert!(matches!(protection_at(Addr::NULL), Err(InjectError::NotMapped(_))));
    }
}
