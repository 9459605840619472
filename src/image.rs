//! # Image Module
//!
//! Provides a validated view of a PE image that is mapped into this process.
//!
//! The bootstrap needs two things from the host executable: the address of its entry point
//! and the address of its TLS callback array. Both are found by walking the PE headers of the
//! mapped image. [`ImageView`] does that walk with bounds checks on every access, so the raw
//! pointer arithmetic over the image stays inside this module.
//!
//! The header layouts come from [`object::pe`]. The view only understands images of the same
//! bitness as this process.

use std::mem::size_of;

use object::pe;
use object::LittleEndian as LE;
use tracing::{debug, trace};

use crate::addr::Addr;
use crate::errors::{InjectError, Result};

#[cfg(target_pointer_width = "64")]
type NtHeaders = pe::ImageNtHeaders64;
#[cfg(target_pointer_width = "64")]
type TlsDirectory = pe::ImageTlsDirectory64;
#[cfg(target_pointer_width = "64")]
const OPTIONAL_HEADER_MAGIC: u16 = pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC;
#[cfg(target_pointer_width = "64")]
type Pointer = u64;

#[cfg(target_pointer_width = "32")]
type NtHeaders = pe::ImageNtHeaders32;
#[cfg(target_pointer_width = "32")]
type TlsDirectory = pe::ImageTlsDirectory32;
#[cfg(target_pointer_width = "32")]
const OPTIONAL_HEADER_MAGIC: u16 = pe::IMAGE_NT_OPTIONAL_HDR32_MAGIC;
#[cfg(target_pointer_width = "32")]
type Pointer = u32;

/// Upper bound for walking a TLS callback array
const MAX_TLS_CALLBACKS: usize = 64;

/// A bounds-checked view of a PE image mapped at `base`
#[derive(Debug, Clone, Copy)]
pub struct ImageView {
    base: Addr,
    size: usize,
    nt_offset: usize,
}

impl ImageView {
    /// Creates a view of `size` bytes of mapped image starting at `base`
    ///
    /// The DOS and NT headers are validated immediately.
    ///
    /// # Errors
    ///
    /// Fails with [`InjectError::MalformedImage`] if the signatures or the optional header
    /// magic do not match, and with [`InjectError::ImageOutOfBounds`] if the headers do not fit
    /// into `size` bytes.
    ///
    /// # Safety
    ///
    /// `size` bytes starting at `base` must be readable for as long as the view is used.
    pub unsafe fn new(base: Addr, size: usize) -> Result<Self> {
        let mut view = Self {
            base,
            size,
            nt_offset: 0,
        };

        let dos: pe::ImageDosHeader = view.read(0)?;
        if dos.e_magic.get(LE) != pe::IMAGE_DOS_SIGNATURE {
            return Err(InjectError::MalformedImage(format!(
                "bad DOS signature {:#06x}",
                dos.e_magic.get(LE)
            )));
        }

        view.nt_offset = dos.e_lfanew.get(LE) as usize;
        let nt = view.nt_headers()?;
        if nt.signature.get(LE) != pe::IMAGE_NT_SIGNATURE {
            return Err(InjectError::MalformedImage(format!(
                "bad NT signature {:#010x}",
                nt.signature.get(LE)
            )));
        }
        if nt.optional_header.magic.get(LE) != OPTIONAL_HEADER_MAGIC {
            return Err(InjectError::MalformedImage(format!(
                "optional header magic {:#06x} does not match this process",
                nt.optional_header.magic.get(LE)
            )));
        }

        trace!("image view at {base} with {size:#x} bytes, NT headers at {:#x}", view.nt_offset);
        Ok(view)
    }

    /// Creates a view of the image mapped at `base`, sized by its `SizeOfImage` field
    ///
    /// # Safety
    ///
    /// `base` must be the start of a PE image mapped by the loader.
    pub unsafe fn from_base(base: Addr) -> Result<Self> {
        let dos = std::ptr::read_unaligned(base.as_ptr::<pe::ImageDosHeader>());
        let nt_offset = dos.e_lfanew.get(LE) as usize;
        let nt = std::ptr::read_unaligned((base + nt_offset).as_ptr::<NtHeaders>());
        let size = nt.optional_header.size_of_image.get(LE) as usize;
        debug!("image at {base} declares {size:#x} bytes");
        Self::new(base, size)
    }

    /// Creates a view of the executable that started this process
    #[cfg(windows)]
    pub fn host() -> Result<Self> {
        use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;

        // SAFETY: a null name returns the handle of the host executable
        let module = unsafe { GetModuleHandleW(std::ptr::null()) };
        if module.is_null() {
            return Err(InjectError::last_os_error("GetModuleHandleW"));
        }
        // SAFETY: module handles are the base addresses of mapped images
        unsafe { Self::from_base(Addr::from(module as usize)) }
    }

    pub fn base(&self) -> Addr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(InjectError::ImageOutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    fn read<T: object::pod::Pod>(&self, offset: usize) -> Result<T> {
        self.check(offset, size_of::<T>())?;
        // SAFETY: in bounds of the readable image, Pod types accept any bit pattern
        Ok(unsafe { std::ptr::read_unaligned((self.base + offset).as_ptr::<T>()) })
    }

    fn offset_of(&self, addr: Addr, len: usize) -> Result<usize> {
        if addr < self.base {
            return Err(InjectError::ImageOutOfBounds {
                offset: 0,
                len,
                size: self.size,
            });
        }
        let offset = addr - self.base;
        self.check(offset, len)?;
        Ok(offset)
    }

    fn nt_headers(&self) -> Result<NtHeaders> {
        self.read(self.nt_offset)
    }

    fn data_directory(&self, index: usize) -> Result<Option<pe::ImageDataDirectory>> {
        let nt = self.nt_headers()?;
        let count = nt.optional_header.number_of_rva_and_sizes.get(LE) as usize;
        if index >= count {
            return Ok(None);
        }
        let offset = self.nt_offset + size_of::<NtHeaders>() + index * size_of::<pe::ImageDataDirectory>();
        let dir: pe::ImageDataDirectory = self.read(offset)?;
        if dir.virtual_address.get(LE) == 0 {
            return Ok(None);
        }
        Ok(Some(dir))
    }

    /// The absolute address the loader transfers control to, if the image declares one
    pub fn entry_point(&self) -> Result<Option<Addr>> {
        let rva = self.nt_headers()?.optional_header.address_of_entry_point.get(LE) as usize;
        if rva == 0 {
            return Ok(None);
        }
        self.check(rva, 1)?;
        Ok(Some(self.base + rva))
    }

    fn tls_directory(&self) -> Result<Option<TlsDirectory>> {
        let Some(dir) = self.data_directory(pe::IMAGE_DIRECTORY_ENTRY_TLS)? else {
            return Ok(None);
        };
        Ok(Some(self.read(dir.virtual_address.get(LE) as usize)?))
    }

    /// The address of the first entry of the TLS callback array, if the image has one
    ///
    /// This is the slot the loader reads the first TLS callback from. Its content may be
    /// null if the array is empty.
    pub fn tls_callback_slot(&self) -> Result<Option<Addr>> {
        let Some(tls) = self.tls_directory()? else {
            return Ok(None);
        };
        let callbacks = Addr::from(tls.address_of_call_backs.get(LE) as usize);
        if callbacks.is_null() {
            return Ok(None);
        }
        self.offset_of(callbacks, size_of::<Pointer>())?;
        Ok(Some(callbacks))
    }

    /// Reads a pointer stored inside the image
    pub fn read_pointer(&self, addr: Addr) -> Result<Addr> {
        let offset = self.offset_of(addr, size_of::<Pointer>())?;
        self.read::<Pointer>(offset).map(|p| Addr::from(p as usize))
    }

    /// All callbacks of the null terminated TLS callback array
    pub fn tls_callbacks(&self) -> Result<Vec<Addr>> {
        let Some(mut slot) = self.tls_callback_slot()? else {
            return Ok(Vec::new());
        };
        let mut callbacks = Vec::new();
        while callbacks.len() < MAX_TLS_CALLBACKS {
            let callback = self.read_pointer(slot)?;
            if callback.is_null() {
                break;
            }
            callbacks.push(callback);
            slot += size_of::<Pointer>();
        }
        Ok(callbacks)
    }
}
