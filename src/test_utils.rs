//! Helpers shared by the unit tests: scratch memory pages and synthetic PE images.

#![allow(dead_code)]

use std::path::PathBuf;

use nix::libc;

use crate::addr::Addr;
use crate::image::ImageView;

const PAGE: usize = 0x1000;

/// An anonymous private mapping that is unmapped on drop
pub struct ScratchPage {
    addr: Addr,
    len: usize,
}

impl ScratchPage {
    /// Maps one read+write page, executable if `exec` is set
    pub fn new(exec: bool) -> Self {
        Self::with_len(PAGE, exec)
    }

    pub fn with_len(len: usize, exec: bool) -> Self {
        let mut prot = libc::PROT_READ | libc::PROT_WRITE;
        if exec {
            prot |= libc::PROT_EXEC;
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED, "mmap failed");
        Self {
            addr: Addr::from(ptr),
            len,
        }
    }

    /// Maps a read+execute page that starts with `code`
    pub fn with_code(code: &[u8]) -> Self {
        let page = Self::new(false);
        page.write(0, code);
        let res = unsafe {
            libc::mprotect(page.addr.raw_pointer(), page.len, libc::PROT_READ | libc::PROT_EXEC)
        };
        assert_eq!(res, 0, "mprotect failed");
        page
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts((self.addr + offset).as_ptr::<u8>(), len) }
    }

    pub fn protect(&self, offset: usize, len: usize, prot: nix::sys::mman::ProtFlags) {
        assert!(offset + len <= self.len);
        let res = unsafe { libc::mprotect((self.addr + offset).raw_pointer(), len, prot.bits()) };
        assert_eq!(res, 0, "mprotect failed");
    }

    /// Writes into the page, which must currently be writable
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.addr + offset).as_mut_ptr::<u8>(),
                data.len(),
            )
        }
    }
}

impl Drop for ScratchPage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr.raw_pointer(), self.len);
        }
    }
}

/// Path of the C library mapped into this process
pub fn loaded_libc() -> PathBuf {
    proc_maps::get_process_maps(std::process::id() as proc_maps::Pid)
        .unwrap()
        .iter()
        .filter_map(|m| m.filename())
        .find(|path| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with("libc.so"))
        })
        .map(|path| path.to_path_buf())
        .expect("libc is not mapped")
}

pub const IMAGE_LEN: usize = 2 * PAGE;
pub const NT_OFFSET: usize = 0x80;
pub const TLS_DIRECTORY_RVA: usize = 0x300;
pub const TLS_CALLBACKS_RVA: usize = 0x340;
pub const ENTRY_RVA: usize = 0x1000;
/// Code at the entry point of synthetic images
pub const ENTRY_CODE: [u8; 16] = [
    0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x20, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0xc3,
];

/// A minimal PE32+ image mapped like the loader would map it
///
/// Headers live in the first page, the entry point at the start of the second page. If a TLS
/// callback is given, the image has a TLS directory whose callback array holds it.
pub struct SyntheticImage {
    page: ScratchPage,
}

impl SyntheticImage {
    pub fn build(tls_callback: Option<Addr>) -> Self {
        let page = ScratchPage::with_len(IMAGE_LEN, false);
        let base = page.addr();

        // DOS header
        page.write(0, b"MZ");
        page.write(0x3c, &(NT_OFFSET as u32).to_le_bytes());

        // NT signature and file header
        page.write(NT_OFFSET, b"PE\0\0");
        let file_header = NT_OFFSET + 4;
        page.write(file_header, &0x8664u16.to_le_bytes());
        page.write(file_header + 16, &240u16.to_le_bytes());

        // optional header
        let optional = NT_OFFSET + 24;
        page.write(optional, &0x20bu16.to_le_bytes());
        page.write(optional + 16, &(ENTRY_RVA as u32).to_le_bytes());
        page.write(optional + 24, &base.u64().to_le_bytes());
        page.write(optional + 56, &(IMAGE_LEN as u32).to_le_bytes());
        page.write(optional + 60, &(PAGE as u32).to_le_bytes());
        page.write(optional + 108, &16u32.to_le_bytes());

        if let Some(callback) = tls_callback {
            let tls_dir_entry = optional + 112 + 9 * 8;
            page.write(tls_dir_entry, &(TLS_DIRECTORY_RVA as u32).to_le_bytes());
            page.write(tls_dir_entry + 4, &40u32.to_le_bytes());

            let callbacks = base + TLS_CALLBACKS_RVA;
            page.write(TLS_DIRECTORY_RVA + 24, &callbacks.u64().to_le_bytes());
            page.write(TLS_CALLBACKS_RVA, &callback.u64().to_le_bytes());
        }

        page.write(ENTRY_RVA, &ENTRY_CODE);

        Self { page }
    }

    pub fn addr(&self) -> Addr {
        self.page.addr()
    }

    pub fn len(&self) -> usize {
        self.page.len()
    }

    pub fn view(&self) -> ImageView {
        unsafe { ImageView::new(self.addr(), self.len()) }.unwrap()
    }

    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        self.page.bytes(offset, len)
    }

    pub fn write(&self, offset: usize, data: &[u8]) {
        self.page.write(offset, data)
    }

    pub fn read_pointer(&self, offset: usize) -> Addr {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(offset, 8));
        Addr::from(u64::from_le_bytes(raw))
    }
}
