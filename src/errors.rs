//! # Error Module
//!
//! Defines the error type used throughout coreinject.
//!
//! Every fallible operation returns [`Result`], an alias over [`InjectError`]. Platform
//! failures keep the underlying OS error so callers can inspect the original error code.

use std::path::PathBuf;

use thiserror::Error;

use crate::addr::Addr;

/// Type alias for Results returned by coreinject functions
pub type Result<T> = std::result::Result<T, InjectError>;

/// Errors that can occur while patching, hooking, watching or bootstrapping
#[derive(Error, Debug)]
pub enum InjectError {
    /// Error from the operating system (Linux)
    #[cfg(target_os = "linux")]
    #[error("Os error: {0}")]
    Os(#[from] nix::Error),

    /// Input/output error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A named platform call failed, the source carries the OS error code
    #[error("{call} failed: {source}")]
    PlatformCall {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The memory protection of a range could not be changed
    #[error("Could not change the protection of {len} bytes at {addr}: {source}")]
    ProtectionChange {
        addr: Addr,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    /// The address is not part of any mapping of this process
    #[error("Address {0} is not mapped")]
    NotMapped(Addr),

    /// Tried to acquire a patch region without any bytes in it
    #[error("Tried to patch an empty range at {0}")]
    EmptyPatch(Addr),

    /// Tried to write past the end of a patch region
    #[error("Write of {len} bytes at offset {offset} exceeds the patch region of {region} bytes")]
    PatchOutOfBounds {
        offset: usize,
        len: usize,
        region: usize,
    },

    /// The hook is already installed
    #[error("Hook at {0} is already installed")]
    HookAlreadyInstalled(Addr),

    /// Some other hook already redirects this target
    #[error("Target {0} is already hooked")]
    TargetAlreadyHooked(Addr),

    /// All hardware watch slots of the thread are armed
    #[error("No free hardware watch slot")]
    NoFreeSlot,

    /// The watch width is not supported by the hardware
    #[error("Unsupported watch width: {0} (must be 1, 2, 4 or 8)")]
    InvalidWatchWidth(u8),

    /// Execute watches must cover exactly one byte
    #[error("Execute watches must have a width of 1, got {0}")]
    InvalidExecuteWidth(u8),

    /// The executable image headers are malformed or truncated
    #[error("Malformed executable image: {0}")]
    MalformedImage(String),

    /// An image offset lies outside of the mapped image
    #[error("Image access of {len} bytes at offset {offset:#x} exceeds the image size {size:#x}")]
    ImageOutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// Error while parsing an object file
    #[error("Object parse error: {0}")]
    Object(#[from] object::Error),

    /// The bootstrap entry point hook was already fired
    #[error("The bootstrap was already fired")]
    AlreadyFired,

    /// The bootstrap is not in the phase needed for this operation
    #[error("The bootstrap is not installed (phase: {0})")]
    NotInstalled(String),

    /// The bootstrap was installed before
    #[error("The bootstrap was already installed")]
    AlreadyInstalled,

    /// No runtime is attached to this process
    #[error("No runtime is attached")]
    NotAttached,

    /// A runtime is already attached to this process
    #[error("A runtime is already attached")]
    AlreadyAttached,

    /// A lock was poisoned by a panicking thread
    #[error("Lock poisoned: {0}")]
    Poisoned(&'static str),

    /// A plugin module could not be loaded
    #[error("Could not load plugin {path}: {reason}")]
    PluginLoad { path: PathBuf, reason: String },

    /// No plugin with this name is registered
    #[error("No plugin named {0} is registered")]
    UnknownPlugin(String),

    /// Could not (de)serialize JSON
    #[error("Could not (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The logger could not be installed
    #[error("Could not set up the logger: {0}")]
    Logger(String),
}

impl InjectError {
    /// Wraps the last OS error of the calling thread for a failed platform call
    pub fn last_os_error(call: &'static str) -> Self {
        InjectError::PlatformCall {
            call,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Returns the raw OS error code if this error came from a platform call
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            InjectError::PlatformCall { source, .. } | InjectError::ProtectionChange { source, .. } => {
                source.raw_os_error()
            }
            InjectError::Io(e) => e.raw_os_error(),
            #[cfg(target_os = "linux")]
            InjectError::Os(e) => Some(*e as i32),
            _ => None,
        }
    }
}
