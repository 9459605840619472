//! # coreinject
//!
//! Attaches independently built plugin modules to a host executable before the host's own
//! code runs.
//!
//! The runtime module is loaded into the host process before its entry point executes. It
//! hooks the entry point, loads and starts the plugins when the host reaches it, and then
//! restores the host so it starts normally. The building blocks are usable on their own:
//!
//! - [`patch`]: temporarily writable code pages
//! - [`stomp`]: redirecting a function with a jump written over its first bytes
//! - [`hwbp`]: hardware watchpoints through the debug registers
//! - [`image`]: locating the entry point and TLS callbacks of a mapped PE image
//! - [`plugins`]: loading plugins and broadcasting events to them
//!
//! Only x86 and x86-64 are supported.

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
compile_error!("coreinject only supports x86 and x86_64");

pub mod addr;
pub mod bootstrap;
pub mod config;
pub mod disassemble;
#[cfg(windows)]
pub mod entry;
pub mod errors;
pub mod hwbp;
pub mod image;
pub mod logging;
pub mod patch;
pub mod plugins;
pub mod runtime;
pub mod stomp;

#[cfg(all(test, target_os = "linux", target_pointer_width = "64"))]
mod test_utils;

pub use errors::Result;
