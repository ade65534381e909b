//! Host-side DFU exploit and firmware tooling for the N3G-N7G family of
//! devices.
//!
//! The crate is split the way `blri` is: this library holds every
//! protocol, format, and exploit primitive; `src/bin/dfuhax.rs` is a thin
//! clap wrapper around [`flows`].

pub mod asm;
pub mod config;
pub mod device;
pub mod dfu;
pub mod efi;
pub mod error;
pub mod exploit;
pub mod flows;
pub mod img1;
pub mod mse;
pub mod syscfg;
pub mod usb;
pub mod usbms;

pub use error::{Error, Result};
