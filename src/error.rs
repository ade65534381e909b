//! Aggregated error type for the core library.
//!
//! Mirrors `blri::Error`: every producing module gets its own `thiserror`
//! enum, and this type stitches them together with `#[from]` so callers at
//! the flow/CLI layer only ever match on one type.

use crate::asm::AsmError;
use crate::dfu::DfuError;
use crate::efi::compression::CompressionError;
use crate::efi::patch::PatchError;
use crate::efi::EfiError;
use crate::exploit::ExploitError;
use crate::img1::Img1Error;
use crate::mse::MseError;
use crate::syscfg::SyscfgError;
use crate::usb::UsbError;
use crate::usbms::ScsiError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no matching device found on the bus")]
    NoDeviceFound,
    #[error("connected device does not match any known device kind")]
    UnknownDeviceKind,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Usb(#[from] UsbError),
    #[error(transparent)]
    Asm(#[from] AsmError),
    #[error(transparent)]
    Dfu(#[from] DfuError),
    #[error(transparent)]
    Exploit(#[from] ExploitError),
    #[error(transparent)]
    Img1(#[from] Img1Error),
    #[error(transparent)]
    Mse(#[from] MseError),
    #[error(transparent)]
    Efi(#[from] EfiError),
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Scsi(#[from] ScsiError),
    #[error(transparent)]
    Syscfg(#[from] SyscfgError),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = core::result::Result<T, Error>;
