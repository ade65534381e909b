//! Backend-agnostic USB transport (component A).
//!
//! The historical tool talks to the device exclusively through libusb.
//! `UsbTransport` factors that down to the handful of primitives the
//! exploit, DFU, and mass-storage layers actually need, the way
//! `blri::isp::IspCommand` factors serial framing down to
//! `write_packet_data`/`parse_response`. This keeps `rusb` out of the
//! signatures of every other module and gives tests a seam to mock.

pub mod rusb_backend;

use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum UsbError {
    #[error("no device matched vendor={vendor:#06x} product={product:#06x}")]
    NotFound { vendor: u16, product: u16 },
    #[error("USB control transfer failed: {0}")]
    Transfer(String),
    #[error("USB transfer timed out")]
    Timeout,
    #[error("device descriptor could not be read: {0}")]
    Descriptor(String),
    #[error("device was deliberately disconnected mid-transfer by the exploit's unacknowledged request (expected)")]
    ExpectedDisconnect,
}

/// Direction/type/recipient byte layout matches the USB spec's
/// `bmRequestType`; exposed as named constants rather than a bitflag type
/// since only a few combinations are ever used here.
pub mod request_type {
    pub const HOST_TO_DEVICE_CLASS_INTERFACE: u8 = 0x21;
    pub const DEVICE_TO_HOST_CLASS_INTERFACE: u8 = 0xA1;
    pub const HOST_TO_DEVICE_VENDOR_DEVICE: u8 = 0x40;
    pub const HOST_TO_DEVICE_STANDARD_DEVICE: u8 = 0x00;
}

/// Everything the upper layers need from a USB connection. Implemented by
/// [`rusb_backend::RusbTransport`]; tests can provide an in-memory fake.
pub trait UsbTransport {
    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError>;

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, UsbError>;
    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbError>;

    /// Sends a control transfer that the device is known not to
    /// acknowledge (the overflow primitive's SETUP packet). A timeout here
    /// is the expected, successful outcome; any other error still
    /// propagates.
    fn control_out_expect_no_ack(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), UsbError> {
        match self.control_out(request_type, request, value, index, data, timeout) {
            Ok(_) => Ok(()),
            Err(UsbError::Timeout) => Ok(()),
            Err(other) => Err(other),
        }
    }
}
