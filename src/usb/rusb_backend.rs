//! `rusb` (libusb) implementation of [`super::UsbTransport`].

use super::{UsbError, UsbTransport};
use crate::device::{DeviceKind, InterfaceKind, APPLE_VENDOR_ID};
use std::time::Duration;

pub struct RusbTransport {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
}

impl RusbTransport {
    /// Opens the first Apple device whose product ID matches a known
    /// `(DeviceKind, InterfaceKind)` pair and returns it alongside that
    /// identification, mirroring the historical tool's bus scan.
    pub fn find_any() -> Result<(Self, DeviceKind, InterfaceKind), UsbError> {
        for device in rusb::devices()
            .map_err(|e| UsbError::Descriptor(e.to_string()))?
            .iter()
        {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != APPLE_VENDOR_ID {
                continue;
            }
            if let Some((kind, iface)) = DeviceKind::from_product_id(descriptor.product_id()) {
                let handle = device.open().map_err(|e| UsbError::Transfer(e.to_string()))?;
                return Ok((Self { handle }, kind, iface));
            }
        }
        Err(UsbError::NotFound { vendor: APPLE_VENDOR_ID, product: 0 })
    }

    pub fn open(kind: DeviceKind, iface: InterfaceKind) -> Result<Self, UsbError> {
        let product = kind.product_id(iface);
        let handle = rusb::open_device_with_vid_pid(APPLE_VENDOR_ID, product)
            .ok_or(UsbError::NotFound { vendor: APPLE_VENDOR_ID, product })?;
        Ok(Self { handle })
    }
}

fn map_transfer_err(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Timeout => UsbError::Timeout,
        other => UsbError::Transfer(other.to_string()),
    }
}

impl UsbTransport for RusbTransport {
    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.handle
            .write_control(request_type, request, value, index, data, timeout)
            .map_err(map_transfer_err)
    }

    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        self.handle
            .read_control(request_type, request, value, index, buf, timeout)
            .map_err(map_transfer_err)
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, UsbError> {
        self.handle
            .write_bulk(endpoint, data, timeout)
            .map_err(map_transfer_err)
    }

    fn bulk_in(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbError> {
        self.handle
            .read_bulk(endpoint, buf, timeout)
            .map_err(map_transfer_err)
    }
}
