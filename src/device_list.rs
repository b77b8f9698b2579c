//! Enumeration of connected TimsSDR devices.

use rusb::{Context, DeviceHandle, UsbContext};

use crate::constants::{PRODUCT_ID, USB_MAX_SERIAL_LENGTH, USB_OPERATION_TIMEOUT, VENDOR_ID};
use crate::device::Device;
use crate::error::{Error, Result};

/// Hardware identification derived from the USB product id, usable without
/// opening the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbBoardId {
    /// F232R-based TimsSDR board.
    F232R,
}

impl UsbBoardId {
    fn from_product_id(product_id: u16) -> Option<Self> {
        match product_id {
            PRODUCT_ID => Some(UsbBoardId::F232R),
            _ => None,
        }
    }

    /// The USB product id behind this board id.
    pub fn product_id(self) -> u16 {
        match self {
            UsbBoardId::F232R => PRODUCT_ID,
        }
    }
}

/// One detected TimsSDR.
pub struct DeviceListEntry {
    device: rusb::Device<Context>,
    serial_number: Option<String>,
    board_id: UsbBoardId,
}

impl DeviceListEntry {
    /// The device's serial number, if it could be read during enumeration.
    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    pub fn board_id(&self) -> UsbBoardId {
        self.board_id
    }
}

/// A list of detected TimsSDR devices.
pub struct DeviceList {
    context: Context,
    entries: Vec<DeviceListEntry>,
}

impl DeviceList {
    /// Scans the bus for TimsSDR devices.
    ///
    /// Serial numbers are read opportunistically; devices that cannot be
    /// opened for the string read are still listed, without one.
    pub fn new() -> Result<Self> {
        let context = crate::context::global()?;
        let mut entries = Vec::new();
        for device in context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != VENDOR_ID {
                continue;
            }
            let board_id = match UsbBoardId::from_product_id(descriptor.product_id()) {
                Some(board_id) => board_id,
                None => continue,
            };
            let serial_number = device
                .open()
                .ok()
                .and_then(|handle| read_serial_number(&handle));
            entries.push(DeviceListEntry {
                device,
                serial_number,
                board_id,
            });
        }
        Ok(DeviceList { context, entries })
    }

    /// Number of TimsSDRs found.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The detected devices, in bus-enumeration order.
    pub fn entries(&self) -> &[DeviceListEntry] {
        &self.entries
    }

    /// Opens the device at `index` in this list.
    pub fn open(&self, index: usize) -> Result<Device> {
        let entry = self.entries.get(index).ok_or(Error::InvalidParam)?;
        let handle = entry.device.open()?;
        Device::open_setup(self.context.clone(), handle)
    }
}

/// Best-effort read of the serial-number string descriptor, capped to the
/// length the library reports.
pub(crate) fn read_serial_number(handle: &DeviceHandle<Context>) -> Option<String> {
    let descriptor = handle.device().device_descriptor().ok()?;
    let languages = handle.read_languages(USB_OPERATION_TIMEOUT).ok()?;
    let language = languages.first().copied()?;
    let mut serial = handle
        .read_serial_number_string(language, &descriptor, USB_OPERATION_TIMEOUT)
        .ok()?;
    serial.truncate(USB_MAX_SERIAL_LENGTH);
    Some(serial)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_ids_round_trip_product_ids() {
        assert_eq!(UsbBoardId::from_product_id(0x6014), Some(UsbBoardId::F232R));
        assert_eq!(UsbBoardId::from_product_id(0x6010), None);
        assert_eq!(UsbBoardId::F232R.product_id(), 0x6014);
    }
}
