//! Device constants: USB identity, endpoint addresses and the geometry of
//! the streaming transfer ring.

use std::time::Duration;

use rusb::constants::{LIBUSB_ENDPOINT_IN, LIBUSB_ENDPOINT_OUT};

/// FTDI vendor id used by the TimsSDR board.
pub const VENDOR_ID: u16 = 0x0403;
/// Product id of the F232R-based TimsSDR board.
pub const PRODUCT_ID: u16 = 0x6014;

/// Timeout applied to control requests against the device.
///
/// The bulk streaming path never waits on this; it is reserved for board
/// queries issued outside of streaming.
pub const USB_OPERATION_TIMEOUT: Duration = Duration::from_millis(4000);

/// The configuration the device must be in before interface 0 is claimed.
pub(crate) const USB_CONFIG_STANDARD: u8 = 1;

/// Bulk IN endpoint carrying received samples.
///
/// The device firmware streams on endpoint 1 IN (0x81).
pub const RX_ENDPOINT_ADDRESS: u8 = LIBUSB_ENDPOINT_IN | 1;

/// Bulk OUT endpoint accepting samples for transmission.
pub const TX_ENDPOINT_ADDRESS: u8 = LIBUSB_ENDPOINT_OUT | 2;

/// Number of bulk transfers kept in flight per direction.
pub const TRANSFER_COUNT: usize = 4;

/// Size in bytes of each transfer buffer in the ring.
pub const TRANSFER_BUFFER_SIZE: usize = 262_144;

/// Size of the device's internal buffer, and therefore of the zero-filled
/// flush transfer that drains it at end of transmission.
pub const DEVICE_BUFFER_SIZE: usize = 32_768;

/// Bulk OUT writes must be a whole number of max-size packets; short writes
/// are padded with zeros up to this boundary.
pub(crate) const USB_PACKET_SIZE: usize = 512;

/// How long the event pump waits inside the transport before re-checking
/// its exit flag.
pub(crate) const EVENT_PUMP_TICK: Duration = Duration::from_millis(500);

/// Longest serial-number string the library will report.
pub(crate) const USB_MAX_SERIAL_LENGTH: usize = 32;
