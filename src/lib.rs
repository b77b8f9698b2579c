//! User-space driver library for TimsSDR software-defined-radio peripherals.
//!
//! The TimsSDR exposes an FTDI-class bulk USB interface (`0403:6014`) that
//! streams interleaved 8-bit I/Q sample pairs. This crate keeps a ring of
//! large bulk transfers in flight against that interface and hands each
//! completed buffer to an application callback, sustaining full-rate RX and
//! TX without drops:
//!
//! - [`Device::start_rx`] / [`Device::start_tx`] submit the whole ring and
//!   stream until the callback asks to stop or [`Device::stop_rx`] /
//!   [`Device::stop_tx`] cancel and drain it.
//! - [`Device::enable_tx_flush`] arms one extra zero-filled transfer that
//!   drains the device's internal buffer at end of transmission, so the last
//!   samples are not cut off; the flush callback signals when stopping is
//!   safe.
//! - A dedicated event-pump worker per device drives the USB transport;
//!   application threads never block except in the `stop_*`/close paths.
//!
//! Callbacks run on the event-pump worker. They must not call back into the
//! library, and the [`StreamTransfer`] descriptor they receive is only valid
//! for the duration of the invocation.
//!
//! Device discovery goes through [`DeviceList`], [`Device::open`] or
//! [`Device::open_by_serial`]. The transport is initialised lazily; an
//! explicit [`init`]/[`exit`] pair is available for applications that want
//! deterministic teardown, with [`exit`] refusing while devices are open.

pub mod constants;
mod context;
mod device;
mod device_list;
mod error;
mod port;
mod stream;
mod transfer;

pub use crate::context::{exit, init};
pub use crate::device::{Device, PartIdSerialNo};
pub use crate::device_list::{DeviceList, DeviceListEntry, UsbBoardId};
pub use crate::error::{Error, Result};
pub use crate::port::{BulkPort, CompletionSink, TransferStatus, UsbPort};
pub use crate::transfer::{
    BlockCompleteCallback, FlushCallback, SampleBlockCallback, StreamControl, StreamTransfer,
};

/// Library version, usable before [`init`].
pub fn library_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
