//! The owning device handle: open/close lifecycle and the streaming
//! coordinator's public surface.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use rusb::{Context, DeviceHandle, UsbContext};

use crate::constants::{
    PRODUCT_ID, RX_ENDPOINT_ADDRESS, TX_ENDPOINT_ADDRESS, USB_CONFIG_STANDARD,
    USB_MAX_SERIAL_LENGTH, VENDOR_ID,
};
use crate::device_list::read_serial_number;
use crate::error::{Error, Result};
use crate::port::{BulkPort, CompletionSink, UsbPort};
use crate::stream::StreamCore;
use crate::transfer::{StreamControl, StreamTransfer};

/// Board part id and serial number, as reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartIdSerialNo {
    /// MCU part ID register value.
    pub part_id: [u32; 2],
    /// MCU device unique ID.
    pub serial_no: [u32; 4],
}

/// An open TimsSDR device.
///
/// The handle is move-only and owns the transfer ring, the event-pump worker
/// and the USB device handle. Dropping it (or calling [`Device::close`])
/// cancels any in-flight transfers, drains their completions, stops the
/// worker and releases the device.
///
/// Streaming callbacks run on the event-pump worker and must not call back
/// into the library; they are handed a short-lived [`StreamTransfer`] that
/// cannot outlive the invocation.
pub struct Device<P: BulkPort = UsbPort> {
    core: Arc<StreamCore<P>>,
    pump: Option<JoinHandle<()>>,
    counted: bool,
}

impl Device<UsbPort> {
    /// Opens the first TimsSDR found on the bus.
    pub fn open() -> Result<Self> {
        let context = crate::context::global()?;
        let handle = context
            .open_device_with_vid_pid(VENDOR_ID, PRODUCT_ID)
            .ok_or(Error::NotFound)?;
        Device::open_setup(context, handle)
    }

    /// Opens the TimsSDR whose serial number ends with `desired_serial`.
    ///
    /// `None` falls back to [`Device::open`].
    pub fn open_by_serial(desired_serial: Option<&str>) -> Result<Self> {
        let desired = match desired_serial {
            Some(desired) => desired,
            None => return Device::open(),
        };
        if desired.len() > USB_MAX_SERIAL_LENGTH {
            return Err(Error::NotFound);
        }

        let context = crate::context::global()?;
        for device in context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != VENDOR_ID || descriptor.product_id() != PRODUCT_ID {
                continue;
            }
            let handle = match device.open() {
                Ok(handle) => handle,
                Err(_) => continue,
            };
            match read_serial_number(&handle) {
                Some(serial) if serial.ends_with(desired) => {
                    return Device::open_setup(context, handle);
                }
                _ => {}
            }
        }
        Err(Error::NotFound)
    }

    /// Configures an opened USB handle and builds the streaming machinery
    /// around it: configuration 1, interface 0 claimed, ring allocated,
    /// event pump started. Failures unwind through the handle's drop.
    pub(crate) fn open_setup(context: Context, mut handle: DeviceHandle<Context>) -> Result<Self> {
        set_standard_configuration(&mut handle)?;
        handle.claim_interface(0)?;

        let port = UsbPort::new(context, handle)?;
        let mut device = Device::from_port(port)?;
        device.counted = true;
        crate::context::device_opened();
        Ok(device)
    }
}

impl<P: BulkPort> Device<P> {
    /// Builds a device around an already-configured bulk port and starts its
    /// event-pump worker. This is the seam the libusb-backed open paths go
    /// through; alternative transports enter here.
    pub fn from_port(port: P) -> Result<Self> {
        let core = Arc::new(StreamCore::new(port));
        let sink: Weak<dyn CompletionSink> = Arc::downgrade(&(Arc::clone(&core) as Arc<dyn CompletionSink>));
        core.port.attach(sink);

        core.streaming.store(false, Ordering::SeqCst);
        core.do_exit.store(false, Ordering::SeqCst);

        let worker = Arc::clone(&core);
        let pump = thread::Builder::new()
            .name("timssdr-transfer".into())
            .spawn(move || worker.pump_loop())
            .map_err(|_| Error::Thread)?;
        core.transfer_thread_started
            .store(true, Ordering::SeqCst);

        Ok(Device {
            core,
            pump: Some(pump),
            counted: false,
        })
    }

    /// Starts receiving.
    ///
    /// `callback` is invoked on the event-pump worker once per received
    /// buffer, with `valid_length` bytes of interleaved 8-bit I/Q samples,
    /// until it returns [`StreamControl::Stop`] or [`Device::stop_rx`] is
    /// called. In sweep mode each logical block inside the buffer begins
    /// with a 10-byte tuned-frequency header followed by samples; the
    /// library hands over the raw bytes and leaves that framing to the
    /// application.
    pub fn start_rx<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(&mut StreamTransfer<'_>) -> StreamControl + Send + 'static,
    {
        self.core.start(RX_ENDPOINT_ADDRESS, Box::new(callback))
    }

    /// Stops receiving, blocking until every in-flight transfer has
    /// drained.
    pub fn stop_rx(&self) -> Result<()> {
        self.core.cancel_transfers()
    }

    /// Starts transmitting.
    ///
    /// `callback` fills each buffer with samples and sets `valid_length`;
    /// short buffers are zero-padded to the endpoint's packet boundary
    /// before submission. If a flush transfer has been enabled with
    /// [`Device::enable_tx_flush`] it is armed for this session, and the
    /// application should wait for the flush callback before calling
    /// [`Device::stop_tx`] so that no trailing samples are cut off.
    pub fn start_tx<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(&mut StreamTransfer<'_>) -> StreamControl + Send + 'static,
    {
        self.core.start(TX_ENDPOINT_ADDRESS, Box::new(callback))
    }

    /// Stops transmitting, blocking until every in-flight transfer has
    /// drained.
    pub fn stop_tx(&self) -> Result<()> {
        self.core.cancel_transfers()
    }

    /// Installs a hook that observes every finished outbound transfer,
    /// successful or not, before the stream decides whether to refill it.
    pub fn set_tx_block_complete_callback<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(&StreamTransfer<'_>, bool) + Send + 'static,
    {
        self.core.set_block_complete_callback(Box::new(callback));
        Ok(())
    }

    /// Allocates the end-of-transmission flush transfer and installs its
    /// callback. Idempotent; must be called before `start_tx` to take
    /// effect for a session.
    pub fn enable_tx_flush<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(bool) + Send + 'static,
    {
        if !self.core.flush_idle() {
            return Err(Error::Busy);
        }
        self.core.set_flush_callback(Box::new(callback));
        self.core.port.enable_flush()
    }

    /// Frees the flush transfer and clears its callback.
    pub fn disable_tx_flush(&self) -> Result<()> {
        if !self.core.flush_idle() {
            return Err(Error::Busy);
        }
        self.core.port.disable_flush();
        self.core.clear_flush_callback();
        Ok(())
    }

    /// Queries streaming status without taking the transfer lock.
    ///
    /// `Ok(())` while streaming; otherwise one of
    /// [`Error::StreamingThreadErr`], [`Error::StreamingStopped`] or
    /// [`Error::StreamingExitCalled`] according to which flag is off. The
    /// observation is best-effort and may trail the true state briefly.
    pub fn is_streaming(&self) -> Result<()> {
        self.core.streaming_status()
    }

    /// Reads the MCU part id and serial number.
    // TODO: issue the FTDI EEPROM read; until then this reports the fixed
    // F232R identity.
    pub fn board_partid_serialno_read(&self) -> Result<PartIdSerialNo> {
        Ok(PartIdSerialNo {
            part_id: [0x60, 0x14],
            serial_no: [0; 4],
        })
    }

    /// Closes the device: cancels and drains transfers, stops the event
    /// pump and releases the USB handle. Dropping the handle does the same,
    /// discarding the result.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    /// Cancel, drain, stop the pump, and release the open-device count.
    /// Idempotent so that `close` and `Drop` compose.
    fn teardown(&mut self) -> Result<()> {
        let mut result = Ok(());

        if self
            .core
            .transfer_thread_started
            .load(Ordering::SeqCst)
        {
            // Blocks until the worker has handled every completion; Err here
            // only means no session was set up.
            let _ = self.core.cancel_transfers();

            self.core
                .do_exit
                .store(true, Ordering::SeqCst);
            // Wake the worker instead of waiting out its event timeout.
            self.core.port.interrupt();

            if let Some(pump) = self.pump.take() {
                if pump.join().is_err() {
                    result = Err(Error::Thread);
                }
            }
            self.core
                .transfer_thread_started
                .store(false, Ordering::SeqCst);
        }
        self.core
            .do_exit
            .store(false, Ordering::SeqCst);

        if self.counted {
            crate::context::device_closed();
            self.counted = false;
        }
        result
    }
}

impl<P: BulkPort> Drop for Device<P> {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

fn detach_kernel_drivers(handle: &mut DeviceHandle<Context>) -> Result<()> {
    if !rusb::supports_detach_kernel_driver() {
        return Ok(());
    }
    let config = handle.device().active_config_descriptor()?;
    for interface in 0..config.num_interfaces() {
        match handle.kernel_driver_active(interface) {
            Ok(true) => handle.detach_kernel_driver(interface)?,
            Ok(false) => {}
            Err(rusb::Error::NotSupported) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn set_standard_configuration(handle: &mut DeviceHandle<Context>) -> Result<()> {
    let current = handle.active_configuration()?;
    if current != USB_CONFIG_STANDARD {
        detach_kernel_drivers(handle)?;
        handle.set_active_configuration(USB_CONFIG_STANDARD)?;
    }
    detach_kernel_drivers(handle)
}
