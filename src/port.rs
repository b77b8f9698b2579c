//! The bulk-USB port the streaming engine drives: a fixed ring of
//! pre-allocated bulk transfers plus an optional flush transfer, behind a
//! trait so the engine state machine is independent of the transport.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::slice;
use std::sync::{Mutex, Weak};
use std::time::Duration;

use libc::{c_int, c_void};
use rusb::constants::{
    LIBUSB_ERROR_BUSY, LIBUSB_ERROR_INVALID_PARAM, LIBUSB_ERROR_IO, LIBUSB_ERROR_NOT_SUPPORTED,
    LIBUSB_ERROR_NO_DEVICE, LIBUSB_ERROR_NO_MEM, LIBUSB_TRANSFER_CANCELLED,
    LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_ERROR, LIBUSB_TRANSFER_NO_DEVICE,
    LIBUSB_TRANSFER_OVERFLOW, LIBUSB_TRANSFER_STALL, LIBUSB_TRANSFER_TIMED_OUT,
};
use rusb::{ffi, Context, DeviceHandle, UsbContext};

use crate::constants::{DEVICE_BUFFER_SIZE, TRANSFER_BUFFER_SIZE, TRANSFER_COUNT, TX_ENDPOINT_ADDRESS};
use crate::error::{Error, Result};

/// Final state of a finished bulk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Completed without error.
    Completed,
    /// Failed (IO error).
    Error,
    /// Timed out.
    TimedOut,
    /// Cancelled.
    Cancelled,
    /// Endpoint stalled.
    Stall,
    /// Device was disconnected.
    NoDevice,
    /// Device sent more data than requested.
    Overflow,
}

impl TransferStatus {
    fn from_libusb(status: c_int) -> Self {
        match status {
            LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
            LIBUSB_TRANSFER_ERROR => TransferStatus::Error,
            LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
            LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
            LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
            LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
            LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
            _ => TransferStatus::Error,
        }
    }
}

/// Where a port delivers its completions.
///
/// Implemented by the streaming engine; the port holds only a weak
/// reference, so the engine owning the port does not form a cycle.
pub trait CompletionSink: Send + Sync {
    /// An ordinary ring transfer finished with `status`, having moved
    /// `actual_length` bytes.
    fn transfer_done(&self, slot: usize, status: TransferStatus, actual_length: usize);

    /// The flush transfer finished with `status`.
    fn flush_done(&self, status: TransferStatus);
}

/// A bulk-USB port: the transport capability the streaming engine consumes.
///
/// A port owns a fixed ring of transfer slots with stable backing buffers,
/// an optional flush transfer, and the transport's event loop. Completions
/// are delivered, in submission order per endpoint, to the attached
/// [`CompletionSink`] from within [`BulkPort::handle_events`].
pub trait BulkPort: Send + Sync + 'static {
    /// Number of slots in the ring.
    fn slot_count(&self) -> usize;

    /// Capacity in bytes of each slot buffer.
    fn slot_len(&self) -> usize;

    /// Borrows a slot's backing buffer.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the slot is not submitted to the
    /// transport and that no other borrow of the buffer exists. The engine
    /// upholds this by only touching buffers before first submission or
    /// between a transfer's completion and its resubmission, under the
    /// transfer lock.
    unsafe fn slot_buffer(&self, slot: usize) -> &mut [u8];

    /// Wires the ring's completions to `sink`. Called once, before any
    /// submission.
    fn attach(&self, sink: Weak<dyn CompletionSink>);

    /// Submits `length` bytes of the slot's buffer on `endpoint`.
    fn submit(&self, slot: usize, endpoint: u8, length: usize) -> Result<()>;

    /// Requests cancellation of a slot's in-flight transfer. A transfer that
    /// is not in flight is left alone.
    fn cancel(&self, slot: usize);

    /// True once [`BulkPort::enable_flush`] has allocated the flush transfer.
    fn flush_enabled(&self) -> bool;

    /// Allocates the zero-filled flush transfer. Idempotent.
    fn enable_flush(&self) -> Result<()>;

    /// Frees the flush transfer. Must not be called while it is in flight.
    fn disable_flush(&self);

    /// Submits the flush transfer on the TX endpoint.
    fn submit_flush(&self) -> Result<()>;

    /// Requests cancellation of an in-flight flush transfer.
    fn cancel_flush(&self);

    /// Runs one batch of transport event handling, waiting at most
    /// `timeout` for activity. Completion callbacks fire on the calling
    /// thread.
    fn handle_events(&self, timeout: Duration) -> Result<()>;

    /// Wakes a thread blocked in [`BulkPort::handle_events`].
    fn interrupt(&self);
}

fn submit_error(err: c_int) -> Error {
    Error::Usb(match err {
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_IO => rusb::Error::Io,
        _ => rusb::Error::Other,
    })
}

/// Per-slot context handed to libusb as `user_data`. Boxed so its address
/// stays stable while transfers are in flight.
struct SlotData {
    sink: Weak<dyn CompletionSink>,
    slot: usize,
}

struct FlushData {
    sink: Weak<dyn CompletionSink>,
}

extern "system" fn ring_transfer_callback(transfer: *mut ffi::libusb_transfer) {
    if transfer.is_null() {
        return;
    }
    // SAFETY: libusb hands back the transfer we filled; its user_data points
    // at a SlotData that outlives every submission of this transfer.
    let (sink, slot, status, actual_length) = unsafe {
        let transfer = &*transfer;
        let data = &*(transfer.user_data as *const SlotData);
        (
            data.sink.clone(),
            data.slot,
            transfer.status,
            transfer.actual_length.max(0) as usize,
        )
    };
    if let Some(sink) = sink.upgrade() {
        sink.transfer_done(slot, TransferStatus::from_libusb(status), actual_length);
    }
}

extern "system" fn flush_transfer_callback(transfer: *mut ffi::libusb_transfer) {
    if transfer.is_null() {
        return;
    }
    // SAFETY: as above, user_data points at the FlushData owned by the
    // flush slot.
    let (sink, status) = unsafe {
        let transfer = &*transfer;
        let data = &*(transfer.user_data as *const FlushData);
        (data.sink.clone(), transfer.status)
    };
    if let Some(sink) = sink.upgrade() {
        sink.flush_done(TransferStatus::from_libusb(status));
    }
}

struct Slot {
    transfer: NonNull<ffi::libusb_transfer>,
    buffer: UnsafeCell<Box<[u8]>>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        // SAFETY: the device has cancelled and drained all transfers before
        // the port is dropped, so the transfer is no longer owned by libusb.
        unsafe { ffi::libusb_free_transfer(self.transfer.as_ptr()) };
    }
}

struct FlushSlot {
    transfer: NonNull<ffi::libusb_transfer>,
    _buffer: UnsafeCell<Box<[u8]>>,
    _data: Box<FlushData>,
}

impl Drop for FlushSlot {
    fn drop(&mut self) {
        // SAFETY: freed only by disable_flush (which refuses while a flush
        // is pending) or after the close-path drain.
        unsafe { ffi::libusb_free_transfer(self.transfer.as_ptr()) };
    }
}

/// The libusb-backed bulk port used by opened devices.
pub struct UsbPort {
    context: Context,
    handle: DeviceHandle<Context>,
    slots: Vec<Slot>,
    slot_data: Mutex<Vec<Box<SlotData>>>,
    flush: Mutex<Option<FlushSlot>>,
    sink: Mutex<Option<Weak<dyn CompletionSink>>>,
}

// SAFETY: the raw transfer objects are only touched through the engine's
// locking discipline (one submitter at a time per slot, buffers untouched
// while in flight) and libusb's own API is thread safe.
unsafe impl Send for UsbPort {}
unsafe impl Sync for UsbPort {}

impl UsbPort {
    /// Allocates the transfer ring against an opened, claimed device handle.
    pub(crate) fn new(context: Context, handle: DeviceHandle<Context>) -> Result<Self> {
        let mut slots = Vec::with_capacity(TRANSFER_COUNT);
        for _ in 0..TRANSFER_COUNT {
            let transfer =
                NonNull::new(unsafe { ffi::libusb_alloc_transfer(0) }).ok_or(Error::NoMem)?;
            slots.push(Slot {
                transfer,
                buffer: UnsafeCell::new(vec![0u8; TRANSFER_BUFFER_SIZE].into_boxed_slice()),
            });
        }
        Ok(UsbPort {
            context,
            handle,
            slots,
            slot_data: Mutex::new(Vec::new()),
            flush: Mutex::new(None),
            sink: Mutex::new(None),
        })
    }
}

impl BulkPort for UsbPort {
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot_len(&self) -> usize {
        TRANSFER_BUFFER_SIZE
    }

    unsafe fn slot_buffer(&self, slot: usize) -> &mut [u8] {
        let buffer = self.slots[slot].buffer.get();
        slice::from_raw_parts_mut((*buffer).as_mut_ptr(), (&*buffer).len())
    }

    fn attach(&self, sink: Weak<dyn CompletionSink>) {
        let mut slot_data = self.slot_data.lock().unwrap();
        slot_data.clear();
        for (index, slot) in self.slots.iter().enumerate() {
            let data = Box::new(SlotData {
                sink: sink.clone(),
                slot: index,
            });
            // SAFETY: transfer and buffer are valid for the life of the
            // port; the endpoint is set per submission.
            unsafe {
                ffi::libusb_fill_bulk_transfer(
                    slot.transfer.as_ptr(),
                    self.handle.as_raw(),
                    0,
                    (*slot.buffer.get()).as_mut_ptr(),
                    (&*slot.buffer.get()).len() as c_int,
                    ring_transfer_callback,
                    &*data as *const SlotData as *mut c_void,
                    0,
                );
            }
            slot_data.push(data);
        }
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn submit(&self, slot: usize, endpoint: u8, length: usize) -> Result<()> {
        let transfer = self.slots[slot].transfer.as_ptr();
        // SAFETY: the caller guarantees the slot is not in flight.
        unsafe {
            (*transfer).endpoint = endpoint;
            (*transfer).length = length as c_int;
            match ffi::libusb_submit_transfer(transfer) {
                0 => Ok(()),
                err => Err(submit_error(err)),
            }
        }
    }

    fn cancel(&self, slot: usize) {
        // Cancelling a transfer that is not in flight reports NOT_FOUND,
        // which is of no interest here.
        unsafe { ffi::libusb_cancel_transfer(self.slots[slot].transfer.as_ptr()) };
    }

    fn flush_enabled(&self) -> bool {
        self.flush.lock().unwrap().is_some()
    }

    fn enable_flush(&self) -> Result<()> {
        let sink = self
            .sink
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::Other)?;
        let mut flush = self.flush.lock().unwrap();
        if flush.is_some() {
            return Ok(());
        }
        let transfer =
            NonNull::new(unsafe { ffi::libusb_alloc_transfer(0) }).ok_or(Error::NoMem)?;
        let buffer = UnsafeCell::new(vec![0u8; DEVICE_BUFFER_SIZE].into_boxed_slice());
        let data = Box::new(FlushData { sink });
        // SAFETY: transfer, buffer and data live as long as the flush slot.
        unsafe {
            ffi::libusb_fill_bulk_transfer(
                transfer.as_ptr(),
                self.handle.as_raw(),
                TX_ENDPOINT_ADDRESS,
                (*buffer.get()).as_mut_ptr(),
                DEVICE_BUFFER_SIZE as c_int,
                flush_transfer_callback,
                &*data as *const FlushData as *mut c_void,
                0,
            );
        }
        *flush = Some(FlushSlot {
            transfer,
            _buffer: buffer,
            _data: data,
        });
        Ok(())
    }

    fn disable_flush(&self) {
        self.flush.lock().unwrap().take();
    }

    fn submit_flush(&self) -> Result<()> {
        let flush = self.flush.lock().unwrap();
        let slot = flush.as_ref().ok_or(Error::Other)?;
        // SAFETY: the flush transfer stays allocated while a submission can
        // be outstanding.
        match unsafe { ffi::libusb_submit_transfer(slot.transfer.as_ptr()) } {
            0 => Ok(()),
            err => Err(submit_error(err)),
        }
    }

    fn cancel_flush(&self) {
        let flush = self.flush.lock().unwrap();
        if let Some(slot) = flush.as_ref() {
            unsafe { ffi::libusb_cancel_transfer(slot.transfer.as_ptr()) };
        }
    }

    fn handle_events(&self, timeout: Duration) -> Result<()> {
        self.context.handle_events(Some(timeout)).map_err(Error::from)
    }

    fn interrupt(&self) {
        unsafe { ffi::libusb_interrupt_event_handler(self.context.as_raw()) };
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! An in-memory port that plays the role of an infinitely fast device:
    //! every submission is acknowledged as a full completion delivered in
    //! submission order by `handle_events`.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Condvar, Mutex, Weak};
    use std::time::Duration;

    use super::{BulkPort, CompletionSink, TransferStatus};
    use crate::constants::{TRANSFER_BUFFER_SIZE, TRANSFER_COUNT};
    use crate::error::{Error, Result};

    /// One submission as seen by the fake device.
    #[derive(Clone)]
    pub(crate) struct SubmitRecord {
        pub endpoint: u8,
        pub length: usize,
        /// Copy of the first 512 submitted bytes, for padding assertions.
        pub head: Vec<u8>,
    }

    enum MockEvent {
        Slot {
            slot: usize,
            status: TransferStatus,
            actual_length: usize,
        },
        Flush {
            status: TransferStatus,
        },
    }

    struct MockState {
        queue: VecDeque<MockEvent>,
        submissions: Vec<SubmitRecord>,
        flush_submissions: usize,
        flush_allocated: bool,
        flush_pending: bool,
    }

    pub(crate) struct MockPort {
        buffers: Vec<std::cell::UnsafeCell<Box<[u8]>>>,
        state: Mutex<MockState>,
        events: Condvar,
        sink: Mutex<Option<Weak<dyn CompletionSink>>>,
        flush_allocations: AtomicUsize,
    }

    // SAFETY: buffer access follows the same exclusive-access contract as
    // the real port; everything else is behind mutexes.
    unsafe impl Send for MockPort {}
    unsafe impl Sync for MockPort {}

    impl MockPort {
        pub(crate) fn new() -> Self {
            MockPort {
                buffers: (0..TRANSFER_COUNT)
                    .map(|_| {
                        std::cell::UnsafeCell::new(
                            vec![0u8; TRANSFER_BUFFER_SIZE].into_boxed_slice(),
                        )
                    })
                    .collect(),
                state: Mutex::new(MockState {
                    queue: VecDeque::new(),
                    submissions: Vec::new(),
                    flush_submissions: 0,
                    flush_allocated: false,
                    flush_pending: false,
                }),
                events: Condvar::new(),
                sink: Mutex::new(None),
                flush_allocations: AtomicUsize::new(0),
            }
        }

        pub(crate) fn submissions(&self) -> Vec<SubmitRecord> {
            self.state.lock().unwrap().submissions.clone()
        }

        pub(crate) fn flush_submissions(&self) -> usize {
            self.state.lock().unwrap().flush_submissions
        }

        pub(crate) fn flush_allocations(&self) -> usize {
            self.flush_allocations.load(Ordering::SeqCst)
        }

        fn current_sink(&self) -> Option<std::sync::Arc<dyn CompletionSink>> {
            self.sink
                .lock()
                .unwrap()
                .clone()
                .and_then(|weak| weak.upgrade())
        }
    }

    impl BulkPort for MockPort {
        fn slot_count(&self) -> usize {
            self.buffers.len()
        }

        fn slot_len(&self) -> usize {
            TRANSFER_BUFFER_SIZE
        }

        unsafe fn slot_buffer(&self, slot: usize) -> &mut [u8] {
            let buffer = self.buffers[slot].get();
            std::slice::from_raw_parts_mut((*buffer).as_mut_ptr(), (&*buffer).len())
        }

        fn attach(&self, sink: Weak<dyn CompletionSink>) {
            *self.sink.lock().unwrap() = Some(sink);
        }

        fn submit(&self, slot: usize, endpoint: u8, length: usize) -> Result<()> {
            let head_len = length.min(512);
            // SAFETY: the engine guarantees exclusive access at submit time.
            let head = unsafe { self.slot_buffer(slot)[..head_len].to_vec() };
            let mut state = self.state.lock().unwrap();
            state.submissions.push(SubmitRecord {
                endpoint,
                length,
                head,
            });
            state.queue.push_back(MockEvent::Slot {
                slot,
                status: TransferStatus::Completed,
                actual_length: length,
            });
            self.events.notify_all();
            Ok(())
        }

        fn cancel(&self, slot: usize) {
            let mut state = self.state.lock().unwrap();
            for event in state.queue.iter_mut() {
                if let MockEvent::Slot {
                    slot: queued,
                    status,
                    ..
                } = event
                {
                    if *queued == slot {
                        *status = TransferStatus::Cancelled;
                    }
                }
            }
            self.events.notify_all();
        }

        fn flush_enabled(&self) -> bool {
            self.state.lock().unwrap().flush_allocated
        }

        fn enable_flush(&self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if !state.flush_allocated {
                state.flush_allocated = true;
                self.flush_allocations.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn disable_flush(&self) {
            self.state.lock().unwrap().flush_allocated = false;
        }

        fn submit_flush(&self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if !state.flush_allocated {
                return Err(Error::Other);
            }
            if state.flush_pending {
                return Err(Error::Usb(rusb::Error::Busy));
            }
            state.flush_pending = true;
            state.flush_submissions += 1;
            state.queue.push_back(MockEvent::Flush {
                status: TransferStatus::Completed,
            });
            self.events.notify_all();
            Ok(())
        }

        fn cancel_flush(&self) {
            let mut state = self.state.lock().unwrap();
            for event in state.queue.iter_mut() {
                if let MockEvent::Flush { status } = event {
                    *status = TransferStatus::Cancelled;
                }
            }
            self.events.notify_all();
        }

        fn handle_events(&self, timeout: Duration) -> Result<()> {
            let event = {
                let mut state = self.state.lock().unwrap();
                if state.queue.is_empty() {
                    let wait = timeout.min(Duration::from_millis(20));
                    let (guard, _) = self.events.wait_timeout(state, wait).unwrap();
                    state = guard;
                }
                let event = state.queue.pop_front();
                if matches!(event, Some(MockEvent::Flush { .. })) {
                    state.flush_pending = false;
                }
                event
            };
            // Dispatch without holding the mock's lock; the sink takes the
            // engine's transfer lock.
            if let Some(event) = event {
                if let Some(sink) = self.current_sink() {
                    match event {
                        MockEvent::Slot {
                            slot,
                            status,
                            actual_length,
                        } => {
                            let actual_length = if status == TransferStatus::Completed {
                                actual_length
                            } else {
                                0
                            };
                            sink.transfer_done(slot, status, actual_length);
                        }
                        MockEvent::Flush { status } => sink.flush_done(status),
                    }
                }
            }
            Ok(())
        }

        fn interrupt(&self) {
            self.events.notify_all();
        }
    }
}
