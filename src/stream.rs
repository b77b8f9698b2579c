//! The streaming engine: the per-device coordination state shared between
//! application threads and the event-pump worker, the transfer-completion
//! state machine, and the pump body itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crate::constants::{EVENT_PUMP_TICK, TX_ENDPOINT_ADDRESS};
use crate::error::{Error, Result};
use crate::port::{BulkPort, CompletionSink, TransferStatus};
use crate::transfer::{
    pad_to_packet, BlockCompleteCallback, FlushCallback, SampleBlockCallback, StreamControl,
    StreamTransfer,
};

/// State guarded by the transfer lock.
struct StreamState {
    /// True between a successful start and the beginning of cancellation.
    setup: bool,
    /// Transfers currently owned by the transport, flush excluded.
    active: usize,
    /// A flush transfer is pending or about to be submitted.
    flush: bool,
    /// The flush transfer is owned by the transport right now. Unlike
    /// `active`, survives disarming so the drain wait covers it.
    flush_in_flight: bool,
    /// Endpoint of the current session.
    endpoint: u8,
    /// The application's sample-block callback, invoked under the lock.
    callback: Option<SampleBlockCallback>,
}

/// Hook callbacks that run outside the transfer lock. Never locked together
/// with the transfer lock.
struct Hooks {
    block_complete: Option<BlockCompleteCallback>,
    flush: Option<FlushCallback>,
}

/// Shared core of an open device: one per device, referenced by the owning
/// handle and by the event-pump worker.
pub(crate) struct StreamCore<P: BulkPort> {
    pub(crate) port: P,
    state: Mutex<StreamState>,
    all_finished: Condvar,
    /// Readable without the lock by status queries.
    pub(crate) streaming: AtomicBool,
    pub(crate) do_exit: AtomicBool,
    pub(crate) transfer_thread_started: AtomicBool,
    hooks: Mutex<Hooks>,
}

impl<P: BulkPort> StreamCore<P> {
    pub(crate) fn new(port: P) -> Self {
        StreamCore {
            port,
            state: Mutex::new(StreamState {
                setup: false,
                active: 0,
                flush: false,
                flush_in_flight: false,
                endpoint: 0,
                callback: None,
            }),
            all_finished: Condvar::new(),
            streaming: AtomicBool::new(false),
            do_exit: AtomicBool::new(false),
            transfer_thread_started: AtomicBool::new(false),
            hooks: Mutex::new(Hooks {
                block_complete: None,
                flush: None,
            }),
        }
    }

    /// Starts a session on `endpoint`, arming the flush transfer for TX if
    /// one has been allocated.
    pub(crate) fn start(&self, endpoint: u8, callback: SampleBlockCallback) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.setup {
                return Err(Error::Busy);
            }
            if endpoint == TX_ENDPOINT_ADDRESS && self.port.flush_enabled() {
                state.flush = true;
            }
        }
        self.prepare_transfers(endpoint, callback)
    }

    /// Brings the ring from idle to fully submitted.
    ///
    /// For TX the application callback fills every buffer first, before
    /// anything is submitted; otherwise an early completion could invoke the
    /// callback concurrently with the fill loop. The callback may refuse to
    /// fill (or produce nothing), in which case only the buffers readied so
    /// far are submitted and streaming is left disabled so completions wind
    /// the session down.
    fn prepare_transfers(&self, endpoint: u8, mut callback: SampleBlockCallback) -> Result<()> {
        let slot_count = self.port.slot_count();
        let mut lengths = vec![self.port.slot_len(); slot_count];
        let mut ready = slot_count;

        if endpoint == TX_ENDPOINT_ADDRESS {
            ready = 0;
            for slot in 0..slot_count {
                // SAFETY: nothing is in flight before setup; this thread has
                // exclusive access to the buffer.
                let buffer = unsafe { self.port.slot_buffer(slot) };
                let capacity = buffer.len();
                let mut transfer = StreamTransfer {
                    buffer,
                    valid_length: capacity,
                };
                let flow = callback(&mut transfer);
                let valid_length = transfer.valid_length.min(capacity);
                if flow == StreamControl::Continue && valid_length > 0 {
                    lengths[slot] = valid_length;
                    ready += 1;
                } else {
                    break;
                }
            }
        }

        // Hold the transfer lock across the submit loop so that completion
        // callbacks cannot resubmit anything until every ready transfer has
        // been submitted once.
        let mut state = self.state.lock().unwrap();
        state.callback = Some(callback);
        state.endpoint = endpoint;

        let mut first_error = None;
        for slot in 0..ready {
            let mut length = lengths[slot];
            if endpoint == TX_ENDPOINT_ADDRESS {
                // SAFETY: submitted slots are only touched here until their
                // completion fires; the lock is held.
                let buffer = unsafe { self.port.slot_buffer(slot) };
                length = pad_to_packet(buffer, length);
            }
            match self.port.submit(slot, endpoint, length) {
                Ok(()) => state.active += 1,
                Err(err) => {
                    first_error = Some(err);
                    break;
                }
            }
        }

        if first_error.is_none() {
            state.setup = true;
            // Only keep streaming if the whole ring went out; otherwise the
            // completion handler must wind the submitted transfers down.
            self.streaming.store(ready == slot_count, Ordering::SeqCst);
            if ready != slot_count && state.flush {
                match self.port.submit_flush() {
                    Ok(()) => state.flush_in_flight = true,
                    Err(err) => first_error = Some(err),
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Cancels every in-flight transfer and blocks until their completion
    /// callbacks have drained. The only blocking point of the coordinator.
    pub(crate) fn cancel_transfers(&self) -> Result<()> {
        // Cancelling for any reason means the session is over.
        self.streaming.store(false, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        if !state.setup {
            return Err(Error::Other);
        }

        // Holding the lock blocks the completion handler from restarting a
        // transfer while cancellation is in progress.
        for slot in 0..self.port.slot_count() {
            self.port.cancel(slot);
        }
        self.port.cancel_flush();

        state.setup = false;
        state.flush = false;

        while state.active > 0 || state.flush_in_flight {
            state = self.all_finished.wait(state).unwrap();
        }
        Ok(())
    }

    pub(crate) fn set_block_complete_callback(&self, callback: BlockCompleteCallback) {
        self.hooks.lock().unwrap().block_complete = Some(callback);
    }

    pub(crate) fn set_flush_callback(&self, callback: FlushCallback) {
        self.hooks.lock().unwrap().flush = Some(callback);
    }

    pub(crate) fn clear_flush_callback(&self) {
        self.hooks.lock().unwrap().flush = None;
    }

    /// Guard used by the flush enable/disable paths: the flush transfer may
    /// only be (de)allocated while no session is set up and no flush is
    /// pending.
    pub(crate) fn flush_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.setup && !state.flush && !state.flush_in_flight
    }

    /// Lock-free status observation.
    pub(crate) fn streaming_status(&self) -> Result<()> {
        let thread_started = self.transfer_thread_started.load(Ordering::SeqCst);
        let streaming = self.streaming.load(Ordering::SeqCst);
        let do_exit = self.do_exit.load(Ordering::SeqCst);
        if thread_started && streaming && !do_exit {
            Ok(())
        } else if !thread_started {
            Err(Error::StreamingThreadErr)
        } else if !streaming {
            Err(Error::StreamingStopped)
        } else {
            Err(Error::StreamingExitCalled)
        }
    }

    /// Body of the event-pump worker: drive the transport until told to
    /// exit. Transport errors other than an interrupt stop the stream but
    /// never the pump.
    pub(crate) fn pump_loop(&self) {
        block_signals();
        while !self.do_exit.load(Ordering::SeqCst) {
            match self.port.handle_events(EVENT_PUMP_TICK) {
                Ok(()) | Err(Error::Usb(rusb::Error::Interrupted)) => {}
                Err(_) => self.streaming.store(false, Ordering::SeqCst),
            }
        }
    }
}

impl<P: BulkPort> CompletionSink for StreamCore<P> {
    fn transfer_done(&self, slot: usize, status: TransferStatus, actual_length: usize) {
        let success = status == TransferStatus::Completed;

        // The block-complete hook observes the finished transfer before the
        // stream/resubmit decision, outside the transfer lock.
        {
            let mut hooks = self.hooks.lock().unwrap();
            if let Some(hook) = hooks.block_complete.as_mut() {
                // SAFETY: the slot completed and cannot be resubmitted until
                // the transfer lock is taken below.
                let buffer = unsafe { self.port.slot_buffer(slot) };
                let transfer = StreamTransfer {
                    buffer,
                    valid_length: actual_length,
                };
                hook(&transfer, success);
            }
        }

        // Take the lock to make sure a transfer is not restarted while
        // cancel_transfers is in the middle of stopping them.
        let mut state = self.state.lock().unwrap();
        let mut resubmitted = false;
        let mut submit_failed = false;

        if success {
            let streaming = self.streaming.load(Ordering::SeqCst);
            let (continue_streaming, valid_length) = match state.callback.as_mut() {
                Some(callback) if streaming => {
                    // SAFETY: completed slot, exclusive access under the
                    // transfer lock.
                    let buffer = unsafe { self.port.slot_buffer(slot) };
                    let capacity = buffer.len();
                    let mut transfer = StreamTransfer {
                        buffer,
                        valid_length: actual_length,
                    };
                    let flow = callback(&mut transfer);
                    let valid_length = transfer.valid_length.min(capacity);
                    (flow == StreamControl::Continue && valid_length > 0, valid_length)
                }
                _ => (false, 0),
            };

            if continue_streaming {
                if state.setup {
                    resubmitted = true;
                    let mut length = valid_length;
                    if state.endpoint == TX_ENDPOINT_ADDRESS {
                        // SAFETY: as above; still under the lock.
                        let buffer = unsafe { self.port.slot_buffer(slot) };
                        length = pad_to_packet(buffer, length);
                    }
                    submit_failed = self.port.submit(slot, state.endpoint, length).is_err();
                }
            } else if state.flush {
                match self.port.submit_flush() {
                    Ok(()) => state.flush_in_flight = true,
                    Err(_) => {
                        self.streaming.store(false, Ordering::SeqCst);
                        state.flush = false;
                    }
                }
            }
        } else {
            self.streaming.store(false, Ordering::SeqCst);
            state.flush = false;
        }

        // If the transfer went back out successfully, this completion is
        // fully handled; otherwise this slot's streak ends here.
        if !resubmitted || submit_failed {
            self.streaming.store(false, Ordering::SeqCst);
            if state.active == 1 {
                if !state.flush {
                    state.active = 0;
                    self.all_finished.notify_all();
                }
            } else {
                // A cancelled flush may already have zeroed the count while
                // slot completions were still queued.
                state.active = state.active.saturating_sub(1);
            }
        }
    }

    fn flush_done(&self, status: TransferStatus) {
        let success = status == TransferStatus::Completed;

        // The flush transfer completes after every ordinary transfer on the
        // endpoint, so the session is over either way.
        {
            let mut state = self.state.lock().unwrap();
            state.flush = false;
            state.flush_in_flight = false;
            state.active = 0;
            self.all_finished.notify_all();
        }

        let mut hooks = self.hooks.lock().unwrap();
        if let Some(callback) = hooks.flush.as_mut() {
            callback(success);
        }
    }
}

/// Blocks all asynchronous signals on the calling thread. Applications tend
/// to drive periodic statistics off SIGALRM and POSIX does not specify which
/// thread receives it; the pump must not have its event dispatch interrupted
/// by such delivery.
#[cfg(unix)]
fn block_signals() {
    use std::{mem, ptr};
    // SAFETY: sigset initialisation and masking affect only this thread.
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigfillset(&mut set);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
    }
}

#[cfg(not(unix))]
fn block_signals() {}
