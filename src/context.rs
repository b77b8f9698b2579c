//! Process-wide transport state: the shared libusb context and the count of
//! open devices that gates transport teardown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rusb::Context;

use crate::error::{Error, Result};

static GLOBAL_CONTEXT: Mutex<Option<Context>> = Mutex::new(None);
static OPEN_DEVICES: AtomicUsize = AtomicUsize::new(0);

/// Initialises the USB transport.
///
/// Called implicitly by the open paths; calling it repeatedly is harmless.
pub fn init() -> Result<()> {
    global().map(|_| ())
}

/// Tears down the USB transport.
///
/// Refuses with [`Error::NotLastDevice`] while any device opened through this
/// library is still alive. Safe to call repeatedly.
pub fn exit() -> Result<()> {
    let mut slot = GLOBAL_CONTEXT.lock().unwrap();
    if OPEN_DEVICES.load(Ordering::SeqCst) != 0 {
        return Err(Error::NotLastDevice);
    }
    // Dropping the last clone of the context closes the transport.
    *slot = None;
    Ok(())
}

/// Returns a clone of the shared context, initialising it on first use.
pub(crate) fn global() -> Result<Context> {
    let mut slot = GLOBAL_CONTEXT.lock().unwrap();
    match &*slot {
        Some(context) => Ok(context.clone()),
        None => {
            let context = Context::new()?;
            *slot = Some(context.clone());
            Ok(context)
        }
    }
}

pub(crate) fn device_opened() {
    OPEN_DEVICES.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn device_closed() {
    OPEN_DEVICES.fetch_sub(1, Ordering::SeqCst);
}
