//! # Error reporting
//!
//! Fallible operations return an [`Error`] to their caller *and* latch the
//! failure in a process wide last-error register, tagged with the subsystem
//! that failed. The register keeps only the most recent failure.
//!
//! The register is written from both main-line and interrupt context. Access
//! is serialised with a critical section, but two failures in quick
//! succession still overwrite each other: only the last one is observable.

use core::cell::Cell;

use critical_section::Mutex;

use crate::can::LastErrorCode;

/// Subsystem a latched error originates from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Subsystem {
    Adc,
    Can,
    Dma,
    Event,
}

/// The last latched failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorRecord {
    pub subsystem: Subsystem,
    /// Crate level error code, see [`Error::code`]
    pub code: u8,
    /// Code reported by the hardware, if any
    pub native: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// All transmit mailboxes are busy
    NoMailboxAvailable,
    /// A transfer was requested with an empty or null buffer
    NoBuffer,
    /// A bounded table (regular sequence, subscriber list) is full
    CapacityExceeded,
    /// Channel number not wired to the converter
    InvalidChannel,
    /// Payload or length outside of what the peripheral accepts
    InvalidLength,
    /// Operation not allowed while a transfer is in flight
    Busy,
    /// Wait timed out
    Timeout,
    /// Configuration the silicon cannot do
    Unsupported,
    /// DMA transfer error flag raised by the controller
    Transfer,
    /// Error reported by the CAN controller
    Bus(LastErrorCode),
}

impl Error {
    /// Numeric code stored in the error register
    pub fn code(self) -> u8 {
        match self {
            Error::NoMailboxAvailable => 1,
            Error::NoBuffer => 2,
            Error::CapacityExceeded => 3,
            Error::InvalidChannel => 4,
            Error::InvalidLength => 5,
            Error::Busy => 6,
            Error::Timeout => 7,
            Error::Unsupported => 8,
            Error::Transfer => 9,
            Error::Bus(lec) => lec.code(),
        }
    }

    /// Latches `self` under `subsystem` and hands it back for returning.
    #[inline]
    pub(crate) fn latch(self, subsystem: Subsystem, native: u32) -> Self {
        set_error(subsystem, self.code(), native);
        self
    }
}

static LAST_ERROR: Mutex<Cell<Option<ErrorRecord>>> = Mutex::new(Cell::new(None));

/// Records a failure and returns `code`, so a call site can report and
/// return in one expression.
pub fn set_error(subsystem: Subsystem, code: u8, native: u32) -> u8 {
    debug!("error latched: code {=u8} native {=u32}", code, native);
    critical_section::with(|cs| {
        LAST_ERROR.borrow(cs).set(Some(ErrorRecord {
            subsystem,
            code,
            native,
        }))
    });
    code
}

/// Returns `true` if a failure has been latched and not cleared since
pub fn has_pending_error() -> bool {
    last_error().is_some()
}

/// Returns the last latched failure without clearing it
pub fn last_error() -> Option<ErrorRecord> {
    critical_section::with(|cs| LAST_ERROR.borrow(cs).get())
}

/// Returns the last latched failure and clears the register
pub fn take_error() -> Option<ErrorRecord> {
    critical_section::with(|cs| LAST_ERROR.borrow(cs).take())
}

/// Clears the register
pub fn clear_error() {
    critical_section::with(|cs| LAST_ERROR.borrow(cs).set(None));
}

/// Serialises tests that inspect the process wide register.
#[cfg(test)]
pub(crate) fn exclusive() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    let guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_error();
    guard
}
