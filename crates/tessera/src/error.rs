//! Error reporting.
//!
//! The allocator never panics on a bad pointer: integrity violations are
//! funneled through a single process-wide hook carrying a POSIX-style
//! error code, rate-limited so a corrupted loop cannot flood stderr. Out
//! of memory is reported here too, but is additionally visible to the
//! caller as a null return.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use thiserror::Error;

/// Maximum number of reports delivered per process; later reports are
/// dropped silently.
const MAX_REPORTS: u32 = 16;

/// An allocator-detected error condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The OS or arena layer could not supply memory.
    #[error("unable to allocate memory ({size} bytes)")]
    OutOfMemory {
        /// Requested size in bytes.
        size: usize,
    },
    /// A block was freed that is already on one of its page's free lists.
    #[error("double free detected of block {addr:#x}")]
    DoubleFree {
        /// Address of the block.
        addr: usize,
    },
    /// A free-list link decoded outside its owning page, or a thread-free
    /// chain exceeded the page capacity.
    #[error("corrupted free list at {addr:#x}")]
    Corruption {
        /// Address of the suspect block or page.
        addr: usize,
    },
    /// A pointer passed to free/usable-size does not belong to this
    /// allocator. The call is a no-op.
    #[error("pointer {addr:#x} does not point to a valid heap region")]
    InvalidPointer {
        /// The foreign address.
        addr: usize,
    },
    /// The padding canary after a block was clobbered before free.
    #[error("buffer overflow detected in block {addr:#x}")]
    Overflow {
        /// Address of the block.
        addr: usize,
    },
}

impl Error {
    /// POSIX-style error code for this condition.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::OutOfMemory { .. } => 12,    // ENOMEM
            Self::DoubleFree { .. } => 11,     // EAGAIN
            Self::Corruption { .. } => 14,     // EFAULT
            Self::InvalidPointer { .. } => 22, // EINVAL
            Self::Overflow { .. } => 75,       // EOVERFLOW
        }
    }

    /// Whether this condition indicates memory corruption (as opposed to
    /// resource exhaustion or caller misuse).
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::DoubleFree { .. } | Self::Corruption { .. } | Self::Overflow { .. }
        )
    }
}

/// Process-wide error handler signature.
pub type ErrorHandler = fn(Error);

static HANDLER: AtomicUsize = AtomicUsize::new(0);
static REPORTS: AtomicU32 = AtomicU32::new(0);

/// Installs a process-wide error handler, replacing any previous one.
/// Passing `None` restores the default (stderr) handler.
pub fn set_error_handler(handler: Option<ErrorHandler>) {
    let raw = handler.map_or(0, |f| f as usize);
    HANDLER.store(raw, Ordering::Release);
}

/// Resets the rate limiter; useful in tests.
#[doc(hidden)]
pub fn reset_error_count() {
    REPORTS.store(0, Ordering::Relaxed);
}

/// Reports an error through the installed hook, rate-limited.
pub(crate) fn report(err: Error) {
    if REPORTS.fetch_add(1, Ordering::Relaxed) >= MAX_REPORTS {
        return;
    }

    crate::trace::error_reported(err);

    let raw = HANDLER.load(Ordering::Acquire);
    if raw == 0 {
        eprintln!("tessera: error {}: {err}", err.code());
    } else {
        // SAFETY: only ever stored from a valid `ErrorHandler` in
        // `set_error_handler`.
        let f: ErrorHandler = unsafe { std::mem::transmute::<usize, ErrorHandler>(raw) };
        f(err);
    }

    #[cfg(feature = "paranoid")]
    if err.is_corruption() {
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static SEEN: AtomicUsize = AtomicUsize::new(0);

    fn counting_handler(_err: Error) {
        SEEN.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn test_codes_are_posix_style() {
        assert_eq!(Error::OutOfMemory { size: 1 }.code(), 12);
        assert_eq!(Error::InvalidPointer { addr: 0x10 }.code(), 22);
        assert!(Error::DoubleFree { addr: 0 }.is_corruption());
        assert!(!Error::OutOfMemory { size: 0 }.is_corruption());
    }

    #[test]
    fn test_display_mentions_address() {
        let msg = Error::Corruption { addr: 0xabcd }.to_string();
        assert!(msg.contains("0xabcd"));
    }

    #[cfg(not(feature = "paranoid"))]
    #[test]
    fn test_handler_is_called_and_rate_limited() {
        reset_error_count();
        set_error_handler(Some(counting_handler));
        for _ in 0..(MAX_REPORTS + 10) {
            report(Error::InvalidPointer { addr: 0x1000 });
        }
        assert_eq!(SEEN.load(Ordering::Relaxed) as u32, MAX_REPORTS);
        set_error_handler(None);
    }
}
