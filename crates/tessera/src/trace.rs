//! Structured tracing support.
//!
//! When the `tracing` feature is enabled, segment-level events and error
//! reports are emitted as `tracing` events; otherwise every function here
//! compiles to nothing.

#[cfg(feature = "tracing")]
mod imp {
    use crate::error::Error;

    pub fn segment_alloc(addr: usize, size: usize, huge: bool) {
        tracing::debug!(addr, size, huge, "segment_alloc");
    }

    pub fn segment_free(addr: usize, size: usize) {
        tracing::debug!(addr, size, "segment_free");
    }

    pub fn segment_abandon(addr: usize, used: usize) {
        tracing::debug!(addr, used, "segment_abandon");
    }

    pub fn segment_reclaim(addr: usize, reclaimed_pages: usize) {
        tracing::debug!(addr, reclaimed_pages, "segment_reclaim");
    }

    pub fn segment_purge(addr: usize, granules: usize, decommit: bool) {
        tracing::trace!(addr, granules, decommit, "segment_purge");
    }

    pub fn error_reported(err: Error) {
        tracing::error!(code = err.code(), "{err}");
    }
}

#[cfg(not(feature = "tracing"))]
mod imp {
    use crate::error::Error;

    #[inline(always)]
    pub fn segment_alloc(_addr: usize, _size: usize, _huge: bool) {}
    #[inline(always)]
    pub fn segment_free(_addr: usize, _size: usize) {}
    #[inline(always)]
    pub fn segment_abandon(_addr: usize, _used: usize) {}
    #[inline(always)]
    pub fn segment_reclaim(_addr: usize, _reclaimed_pages: usize) {}
    #[inline(always)]
    pub fn segment_purge(_addr: usize, _granules: usize, _decommit: bool) {}
    #[inline(always)]
    pub fn error_reported(_err: Error) {}
}

pub use imp::*;
