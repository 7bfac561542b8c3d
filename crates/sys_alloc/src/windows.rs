use std::io::{self, Error};
use std::mem;
use std::ptr::{self, NonNull};

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_DECOMMIT, MEM_LARGE_PAGES,
    MEM_RELEASE, MEM_RESERVE, MEM_RESET, PAGE_NOACCESS, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, GetTickCount64, SYSTEM_INFO};

use crate::Allocation;

/// Returns the system allocation granularity.
///
/// `VirtualAlloc` addresses are aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&raw mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&raw mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub fn large_page_size() -> usize {
    // GetLargePageMinimum needs the lock-pages privilege anyway; report the
    // common 2MB so callers can size requests, attempts still fall back.
    2 << 20
}

pub const fn has_overcommit() -> bool {
    false
}

pub const fn numa_node() -> usize {
    0
}

pub const fn numa_node_count() -> usize {
    1
}

pub fn clock_now_ms() -> u64 {
    unsafe { GetTickCount64() }
}

pub unsafe fn reserve_aligned(
    size: usize,
    align: usize,
    commit: bool,
    allow_large: bool,
) -> io::Result<Allocation> {
    let flags = if commit {
        MEM_RESERVE | MEM_COMMIT
    } else {
        MEM_RESERVE
    };

    if allow_large {
        // Large pages must be committed in one go and need the lock-pages
        // privilege; fall through quietly when the call fails.
        let ptr = unsafe {
            VirtualAlloc(
                ptr::null(),
                size,
                MEM_RESERVE | MEM_COMMIT | MEM_LARGE_PAGES,
                PAGE_READWRITE,
            )
        };
        if !ptr.is_null() && ptr as usize % align == 0 {
            return Ok(Allocation {
                ptr: unsafe { NonNull::new_unchecked(ptr.cast()) },
                size,
                committed: true,
                large: true,
            });
        }
        if !ptr.is_null() {
            unsafe { VirtualFree(ptr, 0, MEM_RELEASE) };
        }
    }

    // VirtualAlloc cannot trim a reservation, so to align beyond the
    // allocation granularity: probe a large reservation for the aligned
    // address inside it, release, and re-reserve at that exact address.
    // Another thread can race for the address, hence the retry loop.
    for _ in 0..16 {
        let ptr = unsafe { VirtualAlloc(ptr::null(), size, flags, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        if ptr as usize % align == 0 {
            return Ok(Allocation {
                ptr: unsafe { NonNull::new_unchecked(ptr.cast()) },
                size,
                committed: commit,
                large: false,
            });
        }
        unsafe { VirtualFree(ptr, 0, MEM_RELEASE) };

        let over = size.checked_add(align).ok_or(io::ErrorKind::OutOfMemory)?;
        let probe = unsafe { VirtualAlloc(ptr::null(), over, MEM_RESERVE, PAGE_NOACCESS) };
        if probe.is_null() {
            return Err(Error::last_os_error());
        }
        let aligned = (probe as usize).next_multiple_of(align);
        unsafe { VirtualFree(probe, 0, MEM_RELEASE) };

        let ptr = unsafe { VirtualAlloc(aligned as *const _, size, flags, PAGE_READWRITE) };
        if !ptr.is_null() {
            return Ok(Allocation {
                ptr: unsafe { NonNull::new_unchecked(ptr.cast()) },
                size,
                committed: commit,
                large: false,
            });
        }
        // Lost the race; try again.
    }
    Err(Error::from(io::ErrorKind::OutOfMemory))
}

pub unsafe fn release(alloc: Allocation) {
    unsafe {
        VirtualFree(alloc.ptr.as_ptr().cast(), 0, MEM_RELEASE);
    }
}

pub unsafe fn commit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    let rc = unsafe { VirtualAlloc(ptr.as_ptr().cast(), size, MEM_COMMIT, PAGE_READWRITE) };
    if rc.is_null() {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

pub unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    let rc = unsafe { VirtualFree(ptr.as_ptr().cast(), size, MEM_DECOMMIT) };
    if rc == 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

pub unsafe fn reset(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    let rc = unsafe { VirtualAlloc(ptr.as_ptr().cast(), size, MEM_RESET, PAGE_READWRITE) };
    if rc.is_null() {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

pub unsafe fn protect(ptr: NonNull<u8>, size: usize, allow_rw: bool) -> io::Result<()> {
    let prot = if allow_rw { PAGE_READWRITE } else { PAGE_NOACCESS };
    let mut old = 0;
    let rc = unsafe { VirtualProtect(ptr.as_ptr().cast(), size, prot, &raw mut old) };
    if rc == 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}
