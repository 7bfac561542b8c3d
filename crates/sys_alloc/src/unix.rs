use std::io::{self, Error};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Allocation;

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub fn large_page_size() -> usize {
    #[cfg(any(target_os = "linux", target_os = "android", target_vendor = "apple"))]
    {
        2 << 20
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_vendor = "apple")))]
    {
        0
    }
}

pub fn has_overcommit() -> bool {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        // 0 = heuristic overcommit, 1 = always overcommit, 2 = strict.
        static MODE: AtomicUsize = AtomicUsize::new(usize::MAX);
        let mode = match MODE.load(Ordering::Relaxed) {
            usize::MAX => {
                let mode = std::fs::read_to_string("/proc/sys/vm/overcommit_memory")
                    .ok()
                    .and_then(|s| s.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                MODE.store(mode, Ordering::Relaxed);
                mode
            }
            mode => mode,
        };
        mode <= 1
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        false
    }
}

/// Returns the NUMA node the current thread is running on.
pub fn numa_node() -> usize {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let mut node: libc::c_uint = 0;
        let rc = unsafe {
            libc::syscall(
                libc::SYS_getcpu,
                ptr::null_mut::<libc::c_uint>(),
                &raw mut node,
                ptr::null_mut::<libc::c_void>(),
            )
        };
        if rc == 0 {
            (node as usize).min(numa_node_count() - 1)
        } else {
            0
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        0
    }
}

/// Returns the number of NUMA nodes on the system (at least 1), cached.
pub fn numa_node_count() -> usize {
    static COUNT: AtomicUsize = AtomicUsize::new(0);

    match COUNT.load(Ordering::Relaxed) {
        0 => {
            let mut count = 1;
            #[cfg(any(target_os = "linux", target_os = "android"))]
            {
                while std::path::Path::new(&format!("/sys/devices/system/node/node{count}"))
                    .exists()
                {
                    count += 1;
                }
            }
            COUNT.store(count, Ordering::Relaxed);
            count
        }
        count => count,
    }
}

/// Monotonic clock in milliseconds since an arbitrary epoch.
pub fn clock_now_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &raw mut ts) };
    if rc == 0 {
        (ts.tv_sec as u64) * 1000 + (ts.tv_nsec as u64) / 1_000_000
    } else {
        0
    }
}

unsafe fn mmap_anon(size: usize, prot: libc::c_int, extra_flags: libc::c_int) -> *mut u8 {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON | extra_flags;
    let ptr = unsafe { libc::mmap(ptr::null_mut(), size, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        ptr.cast()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn mmap_large(size: usize) -> *mut u8 {
    // Large pages are always committed; MAP_HUGETLB fails cleanly when no
    // huge pages are reserved on the system.
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_HUGETLB;
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let ptr = unsafe { libc::mmap(ptr::null_mut(), size, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        ptr.cast()
    }
}

pub unsafe fn reserve_aligned(
    size: usize,
    align: usize,
    commit: bool,
    allow_large: bool,
) -> io::Result<Allocation> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if allow_large && large_page_size() > 0 && size % large_page_size() == 0 {
        let lps = large_page_size();
        let ptr = unsafe { mmap_large(size) };
        if let Some(ptr) = NonNull::new(ptr) {
            if ptr.as_ptr() as usize % align == 0 {
                return Ok(Allocation {
                    ptr,
                    size,
                    committed: true,
                    large: true,
                });
            }
            unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
            // Alignment above the huge-page size: over-reserve and trim.
            // Both the base and the target boundary are huge-page
            // multiples, so the trimmed ends are unmappable as whole
            // huge pages.
            if align > lps && align % lps == 0 {
                if let Some(over) = size.checked_add(align) {
                    let base = unsafe { mmap_large(over) };
                    if !base.is_null() {
                        let addr = base as usize;
                        let aligned = addr.next_multiple_of(align);
                        let lead = aligned - addr;
                        let tail = over - lead - size;
                        unsafe {
                            if lead > 0 {
                                libc::munmap(base.cast(), lead);
                            }
                            if tail > 0 {
                                libc::munmap((aligned + size) as *mut libc::c_void, tail);
                            }
                        }
                        return Ok(Allocation {
                            ptr: unsafe { NonNull::new_unchecked(aligned as *mut u8) },
                            size,
                            committed: true,
                            large: true,
                        });
                    }
                }
            }
        }
    }
    let _ = allow_large;

    let prot = if commit {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_NONE
    };
    let extra = if commit { 0 } else { MAP_NORESERVE };

    // First try a plain mapping; the kernel usually hands back something
    // well-aligned for power-of-two sizes.
    let ptr = unsafe { mmap_anon(size, prot, extra) };
    if !ptr.is_null() && ptr as usize % align == 0 {
        return Ok(Allocation {
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            size,
            committed: commit,
            large: false,
        });
    }
    if !ptr.is_null() {
        unsafe { libc::munmap(ptr.cast(), size) };
    }

    // Over-reserve and trim both ends down to the aligned window.
    let over = size.checked_add(align).ok_or(io::ErrorKind::OutOfMemory)?;
    let base = unsafe { mmap_anon(over, prot, extra) };
    if base.is_null() {
        return Err(Error::last_os_error());
    }
    let addr = base as usize;
    let aligned = addr.next_multiple_of(align);
    let lead = aligned - addr;
    let tail = over - lead - size;
    unsafe {
        if lead > 0 {
            libc::munmap(base.cast(), lead);
        }
        if tail > 0 {
            libc::munmap((aligned + size) as *mut libc::c_void, tail);
        }
    }
    Ok(Allocation {
        ptr: unsafe { NonNull::new_unchecked(aligned as *mut u8) },
        size,
        committed: commit,
        large: false,
    })
}

pub unsafe fn release(alloc: Allocation) {
    unsafe {
        libc::munmap(alloc.ptr.as_ptr().cast(), alloc.size);
    }
}

pub unsafe fn commit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    let rc = unsafe {
        libc::mprotect(
            ptr.as_ptr().cast(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    unsafe {
        // Drop the physical pages first, then make the range inaccessible so
        // a stale access faults instead of silently re-faulting pages in.
        let rc = libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED);
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        let rc = libc::mprotect(ptr.as_ptr().cast(), size, libc::PROT_NONE);
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }
}

pub unsafe fn reset(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let advice = libc::MADV_FREE;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let advice = libc::MADV_DONTNEED;

    let rc = unsafe { libc::madvise(ptr.as_ptr().cast(), size, advice) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub unsafe fn protect(ptr: NonNull<u8>, size: usize, allow_rw: bool) -> io::Result<()> {
    let prot = if allow_rw {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_NONE
    };
    let rc = unsafe { libc::mprotect(ptr.as_ptr().cast(), size, prot) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}
