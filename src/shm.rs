//! POSIX shared-memory plumbing.
//!
//! Thin `libc` wrappers used by the bootstrap layer: named `shm_open`
//! regions for discovery, anonymous `memfd_create` regions for the buffer
//! and info cells, and the mmap/munmap calls tying them together. Everything
//! here returns `io::Result`; the caller attaches operation context.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

/// Huge-page unit used when the buffer region gets hugetlb backing.
const HUGE_PAGE_BYTES: usize = 2 * 1024 * 1024;

fn cstring(s: &str) -> io::Result<CString> {
    CString::new(s).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "embedded NUL"))
}

fn mmap_shared(fd: RawFd, len: usize, prot: libc::c_int) -> io::Result<NonNull<u8>> {
    let addr = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0) };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(NonNull::new(addr.cast()).expect("mmap returned NULL without MAP_FAILED"))
}

/// Creates (or reopens, after a producer crash) a named region and maps it
/// read-write. The fd is closed; the mapping stays valid.
pub(crate) fn shm_create(name: &str, size: usize) -> io::Result<NonNull<u8>> {
    let c_name = cstring(name)?;
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::ftruncate(fd, size as libc::off_t) } == -1 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    let mapping = mmap_shared(fd, size, libc::PROT_READ | libc::PROT_WRITE);
    unsafe { libc::close(fd) };
    tracing::debug!(name, size, "created shared-memory region");
    mapping
}

/// Opens an existing named region read-only and maps `size` bytes of it.
pub(crate) fn shm_open_ro(name: &str, size: usize) -> io::Result<NonNull<u8>> {
    let c_name = cstring(name)?;
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    let mapping = mmap_shared(fd, size, libc::PROT_READ);
    unsafe { libc::close(fd) };
    mapping
}

/// Removes a named region from the shared-memory namespace.
pub(crate) fn shm_unlink(name: &str) -> io::Result<()> {
    let c_name = cstring(name)?;
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// An anonymous memfd-backed region mapped read-write.
///
/// The fd is kept open: it is what `/proc/<pid>/fd/<fd>` resolves to, so
/// closing it would invalidate the identifier advertised to consumers.
pub(crate) struct MemfdRegion {
    pub fd: RawFd,
    pub ptr: NonNull<u8>,
    /// Mapped length; for huge-page regions this is `size` rounded up to the
    /// huge-page unit.
    pub len: usize,
}

/// Creates a memfd of at least `size` bytes and maps it read-write.
///
/// With `want_huge`, hugetlb backing is attempted first (TLB relief for the
/// hot loop) and normal pages are used if the kernel refuses; hugeness is
/// an optimization, never a requirement.
pub(crate) fn memfd_region(name: &str, size: usize, want_huge: bool) -> io::Result<MemfdRegion> {
    let c_name = cstring(name)?;

    if want_huge {
        let rounded = size.div_ceil(HUGE_PAGE_BYTES) * HUGE_PAGE_BYTES;
        let flags = libc::MFD_CLOEXEC | libc::MFD_HUGETLB | libc::MFD_HUGE_2MB;
        match memfd_region_with(&c_name, rounded, flags) {
            Ok(region) => return Ok(region),
            Err(err) => {
                tracing::warn!(
                    name,
                    %err,
                    "huge-page backing unavailable, falling back to normal pages"
                );
            }
        }
    }

    memfd_region_with(&c_name, size, libc::MFD_CLOEXEC)
}

fn memfd_region_with(name: &CString, len: usize, flags: libc::c_uint) -> io::Result<MemfdRegion> {
    let fd = unsafe { libc::memfd_create(name.as_ptr(), flags) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::ftruncate(fd, len as libc::off_t) } == -1 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    match mmap_shared(fd, len, libc::PROT_READ | libc::PROT_WRITE) {
        Ok(ptr) => Ok(MemfdRegion { fd, ptr, len }),
        Err(err) => {
            unsafe { libc::close(fd) };
            Err(err)
        }
    }
}

/// Opens a filesystem path read-only without mapping it.
pub(crate) fn open_ro(path: &str) -> io::Result<RawFd> {
    let c_path = cstring(path)?;
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Size of an open file, per fstat.
pub(crate) fn fd_size(fd: RawFd) -> io::Result<u64> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { stat.assume_init() }.st_size as u64)
}

/// Maps `len` bytes of an open fd read-only.
pub(crate) fn map_ro(fd: RawFd, len: usize) -> io::Result<NonNull<u8>> {
    mmap_shared(fd, len, libc::PROT_READ)
}

pub(crate) fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

/// Releases a mapping established by any of the functions above.
pub(crate) unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
    if unsafe { libc::munmap(ptr.as_ptr().cast(), len) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
