//! Thin wrappers over the `*at` syscall family.
//!
//! Everything here operates relative to an already-resolved directory
//! descriptor. Raw errnos are surfaced as `std::io::Error`; the callers in
//! `fs.rs` convert them to the daemon taxonomy with the path attached.

use std::ffi::{CStr, CString, OsStr};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

/// Converts a single path component to a C string, rejecting NUL bytes.
pub fn cstr(name: &OsStr) -> io::Result<CString> {
    CString::new(name.as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// `openat(2)` returning an owned descriptor. `O_CLOEXEC` is always added.
pub fn openat(dirfd: BorrowedFd<'_>, name: &CStr, flags: libc::c_int, mode: libc::mode_t) -> io::Result<OwnedFd> {
    loop {
        let fd = unsafe {
            libc::openat(
                dirfd.as_raw_fd(),
                name.as_ptr(),
                flags | libc::O_CLOEXEC,
                mode as libc::c_uint,
            )
        };
        if fd >= 0 {
            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// `openat2(2)` with `RESOLVE_BENEATH`: the kernel guarantees the resolved
/// path, symlinks included, never leaves `dirfd`. Escapes surface as `EXDEV`.
#[cfg(target_os = "linux")]
pub fn openat2_beneath(
    dirfd: BorrowedFd<'_>,
    path: &CStr,
    flags: libc::c_int,
    mode: libc::mode_t,
) -> io::Result<OwnedFd> {
    let mut how: libc::open_how = unsafe { std::mem::zeroed() };
    how.flags = (flags | libc::O_CLOEXEC) as u64;
    // openat2 rejects a non-zero mode unless the call can create something.
    if flags & libc::O_CREAT != 0 {
        how.mode = u64::from(mode);
    }
    how.resolve = libc::RESOLVE_BENEATH;

    loop {
        let fd = unsafe {
            libc::syscall(
                libc::SYS_openat2,
                dirfd.as_raw_fd(),
                path.as_ptr(),
                std::ptr::addr_of_mut!(how),
                std::mem::size_of::<libc::open_how>(),
            )
        };
        if fd >= 0 {
            return Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) });
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // EAGAIN from openat2 means the kernel detected a concurrent
            // rename while resolving; the call is safe to retry.
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => return Err(err),
        }
    }
}

/// Duplicates a descriptor with `O_CLOEXEC`.
pub fn dup(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    let new = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
    if new < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

/// `fstatat(2)`.
pub fn fstatat(dirfd: BorrowedFd<'_>, name: &CStr, follow: bool) -> io::Result<libc::stat> {
    let flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    check(unsafe { libc::fstatat(dirfd.as_raw_fd(), name.as_ptr(), &mut st, flags) })?;
    Ok(st)
}

/// `fstat(2)` on an already-open descriptor.
pub fn fstat(fd: BorrowedFd<'_>) -> io::Result<libc::stat> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    check(unsafe { libc::fstat(fd.as_raw_fd(), &mut st) })?;
    Ok(st)
}

/// `unlinkat(2)`; `dir` selects `AT_REMOVEDIR`.
pub fn unlinkat(dirfd: BorrowedFd<'_>, name: &CStr, dir: bool) -> io::Result<()> {
    let flags = if dir { libc::AT_REMOVEDIR } else { 0 };
    check(unsafe { libc::unlinkat(dirfd.as_raw_fd(), name.as_ptr(), flags) })
}

/// `mkdirat(2)`.
pub fn mkdirat(dirfd: BorrowedFd<'_>, name: &CStr, mode: libc::mode_t) -> io::Result<()> {
    check(unsafe { libc::mkdirat(dirfd.as_raw_fd(), name.as_ptr(), mode) })
}

/// `renameat(2)` between two resolved parents.
pub fn renameat(
    old_dirfd: BorrowedFd<'_>,
    old_name: &CStr,
    new_dirfd: BorrowedFd<'_>,
    new_name: &CStr,
) -> io::Result<()> {
    check(unsafe {
        libc::renameat(
            old_dirfd.as_raw_fd(),
            old_name.as_ptr(),
            new_dirfd.as_raw_fd(),
            new_name.as_ptr(),
        )
    })
}

/// `symlinkat(2)`. The target is stored verbatim; resolution-time checks are
/// what keep escaping links from ever being followed.
pub fn symlinkat(target: &CStr, dirfd: BorrowedFd<'_>, name: &CStr) -> io::Result<()> {
    check(unsafe { libc::symlinkat(target.as_ptr(), dirfd.as_raw_fd(), name.as_ptr()) })
}

/// `fchmodat(2)`.
pub fn fchmodat(dirfd: BorrowedFd<'_>, name: &CStr, mode: libc::mode_t) -> io::Result<()> {
    check(unsafe { libc::fchmodat(dirfd.as_raw_fd(), name.as_ptr(), mode, 0) })
}

/// `fchownat(2)` on the entry itself (symlinks are not followed).
pub fn fchownat(dirfd: BorrowedFd<'_>, name: &CStr, uid: libc::uid_t, gid: libc::gid_t) -> io::Result<()> {
    check(unsafe {
        libc::fchownat(
            dirfd.as_raw_fd(),
            name.as_ptr(),
            uid,
            gid,
            libc::AT_SYMLINK_NOFOLLOW,
        )
    })
}

/// `utimensat(2)` with nanosecond timespecs.
pub fn utimensat(dirfd: BorrowedFd<'_>, name: &CStr, atime: libc::timespec, mtime: libc::timespec) -> io::Result<()> {
    let times = [atime, mtime];
    check(unsafe { libc::utimensat(dirfd.as_raw_fd(), name.as_ptr(), times.as_ptr(), 0) })
}

/// `readlinkat(2)`.
pub fn readlinkat(dirfd: BorrowedFd<'_>, name: &CStr) -> io::Result<PathBuf> {
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let n = unsafe {
        libc::readlinkat(
            dirfd.as_raw_fd(),
            name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    buf.truncate(n as usize);
    Ok(PathBuf::from(OsStr::from_bytes(&buf)))
}

/// `ftruncate(2)`.
pub fn ftruncate(fd: BorrowedFd<'_>, len: libc::off_t) -> io::Result<()> {
    check(unsafe { libc::ftruncate(fd.as_raw_fd(), len) })
}

/// Timespec helper: `UTIME_OMIT` keeps the current value.
pub fn timespec_omit() -> libc::timespec {
    libc::timespec {
        tv_sec: 0,
        tv_nsec: libc::UTIME_OMIT,
    }
}

/// Timespec from a unix timestamp in seconds + nanos.
pub fn timespec(secs: i64, nanos: i64) -> libc::timespec {
    libc::timespec {
        tv_sec: secs as libc::time_t,
        tv_nsec: nanos as libc::c_long,
    }
}
