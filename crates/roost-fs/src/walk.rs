//! Streaming directory iteration over directory descriptors.
//!
//! Server data directories can hold millions of entries, so iteration never
//! materializes a full listing: entries are yielded one at a time straight
//! from the kernel, and stat/open on an entry always goes through the parent
//! descriptor captured during traversal.

use std::ffi::{CStr, OsStr, OsString};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::fs::FileInfo;
use crate::sys;

/// What a walk callback wants done after seeing an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    /// Keep going; descend into directories.
    Continue,
    /// Do not descend into this directory (ignored for non-directories).
    SkipDir,
}

/// One directory entry observed during iteration.
pub struct DirEntry<'a> {
    parent: BorrowedFd<'a>,
    name: OsString,
    dtype: u8,
}

impl DirEntry<'_> {
    /// The entry's file name.
    #[must_use]
    pub fn name(&self) -> &OsStr {
        &self.name
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.dtype == libc::DT_DIR
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.dtype == libc::DT_LNK
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.dtype == libc::DT_REG
    }

    /// Stats the entry through the parent descriptor without following
    /// symlinks.
    pub fn info(&self) -> io::Result<FileInfo> {
        let name = sys::cstr(&self.name)?;
        let st = sys::fstatat(self.parent, &name, false)?;
        Ok(FileInfo::from_stat(&self.name, &st))
    }

    /// Opens the entry for reading through the parent descriptor. Symlinks
    /// are not followed.
    pub fn open(&self) -> io::Result<std::fs::File> {
        let name = sys::cstr(&self.name)?;
        let fd = sys::openat(self.parent, &name, libc::O_RDONLY | libc::O_NOFOLLOW, 0)?;
        Ok(std::fs::File::from(fd))
    }

    /// Reads the symlink target through the parent descriptor.
    pub fn read_link(&self) -> io::Result<PathBuf> {
        let name = sys::cstr(&self.name)?;
        sys::readlinkat(self.parent, &name)
    }

    /// The captured parent directory descriptor.
    #[must_use]
    pub fn parent_fd(&self) -> BorrowedFd<'_> {
        self.parent
    }

    /// Opens the entry as a directory for descending.
    pub(crate) fn open_dir(&self) -> io::Result<OwnedFd> {
        let name = sys::cstr(&self.name)?;
        sys::openat(
            self.parent,
            &name,
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_NOFOLLOW,
            0,
        )
    }
}

/// Raw readdir iteration over an owned descriptor.
pub(crate) struct RawDir {
    dirp: *mut libc::DIR,
}

// The DIR stream is only touched through &mut self.
unsafe impl Send for RawDir {}

impl RawDir {
    /// Takes ownership of `fd` and opens a directory stream on it.
    pub(crate) fn new(fd: OwnedFd) -> io::Result<Self> {
        let dirp = unsafe { libc::fdopendir(fd.into_raw_fd()) };
        if dirp.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { dirp })
    }

    /// Yields the next entry name and d_type, skipping `.` and `..`.
    pub(crate) fn next_entry(&mut self) -> io::Result<Option<(OsString, u8)>> {
        loop {
            // readdir returns NULL both at end-of-stream and on error; errno
            // disambiguates.
            clear_errno();
            let ent = unsafe { libc::readdir(self.dirp) };
            if ent.is_null() {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(0) {
                    return Ok(None);
                }
                return Err(err);
            }
            let ent = unsafe { &*ent };
            let name = unsafe { CStr::from_ptr(ent.d_name.as_ptr()) };
            let bytes = name.to_bytes();
            if bytes == b"." || bytes == b".." {
                continue;
            }
            return Ok(Some((OsStr::from_bytes(bytes).to_os_string(), ent.d_type)));
        }
    }
}

impl Drop for RawDir {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dirp) };
    }
}

#[cfg(target_os = "linux")]
fn clear_errno() {
    unsafe { *libc::__errno_location() = 0 };
}

#[cfg(target_os = "macos")]
fn clear_errno() {
    unsafe { *libc::__error() = 0 };
}

/// Iterates the single directory behind `dirfd`, invoking `f` for each
/// entry. Entries arrive in the order the kernel returns them.
pub(crate) fn iter_dir<F>(dirfd: OwnedFd, mut f: F) -> io::Result<()>
where
    F: FnMut(&DirEntry<'_>) -> io::Result<()>,
{
    let parent = sys::dup(dirfd.as_fd())?;
    let mut raw = RawDir::new(dirfd)?;
    while let Some((name, dtype)) = raw.next_entry()? {
        let entry = DirEntry {
            parent: parent.as_fd(),
            name,
            dtype,
        };
        f(&entry)?;
    }
    Ok(())
}

/// Depth-first walk rooted at `dirfd`. The callback receives the path of
/// the containing directory relative to the walk root plus the entry, and
/// controls descent. Symlinked directories are reported but never entered.
pub(crate) fn walk_fd<F>(dirfd: OwnedFd, rel: &Path, f: &mut F) -> io::Result<()>
where
    F: FnMut(&Path, &DirEntry<'_>) -> io::Result<WalkAction>,
{
    let parent = sys::dup(dirfd.as_fd())?;
    let mut raw = RawDir::new(dirfd)?;
    while let Some((name, dtype)) = raw.next_entry()? {
        let entry = DirEntry {
            parent: parent.as_fd(),
            name,
            dtype,
        };
        let action = f(rel, &entry)?;
        if entry.is_dir() && action == WalkAction::Continue {
            match entry.open_dir() {
                Ok(child) => {
                    let child_rel = rel.join(entry.name());
                    walk_fd(child, &child_rel, f)?;
                }
                // The directory vanished between readdir and open; servers
                // mutate their trees while we account them.
                Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {}
                Err(err) => return Err(err),
            }
        }
    }
    Ok(())
}
