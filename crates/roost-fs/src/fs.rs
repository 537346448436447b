//! The sandboxed filesystem type and its operation set.

use std::ffi::{CString, OsStr, OsString};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use roost_error::{CommonError, Result};
use serde::Serialize;

use crate::path::{open_beneath, sanitize, split_parent};
use crate::sys;
use crate::usage::UsageCounter;
use crate::walk::{self, DirEntry, WalkAction};

/// Default file mode for files the daemon creates on behalf of a caller.
pub const DEFAULT_FILE_MODE: u32 = 0o644;
/// Default mode for directories the daemon creates.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Metadata for a single entry, decoupled from `std::fs` so it can be built
/// straight from an `fstatat` result.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Symbolic form, e.g. `drwxr-xr-x`.
    pub mode: String,
    /// Octal permission bits, e.g. `755`.
    pub mode_bits: String,
    pub size: u64,
    pub directory: bool,
    pub file: bool,
    pub symlink: bool,
    #[serde(skip)]
    pub uid: u32,
    #[serde(skip)]
    pub gid: u32,
    #[serde(skip)]
    pub raw_mode: u32,
}

impl FileInfo {
    pub(crate) fn from_stat(name: &OsStr, st: &libc::stat) -> Self {
        let mode = st.st_mode as u32;
        let kind = mode & libc::S_IFMT as u32;
        Self {
            name: name.to_string_lossy().into_owned(),
            created: DateTime::from_timestamp(st.st_ctime as i64, st.st_ctime_nsec as u32)
                .unwrap_or_default(),
            modified: DateTime::from_timestamp(st.st_mtime as i64, st.st_mtime_nsec as u32)
                .unwrap_or_default(),
            mode: symbolic_mode(mode),
            mode_bits: format!("{:o}", mode & 0o7777),
            size: st.st_size.max(0) as u64,
            directory: kind == libc::S_IFDIR as u32,
            file: kind == libc::S_IFREG as u32,
            symlink: kind == libc::S_IFLNK as u32,
            uid: st.st_uid,
            gid: st.st_gid,
            raw_mode: mode,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.directory
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.file
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.symlink
    }
}

fn symbolic_mode(mode: u32) -> String {
    let kind = match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => 'd',
        m if m == libc::S_IFLNK as u32 => 'l',
        m if m == libc::S_IFSOCK as u32 => 's',
        m if m == libc::S_IFIFO as u32 => 'p',
        m if m == libc::S_IFBLK as u32 => 'b',
        m if m == libc::S_IFCHR as u32 => 'c',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// Converts a raw I/O failure into the daemon error taxonomy, attaching the
/// caller's path.
fn convert(err: io::Error, path: &str) -> CommonError {
    match err.raw_os_error() {
        Some(errno) => CommonError::from_errno(errno, path),
        None => CommonError::Io(err),
    }
}

/// A sandboxed filesystem rooted at a server's data directory.
///
/// The root is opened once; every subsequent resolution is relative to that
/// descriptor and constrained to stay beneath it.
pub struct Filesystem {
    root: PathBuf,
    root_fd: OwnedFd,
    usage: UsageCounter,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("root", &self.root)
            .field("limit", &self.usage.limit())
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    /// Opens (creating if necessary) a filesystem rooted at `root` with a
    /// byte quota of `limit` (zero = unlimited).
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created or opened.
    pub fn new(root: impl Into<PathBuf>, limit: u64, walk_interval: Duration) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let c_root = sys::cstr(root.as_os_str()).map_err(|e| convert(e, &root.to_string_lossy()))?;
        let root_fd = open_root(&c_root).map_err(|e| convert(e, &root.to_string_lossy()))?;
        Ok(Self {
            root,
            root_fd,
            usage: UsageCounter::new(limit, walk_interval),
        })
    }

    /// The absolute host path of the server root.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Quota in bytes; zero means unlimited.
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.usage.limit()
    }

    pub fn set_limit(&self, limit: u64) {
        self.usage.set_limit(limit);
    }

    /// The currently accounted usage without forcing a walk.
    #[must_use]
    pub fn cached_usage(&self) -> u64 {
        self.usage.used()
    }

    /// Applies a signed delta to the accounted usage.
    pub fn add_disk(&self, delta: i64) {
        self.usage.add(delta);
    }

    /// True when `delta` more bytes would still fit under the quota.
    #[must_use]
    pub fn can_fit(&self, delta: i64) -> bool {
        self.usage.can_fit(delta)
    }

    /// True while the accounted usage is within the quota.
    #[must_use]
    pub fn has_space_available(&self) -> bool {
        self.usage.has_space_available()
    }

    /// Returns the disk usage, re-walking the tree when the cached value is
    /// stale or `force` is set. The walk is synchronous; async callers run
    /// it on a blocking thread.
    pub fn disk_usage(&self, force: bool) -> Result<u64> {
        if self.usage.should_walk(force) {
            let mut total: u64 = 0;
            self.walk("/", &mut |_, entry| {
                if entry.is_file() {
                    if let Ok(info) = entry.info() {
                        total += info.size;
                    }
                }
                Ok(WalkAction::Continue)
            })?;
            self.usage.set_used(total);
        }
        Ok(self.usage.used())
    }

    // ------------------------------------------------------------------
    // Resolution helpers
    // ------------------------------------------------------------------

    fn open_rel(&self, path: &str, flags: libc::c_int, mode: u32) -> Result<OwnedFd> {
        let rel = sanitize(path)?;
        open_beneath(self.root_fd.as_fd(), &rel, flags, mode as libc::mode_t)
            .map_err(|e| convert(e, path))
    }

    /// Resolves the parent directory of `path` and returns its descriptor
    /// plus the final component. Fails for the root itself.
    fn resolve_parent(&self, path: &str) -> Result<(OwnedFd, CString)> {
        let rel = sanitize(path)?;
        let (parent_rel, name) =
            split_parent(&rel).ok_or_else(|| CommonError::bad_path(path))?;
        let parent = open_beneath(
            self.root_fd.as_fd(),
            &parent_rel,
            libc::O_RDONLY | libc::O_DIRECTORY,
            0,
        )
        .map_err(|e| convert(e, path))?;
        Ok((parent, name))
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Opens a file for reading. Symlinks are followed only while they stay
    /// beneath the root.
    pub fn open(&self, path: &str) -> Result<std::fs::File> {
        let fd = self.open_rel(path, libc::O_RDONLY, 0)?;
        let st = sys::fstat(fd.as_fd()).map_err(|e| convert(e, path))?;
        if st.st_mode as u32 & libc::S_IFMT as u32 == libc::S_IFDIR as u32 {
            return Err(CommonError::IsADirectory(path.to_string()));
        }
        Ok(std::fs::File::from(fd))
    }

    /// Streams a file's contents into `w`, returning the bytes copied.
    pub fn read_into(&self, path: &str, w: &mut impl Write) -> Result<u64> {
        let mut f = self.open(path)?;
        Ok(io::copy(&mut f, w)?)
    }

    /// Reads an entire file into memory. Intended for configuration-sized
    /// files, not server archives.
    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut f = self.open(path)?;
        f.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Stats `path`, following in-root symlinks.
    pub fn stat(&self, path: &str) -> Result<FileInfo> {
        let rel = sanitize(path)?;
        if rel.as_os_str().is_empty() {
            let st = sys::fstat(self.root_fd.as_fd()).map_err(|e| convert(e, path))?;
            return Ok(FileInfo::from_stat(OsStr::new("/"), &st));
        }
        // Resolve through an O_PATH-style open so the final stat cannot race
        // a swap of the path with a link out of the root.
        let fd = self.open_rel(path, read_only_path_flags(), 0)?;
        let st = sys::fstat(fd.as_fd()).map_err(|e| convert(e, path))?;
        let name = rel.file_name().unwrap_or_else(|| OsStr::new("/"));
        Ok(FileInfo::from_stat(name, &st))
    }

    /// Stats `path` without following a final symlink.
    pub fn lstat(&self, path: &str) -> Result<FileInfo> {
        let rel = sanitize(path)?;
        if rel.as_os_str().is_empty() {
            return self.stat(path);
        }
        let (parent, name) = self.resolve_parent(path)?;
        let st = sys::fstatat(parent.as_fd(), &name, false).map_err(|e| convert(e, path))?;
        let file_name = rel.file_name().unwrap_or_else(|| OsStr::new("/"));
        Ok(FileInfo::from_stat(file_name, &st))
    }

    /// Lists a directory, directories first, names case-insensitively
    /// sorted. The full listing is materialized; use [`Filesystem::walk`]
    /// for unbounded trees.
    pub fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let fd = self.open_rel(path, libc::O_RDONLY | libc::O_DIRECTORY, 0)?;
        let mut out = Vec::new();
        walk::iter_dir(fd, |entry| {
            match entry.info() {
                Ok(info) => out.push(info),
                // Entry removed mid-listing; skip it.
                Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {}
                Err(err) => return Err(err),
            }
            Ok(())
        })
        .map_err(|e| convert(e, path))?;
        out.sort_by(|a, b| {
            b.directory
                .cmp(&a.directory)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(out)
    }

    /// Depth-first walk from `path`. Entries are yielded in the order the
    /// directories return them, without sorting or buffering.
    pub fn walk<F>(&self, path: &str, f: &mut F) -> Result<()>
    where
        F: FnMut(&Path, &DirEntry<'_>) -> io::Result<WalkAction>,
    {
        let rel = sanitize(path)?;
        let fd = self.open_rel(path, libc::O_RDONLY | libc::O_DIRECTORY, 0)?;
        walk::walk_fd(fd, &rel, f).map_err(|e| convert(e, path))
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Opens `path` read-write, creating it (and missing parents) when
    /// absent.
    pub fn touch(&self, path: &str, mode: u32) -> Result<std::fs::File> {
        let rel = sanitize(path)?;
        if rel.as_os_str().is_empty() {
            return Err(CommonError::IsADirectory(path.to_string()));
        }
        match self.open_rel(path, libc::O_RDWR | libc::O_CREAT, mode) {
            Ok(fd) => Ok(std::fs::File::from(fd)),
            Err(err) if err.is_not_found() => {
                if let Some(parent) = rel.parent() {
                    self.mkdir_all(&parent.to_string_lossy(), DEFAULT_DIR_MODE)?;
                }
                let fd = self.open_rel(path, libc::O_RDWR | libc::O_CREAT, mode)?;
                Ok(std::fs::File::from(fd))
            }
            Err(err) => Err(err),
        }
    }

    /// Writes `size` bytes from `r` to `path`, enforcing the quota before
    /// any byte is written and truncating any previous contents.
    ///
    /// # Errors
    ///
    /// Returns a disk-space error, leaving the existing file untouched, when
    /// the post-write usage would exceed the quota.
    pub fn write_file(&self, path: &str, r: &mut (impl Read + ?Sized), size: u64, mode: u32) -> Result<u64> {
        let existing = match self.stat(path) {
            Ok(info) if info.is_dir() => {
                return Err(CommonError::IsADirectory(path.to_string()));
            }
            Ok(info) => info.size as i64,
            Err(err) if err.is_not_found() => 0,
            Err(err) => return Err(err),
        };

        let delta = size as i64 - existing;
        if !self.can_fit(delta) {
            return Err(CommonError::disk_space(path.to_string()));
        }

        let rel = sanitize(path)?;
        if let Some(parent) = rel.parent() {
            if !parent.as_os_str().is_empty() {
                self.mkdir_all(&parent.to_string_lossy(), DEFAULT_DIR_MODE)?;
            }
        }

        let fd = self.open_rel(path, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, mode)?;
        let mut file = std::fs::File::from(fd);
        let written = io::copy(r, &mut file)?;
        self.add_disk(written as i64 - existing);
        Ok(written)
    }

    /// Appends `size` bytes from `r` to `path`, creating it when absent.
    pub fn append_file(&self, path: &str, r: &mut impl Read, size: u64, mode: u32) -> Result<u64> {
        if !self.can_fit(size as i64) {
            return Err(CommonError::disk_space(path.to_string()));
        }
        let rel = sanitize(path)?;
        if let Some(parent) = rel.parent() {
            if !parent.as_os_str().is_empty() {
                self.mkdir_all(&parent.to_string_lossy(), DEFAULT_DIR_MODE)?;
            }
        }
        let fd = self.open_rel(path, libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND, mode)?;
        let mut file = std::fs::File::from(fd);
        let written = io::copy(r, &mut file)?;
        self.add_disk(written as i64);
        Ok(written)
    }

    /// Creates a single directory.
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        sys::mkdirat(parent.as_fd(), &name, mode as libc::mode_t).map_err(|e| convert(e, path))
    }

    /// Creates a directory and any missing parents.
    pub fn mkdir_all(&self, path: &str, mode: u32) -> Result<()> {
        let rel = sanitize(path)?;
        let mut prefix = PathBuf::new();
        for comp in rel.components() {
            let parent = open_beneath(
                self.root_fd.as_fd(),
                &prefix,
                libc::O_RDONLY | libc::O_DIRECTORY,
                0,
            )
            .map_err(|e| convert(e, path))?;
            let name = sys::cstr(comp.as_os_str()).map_err(|e| convert(e, path))?;
            match sys::mkdirat(parent.as_fd(), &name, mode as libc::mode_t) {
                Ok(()) => {}
                Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {}
                Err(err) => return Err(convert(err, path)),
            }
            prefix.push(comp);
        }
        Ok(())
    }

    /// Renames `old` to `new`. The root itself can neither be renamed nor
    /// renamed over, and both sides must resolve beneath the root.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old_rel = sanitize(old)?;
        let new_rel = sanitize(new)?;
        if old_rel.as_os_str().is_empty() || new_rel.as_os_str().is_empty() {
            return Err(CommonError::bad_path("cannot rename the server root"));
        }
        let (old_parent, old_name) = self.resolve_parent(old)?;
        let (new_parent, new_name) = self.resolve_parent(new)?;
        sys::renameat(
            old_parent.as_fd(),
            &old_name,
            new_parent.as_fd(),
            &new_name,
        )
        .map_err(|e| convert(e, new))
    }

    /// Duplicates a regular file next to itself, picking the first free
    /// `name copy`, `name copy 2`, … suffix. Returns the new root-relative
    /// path.
    pub fn copy_file(&self, path: &str) -> Result<String> {
        let info = self.stat(path)?;
        if !info.is_file() {
            return Err(CommonError::invalid_input(format!(
                "{path}: only regular files can be copied"
            )));
        }

        let rel = sanitize(path)?;
        let parent = rel.parent().map(Path::to_path_buf).unwrap_or_default();
        let stem_full = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CommonError::bad_path(path))?;
        let (stem, ext) = match stem_full.split_once('.') {
            // Dotfiles keep their name intact.
            Some(("", _)) => (stem_full.as_str(), String::new()),
            Some((s, e)) => (s, format!(".{e}")),
            None => (stem_full.as_str(), String::new()),
        };

        let mut candidate = String::new();
        for i in 0..64 {
            let name = match i {
                0 => format!("{stem} copy{ext}"),
                n => format!("{stem} copy {}{ext}", n + 1),
            };
            let full = parent.join(&name).to_string_lossy().into_owned();
            match self.lstat(&full) {
                Err(err) if err.is_not_found() => {
                    candidate = full;
                    break;
                }
                Err(err) => return Err(err),
                Ok(_) => continue,
            }
        }
        if candidate.is_empty() {
            return Err(CommonError::conflict(format!(
                "{path}: no free copy suffix available"
            )));
        }

        let mut src = self.open(path)?;
        self.write_file(&candidate, &mut src, info.size, info.raw_mode & 0o7777)?;
        Ok(candidate)
    }

    /// Removes a file or an empty directory. The empty path (the root) is
    /// refused.
    pub fn remove(&self, path: &str) -> Result<()> {
        let rel = sanitize(path)?;
        if rel.as_os_str().is_empty() {
            return Err(CommonError::bad_path("cannot remove the server root"));
        }
        let (parent, name) = self.resolve_parent(path)?;
        let st = sys::fstatat(parent.as_fd(), &name, false).map_err(|e| convert(e, path))?;
        let is_dir = st.st_mode as u32 & libc::S_IFMT as u32 == libc::S_IFDIR as u32;
        sys::unlinkat(parent.as_fd(), &name, is_dir).map_err(|e| convert(e, path))?;
        if st.st_mode as u32 & libc::S_IFMT as u32 == libc::S_IFREG as u32 {
            self.add_disk(-(st.st_size.max(0) as i64));
        }
        Ok(())
    }

    /// Removes a path and everything beneath it. The root itself is
    /// refused; use [`Filesystem::truncate_root`] for that.
    pub fn remove_all(&self, path: &str) -> Result<()> {
        let rel = sanitize(path)?;
        if rel.as_os_str().is_empty() {
            return Err(CommonError::bad_path("cannot remove the server root"));
        }
        let (parent, name) = self.resolve_parent(path)?;
        self.remove_all_at(&parent, &name).map_err(|e| convert(e, path))
    }

    fn remove_all_at(&self, parent: &OwnedFd, name: &CString) -> io::Result<()> {
        let st = match sys::fstatat(parent.as_fd(), name, false) {
            Ok(st) => st,
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => return Ok(()),
            Err(err) => return Err(err),
        };

        if st.st_mode as u32 & libc::S_IFMT as u32 == libc::S_IFDIR as u32 {
            let dir = sys::openat(
                parent.as_fd(),
                name,
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_NOFOLLOW,
                0,
            )?;
            let held = sys::dup(dir.as_fd())?;
            let mut children: Vec<OsString> = Vec::new();
            walk::iter_dir(dir, |entry| {
                children.push(entry.name().to_os_string());
                Ok(())
            })?;
            for child in children {
                let child_name = sys::cstr(&child)?;
                self.remove_all_at(&held, &child_name)?;
            }
            sys::unlinkat(parent.as_fd(), name, true)?;
        } else {
            sys::unlinkat(parent.as_fd(), name, false)?;
            if st.st_mode as u32 & libc::S_IFMT as u32 == libc::S_IFREG as u32 {
                self.add_disk(-(st.st_size.max(0) as i64));
            }
        }
        Ok(())
    }

    /// Empties the server root and resets the usage counter. The root
    /// directory itself survives.
    pub fn truncate_root(&self) -> Result<()> {
        let fd = self.open_rel("/", libc::O_RDONLY | libc::O_DIRECTORY, 0)?;
        let held = sys::dup(fd.as_fd()).map_err(|e| convert(e, "/"))?;
        let mut children: Vec<OsString> = Vec::new();
        walk::iter_dir(fd, |entry| {
            children.push(entry.name().to_os_string());
            Ok(())
        })
        .map_err(|e| convert(e, "/"))?;
        for child in children {
            let name = sys::cstr(&child).map_err(|e| convert(e, "/"))?;
            self.remove_all_at(&held, &name).map_err(|e| convert(e, "/"))?;
        }
        self.usage.set_used(0);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    /// Changes permission bits.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        sys::fchmodat(parent.as_fd(), &name, mode as libc::mode_t).map_err(|e| convert(e, path))
    }

    /// Changes ownership of a single entry (symlinks are not followed).
    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let rel = sanitize(path)?;
        if rel.as_os_str().is_empty() {
            // Chown the root directory itself through its descriptor.
            let dot = sys::cstr(OsStr::new(".")).map_err(|e| convert(e, path))?;
            return sys::fchownat(self.root_fd.as_fd(), &dot, uid, gid)
                .map_err(|e| convert(e, path));
        }
        let (parent, name) = self.resolve_parent(path)?;
        sys::fchownat(parent.as_fd(), &name, uid, gid).map_err(|e| convert(e, path))
    }

    /// Recursively chowns a subtree, including the starting path.
    pub fn chown_tree(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.chown(path, uid, gid)?;
        self.walk(path, &mut |_, entry| {
            let name = sys::cstr(entry.name())?;
            if let Err(err) = sys::fchownat(entry.parent_fd(), &name, uid, gid) {
                // An entry deleted mid-walk is not fatal.
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
            Ok(WalkAction::Continue)
        })
    }

    /// Sets access and modification times. `None` preserves the current
    /// value for that field.
    pub fn chtimes(
        &self,
        path: &str,
        atime: Option<DateTime<Utc>>,
        mtime: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let a = match atime {
            Some(t) => sys::timespec(t.timestamp(), i64::from(t.timestamp_subsec_nanos())),
            None => sys::timespec_omit(),
        };
        let m = match mtime {
            Some(t) => sys::timespec(t.timestamp(), i64::from(t.timestamp_subsec_nanos())),
            None => sys::timespec_omit(),
        };
        sys::utimensat(parent.as_fd(), &name, a, m).map_err(|e| convert(e, path))
    }

    /// Creates a symlink at `link` pointing at `target`. The target string
    /// is stored verbatim; resolution-time checks keep an escaping target
    /// from ever being followed.
    pub fn symlink(&self, target: &str, link: &str) -> Result<()> {
        if target.as_bytes().contains(&0) {
            return Err(CommonError::bad_path(target));
        }
        let (parent, name) = self.resolve_parent(link)?;
        let target = CString::new(target.as_bytes())
            .map_err(|_| CommonError::bad_path(target))?;
        sys::symlinkat(&target, parent.as_fd(), &name).map_err(|e| convert(e, link))
    }
}

fn open_root(path: &std::ffi::CStr) -> io::Result<OwnedFd> {
    use std::os::fd::FromRawFd;
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(target_os = "linux")]
fn read_only_path_flags() -> libc::c_int {
    libc::O_PATH
}

#[cfg(not(target_os = "linux"))]
fn read_only_path_flags() -> libc::c_int {
    libc::O_RDONLY
}
