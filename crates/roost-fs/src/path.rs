//! Untrusted path sanitization and beneath-only resolution.

use std::ffi::CString;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::{Component, Path, PathBuf};

use roost_error::CommonError;

use crate::sys;

/// Lexically cleans an untrusted caller path into a root-relative path.
///
/// Absolute paths are interpreted relative to the server root (the caller's
/// `/` is the root directory). `.` components are dropped and `..` is
/// resolved textually; a `..` that would climb above the root, or a NUL byte
/// anywhere, is a bad-path-resolution error before any syscall is made.
/// The returned path may be empty, which denotes the root itself.
pub fn sanitize(path: &str) -> Result<PathBuf, CommonError> {
    if path.as_bytes().contains(&0) {
        return Err(CommonError::bad_path(path));
    }
    let mut out = PathBuf::new();
    for comp in Path::new(path).components() {
        match comp {
            Component::RootDir | Component::CurDir => {}
            Component::Prefix(_) => return Err(CommonError::bad_path(path)),
            Component::ParentDir => {
                if !out.pop() {
                    return Err(CommonError::bad_path(path));
                }
            }
            Component::Normal(c) => out.push(c),
        }
    }
    Ok(out)
}

/// Splits a sanitized, non-empty path into its parent and final component.
pub fn split_parent(rel: &Path) -> Option<(PathBuf, CString)> {
    let name = rel.file_name()?;
    let parent = rel.parent().map(Path::to_path_buf).unwrap_or_default();
    let name = sys::cstr(name).ok()?;
    Some((parent, name))
}

/// Opens `rel` (sanitized, root-relative) without ever resolving outside
/// `root`. An empty `rel` duplicates the root descriptor, which is only
/// meaningful for directory opens.
pub fn open_beneath(
    root: BorrowedFd<'_>,
    rel: &Path,
    flags: libc::c_int,
    mode: libc::mode_t,
) -> io::Result<OwnedFd> {
    if rel.as_os_str().is_empty() {
        return sys::dup(root);
    }
    open_beneath_impl(root, rel, flags, mode)
}

#[cfg(target_os = "linux")]
fn open_beneath_impl(
    root: BorrowedFd<'_>,
    rel: &Path,
    flags: libc::c_int,
    mode: libc::mode_t,
) -> io::Result<OwnedFd> {
    let path = sys::cstr(rel.as_os_str())?;
    sys::openat2_beneath(root, &path, flags, mode)
}

/// Portable fallback: walk component-by-component with `O_NOFOLLOW` opens,
/// resolving symlinks by hand and rejecting any target that leaves the root.
/// Provides the same guarantee `openat2(RESOLVE_BENEATH)` gives on Linux.
#[cfg(not(target_os = "linux"))]
fn open_beneath_impl(
    root: BorrowedFd<'_>,
    rel: &Path,
    flags: libc::c_int,
    mode: libc::mode_t,
) -> io::Result<OwnedFd> {
    use std::collections::VecDeque;
    use std::ffi::OsString;
    use std::os::fd::AsFd;

    const MAX_SYMLINKS: u32 = 40;

    let escape = || io::Error::from_raw_os_error(libc::EXDEV);

    // Directory descriptors from root to the current position; `..` pops.
    let mut dirs: Vec<OwnedFd> = vec![sys::dup(root)?];
    let mut queue: VecDeque<OsString> = rel
        .components()
        .map(|c| c.as_os_str().to_os_string())
        .collect();
    let mut links_followed = 0u32;

    while let Some(comp) = queue.pop_front() {
        if comp == *"." {
            continue;
        }
        if comp == *".." {
            if dirs.len() == 1 {
                return Err(escape());
            }
            dirs.pop();
            continue;
        }

        let name = sys::cstr(&comp)?;
        let current = dirs.last().expect("dir stack never empty").as_fd();
        let last = queue.is_empty();

        let open_flags = if last {
            flags | libc::O_NOFOLLOW
        } else {
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_NOFOLLOW
        };

        match sys::openat(current, &name, open_flags, mode) {
            Ok(fd) => {
                if last {
                    return Ok(fd);
                }
                dirs.push(fd);
            }
            Err(err) => {
                let errno = err.raw_os_error();
                // ELOOP (or EMLINK on some BSDs) signals a symlink in the
                // final component; splice its target into the queue.
                let is_symlink_stop =
                    errno == Some(libc::ELOOP) || errno == Some(libc::EMLINK) || errno == Some(libc::ENOTDIR);
                if !is_symlink_stop {
                    return Err(err);
                }
                let st = sys::fstatat(current, &name, false)?;
                if st.st_mode & libc::S_IFMT != libc::S_IFLNK {
                    return Err(err);
                }
                links_followed += 1;
                if links_followed > MAX_SYMLINKS {
                    return Err(io::Error::from_raw_os_error(libc::ELOOP));
                }
                let target = sys::readlinkat(current, &name)?;
                if target.is_absolute() {
                    return Err(escape());
                }
                for (i, c) in target.components().enumerate() {
                    queue.insert(i, c.as_os_str().to_os_string());
                }
            }
        }
    }

    // The path was nothing but `.`/`..` components that landed back on a
    // directory we already hold; hand back a duplicate of it.
    sys::dup(dirs.last().expect("dir stack never empty").as_fd())
}

#[cfg(test)]
mod tests {
    use super::sanitize;

    #[test]
    fn sanitize_cleans_lexically() {
        assert_eq!(sanitize("a/b/../c").unwrap().to_str(), Some("a/c"));
        assert_eq!(sanitize("/a//b/./c").unwrap().to_str(), Some("a/b/c"));
        assert_eq!(sanitize("/").unwrap().to_str(), Some(""));
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert!(sanitize("..").is_err());
        assert!(sanitize("../B/secret.txt").is_err());
        assert!(sanitize("a/../../b").is_err());
    }

    #[test]
    fn sanitize_rejects_nul() {
        assert!(sanitize("a\0b").is_err());
    }
}
