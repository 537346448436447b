//! Streaming tar+gzip archives of a server's files.
//!
//! Used by backups (archive to a local file or an upload stream) and by
//! transfers (archive straight onto a multipart body). Entries are stored
//! with paths relative to the server root, symlinks are archived as links,
//! and the exclusion set is honored while walking.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use roost_error::{CommonError, Result};
use roost_system::Rate;

use crate::walk::WalkAction;
use crate::{Filesystem, IgnoreSet};

/// Gzip effort applied to generated archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    /// Store entries without compressing.
    None,
    /// Fastest gzip setting.
    #[default]
    BestSpeed,
    /// Smallest output.
    BestCompression,
}

impl CompressionLevel {
    /// Parses the configuration file value.
    #[must_use]
    pub fn from_config(value: &str) -> Self {
        match value {
            "none" => Self::None,
            "best_compression" => Self::BestCompression,
            _ => Self::BestSpeed,
        }
    }
}

/// A tar(+gzip) archive of a server filesystem.
pub struct Archive<'a> {
    fs: &'a Filesystem,
    ignore: IgnoreSet,
    only: Option<Vec<PathBuf>>,
    rate: Option<Arc<Rate>>,
    stop: Option<Arc<AtomicBool>>,
}

impl<'a> Archive<'a> {
    #[must_use]
    pub fn new(fs: &'a Filesystem) -> Self {
        Self {
            fs,
            ignore: IgnoreSet::empty(),
            only: None,
            rate: None,
            stop: None,
        }
    }

    /// Excludes paths matching the set.
    #[must_use]
    pub fn with_ignore(mut self, ignore: IgnoreSet) -> Self {
        self.ignore = ignore;
        self
    }

    /// Restricts the archive to an allow-list of root-relative paths.
    #[must_use]
    pub fn with_files(mut self, only: Vec<PathBuf>) -> Self {
        self.only = Some(only);
        self
    }

    /// Caps read throughput in bytes per second.
    #[must_use]
    pub fn with_rate(mut self, rate: Arc<Rate>) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Aborts the walk when the flag flips to true.
    #[must_use]
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Streams the archive into `w`, returning compressed bytes written.
    pub fn stream<W: Write>(&self, w: W, level: CompressionLevel) -> Result<u64> {
        let written = Arc::new(AtomicU64::new(0));
        let counter = CountWriter {
            inner: w,
            count: Arc::clone(&written),
        };

        let sink = match level {
            CompressionLevel::None => Sink::Plain(counter),
            CompressionLevel::BestSpeed => Sink::Gz(GzEncoder::new(counter, Compression::fast())),
            CompressionLevel::BestCompression => {
                Sink::Gz(GzEncoder::new(counter, Compression::best()))
            }
        };

        let mut builder = tar::Builder::new(sink);
        builder.follow_symlinks(false);

        match self.append_tree(&mut builder) {
            Ok(()) => {
                builder.into_inner().map_err(CommonError::Io)?.finish()?;
                Ok(written.load(Ordering::Acquire))
            }
            Err(err) => {
                if self.stopped() {
                    return Err(CommonError::Cancelled);
                }
                Err(err)
            }
        }
    }

    /// Creates the archive at an absolute host path outside the sandbox
    /// (the backup directory). A partial file is removed on failure.
    pub fn create(&self, dst: &Path, level: CompressionLevel) -> Result<u64> {
        let file = std::fs::File::create(dst)?;
        match self.stream(io::BufWriter::new(file), level) {
            Ok(n) => Ok(n),
            Err(err) => {
                let _ = std::fs::remove_file(dst);
                Err(err)
            }
        }
    }

    fn stopped(&self) -> bool {
        self.stop
            .as_ref()
            .map(|s| s.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn wants(&self, rel: &Path, is_dir: bool) -> Inclusion {
        if self.ignore.is_ignored(rel, is_dir) {
            return Inclusion::Skip;
        }
        let Some(only) = &self.only else {
            return Inclusion::Include;
        };
        for allowed in only {
            if rel.starts_with(allowed) {
                return Inclusion::Include;
            }
            // A parent of an allowed path must be descended, not archived.
            if is_dir && allowed.starts_with(rel) {
                return Inclusion::DescendOnly;
            }
        }
        Inclusion::Skip
    }

    fn append_tree<T: Write>(&self, builder: &mut tar::Builder<T>) -> Result<()> {
        self.fs.walk("/", &mut |dir, entry| {
            if self.stopped() {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }

            let rel = dir.join(entry.name());
            let inclusion = self.wants(&rel, entry.is_dir());
            if inclusion == Inclusion::Skip {
                return Ok(if entry.is_dir() {
                    WalkAction::SkipDir
                } else {
                    WalkAction::Continue
                });
            }

            let info = match entry.info() {
                Ok(info) => info,
                // Vanished mid-walk: archive what is still there.
                Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
                    return Ok(WalkAction::Continue)
                }
                Err(err) => return Err(err),
            };

            let mut header = tar::Header::new_gnu();
            header.set_mode(info.raw_mode & 0o7777);
            header.set_uid(u64::from(info.uid));
            header.set_gid(u64::from(info.gid));
            header.set_mtime(info.modified.timestamp().max(0) as u64);

            if entry.is_dir() {
                if inclusion == Inclusion::Include {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    builder.append_data(&mut header, &rel, io::empty())?;
                }
                return Ok(WalkAction::Continue);
            }

            if entry.is_symlink() {
                let target = entry.read_link()?;
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                builder.append_link(&mut header, &rel, &target)?;
                return Ok(WalkAction::Continue);
            }

            if entry.is_file() {
                let file = match entry.open() {
                    Ok(f) => f,
                    Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
                        return Ok(WalkAction::Continue)
                    }
                    Err(err) => return Err(err),
                };
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(info.size);
                match &self.rate {
                    Some(rate) => {
                        let limited = RateLimited {
                            inner: file.take(info.size),
                            rate,
                        };
                        builder.append_data(&mut header, &rel, limited)?;
                    }
                    None => {
                        builder.append_data(&mut header, &rel, file.take(info.size))?;
                    }
                }
            }
            // Sockets, fifos and device nodes are not archived.
            Ok(WalkAction::Continue)
        })
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum Inclusion {
    Include,
    DescendOnly,
    Skip,
}

enum Sink<W: Write> {
    Plain(CountWriter<W>),
    Gz(GzEncoder<CountWriter<W>>),
}

impl<W: Write> Sink<W> {
    fn finish(self) -> io::Result<()> {
        match self {
            Self::Plain(mut w) => w.flush(),
            Self::Gz(gz) => gz.finish()?.flush(),
        }
    }
}

impl<W: Write> Write for Sink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Gz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Gz(w) => w.flush(),
        }
    }
}

struct CountWriter<W: Write> {
    inner: W,
    count: Arc<AtomicU64>,
}

impl<W: Write> Write for CountWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count.fetch_add(n as u64, Ordering::AcqRel);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RateLimited<'r, R: Read> {
    inner: R,
    rate: &'r Rate,
}

impl<R: Read> Read for RateLimited<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.rate.take_blocking(n as u64);
        }
        Ok(n)
    }
}
