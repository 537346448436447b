//! Caller-facing compress and decompress operations.
//!
//! Compression takes an allow-list of paths and produces an archive inside
//! the sandbox; decompression identifies the format from the file name,
//! verifies the extracted size fits the quota, and extracts entries back
//! through the sandbox so path safety and accounting hold.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use roost_error::{CommonError, Result};

use crate::archive::{Archive, CompressionLevel};
use crate::fs::{FileInfo, DEFAULT_FILE_MODE};
use crate::walk::WalkAction;
use crate::Filesystem;

/// Archive formats supported by the file-manager surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    TarBz2,
    TarXz,
}

impl ArchiveFormat {
    /// Resolves a format from a user-supplied extension string.
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_lowercase().as_str() {
            "zip" => Some(Self::Zip),
            "tar.gz" | "tgz" => Some(Self::TarGz),
            "tar.bz2" | "tbz2" => Some(Self::TarBz2),
            "tar.xz" | "txz" => Some(Self::TarXz),
            _ => None,
        }
    }

    /// Resolves a format from a file name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar.bz2") || lower.ends_with(".tbz2") {
            Some(Self::TarBz2)
        } else if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
            Some(Self::TarXz)
        } else {
            None
        }
    }

    /// Canonical extension including the leading dot.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Zip => ".zip",
            Self::TarGz => ".tar.gz",
            Self::TarBz2 => ".tar.bz2",
            Self::TarXz => ".tar.xz",
        }
    }

    /// MIME type reported to the file manager.
    #[must_use]
    pub const fn mimetype(self) -> &'static str {
        match self {
            Self::Zip => "application/zip",
            Self::TarGz => "application/gzip",
            Self::TarBz2 => "application/x-bzip2",
            Self::TarXz => "application/x-xz",
        }
    }
}

impl Filesystem {
    /// Compresses the given paths (relative to `dir`) into a new archive in
    /// `dir`, returning the archive's metadata and its root-relative path.
    ///
    /// # Errors
    ///
    /// Fails with a disk-space error, removing the partial archive, when the
    /// output does not fit the quota.
    pub fn compress_files(
        &self,
        dir: &str,
        name: Option<&str>,
        paths: &[String],
        format: ArchiveFormat,
    ) -> Result<(FileInfo, String)> {
        if paths.is_empty() {
            return Err(CommonError::invalid_input("no files to compress"));
        }

        let base = crate::path::sanitize(dir)?;
        let allow: Vec<PathBuf> = paths
            .iter()
            .map(|p| Ok(base.join(crate::path::sanitize(p)?)))
            .collect::<Result<_>>()?;

        let file_name = match name {
            Some(n) if !n.is_empty() => format!("{n}{}", format.extension()),
            _ => format!(
                "archive-{}{}",
                Utc::now().format("%Y-%m-%dT%H%M%S%z"),
                format.extension()
            ),
        };
        let dest = base.join(&file_name).to_string_lossy().into_owned();
        if self.lstat(&dest).is_ok() {
            return Err(CommonError::already_exists(dest));
        }

        let out = self.touch(&dest, DEFAULT_FILE_MODE)?;
        let written = match format {
            ArchiveFormat::Zip => self.write_zip(&allow, out),
            ArchiveFormat::TarGz | ArchiveFormat::TarBz2 | ArchiveFormat::TarXz => {
                self.write_tar(&allow, out, format)
            }
        };

        match written {
            Ok(bytes) if self.can_fit(bytes as i64) => {
                self.add_disk(bytes as i64);
                Ok((self.stat(&dest)?, dest))
            }
            Ok(_) => {
                self.remove(&dest)?;
                Err(CommonError::disk_space(dest))
            }
            Err(err) => {
                let _ = self.remove(&dest);
                Err(err)
            }
        }
    }

    fn write_tar(
        &self,
        allow: &[PathBuf],
        out: std::fs::File,
        format: ArchiveFormat,
    ) -> Result<u64> {
        let archive = Archive::new(self).with_files(allow.to_vec());
        match format {
            ArchiveFormat::TarGz => archive.stream(io::BufWriter::new(out), CompressionLevel::BestSpeed),
            ArchiveFormat::TarBz2 => {
                let enc = bzip2::write::BzEncoder::new(
                    CountingFile::new(out),
                    bzip2::Compression::default(),
                );
                let counted = enc.get_ref().count();
                let mut builder_input = enc;
                archive.stream_plain_tar(&mut builder_input)?;
                builder_input.finish()?.flush()?;
                Ok(counted.get())
            }
            ArchiveFormat::TarXz => {
                let enc = xz2::write::XzEncoder::new(CountingFile::new(out), 6);
                let counted = enc.get_ref().count();
                let mut builder_input = enc;
                archive.stream_plain_tar(&mut builder_input)?;
                builder_input.finish()?.flush()?;
                Ok(counted.get())
            }
            ArchiveFormat::Zip => unreachable!("zip handled separately"),
        }
    }

    fn write_zip(&self, allow: &[PathBuf], out: std::fs::File) -> Result<u64> {
        let mut zip = zip::ZipWriter::new(out);

        self.walk("/", &mut |dir, entry| {
            let rel = dir.join(entry.name());
            if !allow
                .iter()
                .any(|a| rel.starts_with(a) || a.starts_with(&rel))
            {
                return Ok(if entry.is_dir() {
                    WalkAction::SkipDir
                } else {
                    WalkAction::Continue
                });
            }
            let included = allow.iter().any(|a| rel.starts_with(a));

            if entry.is_dir() {
                return Ok(WalkAction::Continue);
            }
            if entry.is_file() && included {
                let info = entry.info()?;
                let mut options = zip::write::SimpleFileOptions::default()
                    .unix_permissions(info.raw_mode & 0o7777)
                    .compression_method(zip::CompressionMethod::Deflated);
                if info.size >= u32::MAX as u64 {
                    options = options.large_file(true);
                }
                if let Some(dt) = zip_datetime(&info.modified) {
                    options = options.last_modified_time(dt);
                }
                zip.start_file(rel.to_string_lossy(), options)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, zip_err(e)))?;
                let mut file = entry.open()?;
                io::copy(&mut file, &mut zip)?;
            }
            Ok(WalkAction::Continue)
        })?;

        let mut out = zip.finish().map_err(zip_err)?;
        out.flush()?;
        Ok(out.metadata()?.len())
    }

    /// Sums the sizes an archive would extract to and fails when the quota
    /// cannot fit them.
    pub fn space_for_decompression(&self, dir: &str, file: &str) -> Result<()> {
        if self.limit() == 0 {
            return Ok(());
        }
        let path = join_rel(dir, file);
        let format = ArchiveFormat::from_name(file)
            .ok_or_else(|| CommonError::invalid_input(format!("{file}: unrecognized archive format")))?;

        let mut total: i64 = 0;
        match format {
            ArchiveFormat::Zip => {
                let f = self.open(&path)?;
                let mut archive = zip::ZipArchive::new(f).map_err(zip_err)?;
                for i in 0..archive.len() {
                    let entry = archive.by_index_raw(i).map_err(zip_err)?;
                    total = total.saturating_add(entry.size() as i64);
                }
            }
            _ => {
                let f = self.open(&path)?;
                let mut reader = tar_reader(f, format);
                let mut archive = tar::Archive::new(&mut reader);
                for entry in archive.entries()? {
                    let entry = entry?;
                    total = total.saturating_add(entry.header().size().unwrap_or(0) as i64);
                }
            }
        }
        if !self.can_fit(total) {
            return Err(CommonError::disk_space(path));
        }
        Ok(())
    }

    /// Extracts an archive located at `dir/file` into `dir`, restoring
    /// entry modification times and enforcing quota and path safety on every
    /// entry.
    pub fn decompress(&self, dir: &str, file: &str) -> Result<()> {
        let format = ArchiveFormat::from_name(file)
            .ok_or_else(|| CommonError::invalid_input(format!("{file}: unrecognized archive format")))?;
        self.space_for_decompression(dir, file)?;

        let path = join_rel(dir, file);
        match format {
            ArchiveFormat::Zip => {
                let f = self.open(&path)?;
                let mut archive = zip::ZipArchive::new(f).map_err(zip_err)?;
                for i in 0..archive.len() {
                    let mut entry = archive.by_index(i).map_err(zip_err)?;
                    let Some(name) = entry.enclosed_name() else {
                        continue;
                    };
                    let target = join_rel(dir, &name.to_string_lossy());
                    if entry.is_dir() {
                        self.mkdir_all(&target, 0o755)?;
                        continue;
                    }
                    let mode = entry.unix_mode().unwrap_or(0o644) & 0o7777;
                    let size = entry.size();
                    self.write_file(&target, &mut entry, size, mode)?;
                    // by_index holds the borrow; restore the mtime after.
                    let mtime = entry.last_modified().and_then(|dt| {
                        Utc.with_ymd_and_hms(
                            i32::from(dt.year()),
                            u32::from(dt.month()),
                            u32::from(dt.day()),
                            u32::from(dt.hour()),
                            u32::from(dt.minute()),
                            u32::from(dt.second()),
                        )
                        .single()
                    });
                    if let Some(mtime) = mtime {
                        self.chtimes(&target, None, Some(mtime))?;
                    }
                }
            }
            _ => {
                let f = self.open(&path)?;
                let mut reader = tar_reader(f, format);
                let mut archive = tar::Archive::new(&mut reader);
                for entry in archive.entries()? {
                    let mut entry = entry?;
                    let rel = entry.path()?.into_owned();
                    let target = join_rel(dir, &rel.to_string_lossy());
                    let header = entry.header();
                    let mode = (header.mode().unwrap_or(0o644)) & 0o7777;
                    let mtime = header.mtime().ok().and_then(|s| {
                        DateTime::<Utc>::from_timestamp(s as i64, 0)
                    });
                    match header.entry_type() {
                        tar::EntryType::Directory => {
                            self.mkdir_all(&target, mode)?;
                        }
                        tar::EntryType::Symlink => {
                            if let Ok(Some(link)) = entry.link_name() {
                                let _ = self.symlink(&link.to_string_lossy(), &target);
                            }
                        }
                        tar::EntryType::Regular | tar::EntryType::Continuous
                        | tar::EntryType::GNUSparse => {
                            let size = header.size().unwrap_or(0);
                            self.write_file(&target, &mut entry, size, mode)?;
                            if let Some(mtime) = mtime {
                                self.chtimes(&target, None, Some(mtime))?;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }
}

impl Archive<'_> {
    /// Streams a plain (uncompressed) tar body into `w`; the caller owns
    /// whatever encoder wraps the writer.
    fn stream_plain_tar<W: Write>(&self, w: &mut W) -> Result<()> {
        self.stream(NoClose(w), CompressionLevel::None).map(|_| ())
    }
}

/// Write adapter that keeps the wrapped writer alive past the tar builder.
struct NoClose<'w, W: Write>(&'w mut W);

impl<W: Write> Write for NoClose<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// File wrapper counting bytes that actually reach the descriptor.
struct CountingFile {
    inner: std::fs::File,
    count: Count,
}

#[derive(Clone)]
struct Count(std::sync::Arc<std::sync::atomic::AtomicU64>);

impl Count {
    fn get(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl CountingFile {
    fn new(inner: std::fs::File) -> Self {
        Self {
            inner,
            count: Count(std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0))),
        }
    }

    fn count(&self) -> Count {
        self.count.clone()
    }
}

impl Write for CountingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count
            .0
            .fetch_add(n as u64, std::sync::atomic::Ordering::AcqRel);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn tar_reader(f: std::fs::File, format: ArchiveFormat) -> Box<dyn Read> {
    match format {
        ArchiveFormat::TarGz => Box::new(flate2::read::GzDecoder::new(f)),
        ArchiveFormat::TarBz2 => Box::new(bzip2::read::BzDecoder::new(f)),
        ArchiveFormat::TarXz => Box::new(xz2::read::XzDecoder::new(f)),
        ArchiveFormat::Zip => unreachable!("zip does not stream through tar"),
    }
}

fn zip_datetime(modified: &DateTime<Utc>) -> Option<zip::DateTime> {
    use chrono::{Datelike, Timelike};
    zip::DateTime::from_date_and_time(
        modified.year().try_into().ok()?,
        modified.month() as u8,
        modified.day() as u8,
        modified.hour() as u8,
        modified.minute() as u8,
        modified.second() as u8,
    )
    .ok()
}

fn zip_err(err: zip::result::ZipError) -> CommonError {
    match err {
        zip::result::ZipError::Io(e) => CommonError::Io(e),
        other => CommonError::invalid_input(format!("archive: {other}")),
    }
}

fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "/" {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}
