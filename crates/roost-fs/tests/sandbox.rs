//! Sandbox guarantees exercised against a real temporary directory.

use std::io::Cursor;
use std::time::Duration;

use roost_fs::{Filesystem, IgnoreSet};
use tempfile::TempDir;

fn fixture(limit: u64) -> (TempDir, Filesystem) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("server");
    let fs = Filesystem::new(&root, limit, Duration::from_secs(3600)).unwrap();
    (tmp, fs)
}

fn write(fs: &Filesystem, path: &str, data: &[u8]) {
    fs.write_file(path, &mut Cursor::new(data.to_vec()), data.len() as u64, 0o644)
        .unwrap();
}

#[test]
fn read_write_roundtrip() {
    let (_tmp, fs) = fixture(0);
    write(&fs, "config/server.properties", b"motd=hello\n");
    assert_eq!(fs.read("config/server.properties").unwrap(), b"motd=hello\n");
    assert_eq!(fs.cached_usage(), 11);
}

#[test]
fn parent_traversal_is_rejected() {
    let (tmp, fs) = fixture(0);
    std::fs::write(tmp.path().join("secret.txt"), b"top secret").unwrap();

    let err = fs.read("../secret.txt").unwrap_err();
    assert!(err.is_bad_path(), "got: {err}");

    let err = fs.remove("..").unwrap_err();
    assert!(err.is_bad_path());
}

#[test]
fn nul_byte_is_rejected() {
    let (_tmp, fs) = fixture(0);
    assert!(fs.read("a\0b").unwrap_err().is_bad_path());
}

#[test]
fn symlink_out_of_root_is_never_followed() {
    let (tmp, fs) = fixture(0);
    std::fs::write(tmp.path().join("host.txt"), b"host data").unwrap();

    // Absolute and relative escapes, created behind the daemon's back.
    std::os::unix::fs::symlink(tmp.path().join("host.txt"), fs.path().join("abs.txt")).unwrap();
    std::os::unix::fs::symlink("../host.txt", fs.path().join("rel.txt")).unwrap();

    for link in ["abs.txt", "rel.txt"] {
        let err = fs.read(link).unwrap_err();
        assert!(err.is_bad_path(), "{link}: got {err}");
    }
}

#[test]
fn symlink_inside_root_is_followed() {
    let (_tmp, fs) = fixture(0);
    write(&fs, "real.txt", b"data");
    fs.symlink("real.txt", "alias.txt").unwrap();
    assert_eq!(fs.read("alias.txt").unwrap(), b"data");
}

#[test]
fn rename_guards_the_root() {
    let (_tmp, fs) = fixture(0);
    write(&fs, "a.txt", b"a");

    assert!(fs.rename("/", "elsewhere").unwrap_err().is_bad_path());
    assert!(fs.rename("a.txt", "/").unwrap_err().is_bad_path());
    assert!(fs.rename("a.txt", "../a.txt").unwrap_err().is_bad_path());

    fs.rename("a.txt", "b.txt").unwrap();
    assert_eq!(fs.read("b.txt").unwrap(), b"a");
    assert!(fs.read("a.txt").unwrap_err().is_not_found());
}

#[test]
fn remove_refuses_root_and_decrements_usage() {
    let (_tmp, fs) = fixture(0);
    write(&fs, "data.bin", &[0u8; 128]);
    assert_eq!(fs.cached_usage(), 128);

    assert!(fs.remove("").unwrap_err().is_bad_path());
    assert!(fs.remove("/").unwrap_err().is_bad_path());

    fs.remove("data.bin").unwrap();
    assert_eq!(fs.cached_usage(), 0);
}

#[test]
fn quota_refuses_write_before_touching_disk() {
    let (_tmp, fs) = fixture(100);
    write(&fs, "fits.bin", &[0u8; 80]);

    let err = fs
        .write_file("huge.bin", &mut Cursor::new(vec![0u8; 50]), 50, 0o644)
        .unwrap_err();
    assert!(err.is_disk_space());
    // No partial file was created.
    assert!(fs.lstat("huge.bin").unwrap_err().is_not_found());

    // Overwriting an existing file only accounts for the delta.
    fs.write_file("fits.bin", &mut Cursor::new(vec![1u8; 90]), 90, 0o644)
        .unwrap();
    assert_eq!(fs.cached_usage(), 90);
}

#[test]
fn disk_usage_walk_matches_reality() {
    let (_tmp, fs) = fixture(0);
    write(&fs, "a/one.bin", &[0u8; 10]);
    write(&fs, "a/b/two.bin", &[0u8; 20]);
    write(&fs, "three.bin", &[0u8; 30]);

    assert_eq!(fs.disk_usage(true).unwrap(), 60);
}

#[test]
fn list_dir_sorts_directories_first() {
    let (_tmp, fs) = fixture(0);
    write(&fs, "zeta.txt", b"z");
    write(&fs, "Alpha.txt", b"a");
    fs.mkdir_all("worlds", 0o755).unwrap();

    let names: Vec<String> = fs
        .list_dir("/")
        .unwrap()
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert_eq!(names, vec!["worlds", "Alpha.txt", "zeta.txt"]);
}

#[test]
fn mkdir_all_creates_nested_paths() {
    let (_tmp, fs) = fixture(0);
    fs.mkdir_all("plugins/Essentials/userdata", 0o755).unwrap();
    assert!(fs.stat("plugins/Essentials/userdata").unwrap().is_dir());
}

#[test]
fn chtimes_preserves_omitted_fields() {
    let (_tmp, fs) = fixture(0);
    write(&fs, "a.txt", b"a");

    let mtime = chrono::DateTime::from_timestamp(1_600_000_000, 0).unwrap();
    fs.chtimes("a.txt", None, Some(mtime)).unwrap();
    let info = fs.stat("a.txt").unwrap();
    assert_eq!(info.modified.timestamp(), 1_600_000_000);
}

#[test]
fn chmod_applies_permission_bits() {
    let (_tmp, fs) = fixture(0);
    write(&fs, "run.sh", b"#!/bin/sh\n");
    fs.chmod("run.sh", 0o755).unwrap();
    assert_eq!(fs.stat("run.sh").unwrap().mode_bits, "755");
}

#[test]
fn copy_file_picks_free_suffix() {
    let (_tmp, fs) = fixture(0);
    write(&fs, "map.dat", b"level");

    let first = fs.copy_file("map.dat").unwrap();
    assert_eq!(first, "map copy.dat");
    let second = fs.copy_file("map.dat").unwrap();
    assert_eq!(second, "map copy 2.dat");
    assert_eq!(fs.read(&second).unwrap(), b"level");
}

#[test]
fn truncate_root_empties_everything() {
    let (_tmp, fs) = fixture(0);
    write(&fs, "a/b/c.txt", b"abc");
    write(&fs, "top.txt", b"top");

    fs.truncate_root().unwrap();
    assert!(fs.list_dir("/").unwrap().is_empty());
    assert_eq!(fs.cached_usage(), 0);
}

#[test]
fn remove_all_takes_symlinks_not_their_targets() {
    let (_tmp, fs) = fixture(0);
    write(&fs, "keep/data.txt", b"important");
    fs.mkdir_all("junk", 0o755).unwrap();
    fs.symlink("keep", "junk/link-to-keep").unwrap();

    fs.remove_all("junk").unwrap();
    assert_eq!(fs.read("keep/data.txt").unwrap(), b"important");
}

#[test]
fn archive_honors_ignore_set() {
    let (tmp, fs) = fixture(0);
    write(&fs, "world/level.dat", b"level");
    write(&fs, "cache/junk.bin", b"junk");
    write(&fs, "server.log", b"log");

    let ignore = IgnoreSet::from_text("cache/\n*.log").unwrap();
    let dst = tmp.path().join("backup.tar.gz");
    roost_fs::Archive::new(&fs)
        .with_ignore(ignore)
        .create(&dst, roost_fs::CompressionLevel::BestSpeed)
        .unwrap();

    let file = std::fs::File::open(&dst).unwrap();
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();

    assert!(names.contains(&"world/level.dat".to_string()));
    assert!(!names.iter().any(|n| n.starts_with("cache")));
    assert!(!names.contains(&"server.log".to_string()));
}

#[test]
fn compress_then_decompress_roundtrips() {
    for ext in ["zip", "tar.gz", "tar.bz2", "tar.xz"] {
        let (_tmp, fs) = fixture(0);
        write(&fs, "data/a.txt", b"alpha");
        write(&fs, "data/sub/b.txt", b"beta");
        let mtime = chrono::DateTime::from_timestamp(1_500_000_000, 0).unwrap();
        fs.chtimes("data/a.txt", None, Some(mtime)).unwrap();

        let format = roost_fs::ArchiveFormat::from_extension(ext).unwrap();
        let (_, archive_path) = fs
            .compress_files("/", Some("bundle"), &["data".to_string()], format)
            .unwrap();
        assert_eq!(archive_path, format!("bundle.{ext}"));

        fs.remove_all("data").unwrap();
        fs.decompress("/", &archive_path).unwrap();

        assert_eq!(fs.read("data/a.txt").unwrap(), b"alpha", "{ext}");
        assert_eq!(fs.read("data/sub/b.txt").unwrap(), b"beta", "{ext}");
        let restored = fs.stat("data/a.txt").unwrap();
        assert_eq!(restored.modified.timestamp(), 1_500_000_000, "{ext}");
    }
}

#[test]
fn decompress_respects_quota() {
    let (_tmp, fs) = fixture(4096);
    write(&fs, "data/big.bin", &[7u8; 3000]);
    let format = roost_fs::ArchiveFormat::from_extension("tar.gz").unwrap();
    let (_, archive_path) = fs
        .compress_files("/", Some("bundle"), &["data".to_string()], format)
        .unwrap();
    // With the original still on disk the extraction cannot fit.
    let err = fs.decompress("/", &archive_path).unwrap_err();
    assert!(err.is_disk_space(), "got: {err}");
}

#[test]
fn search_matches_substring_glob_and_extension() {
    let (_tmp, fs) = fixture(0);
    write(&fs, "plugins/Essentials.jar", b"jar");
    write(&fs, "plugins/WorldEdit.jar", b"jar");
    write(&fs, "logs/latest.log", b"log");
    write(&fs, "node_modules/pkg/index.jar", b"jar");

    let mut opts = roost_fs::SearchOptions {
        pattern: "essentials".into(),
        ..Default::default()
    };
    let hits = fs.search("/", &opts).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "plugins/Essentials.jar");

    opts.pattern = "*.jar".into();
    let hits = fs.search("/", &opts).unwrap();
    // node_modules is blacklisted.
    assert_eq!(hits.len(), 2);

    opts.pattern = ".log".into();
    let hits = fs.search("/", &opts).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "logs/latest.log");

    opts.pattern = "ab".into();
    assert!(fs.search("/", &opts).is_err());
}

#[test]
fn stat_of_symlink_vs_lstat() {
    let (_tmp, fs) = fixture(0);
    write(&fs, "real.txt", b"data");
    fs.symlink("real.txt", "alias.txt").unwrap();

    assert!(fs.stat("alias.txt").unwrap().is_file());
    assert!(fs.lstat("alias.txt").unwrap().is_symlink());
}
