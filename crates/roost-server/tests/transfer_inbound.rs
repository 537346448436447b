//! Inbound transfer pipeline, driven with synthetic multipart parts.

mod common;

use std::sync::Arc;

use common::MockRemote;
use flate2::write::GzEncoder;
use flate2::Compression;
use roost_env::docker::DockerSettings;
use roost_remote::RemoteClient;
use roost_server::transfer::Incoming;
use roost_server::{activity::ActivityStore, Manager, NodeSettings};
use sha2::{Digest, Sha256};
use uuid::Uuid;

fn manager_fixture() -> (tempfile::TempDir, Arc<Manager>, Arc<MockRemote>) {
    let tmp = tempfile::TempDir::new().unwrap();
    let node = NodeSettings {
        data_dir: tmp.path().join("volumes"),
        backup_dir: tmp.path().join("backups"),
        log_dir: tmp.path().join("logs"),
        tmp_dir: tmp.path().join("tmp"),
        ..Default::default()
    };
    let remote = MockRemote::new();
    let activity =
        Arc::new(ActivityStore::open(&tmp.path().join("activity.db")).unwrap());
    let docker = bollard::Docker::connect_with_local_defaults().unwrap();
    let manager = Manager::new(
        remote.clone() as Arc<dyn RemoteClient>,
        docker,
        DockerSettings::default(),
        activity,
        node,
    );
    (tmp, manager, remote)
}

/// A tar.gz archive containing one file, as the outbound side would send.
fn archive_bytes() -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
    let mut header = tar::Header::new_gnu();
    let contents = b"gamemode=survival\n";
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(1_600_000_000);
    header.set_entry_type(tar::EntryType::Regular);
    builder
        .append_data(&mut header, "server.properties", contents.as_slice())
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn checksum_match_completes_the_transfer() {
    let (_tmp, manager, remote) = manager_fixture();
    let uuid = Uuid::new_v4();

    let mut incoming = Incoming::prepare(Arc::clone(&manager), uuid).await.unwrap();
    assert!(incoming.server().is_transferring());

    let bytes = archive_bytes();
    let digest = hex::encode(Sha256::digest(&bytes));

    incoming
        .receive_archive(std::io::Cursor::new(bytes))
        .await
        .unwrap();
    incoming.verify_archive(&digest).unwrap();

    // The archive's contents landed inside the sandbox.
    let server = manager.get(uuid).unwrap();
    assert_eq!(
        server.filesystem().read("server.properties").unwrap(),
        b"gamemode=survival\n"
    );

    incoming.finish().await.unwrap();
    let server = manager.get(uuid).unwrap();
    assert!(!server.is_transferring());
    assert_eq!(*remote.transfer_reports.lock().unwrap(), vec![(uuid, true)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn checksum_mismatch_wipes_the_skeleton() {
    let (_tmp, manager, remote) = manager_fixture();
    let uuid = Uuid::new_v4();

    let mut incoming = Incoming::prepare(Arc::clone(&manager), uuid).await.unwrap();
    let data_dir = incoming.server().filesystem().path().to_path_buf();

    incoming
        .receive_archive(std::io::Cursor::new(archive_bytes()))
        .await
        .unwrap();

    let err = incoming
        .verify_archive("deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef")
        .unwrap_err();
    assert!(matches!(err, roost_server::CommonError::ChecksumMismatch(_)));

    let failure = incoming.fail_with(err).await.unwrap_err();
    assert!(matches!(
        failure,
        roost_server::CommonError::ChecksumMismatch(_)
    ));

    // Skeleton deregistered, extracted files removed, failure reported.
    assert!(manager.get(uuid).is_none());
    assert!(!data_dir.exists());
    assert_eq!(*remote.transfer_reports.lock().unwrap(), vec![(uuid, false)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn backup_parts_verify_per_file() {
    let (tmp, manager, _remote) = manager_fixture();
    let uuid = Uuid::new_v4();
    let backup_id = Uuid::new_v4();

    let mut incoming = Incoming::prepare(Arc::clone(&manager), uuid).await.unwrap();

    let payload = b"backup archive bytes".to_vec();
    let digest = hex::encode(Sha256::digest(&payload));
    let field = format!("backup_{backup_id}.tar.gz");

    incoming
        .receive_backup(&field, std::io::Cursor::new(payload))
        .await
        .unwrap();
    incoming
        .verify_backup(&format!("checksum_{field}"), &digest)
        .unwrap();

    let stored = tmp
        .path()
        .join("backups")
        .join(uuid.to_string())
        .join(format!("{backup_id}.tar.gz"));
    assert!(stored.is_file());

    let err = incoming
        .verify_backup(&format!("checksum_{field}"), "0000")
        .unwrap_err();
    assert!(matches!(err, roost_server::CommonError::ChecksumMismatch(_)));
    drop(tmp);
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_ending_early_fails_the_transfer() {
    let (_tmp, manager, remote) = manager_fixture();
    let uuid = Uuid::new_v4();

    let incoming = Incoming::prepare(Arc::clone(&manager), uuid).await.unwrap();
    // finish() without a verified archive must take the failure path.
    assert!(incoming.finish().await.is_err());
    assert!(manager.get(uuid).is_none());
    assert_eq!(*remote.transfer_reports.lock().unwrap(), vec![(uuid, false)]);
}
