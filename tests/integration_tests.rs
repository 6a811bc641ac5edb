//! Integration tests for replica.
//!
//! Each test runs a real receiver on a loopback socket against tempdir
//! source and target trees.

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use replica::{
    ConfirmationCode, DataPayload, FileReplicator, ReplicationServer, ReplicatorClient,
    ReplicatorConfig,
};

async fn spawn_server(root: &Path) -> SocketAddr {
    let server = ReplicationServer::bind("127.0.0.1:0", root).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    addr
}

async fn connect(addr: SocketAddr, root: &Path) -> ReplicatorClient {
    ReplicatorClient::connect(&addr.to_string(), root, 10)
        .await
        .unwrap()
}

fn config_with_block_size(block_size: u64) -> ReplicatorConfig {
    ReplicatorConfig {
        block_size,
        ..ReplicatorConfig::default()
    }
}

/// Poll until `condition` holds; the transfer queue drains asynchronously.
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

// =============================================================================
// END-TO-END SCENARIOS
// =============================================================================

#[tokio::test]
async fn two_changed_blocks_are_reported_exactly() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("test.txt"), "abc1def2ghi3jkl4mno5pqr6tuv7wxy8").unwrap();
    std::fs::write(dest.path().join("test.txt"), "abc1def2ghi3XXX4mno5pqr6YYY7wxy8").unwrap();

    let addr = spawn_server(dest.path()).await;
    let client = connect(addr, src.path()).await;

    let confirmation = client.check_duplicates("test.txt", 4).await.unwrap();

    assert_eq!(confirmation.code, ConfirmationCode::ChangesReported);
    assert_eq!(confirmation.chunks.len(), 2);
    assert_eq!(confirmation.chunks[0].chunk_id, 3);
    assert_eq!(confirmation.chunks[1].chunk_id, 6);
}

#[tokio::test]
async fn empty_target_requests_every_chunk_and_converges() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let contents = "abc1def2ghi3jkl4mno5pqrs6tuv7wxy8"; // 33 bytes: 8 full blocks + 1
    std::fs::write(src.path().join("test.txt"), contents).unwrap();
    std::fs::write(dest.path().join("test.txt"), "").unwrap();

    let addr = spawn_server(dest.path()).await;
    let client = connect(addr, src.path()).await;

    let confirmation = client.check_duplicates("test.txt", 4).await.unwrap();
    assert_eq!(confirmation.code, ConfirmationCode::ChangesReported);
    assert_eq!(confirmation.chunks.len(), 9);

    let client = connect(addr, src.path()).await;
    let replicator = FileReplicator::new(client, config_with_block_size(4));
    let enqueued = replicator.process_file("test.txt").await.unwrap();
    assert_eq!(enqueued, 9);

    let target = dest.path().join("test.txt");
    wait_until("target to converge", || {
        std::fs::read(&target).map(|b| b == contents.as_bytes()).unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn attribute_only_update_changes_mode_not_bytes() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let contents = "abc1def2ghi3jkl4mno5pqrs6tuv7wxy8";
    std::fs::write(src.path().join("test.txt"), contents).unwrap();
    std::fs::write(dest.path().join("test.txt"), contents).unwrap();
    std::fs::set_permissions(
        src.path().join("test.txt"),
        std::fs::Permissions::from_mode(0o744),
    )
    .unwrap();

    let addr = spawn_server(dest.path()).await;
    let client = connect(addr, src.path()).await;
    let replicator = FileReplicator::new(client, config_with_block_size(4));

    replicator.update_ownership("test.txt").await.unwrap();

    let meta = std::fs::metadata(dest.path().join("test.txt")).unwrap();
    assert_eq!(meta.permissions().mode() & 0o7777, 0o744);
    assert_eq!(
        std::fs::read(dest.path().join("test.txt")).unwrap(),
        contents.as_bytes()
    );
}

#[tokio::test]
async fn rename_deep_path() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dest.path().join("first/second")).unwrap();
    std::fs::write(dest.path().join("first/second/test.txt"), "payload").unwrap();

    let addr = spawn_server(dest.path()).await;
    let client = connect(addr, src.path()).await;
    let replicator = FileReplicator::new(client, ReplicatorConfig::default());

    replicator
        .rename_file("first/second/test.txt", "first/second/renamed_test.txt")
        .await
        .unwrap();

    assert!(!dest.path().join("first/second/test.txt").exists());
    let renamed = dest.path().join("first/second/renamed_test.txt");
    assert_eq!(std::fs::read(renamed).unwrap(), b"payload");
}

#[tokio::test]
async fn delete_archives_deep_path() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dest.path().join("first/second")).unwrap();
    std::fs::write(dest.path().join("first/second/test.txt"), "payload").unwrap();

    let addr = spawn_server(dest.path()).await;
    let client = connect(addr, src.path()).await;
    let replicator = FileReplicator::new(client, ReplicatorConfig::default());

    replicator.delete_file("first/second/test.txt").await.unwrap();

    assert!(!dest.path().join("first/second/test.txt").exists());
    let archived = dest.path().join(".archive/first/second/test.txt");
    assert_eq!(std::fs::read(archived).unwrap(), b"payload");
}

#[tokio::test]
async fn ping_echoes() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let addr = spawn_server(dest.path()).await;
    let client = connect(addr, src.path()).await;

    let pong = client.ping("randomstring").await.unwrap();
    assert_eq!(pong.val, "randomstring");
}

// =============================================================================
// CONVERGENCE AND IDEMPOTENCE
// =============================================================================

#[tokio::test]
async fn process_file_converges_and_second_pass_is_noop() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let source_bytes = "abc1def2ghi3jkl4mno5pqrs6tuv7wxy8";
    std::fs::write(src.path().join("test.txt"), source_bytes).unwrap();
    std::fs::write(dest.path().join("test.txt"), "abc1def2ghi3XXX4mno5pqrs6YYY7wxy8").unwrap();

    let addr = spawn_server(dest.path()).await;
    let client = connect(addr, src.path()).await;
    let replicator = FileReplicator::new(client, config_with_block_size(4));

    let enqueued = replicator.process_file("test.txt").await.unwrap();
    assert!(enqueued > 0);

    let target = dest.path().join("test.txt");
    wait_until("target to converge", || {
        std::fs::read(&target).map(|b| b == source_bytes.as_bytes()).unwrap_or(false)
    })
    .await;

    // Immediately after convergence the same pass finds nothing to do.
    let confirmation = replicator
        .client()
        .check_duplicates("test.txt", 4)
        .await
        .unwrap();
    assert_eq!(confirmation.code, ConfirmationCode::ChangesNotFound);
    assert!(confirmation.chunks.is_empty());

    let enqueued = replicator.process_file("test.txt").await.unwrap();
    assert_eq!(enqueued, 0);
}

#[tokio::test]
async fn shrinking_source_truncates_target() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    // Source is 8 bytes with a changed second block; target carries an
    // extra trailing block that must disappear.
    std::fs::write(src.path().join("test.txt"), "abc1XXX2").unwrap();
    std::fs::write(dest.path().join("test.txt"), "abc1def2ghi3").unwrap();

    let addr = spawn_server(dest.path()).await;
    let client = connect(addr, src.path()).await;
    let replicator = FileReplicator::new(client, config_with_block_size(4));

    replicator.process_file("test.txt").await.unwrap();

    let target = dest.path().join("test.txt");
    wait_until("target to truncate", || {
        std::fs::read(&target).map(|b| b == b"abc1XXX2").unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn nested_file_converges_into_missing_directories() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(src.path().join("deep/nested")).unwrap();
    std::fs::write(src.path().join("deep/nested/file.txt"), "abc1def2").unwrap();

    let addr = spawn_server(dest.path()).await;
    let client = connect(addr, src.path()).await;
    let replicator = FileReplicator::new(client, config_with_block_size(4));

    replicator.sync_source().await.unwrap();

    let target = dest.path().join("deep/nested/file.txt");
    wait_until("nested file to converge", || {
        std::fs::read(&target).map(|b| b == b"abc1def2").unwrap_or(false)
    })
    .await;
}

// =============================================================================
// PATH CONTAINMENT
// =============================================================================

#[tokio::test]
async fn escaping_paths_never_mutate_outside_root() {
    let outer = tempfile::tempdir().unwrap();
    let dest = outer.path().join("root");
    std::fs::create_dir(&dest).unwrap();
    let src = tempfile::tempdir().unwrap();

    let addr = spawn_server(&dest).await;
    let client = connect(addr, src.path()).await;

    let confirmation = client
        .replicate(DataPayload {
            relative_file_path: "../escape.txt".to_string(),
            chunk_id: 0,
            block_size: 4,
            length: 4,
            data_chunk: b"evil".to_vec(),
            file_mode: 0o644,
            file_size: 4,
            uid: 0,
            gid: 0,
        })
        .await
        .unwrap();

    assert_eq!(confirmation.code, ConfirmationCode::UnhandledError);
    assert!(!outer.path().join("escape.txt").exists());

    let confirmation = client.delete_file("../escape.txt").await.unwrap();
    assert_eq!(confirmation.code, ConfirmationCode::UnhandledError);
}
