//! Artifact staging behavior: cache hits, URL and command inputs, recursive
//! directories, file pieces, and missing outputs.

mod common;

use common::{MockWorkerConfig, spawn_worker, test_config, wait_for_task};
use std::sync::atomic::Ordering;
use taskforge::core::{ArtifactFlags, Coordinator, ResultCode, Task};
use tempfile::TempDir;

#[tokio::test]
async fn cached_url_input_is_fetched_once_per_worker() {
    let mut coordinator = Coordinator::create(test_config()).await.unwrap();
    let worker = spawn_worker(coordinator.port(), MockWorkerConfig::default()).await;

    let mut first = Task::new("cat data.in");
    first
        .specify_input_url("http://example.test/data", "data.in", ArtifactFlags::cached())
        .unwrap();
    coordinator.submit(first).unwrap();
    let done = wait_for_task(&mut coordinator, 30).await.expect("first url task");
    assert_eq!(done.result, ResultCode::Success);
    let output = String::from_utf8_lossy(done.output.as_deref().unwrap_or(&[])).into_owned();
    assert!(output.contains("fetched:http://example.test/data"));
    assert_eq!(worker.stats.puturl_received.load(Ordering::SeqCst), 1);

    // same URL again: the worker-side cache satisfies the input
    let mut second = Task::new("cat data.in");
    second
        .specify_input_url("http://example.test/data", "data.in", ArtifactFlags::cached())
        .unwrap();
    coordinator.submit(second).unwrap();
    let done = wait_for_task(&mut coordinator, 30).await.expect("second url task");
    assert_eq!(done.result, ResultCode::Success);
    assert_eq!(
        worker.stats.puturl_received.load(Ordering::SeqCst),
        1,
        "second task must hit the worker cache"
    );
}

#[tokio::test]
async fn cached_file_input_is_transferred_once() {
    let mut coordinator = Coordinator::create(test_config()).await.unwrap();
    let worker = spawn_worker(coordinator.port(), MockWorkerConfig::default()).await;

    let scratch = TempDir::new().unwrap();
    let source = scratch.path().join("shared.txt");
    std::fs::write(&source, "shared input contents").unwrap();

    for _ in 0..2 {
        let mut task = Task::new("cat shared.txt");
        task.specify_input_file(
            &source.to_string_lossy(),
            "shared.txt",
            ArtifactFlags::cached(),
        )
        .unwrap();
        coordinator.submit(task).unwrap();
        let done = wait_for_task(&mut coordinator, 30).await.expect("task");
        assert_eq!(done.result, ResultCode::Success);
    }
    assert_eq!(
        worker.stats.transfers_received.load(Ordering::SeqCst),
        1,
        "the cached input must only cross the wire once"
    );
}

#[tokio::test]
async fn directory_input_preserves_the_tree_shape() {
    let mut coordinator = Coordinator::create(test_config()).await.unwrap();
    let _worker = spawn_worker(coordinator.port(), MockWorkerConfig::default()).await;

    let scratch = TempDir::new().unwrap();
    let tree = scratch.path().join("tree");
    std::fs::create_dir_all(tree.join("b")).unwrap();
    std::fs::write(tree.join("a"), "alpha").unwrap();
    std::fs::write(tree.join("b/c"), "nested").unwrap();

    let listing = scratch.path().join("listing.txt");
    let mut task = Task::new("find tree -type f | sort > listing.txt");
    task.specify_input_directory(&tree.to_string_lossy(), "tree", ArtifactFlags::default())
        .unwrap();
    task.specify_output_file(
        &listing.to_string_lossy(),
        "listing.txt",
        ArtifactFlags::default(),
    )
    .unwrap();
    coordinator.submit(task).unwrap();

    let done = wait_for_task(&mut coordinator, 30).await.expect("directory task");
    assert_eq!(done.result, ResultCode::Success);
    let listing = std::fs::read_to_string(&listing).unwrap();
    assert_eq!(listing, "tree/a\ntree/b/c\n");
}

#[tokio::test]
async fn file_piece_sends_only_the_requested_range() {
    let mut coordinator = Coordinator::create(test_config()).await.unwrap();
    let _worker = spawn_worker(coordinator.port(), MockWorkerConfig::default()).await;

    let scratch = TempDir::new().unwrap();
    let source = scratch.path().join("alphabet.txt");
    std::fs::write(&source, "abcdefghijklmnopqrstuvwxyz").unwrap();

    let mut task = Task::new("cat slice.txt");
    task.specify_input_piece(
        &source.to_string_lossy(),
        "slice.txt",
        2,
        6,
        ArtifactFlags::default(),
    )
    .unwrap();
    coordinator.submit(task).unwrap();

    let done = wait_for_task(&mut coordinator, 30).await.expect("piece task");
    assert_eq!(done.result, ResultCode::Success);
    let output = String::from_utf8_lossy(done.output.as_deref().unwrap_or(&[])).into_owned();
    assert_eq!(output, "cdefg");
}

#[tokio::test]
async fn command_input_is_generated_at_the_worker() {
    let mut coordinator = Coordinator::create(test_config()).await.unwrap();
    let worker = spawn_worker(coordinator.port(), MockWorkerConfig::default()).await;

    let mut task = Task::new("cat generated.txt");
    task.specify_input_command(
        "printf remote-made",
        "generated.txt",
        ArtifactFlags::cached(),
    )
    .unwrap();
    coordinator.submit(task).unwrap();

    let done = wait_for_task(&mut coordinator, 30).await.expect("putcmd task");
    assert_eq!(done.result, ResultCode::Success);
    let output = String::from_utf8_lossy(done.output.as_deref().unwrap_or(&[])).into_owned();
    assert_eq!(output, "remote-made");
    assert_eq!(worker.stats.putcmd_received.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_output_is_recorded_without_losing_other_outputs() {
    let mut coordinator = Coordinator::create(test_config()).await.unwrap();
    let _worker = spawn_worker(coordinator.port(), MockWorkerConfig::default()).await;

    let scratch = TempDir::new().unwrap();
    let produced = scratch.path().join("produced.txt");
    let absent = scratch.path().join("absent.txt");

    let mut task = Task::new("echo made > produced.txt");
    task.specify_output_file(
        &produced.to_string_lossy(),
        "produced.txt",
        ArtifactFlags::default(),
    )
    .unwrap();
    task.specify_output_file(
        &absent.to_string_lossy(),
        "never-made.txt",
        ArtifactFlags::default(),
    )
    .unwrap();
    coordinator.submit(task).unwrap();

    let done = wait_for_task(&mut coordinator, 30).await.expect("partial task");
    assert_eq!(done.result, ResultCode::OutputMissing);
    assert!(produced.exists(), "the produced output must still be delivered");
    assert!(!absent.exists());
}

#[tokio::test]
async fn failure_only_outputs_are_skipped_on_success() {
    let mut coordinator = Coordinator::create(test_config()).await.unwrap();
    let _worker = spawn_worker(coordinator.port(), MockWorkerConfig::default()).await;

    let scratch = TempDir::new().unwrap();
    let log_path = scratch.path().join("debug.log");

    let mut task = Task::new("echo all-good > debug.log");
    let mut flags = ArtifactFlags::default();
    flags.failure_only = true;
    task.specify_output_file(&log_path.to_string_lossy(), "debug.log", flags)
        .unwrap();
    coordinator.submit(task).unwrap();

    let done = wait_for_task(&mut coordinator, 30).await.expect("task");
    assert_eq!(done.result, ResultCode::Success);
    assert!(
        !log_path.exists(),
        "failure-only outputs must not be fetched for successful tasks"
    );
}

#[tokio::test]
async fn absolute_and_traversal_remote_names_are_rejected() {
    let mut task = Task::new("echo nope");
    assert!(
        task.specify_input_file("/tmp/x", "/abs", ArtifactFlags::default())
            .is_err()
    );
    assert!(
        task.specify_input_file("/tmp/x", "../up", ArtifactFlags::default())
            .is_err()
    );
    assert!(task.specify_output_file("/tmp/x", "ok/name", ArtifactFlags::default()).is_ok());
}
