//! Scheduling behavior observed end-to-end: resource gating, priorities,
//! feature requirements, and the hungry/large-task signals.

mod common;

use common::{MockWorkerConfig, spawn_worker, test_config, wait_for_task};
use taskforge::core::{Coordinator, ResultCode, Task};
use tempfile::TempDir;

#[tokio::test]
async fn oversized_task_is_never_dispatched_and_queue_stays_hungry() {
    let mut config = test_config();
    let scratch = TempDir::new().unwrap();
    let txn_path = scratch.path().join("txn.log");
    config.logs.transaction_log = Some(txn_path.clone());

    let mut coordinator = Coordinator::create(config).await.unwrap();
    let worker = spawn_worker(
        coordinator.port(),
        MockWorkerConfig {
            cores: 1,
            ..Default::default()
        },
    )
    .await;

    let mut task = Task::new("echo never");
    task.specify_cores(2);
    let taskid = coordinator.submit(task).unwrap();

    let outcome = wait_for_task(&mut coordinator, 3).await;
    assert!(outcome.is_none(), "a 2-core task must not run on a 1-core worker");
    assert!(coordinator.hungry() > 0);
    assert_eq!(worker.stats.tasks_executed.load(std::sync::atomic::Ordering::SeqCst), 0);

    // the periodic large-task check made the mismatch observable
    let txn = std::fs::read_to_string(&txn_path).unwrap();
    assert!(
        txn.contains(&format!("TASK {} LARGER-THAN-ANY-WORKER", taskid)),
        "transaction log was: {}",
        txn
    );

    coordinator.cancel_by_taskid(taskid).await;
}

#[tokio::test]
async fn higher_priority_task_is_dispatched_first() {
    let mut coordinator = Coordinator::create(test_config()).await.unwrap();
    let _worker = spawn_worker(
        coordinator.port(),
        MockWorkerConfig {
            cores: 1,
            ..Default::default()
        },
    )
    .await;

    let mut low = Task::new("echo low");
    low.specify_priority(1.0);
    let mut high = Task::new("echo high");
    high.specify_priority(10.0);
    coordinator.submit(low).unwrap();
    let high_id = coordinator.submit(high).unwrap();

    let first = wait_for_task(&mut coordinator, 30).await.expect("first task");
    assert_eq!(first.taskid, high_id, "priority 10 must finish before priority 1");
    let second = wait_for_task(&mut coordinator, 30).await.expect("second task");
    assert_eq!(second.result, ResultCode::Success);
}

#[tokio::test]
async fn feature_requirements_gate_dispatch() {
    let mut coordinator = Coordinator::create(test_config()).await.unwrap();
    let plain = spawn_worker(coordinator.port(), MockWorkerConfig::default()).await;

    let mut task = Task::new("echo gpu");
    task.specify_feature("gpu-compute");
    let taskid = coordinator.submit(task).unwrap();

    assert!(wait_for_task(&mut coordinator, 2).await.is_none());
    assert_eq!(plain.stats.tasks_executed.load(std::sync::atomic::Ordering::SeqCst), 0);

    let _capable = spawn_worker(
        coordinator.port(),
        MockWorkerConfig {
            features: vec!["gpu-compute".to_string()],
            workerid: "gpu-worker".to_string(),
            ..Default::default()
        },
    )
    .await;

    let done = wait_for_task(&mut coordinator, 30).await.expect("gpu task");
    assert_eq!(done.taskid, taskid);
    assert_eq!(done.result, ResultCode::Success);
}

#[tokio::test]
async fn resource_release_allows_sequential_dispatch() {
    let mut coordinator = Coordinator::create(test_config()).await.unwrap();
    let worker = spawn_worker(
        coordinator.port(),
        MockWorkerConfig {
            cores: 1,
            ..Default::default()
        },
    )
    .await;

    for _ in 0..3 {
        coordinator.submit(Task::new("echo seq")).unwrap();
    }
    let mut finished = 0;
    while finished < 3 {
        let task = wait_for_task(&mut coordinator, 30).await.expect("sequential task");
        assert_eq!(task.result, ResultCode::Success);
        finished += 1;
    }
    assert_eq!(
        worker.stats.tasks_executed.load(std::sync::atomic::Ordering::SeqCst),
        3
    );
    assert!(coordinator.empty());
}

#[tokio::test]
async fn stats_reflect_connected_workers_and_done_tasks() {
    let mut coordinator = Coordinator::create(test_config()).await.unwrap();
    let _worker = spawn_worker(coordinator.port(), MockWorkerConfig::default()).await;

    coordinator.submit(Task::new("echo stats")).unwrap();
    let _ = wait_for_task(&mut coordinator, 30).await.expect("task");

    let stats = coordinator.stats();
    assert_eq!(stats.workers_connected, 1);
    assert_eq!(stats.tasks_submitted, 1);
    assert_eq!(stats.tasks_done, 1);
    assert_eq!(stats.tasks_failed, 0);
    assert_eq!(stats.tasks_dispatched, 1);
    assert!(stats.total_resources.cores >= 4);
}
