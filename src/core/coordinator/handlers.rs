//! Worker message dispatch.
//!
//! One handler application per received line: each handler either completes
//! its state update or reports that the connection must be dropped. Handlers
//! never leave a partially updated record behind; payload reads happen
//! before any task or worker state changes.

use super::Coordinator;
use crate::core::protocol::{WorkerMessage, parse_worker_message};
use crate::core::task::{ResultCode, TaskState};
use crate::core::timestamp_us;
use crate::core::worker::{CachedArtifactInfo, WorkerType};
use crate::logging::txn::DisconnectReason;
use log::{debug, warn};
use rand::Rng;
use rand::distributions::Alphanumeric;

/// What the dispatcher should do after a message was handled.
pub(super) enum MessageAction {
    /// Keep the connection.
    Continue,
    /// Drop the connection for the given reason.
    Disconnect(DisconnectReason),
}

/// Apply one worker-originated line to the coordinator state.
pub(super) async fn handle_message(
    coordinator: &mut Coordinator,
    hashkey: &str,
    line: &str,
) -> MessageAction {
    let Some(message) = parse_worker_message(line) else {
        debug!("worker {} sent unrecognized message: {}", hashkey, line);
        return MessageAction::Disconnect(DisconnectReason::Failure);
    };

    match message {
        WorkerMessage::Hello { protocol } => handle_hello(coordinator, hashkey, protocol).await,
        WorkerMessage::Auth(digest) => handle_auth(coordinator, hashkey, &digest).await,
        WorkerMessage::Ready {
            workerid,
            hostname,
            os,
            arch,
            version,
            features,
        } => handle_ready(
            coordinator,
            hashkey,
            workerid,
            hostname,
            os,
            arch,
            version,
            features,
        ),
        WorkerMessage::Status => handle_status(coordinator, hashkey).await,
        WorkerMessage::FromFactory(name) => {
            if let Some(worker) = coordinator.workers.get_mut(hashkey) {
                worker.factory_name = Some(name);
            }
            MessageAction::Continue
        }
        WorkerMessage::ResourceReport(resources) => {
            if let Some(worker) = coordinator.workers.get_mut(hashkey) {
                worker.resources = resources;
                debug!(
                    "worker {} ({}) reports {}",
                    worker.hostname, worker.addrport, resources
                );
            }
            if let Some(txn) = &mut coordinator.txn_log {
                txn.worker_resources(timestamp_us(), hashkey, &resources);
            }
            MessageAction::Continue
        }
        WorkerMessage::EndTime(epoch_secs) => {
            if let Some(worker) = coordinator.workers.get_mut(hashkey) {
                worker.end_time_us = if epoch_secs == 0 {
                    None
                } else {
                    Some(epoch_secs * 1_000_000)
                };
            }
            MessageAction::Continue
        }
        WorkerMessage::Feature(name) => {
            if let Some(worker) = coordinator.workers.get_mut(hashkey) {
                worker.features.insert(name);
            }
            MessageAction::Continue
        }
        WorkerMessage::CacheUpdate {
            fingerprint,
            size,
            mtime,
            transfer_time,
        } => {
            if let Some(worker) = coordinator.workers.get_mut(hashkey) {
                worker.cache.insert(
                    fingerprint,
                    CachedArtifactInfo {
                        size,
                        mtime,
                        transfer_time,
                    },
                );
            }
            MessageAction::Continue
        }
        WorkerMessage::CacheInvalidate(fingerprint) => {
            if let Some(worker) = coordinator.workers.get_mut(hashkey) {
                worker.cache.remove(&fingerprint);
            }
            MessageAction::Continue
        }
        WorkerMessage::TaskResult {
            taskid,
            status,
            exit_code,
            stdout_len,
        } => handle_result(coordinator, hashkey, taskid, status, exit_code, stdout_len).await,
        WorkerMessage::Measured {
            taskid,
            resources,
            wall_time,
        } => {
            if coordinator.worker_of_task.get(&taskid).map(String::as_str) == Some(hashkey) {
                if let Some(task) = coordinator.tasks.get_mut(&taskid) {
                    task.resources_measured = resources;
                    task.time_workers_execute_last = wall_time;
                }
            }
            MessageAction::Continue
        }
        WorkerMessage::WatchUpdate { taskid, len } => {
            handle_watch_update(coordinator, hashkey, taskid, len).await
        }
        WorkerMessage::Alive => MessageAction::Continue,
    }
}

async fn handle_hello(
    coordinator: &mut Coordinator,
    hashkey: &str,
    protocol: u32,
) -> MessageAction {
    use crate::core::protocol::PROTOCOL_VERSION;
    if protocol != PROTOCOL_VERSION {
        warn!(
            "peer {} speaks protocol {} but this coordinator requires {}",
            hashkey, protocol, PROTOCOL_VERSION
        );
        return MessageAction::Disconnect(DisconnectReason::Failure);
    }
    let challenge = coordinator.password.as_ref().map(|_| {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect::<String>()
    });
    let short = coordinator.tuning.short_timeout;
    let Some(worker) = coordinator.workers.get_mut(hashkey) else {
        return MessageAction::Continue;
    };
    worker.greeted = true;
    match challenge {
        Some(nonce) => {
            worker.auth_nonce = Some(nonce.clone());
            if worker
                .link
                .send_line(&format!("challenge {}", nonce), short)
                .await
                .is_err()
            {
                return MessageAction::Disconnect(DisconnectReason::Failure);
            }
        }
        None => worker.authenticated = true,
    }
    MessageAction::Continue
}

async fn handle_auth(coordinator: &mut Coordinator, hashkey: &str, digest: &str) -> MessageAction {
    let Some(password) = coordinator.password.clone() else {
        // auth without a configured password is a protocol violation
        return MessageAction::Disconnect(DisconnectReason::Failure);
    };
    let short = coordinator.tuning.short_timeout;
    let Some(worker) = coordinator.workers.get_mut(hashkey) else {
        return MessageAction::Continue;
    };
    let Some(nonce) = worker.auth_nonce.take() else {
        return MessageAction::Disconnect(DisconnectReason::Failure);
    };
    let expected = format!("{:x}", md5::compute(format!("{}{}", nonce, password)));
    if digest != expected {
        warn!("worker {} failed the password challenge", hashkey);
        return MessageAction::Disconnect(DisconnectReason::Failure);
    }
    worker.authenticated = true;
    if worker.link.send_line("ok", short).await.is_err() {
        return MessageAction::Disconnect(DisconnectReason::Failure);
    }
    MessageAction::Continue
}

#[allow(clippy::too_many_arguments)]
fn handle_ready(
    coordinator: &mut Coordinator,
    hashkey: &str,
    workerid: String,
    hostname: String,
    os: String,
    arch: String,
    version: String,
    features: Vec<String>,
) -> MessageAction {
    let authenticated_required = coordinator.password.is_some();
    let Some(worker) = coordinator.workers.get_mut(hashkey) else {
        return MessageAction::Continue;
    };
    if !worker.greeted || (authenticated_required && !worker.authenticated) {
        warn!("worker {} sent ready before completing the handshake", hashkey);
        return MessageAction::Disconnect(DisconnectReason::Failure);
    }
    worker.worker_type = WorkerType::Worker;
    worker.workerid = workerid;
    worker.hostname = hostname;
    worker.os = os;
    worker.arch = arch;
    worker.version = version;
    for feature in features {
        worker.features.insert(feature);
    }
    debug!(
        "worker {} ({}) ready: {} {} {}",
        worker.workerid, worker.addrport, worker.hostname, worker.os, worker.arch
    );
    MessageAction::Continue
}

async fn handle_status(coordinator: &mut Coordinator, hashkey: &str) -> MessageAction {
    coordinator.refresh_gauges();
    let dump = serde_json::to_string(&coordinator.stats).unwrap_or_else(|_| "{}".to_string());
    let short = coordinator.tuning.short_timeout;
    if let Some(worker) = coordinator.workers.get_mut(hashkey) {
        worker.worker_type = WorkerType::Status;
        let _ = worker.link.send_line(&dump, short).await;
    }
    MessageAction::Disconnect(DisconnectReason::StatusClient)
}

async fn handle_result(
    coordinator: &mut Coordinator,
    hashkey: &str,
    taskid: u64,
    status: u32,
    exit_code: i64,
    stdout_len: u64,
) -> MessageAction {
    let long = coordinator.tuning.long_timeout;
    let payload = {
        let Some(worker) = coordinator.workers.get_mut(hashkey) else {
            return MessageAction::Continue;
        };
        match worker.link.recv_exact(stdout_len as usize, long).await {
            Ok(payload) => payload,
            Err(e) => {
                debug!("failed to read stdout of task {}: {}", taskid, e);
                return MessageAction::Disconnect(DisconnectReason::Failure);
            }
        }
    };

    if coordinator.worker_of_task.get(&taskid).map(String::as_str) != Some(hashkey) {
        // Result for a task no longer bound here (canceled or reassigned).
        debug!("ignoring result for unbound task {}", taskid);
        return MessageAction::Continue;
    }
    let now = timestamp_us();
    let Some(task) = coordinator.tasks.get_mut(&taskid) else {
        return MessageAction::Continue;
    };
    if task.state != TaskState::Running {
        debug!("ignoring result for task {} in state {:?}", taskid, task.state);
        return MessageAction::Continue;
    }

    task.output = Some(payload);
    task.exit_code = exit_code;
    task.update_result(ResultCode::from_wire(status));
    if task.time_workers_execute_last == 0 {
        task.time_workers_execute_last = now.saturating_sub(task.time_when_commit_end);
    }
    task.time_workers_execute_all += task.time_workers_execute_last;
    task.state = TaskState::WaitingRetrieval;
    coordinator.waiting_retrieval.push_back(taskid);
    debug!(
        "task {} finished on {} with status {} exit {}",
        taskid, hashkey, status, exit_code
    );
    MessageAction::Continue
}

/// Append an incremental chunk of a watched output to its local file.
async fn handle_watch_update(
    coordinator: &mut Coordinator,
    hashkey: &str,
    taskid: u64,
    len: u64,
) -> MessageAction {
    let long = coordinator.tuning.long_timeout;
    let payload = {
        let Some(worker) = coordinator.workers.get_mut(hashkey) else {
            return MessageAction::Continue;
        };
        match worker.link.recv_exact(len as usize, long).await {
            Ok(payload) => payload,
            Err(_) => return MessageAction::Disconnect(DisconnectReason::Failure),
        }
    };

    let destination = coordinator.tasks.get(&taskid).and_then(|task| {
        task.outputs
            .iter()
            .find(|artifact| artifact.flags.watch)
            .map(|artifact| artifact.source.clone())
    });
    let Some(destination) = destination else {
        debug!("watch update for task {} with no watched output", taskid);
        return MessageAction::Continue;
    };

    let path = std::path::Path::new(&destination);
    if crate::core::fs_util::create_parent_dirs(path).is_err() {
        warn!("cannot create parents for watched output {}", destination);
        return MessageAction::Continue;
    }
    use std::io::Write;
    let appended = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(&payload));
    match appended {
        Ok(()) => {
            coordinator.stats.bytes_received += len;
            if let Some(task) = coordinator.tasks.get_mut(&taskid) {
                task.bytes_received += len;
                task.bytes_transferred += len;
            }
        }
        Err(e) => warn!("cannot append watched output {}: {}", destination, e),
    }
    MessageAction::Continue
}
