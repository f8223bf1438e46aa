//! Put pipeline: streaming task envelopes and input artifacts to a worker.
//!
//! Inputs are addressed by cache fingerprint on the wire; the task envelope
//! maps fingerprints to task-visible names. Files and directories stream
//! recursively (`dir` ... `end` framing, symlinks sent natively); URLs and
//! commands are delegated to the worker via `puturl`/`putcmd`. A transfer is
//! skipped when the worker's cache already holds the fingerprint; a cache
//! entry whose source changed on disk is used as-is with a warning, since
//! rewriting it could corrupt a concurrent task.

use super::{TransferOutcome, TransferTuning};
use crate::core::artifact::{Artifact, ArtifactKind};
use crate::core::link::Link;
use crate::core::protocol::url_encode;
use crate::core::task::{ResultCode, Task};
use crate::core::worker::{CachedArtifactInfo, Worker};
use crate::core::timestamp_us;
use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One completed input transfer, reported back for logs and statistics.
#[derive(Debug, Clone)]
pub(crate) struct TransferRecord {
    /// Fingerprint of the transferred artifact.
    pub fingerprint: String,
    /// Payload bytes moved.
    pub bytes: u64,
    /// Wall time spent, microseconds.
    pub elapsed_us: u64,
}

/// Send the full dispatch: envelope first, then every input artifact.
///
/// On success the worker has everything it needs to start the task. Any
/// failure is classified: a dead or misbehaving link is a worker failure
/// (the caller retries the task elsewhere), an unreadable input is an
/// application failure (the task is surfaced with `INPUT_MISSING`).
pub(crate) async fn put_task_on_worker(
    tuning: &TransferTuning,
    worker: &mut Worker,
    task: &mut Task,
) -> (TransferOutcome, Vec<TransferRecord>) {
    let mut records = Vec::new();

    // Check for existence of each input first; a missing source fails the
    // dispatch before any byte is committed to the wire.
    for artifact in &task.inputs {
        if matches!(
            artifact.kind,
            ArtifactKind::File | ArtifactKind::FilePiece { .. } | ArtifactKind::Directory
        ) && tokio::fs::symlink_metadata(&artifact.source).await.is_err()
        {
            debug!("input {} missing at {}", artifact.remote_name, artifact.source);
            task.update_result(ResultCode::InputMissing);
            return (TransferOutcome::AppFailure, records);
        }
    }

    if let Err(outcome) = send_envelope(tuning, worker, task).await {
        return (outcome, records);
    }

    let inputs: Vec<Artifact> = task.inputs.clone();
    for artifact in &inputs {
        let started = timestamp_us();
        let (outcome, bytes) = put_input_artifact(tuning, worker, artifact).await;
        let elapsed_us = timestamp_us().saturating_sub(started);

        if bytes > 0 {
            task.bytes_sent += bytes;
            task.bytes_transferred += bytes;
            worker.total_bytes_transferred += bytes;
            worker.total_transfer_time += elapsed_us;
            records.push(TransferRecord {
                fingerprint: artifact.fingerprint.clone(),
                bytes,
                elapsed_us,
            });
        }

        match outcome {
            TransferOutcome::Success => {}
            TransferOutcome::AppFailure => {
                task.update_result(ResultCode::InputMissing);
                return (TransferOutcome::AppFailure, records);
            }
            other => return (other, records),
        }
    }

    (TransferOutcome::Success, records)
}

/// Send the task envelope: command, environment, allocation, and the
/// fingerprint-to-name mapping for every artifact.
async fn send_envelope(
    tuning: &TransferTuning,
    worker: &mut Worker,
    task: &Task,
) -> Result<(), TransferOutcome> {
    let link = &mut worker.link;
    let t = tuning.short_timeout;

    send(link, &format!("task {}", task.taskid), t).await?;
    send(link, &format!("cmd {}", task.command.len()), t).await?;
    send_raw(link, task.command.as_bytes(), t).await?;
    if let Some(coprocess) = &task.coprocess {
        send(link, &format!("coprocess {}", url_encode(coprocess)), t).await?;
    }
    send(link, &format!("category {}", url_encode(&task.category)), t).await?;

    let alloc = &task.resources_allocated;
    for (name, value) in alloc.fields() {
        if value >= 0 {
            send(link, &format!("{} {}", name, value), t).await?;
        }
    }
    if let Some(wall_time) = task.wall_time_us {
        send(link, &format!("wall_time {}", wall_time), t).await?;
    }
    if let Some(end_time) = task.end_time_us {
        send(link, &format!("end_time {}", end_time), t).await?;
    }

    for (key, value) in &task.env {
        let entry = format!("{}={}", key, value);
        send(link, &format!("env {}", entry.len()), t).await?;
        send_raw(link, entry.as_bytes(), t).await?;
    }

    for artifact in &task.inputs {
        send(
            link,
            &format!(
                "infile {} {} {}",
                url_encode(&artifact.fingerprint),
                url_encode(&artifact.remote_name),
                artifact.flags.to_bits()
            ),
            t,
        )
        .await?;
    }
    for artifact in &task.outputs {
        send(
            link,
            &format!(
                "outfile {} {} {}",
                url_encode(&artifact.fingerprint),
                url_encode(&artifact.remote_name),
                artifact.flags.to_bits()
            ),
            t,
        )
        .await?;
    }

    send(link, "end", t).await
}

/// Send one input artifact, consulting the worker cache first.
/// Returns the outcome and the payload bytes actually moved.
async fn put_input_artifact(
    tuning: &TransferTuning,
    worker: &mut Worker,
    artifact: &Artifact,
) -> (TransferOutcome, u64) {
    match artifact.kind {
        ArtifactKind::Buffer => put_buffer(tuning, worker, artifact).await,
        ArtifactKind::Url => put_special(tuning, worker, artifact, "puturl").await,
        ArtifactKind::Command => put_special(tuning, worker, artifact, "putcmd").await,
        ArtifactKind::EmptyDirectory => put_empty_directory(tuning, worker, artifact).await,
        ArtifactKind::File | ArtifactKind::FilePiece { .. } | ArtifactKind::Directory => {
            put_item_if_not_cached(tuning, worker, artifact).await
        }
    }
}

async fn put_buffer(
    tuning: &TransferTuning,
    worker: &mut Worker,
    artifact: &Artifact,
) -> (TransferOutcome, u64) {
    if worker.cache.contains_key(&artifact.fingerprint) {
        return (TransferOutcome::Success, 0);
    }
    let len = artifact.data.len() as u64;
    let stoptime = tuning.transfer_wait_time(len);
    let header = format!(
        "file {} {} {:o}",
        url_encode(&artifact.fingerprint),
        len,
        0o777
    );
    let link = &mut worker.link;
    if send(link, &header, tuning.short_timeout).await.is_err()
        || link.send_bytes(&artifact.data, stoptime).await.is_err()
    {
        return (TransferOutcome::WorkerFailure, 0);
    }
    if artifact.flags.cache {
        worker.cache.insert(
            artifact.fingerprint.clone(),
            CachedArtifactInfo {
                size: len as i64,
                mtime: (timestamp_us() / 1_000_000) as i64,
                transfer_time: 0,
            },
        );
    }
    (TransferOutcome::Success, len)
}

/// Ask the worker to load a URL or command product into its cache. The
/// expected length may be an estimate; the worker's `cache-update` message
/// carries the real size once the object is loaded.
async fn put_special(
    tuning: &TransferTuning,
    worker: &mut Worker,
    artifact: &Artifact,
    keyword: &str,
) -> (TransferOutcome, u64) {
    if worker.cache.contains_key(&artifact.fingerprint) {
        return (TransferOutcome::Success, 0);
    }
    let line = format!(
        "{} {} {} {} {:o}",
        keyword,
        url_encode(&artifact.source),
        url_encode(&artifact.fingerprint),
        artifact.length.unwrap_or(0),
        0o777
    );
    if send(&mut worker.link, &line, tuning.short_timeout).await.is_err() {
        return (TransferOutcome::WorkerFailure, 0);
    }
    if artifact.flags.cache {
        worker.cache.insert(
            artifact.fingerprint.clone(),
            CachedArtifactInfo {
                size: artifact.length.unwrap_or(0) as i64,
                mtime: (timestamp_us() / 1_000_000) as i64,
                transfer_time: 0,
            },
        );
    }
    (TransferOutcome::Success, 0)
}

async fn put_empty_directory(
    tuning: &TransferTuning,
    worker: &mut Worker,
    artifact: &Artifact,
) -> (TransferOutcome, u64) {
    let line = format!("mkdir {}", url_encode(&artifact.fingerprint));
    if send(&mut worker.link, &line, tuning.short_timeout).await.is_err() {
        return (TransferOutcome::WorkerFailure, 0);
    }
    (TransferOutcome::Success, 0)
}

/// Send a file, piece, or directory unless the worker already caches it.
async fn put_item_if_not_cached(
    tuning: &TransferTuning,
    worker: &mut Worker,
    artifact: &Artifact,
) -> (TransferOutcome, u64) {
    let local_info = match tokio::fs::metadata(&artifact.source).await {
        Ok(info) => info,
        Err(e) => {
            debug!("cannot stat input {}: {}", artifact.source, e);
            return (TransferOutcome::AppFailure, 0);
        }
    };
    let local_mtime = local_info
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    if let Some(remote_info) = worker.cache.get(&artifact.fingerprint) {
        if remote_info.mtime != local_mtime || remote_info.size != local_info.len() as i64 {
            warn!(
                "input {} changed locally; task will run with the cached older version",
                artifact.source
            );
        }
        // Up-to-date or stale, the cached copy is used either way.
        return (TransferOutcome::Success, 0);
    }

    debug!(
        "{} ({}) needs {} as '{}'",
        worker.hostname, worker.addrport, artifact.source, artifact.fingerprint
    );

    let (offset, length) = match artifact.kind {
        ArtifactKind::FilePiece { offset, length } => (Some(offset), Some(length)),
        _ => (None, None),
    };

    let mut total: u64 = 0;
    let outcome = put_item(
        tuning,
        &mut worker.link,
        PathBuf::from(&artifact.source),
        artifact.fingerprint.clone(),
        offset,
        length,
        true,
        &mut total,
    )
    .await;

    if outcome == TransferOutcome::Success && artifact.flags.cache {
        worker.cache.insert(
            artifact.fingerprint.clone(),
            CachedArtifactInfo {
                size: local_info.len() as i64,
                mtime: local_mtime,
                transfer_time: 0,
            },
        );
    }
    (outcome, total)
}

/// Send a single item, whether a directory, symlink, or regular file.
///
/// The top-level call follows symlinks, since users commonly hand in a
/// symlink to the real data; inside a directory links are sent natively.
fn put_item<'a>(
    tuning: &'a TransferTuning,
    link: &'a mut Link,
    localpath: PathBuf,
    wirename: String,
    offset: Option<u64>,
    length: Option<u64>,
    follow_links: bool,
    total: &'a mut u64,
) -> BoxFuture<'a, TransferOutcome> {
    async move {
        let info = if follow_links {
            tokio::fs::metadata(&localpath).await
        } else {
            tokio::fs::symlink_metadata(&localpath).await
        };
        let info = match info {
            Ok(info) => info,
            Err(e) => {
                debug!("cannot stat {}: {}", localpath.display(), e);
                return TransferOutcome::AppFailure;
            }
        };

        if info.is_dir() {
            put_directory(tuning, link, &localpath, &wirename, total).await
        } else if info.file_type().is_symlink() {
            put_symlink(tuning, link, &localpath, &wirename, total).await
        } else if info.is_file() {
            put_file(tuning, link, &localpath, &wirename, offset, length, &info, total).await
        } else {
            debug!("skipping unusual file {}", localpath.display());
            TransferOutcome::Success
        }
    }
    .boxed()
}

async fn put_directory(
    tuning: &TransferTuning,
    link: &mut Link,
    localpath: &Path,
    wirename: &str,
    total: &mut u64,
) -> TransferOutcome {
    let mut entries = match tokio::fs::read_dir(localpath).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("cannot open dir {}: {}", localpath.display(), e);
            return TransferOutcome::AppFailure;
        }
    };

    if send(link, &format!("dir {}", url_encode(wirename)), tuning.short_timeout)
        .await
        .is_err()
    {
        return TransferOutcome::WorkerFailure;
    }

    let mut result = TransferOutcome::Success;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        result = put_item(
            tuning,
            link,
            entry.path(),
            name,
            None,
            None,
            false,
            total,
        )
        .await;
        if result != TransferOutcome::Success {
            break;
        }
    }

    if send(link, "end", tuning.short_timeout).await.is_err() {
        return TransferOutcome::WorkerFailure;
    }
    result
}

/// The target of the link is sent as the body following the header.
async fn put_symlink(
    tuning: &TransferTuning,
    link: &mut Link,
    localpath: &Path,
    wirename: &str,
    total: &mut u64,
) -> TransferOutcome {
    let target = match tokio::fs::read_link(localpath).await {
        Ok(target) => target,
        Err(_) => return TransferOutcome::AppFailure,
    };
    let target_bytes = target.as_os_str().as_encoded_bytes().to_vec();
    let header = format!("symlink {} {}", url_encode(wirename), target_bytes.len());
    if send(link, &header, tuning.short_timeout).await.is_err()
        || link
            .send_bytes(&target_bytes, tuning.long_timeout)
            .await
            .is_err()
    {
        return TransferOutcome::WorkerFailure;
    }
    *total += target_bytes.len() as u64;
    TransferOutcome::Success
}

async fn put_file(
    tuning: &TransferTuning,
    link: &mut Link,
    localpath: &Path,
    wirename: &str,
    offset: Option<u64>,
    length: Option<u64>,
    info: &std::fs::Metadata,
    total: &mut u64,
) -> TransferOutcome {
    // Normalize the mode so the worker never materializes unusable files.
    let mode = (file_mode(info) | 0o600) & 0o777;
    let length = length.unwrap_or(info.len());
    let offset = offset.unwrap_or(0);

    if offset + length > info.len() {
        debug!(
            "file piece {} ({}:{}) is out of range",
            localpath.display(),
            offset,
            offset + length
        );
        return TransferOutcome::AppFailure;
    }

    let mut file = match tokio::fs::File::open(localpath).await {
        Ok(file) => file,
        Err(e) => {
            debug!("cannot open file {}: {}", localpath.display(), e);
            return TransferOutcome::AppFailure;
        }
    };
    if offset > 0 {
        use tokio::io::AsyncSeekExt;
        if file.seek(std::io::SeekFrom::Start(offset)).await.is_err() {
            return TransferOutcome::AppFailure;
        }
    }

    let effective_stoptime = tuning.bandwidth_stoptime(length);
    let stoptime = tuning.transfer_wait_time(length);
    let header = format!("file {} {} {:o}", url_encode(wirename), length, mode);
    if send(link, &header, tuning.short_timeout).await.is_err() {
        return TransferOutcome::WorkerFailure;
    }
    let actual = match link.stream_from_file(&mut file, length, stoptime).await {
        Ok(actual) => actual,
        Err(_) => return TransferOutcome::WorkerFailure,
    };
    *total += actual;
    if actual != length {
        return TransferOutcome::WorkerFailure;
    }

    // Hold the effective rate down to the configured bandwidth limit.
    if let Some(stop_us) = effective_stoptime {
        let now = timestamp_us();
        if stop_us > now {
            tokio::time::sleep(Duration::from_micros(stop_us - now)).await;
        }
    }
    TransferOutcome::Success
}

#[cfg(unix)]
fn file_mode(info: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    info.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_info: &std::fs::Metadata) -> u32 {
    0o644
}

async fn send(link: &mut Link, line: &str, timeout: Duration) -> Result<(), TransferOutcome> {
    link.send_line(line, timeout)
        .await
        .map_err(|_| TransferOutcome::WorkerFailure)
}

async fn send_raw(link: &mut Link, data: &[u8], timeout: Duration) -> Result<(), TransferOutcome> {
    link.send_bytes(data, timeout)
        .await
        .map_err(|_| TransferOutcome::WorkerFailure)
}
