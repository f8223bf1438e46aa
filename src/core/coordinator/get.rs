//! Get pipeline: streaming output artifacts back from a worker.
//!
//! The coordinator requests each declared output by fingerprint and consumes
//! the mirrored recursive stream: `file` headers with raw payloads, `symlink`
//! headers with the target, `dir` ... `end` nesting, and `missing` markers.
//! A missing output never aborts the transfer; it is recorded on the task so
//! partial results still reach the caller. Failures to store data locally
//! are distinguished from failures of the worker, because only the latter
//! justify retrying the task elsewhere.

use super::{TransferOutcome, TransferTuning};
use crate::core::artifact::Artifact;
use crate::core::fs_util::{create_parent_dirs, has_disk_space_for};
use crate::core::link::Link;
use crate::core::protocol::{TransferHeader, parse_transfer_header, url_encode};
use crate::core::task::{ResultCode, Task};
use crate::core::timestamp_us;
use crate::core::worker::{CachedArtifactInfo, Worker};
use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, warn};
use std::path::{Path, PathBuf};

/// Outcome of one item inside a recursive get stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GetItem {
    /// Item received and stored.
    Received,
    /// `end` marker: the enclosing directory is complete.
    EndOfList,
    /// The worker misbehaved or the link died.
    WorkerFailure,
    /// The worker reported the item missing.
    Missing,
    /// The coordinator could not store the item locally.
    LocalFailure,
}

/// Fetch one output artifact into its local destination.
///
/// Returns the outcome and the payload bytes received. `AppFailure` means
/// the output was missing at the worker (already recorded on the task);
/// `LocalFailure` means the coordinator could not store it.
pub(crate) async fn get_output_file(
    tuning: &TransferTuning,
    worker: &mut Worker,
    task: &mut Task,
    artifact: &Artifact,
) -> (TransferOutcome, u64) {
    debug!(
        "{} ({}) sending back {} to {}",
        worker.hostname, worker.addrport, artifact.fingerprint, artifact.source
    );
    if worker
        .link
        .send_line(
            &format!("get {}", url_encode(&artifact.fingerprint)),
            tuning.short_timeout,
        )
        .await
        .is_err()
    {
        return (TransferOutcome::WorkerFailure, 0);
    }

    let mut total: u64 = 0;
    let item = get_any(
        tuning,
        &mut worker.link,
        task,
        None,
        Some(PathBuf::from(&artifact.source)),
        &mut total,
    )
    .await;

    let outcome = match item {
        GetItem::Received => TransferOutcome::Success,
        GetItem::Missing => {
            // Recorded as OUTPUT_MISSING by the stream reader; the transfer
            // itself is treated as complete so other outputs still arrive.
            TransferOutcome::Success
        }
        GetItem::EndOfList => TransferOutcome::WorkerFailure,
        GetItem::WorkerFailure => TransferOutcome::WorkerFailure,
        GetItem::LocalFailure => {
            task.update_result(ResultCode::OutputTransferError);
            TransferOutcome::LocalFailure
        }
    };

    if outcome == TransferOutcome::Success && item == GetItem::Received && artifact.flags.cache {
        if let Ok(local_info) = std::fs::metadata(&artifact.source) {
            let mtime = local_info
                .modified()
                .ok()
                .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            worker.cache.insert(
                artifact.fingerprint.clone(),
                CachedArtifactInfo {
                    size: local_info.len() as i64,
                    mtime,
                    transfer_time: 0,
                },
            );
        }
    }

    (outcome, total)
}

/// Receive a single item by observing its header and pulling the payload.
///
/// With `forced_name` set, the item lands exactly there (top-level renamed
/// outputs); otherwise it is placed inside `dirname` under the name the
/// worker sent (interior items of a directory).
fn get_any<'a>(
    tuning: &'a TransferTuning,
    link: &'a mut Link,
    task: &'a mut Task,
    dirname: Option<PathBuf>,
    forced_name: Option<PathBuf>,
    total: &'a mut u64,
) -> BoxFuture<'a, GetItem> {
    async move {
        let line = match link.recv_line(tuning.short_timeout).await {
            Ok(line) => line,
            Err(_) => return GetItem::WorkerFailure,
        };
        let header = match parse_transfer_header(&line) {
            Some(header) => header,
            None => {
                debug!("invalid response to get: {}", line);
                return GetItem::WorkerFailure;
            }
        };

        match header {
            TransferHeader::File { name, size, mode } => {
                let local = resolve_name(&dirname, &forced_name, &name);
                let item = get_file_contents(tuning, link, &local, size, mode).await;
                if item == GetItem::Received {
                    *total += size;
                }
                item
            }
            TransferHeader::Symlink { name, len } => {
                let local = resolve_name(&dirname, &forced_name, &name);
                let target = match link.recv_exact(len as usize, tuning.short_timeout).await {
                    Ok(target) => target,
                    Err(_) => return GetItem::WorkerFailure,
                };
                *total += len;
                let target = PathBuf::from(String::from_utf8_lossy(&target).into_owned());
                match make_symlink(&target, &local) {
                    Ok(()) => GetItem::Received,
                    Err(e) => {
                        debug!("could not create symlink {}: {}", local.display(), e);
                        GetItem::LocalFailure
                    }
                }
            }
            TransferHeader::Dir { name } => {
                let local = resolve_name(&dirname, &forced_name, &name);
                if std::fs::create_dir_all(&local).is_err() {
                    debug!("unable to create {}", local.display());
                    return GetItem::LocalFailure;
                }
                loop {
                    match get_any(tuning, link, task, Some(local.clone()), None, total).await {
                        GetItem::Received | GetItem::Missing => continue,
                        GetItem::EndOfList => return GetItem::Received,
                        failure => return failure,
                    }
                }
            }
            TransferHeader::Missing { name, errno } => {
                debug!("worker could not access {} (errno {})", name, errno);
                task.update_result(ResultCode::OutputMissing);
                GetItem::Missing
            }
            TransferHeader::End => GetItem::EndOfList,
        }
    }
    .boxed()
}

/// Bring back the raw data of one file within the declared constraints.
async fn get_file_contents(
    tuning: &TransferTuning,
    link: &mut Link,
    local_name: &Path,
    length: u64,
    mode: u32,
) -> GetItem {
    let effective_stoptime = tuning.bandwidth_stoptime(length);
    let stoptime = tuning.transfer_wait_time(length);

    if create_parent_dirs(local_name).is_err() {
        let _ = link.soak(length, stoptime).await;
        return GetItem::LocalFailure;
    }

    let check_dir = local_name.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    if !has_disk_space_for(&check_dir, length, tuning.disk_avail_threshold) {
        warn!(
            "not enough disk space for {} ({} bytes needed)",
            local_name.display(),
            length
        );
        let _ = link.soak(length, stoptime).await;
        return GetItem::LocalFailure;
    }

    let mut file = match tokio::fs::File::create(local_name).await {
        Ok(file) => file,
        Err(e) => {
            debug!("cannot open {} for writing: {}", local_name.display(), e);
            let _ = link.soak(length, stoptime).await;
            return GetItem::LocalFailure;
        }
    };

    let actual = match link.stream_to_file(&mut file, length, stoptime).await {
        Ok(actual) => actual,
        Err(_) => {
            drop(file);
            let _ = std::fs::remove_file(local_name);
            return GetItem::WorkerFailure;
        }
    };
    drop(file);

    if actual != length {
        debug!(
            "received size {} does not match expected {} for {}",
            actual,
            length,
            local_name.display()
        );
        let _ = std::fs::remove_file(local_name);
        return GetItem::WorkerFailure;
    }

    apply_mode(local_name, mode);

    if let Some(stop_us) = effective_stoptime {
        let now = timestamp_us();
        if stop_us > now {
            tokio::time::sleep(std::time::Duration::from_micros(stop_us - now)).await;
        }
    }
    GetItem::Received
}

fn resolve_name(dirname: &Option<PathBuf>, forced: &Option<PathBuf>, wire_name: &str) -> PathBuf {
    if let Some(forced) = forced {
        forced.clone()
    } else if let Some(dir) = dirname {
        dir.join(wire_name)
    } else {
        PathBuf::from(wire_name)
    }
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode((mode | 0o600) & 0o777));
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) {}

#[cfg(unix)]
fn make_symlink(target: &Path, link_path: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link_path)
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, _link_path: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks unsupported on this platform",
    ))
}
