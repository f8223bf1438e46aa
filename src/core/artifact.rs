//! Artifact descriptors: the named inputs and outputs attached to tasks.
//!
//! An [`Artifact`] is an immutable value describing one input or output by
//! source kind, task-side ("remote") name, cache-key fingerprint, and
//! transfer flags. Fingerprints are derived from an md5 digest of the source
//! identifier combined with the artifact kind; non-cached artifacts embed a
//! per-instance counter so two tasks never share a copy the worker may delete.
//!
//! # Naming
//!
//! Every artifact has up to three names:
//! - `source`: the local path, URL, or command that provides (or receives)
//!   the data,
//! - `fingerprint`: the name under which workers store it in their cache,
//! - `remote_name`: the path the task sees inside its sandbox.

use crate::Result;
use crate::error::TaskForgeError;
use std::path::{Component, Path};
use std::sync::atomic::{AtomicU64, Ordering};

use super::protocol::url_encode;

/// Closed set of artifact source kinds.
///
/// The put/get pipelines dispatch on this tag explicitly; the set is stable
/// and deliberately not hidden behind a trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// A regular file on the coordinator's filesystem.
    File,
    /// A byte range of a local file.
    FilePiece {
        /// Starting byte offset within the source file.
        offset: u64,
        /// Number of bytes to transfer.
        length: u64,
    },
    /// A directory transferred recursively.
    Directory,
    /// An empty directory created on the worker.
    EmptyDirectory,
    /// Inline data supplied by the application.
    Buffer,
    /// A URL the worker fetches itself.
    Url,
    /// A shell command the worker runs to produce the content.
    Command,
}

impl ArtifactKind {
    /// Prefix under which artifacts of this kind are keyed in worker caches.
    ///
    /// Directories share the `file` namespace with plain files: both are
    /// addressed by a digest of their local path, and a worker stores either
    /// under the same cache entry shape.
    pub fn label(&self) -> &'static str {
        match self {
            ArtifactKind::File | ArtifactKind::Directory | ArtifactKind::EmptyDirectory => "file",
            ArtifactKind::FilePiece { .. } => "piece",
            ArtifactKind::Buffer => "buffer",
            ArtifactKind::Url => "url",
            ArtifactKind::Command => "cmd",
        }
    }
}

/// Special-handling flags attached to an artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArtifactFlags {
    /// Keep the artifact in the worker cache for later tasks.
    pub cache: bool,
    /// Watch the output file and stream back changes as the task runs.
    pub watch: bool,
    /// Only fetch this output if the task failed.
    pub failure_only: bool,
    /// Only fetch this output if the task succeeded.
    pub success_only: bool,
    /// Unpack the archive into a directory on arrival at the worker.
    pub unpack: bool,
}

impl ArtifactFlags {
    /// Flags with only `cache` set, the recommended default for inputs.
    pub fn cached() -> Self {
        ArtifactFlags {
            cache: true,
            ..Default::default()
        }
    }

    /// Pack the flags into the wire representation used in task envelopes.
    pub fn to_bits(&self) -> u32 {
        (self.cache as u32)
            | (self.watch as u32) << 1
            | (self.failure_only as u32) << 2
            | (self.success_only as u32) << 3
            | (self.unpack as u32) << 4
    }

    /// Unpack the wire representation.
    pub fn from_bits(bits: u32) -> Self {
        ArtifactFlags {
            cache: bits & 1 != 0,
            watch: bits & 2 != 0,
            failure_only: bits & 4 != 0,
            success_only: bits & 8 != 0,
            unpack: bits & 16 != 0,
        }
    }
}

/// One named input or output of a task.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Source kind tag.
    pub kind: ArtifactKind,
    /// Transfer flags.
    pub flags: ArtifactFlags,
    /// Local path, URL, or command providing the data. For outputs this is
    /// the local destination path. Empty for buffers.
    pub source: String,
    /// Inline payload for [`ArtifactKind::Buffer`].
    pub data: Vec<u8>,
    /// Path the task sees inside its sandbox. Always relative.
    pub remote_name: String,
    /// Cache key under which workers store this artifact.
    pub fingerprint: String,
    /// Source length in bytes, where known at specification time.
    pub length: Option<u64>,
}

/// Instance counter folded into the fingerprint of non-cached artifacts.
static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Reject remote names that could escape the task sandbox.
///
/// A remote name must be a non-empty relative path with no `..` components.
pub fn validate_remote_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TaskForgeError::specification("remote name is empty"));
    }
    let path = Path::new(name);
    if path.is_absolute() {
        return Err(TaskForgeError::specification(format!(
            "remote name '{}' must not be absolute",
            name
        )));
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(TaskForgeError::specification(format!(
                "remote name '{}' must not contain '..'",
                name
            )));
        }
    }
    Ok(())
}

/// Derive the cache fingerprint for an artifact.
///
/// The fingerprint is a pure function of (kind, source, cache flag, instance
/// counter): cached artifacts use instance id 0 so tasks sharing a source
/// share the worker-side copy, while non-cached artifacts get a unique id and
/// can be deleted when their task completes. The source basename is included
/// to assist debugging only.
fn make_fingerprint(kind: ArtifactKind, source: &str, data: &[u8], flags: ArtifactFlags) -> String {
    let instance = if flags.cache {
        0
    } else {
        INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
    };

    let digest = match kind {
        ArtifactKind::Buffer => md5::compute(data),
        _ => md5::compute(source.as_bytes()),
    };

    let basename = Path::new(source)
        .file_name()
        .map(|n| url_encode(&n.to_string_lossy()))
        .unwrap_or_default();

    let prefix = kind.label();
    match kind {
        ArtifactKind::File | ArtifactKind::Directory | ArtifactKind::EmptyDirectory => {
            format!("{}-{}-{:x}-{}", prefix, instance, digest, basename)
        }
        ArtifactKind::FilePiece { offset, length } => {
            format!(
                "{}-{}-{:x}-{}-{}-{}",
                prefix, instance, digest, basename, offset, length
            )
        }
        ArtifactKind::Url | ArtifactKind::Command | ArtifactKind::Buffer => {
            format!("{}-{}-{:x}", prefix, instance, digest)
        }
    }
}

impl Artifact {
    fn build(
        kind: ArtifactKind,
        source: &str,
        data: Vec<u8>,
        remote_name: &str,
        flags: ArtifactFlags,
        length: Option<u64>,
    ) -> Result<Self> {
        validate_remote_name(remote_name)?;
        let fingerprint = make_fingerprint(kind, source, &data, flags);
        Ok(Artifact {
            kind,
            flags,
            source: source.to_string(),
            data,
            remote_name: remote_name.to_string(),
            fingerprint,
            length,
        })
    }

    /// A regular input or output file.
    pub fn file(source: &str, remote_name: &str, flags: ArtifactFlags) -> Result<Self> {
        Self::build(ArtifactKind::File, source, Vec::new(), remote_name, flags, None)
    }

    /// A byte range of a local file.
    pub fn file_piece(
        source: &str,
        remote_name: &str,
        offset: u64,
        length: u64,
        flags: ArtifactFlags,
    ) -> Result<Self> {
        Self::build(
            ArtifactKind::FilePiece { offset, length },
            source,
            Vec::new(),
            remote_name,
            flags,
            Some(length),
        )
    }

    /// A directory transferred recursively.
    pub fn directory(source: &str, remote_name: &str, flags: ArtifactFlags) -> Result<Self> {
        Self::build(ArtifactKind::Directory, source, Vec::new(), remote_name, flags, None)
    }

    /// An empty directory created at the worker; there is no local source.
    pub fn empty_directory(remote_name: &str, flags: ArtifactFlags) -> Result<Self> {
        Self::build(
            ArtifactKind::EmptyDirectory,
            remote_name,
            Vec::new(),
            remote_name,
            flags,
            None,
        )
    }

    /// Inline data passed as an input file.
    pub fn buffer(data: Vec<u8>, remote_name: &str, flags: ArtifactFlags) -> Result<Self> {
        let length = Some(data.len() as u64);
        Self::build(ArtifactKind::Buffer, "", data, remote_name, flags, length)
    }

    /// A URL the worker fetches into its cache.
    pub fn url(source: &str, remote_name: &str, flags: ArtifactFlags) -> Result<Self> {
        url::Url::parse(source)
            .map_err(|e| TaskForgeError::specification(format!("invalid url '{}': {}", source, e)))?;
        Self::build(ArtifactKind::Url, source, Vec::new(), remote_name, flags, None)
    }

    /// A shell command the worker runs to generate the cached content.
    pub fn command(cmd: &str, remote_name: &str, flags: ArtifactFlags) -> Result<Self> {
        Self::build(ArtifactKind::Command, cmd, Vec::new(), remote_name, flags, None)
    }

    /// Recreate this artifact for a cloned task.
    ///
    /// Non-cached artifacts receive a fresh instance counter so the clone
    /// never shares a worker-side copy with the original.
    pub fn clone_for_resubmit(&self) -> Self {
        let fingerprint = make_fingerprint(self.kind, &self.source, &self.data, self.flags);
        Artifact {
            fingerprint,
            ..self.clone()
        }
    }

    /// Best-effort size of the source in bytes.
    ///
    /// Used by the FILES scheduling policy to weigh cache affinity and as the
    /// expected length in `puturl`/`putcmd` messages. Directories are walked;
    /// URL and command sources report zero until a worker loads them.
    pub fn footprint(&self) -> u64 {
        match self.kind {
            ArtifactKind::Buffer => self.data.len() as u64,
            ArtifactKind::FilePiece { length, .. } => length,
            ArtifactKind::File => std::fs::metadata(&self.source).map(|m| m.len()).unwrap_or(0),
            ArtifactKind::Directory => walkdir::WalkDir::new(&self.source)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.metadata().ok())
                .filter(|metadata| metadata.is_file())
                .map(|metadata| metadata.len())
                .sum(),
            ArtifactKind::EmptyDirectory | ArtifactKind::Url | ArtifactKind::Command => {
                self.length.unwrap_or(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_absolute_remote_name() {
        let err = Artifact::file("/tmp/data", "/etc/passwd", ArtifactFlags::cached());
        assert!(err.is_err());
    }

    #[test]
    fn rejects_parent_traversal() {
        let err = Artifact::file("/tmp/data", "../escape", ArtifactFlags::cached());
        assert!(err.is_err());
        let err = Artifact::file("/tmp/data", "ok/../../escape", ArtifactFlags::cached());
        assert!(err.is_err());
    }

    #[test]
    fn cached_fingerprints_are_shared() {
        let a = Artifact::file("/tmp/data", "data", ArtifactFlags::cached()).unwrap();
        let b = Artifact::file("/tmp/data", "other-name", ArtifactFlags::cached()).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn uncached_fingerprints_are_unique() {
        let a = Artifact::file("/tmp/data", "data", ArtifactFlags::default()).unwrap();
        let b = Artifact::file("/tmp/data", "data", ArtifactFlags::default()).unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn kind_distinguishes_fingerprints() {
        let file = Artifact::file("payload", "data", ArtifactFlags::cached()).unwrap();
        let cmd = Artifact::command("payload", "data", ArtifactFlags::cached()).unwrap();
        assert_ne!(file.fingerprint, cmd.fingerprint);
        assert!(cmd.fingerprint.starts_with("cmd-0-"));
    }

    #[test]
    fn fingerprints_are_keyed_under_the_kind_label() {
        let flags = ArtifactFlags::cached();
        let artifacts = [
            Artifact::file("/tmp/data", "data", flags).unwrap(),
            Artifact::directory("/tmp/tree", "tree", flags).unwrap(),
            Artifact::file_piece("/tmp/data", "part", 0, 8, flags).unwrap(),
            Artifact::buffer(b"inline".to_vec(), "buf", flags).unwrap(),
            Artifact::url("http://host/file", "file", flags).unwrap(),
            Artifact::command("make-data", "data", flags).unwrap(),
        ];
        for artifact in &artifacts {
            let prefix = format!("{}-", artifact.kind.label());
            assert!(
                artifact.fingerprint.starts_with(&prefix),
                "{} not keyed under {}",
                artifact.fingerprint,
                prefix
            );
        }
    }

    #[test]
    fn buffer_fingerprint_depends_on_data() {
        let a = Artifact::buffer(b"one".to_vec(), "buf", ArtifactFlags::cached()).unwrap();
        let b = Artifact::buffer(b"two".to_vec(), "buf", ArtifactFlags::cached()).unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
        assert_eq!(a.length, Some(3));
    }

    #[test]
    fn url_validation() {
        assert!(Artifact::url("http://host/file", "file", ArtifactFlags::cached()).is_ok());
        assert!(Artifact::url("not a url", "file", ArtifactFlags::cached()).is_err());
    }

    #[test]
    fn resubmit_clone_refreshes_uncached_instance() {
        let a = Artifact::file("/tmp/data", "data", ArtifactFlags::default()).unwrap();
        let b = a.clone_for_resubmit();
        assert_ne!(a.fingerprint, b.fingerprint);

        let cached = Artifact::file("/tmp/data", "data", ArtifactFlags::cached()).unwrap();
        assert_eq!(cached.fingerprint, cached.clone_for_resubmit().fingerprint);
    }
}
