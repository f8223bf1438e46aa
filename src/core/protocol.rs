//! Wire protocol definitions shared by the dispatcher and the pipelines.
//!
//! Messages are newline-terminated ASCII command lines; names travel
//! url-encoded so arbitrary characters survive the wire, and binary payloads
//! follow a header line that declares their length. This module holds the
//! protocol version gate, the encoding helpers, and the typed parse of every
//! worker-originated message. Coordinator-to-worker lines are formatted
//! in-place by the pipelines since most interpolate live transfer state.

use super::resources::Resources;

/// Protocol version advertised by the coordinator.
///
/// Workers announcing any other version are disconnected during the greeting.
pub const PROTOCOL_VERSION: u32 = 3;

/// Maximum length of a protocol line, header included.
pub const LINE_MAX: usize = 4096;

/// Percent-encode a name for transmission on a message line.
///
/// Everything outside `[A-Za-z0-9._/-]` is escaped, so whitespace and shell
/// metacharacters cannot break the line-oriented framing.
pub fn url_encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'/' | b'-' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Reverse of [`url_encode`]. Malformed escapes are passed through verbatim.
pub fn url_decode(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Every message a worker (or status client) may send to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// `taskforge <protocol>`: version gate, first line of every connection.
    Hello {
        /// Protocol version the peer speaks.
        protocol: u32,
    },
    /// `ready <workerid> <hostname> <os> <arch> <version> [feature...]`
    Ready {
        /// Stable worker identity chosen by the worker process.
        workerid: String,
        /// Hostname of the worker machine.
        hostname: String,
        /// Operating system name.
        os: String,
        /// Hardware architecture.
        arch: String,
        /// Worker software version.
        version: String,
        /// Features advertised in the greeting.
        features: Vec<String>,
    },
    /// `from-factory <name>`: worker was started by a factory.
    FromFactory(String),
    /// `resources <cores> <memory> <disk> <gpus>`: advertised totals.
    ResourceReport(Resources),
    /// `end-time <epoch-secs>`: worker's own termination deadline (0 = none).
    EndTime(u64),
    /// `feature <name>`: late feature advertisement.
    Feature(String),
    /// `auth <digest>`: reply to a password challenge.
    Auth(String),
    /// `cache-update <fingerprint> <size> <mtime> <transfer-time>`
    CacheUpdate {
        /// Cache key now present on the worker.
        fingerprint: String,
        /// Stored size in bytes.
        size: i64,
        /// Source modification time, seconds since epoch.
        mtime: i64,
        /// Time the worker spent loading the entry, microseconds.
        transfer_time: u64,
    },
    /// `cache-invalidate <fingerprint>`: worker dropped a cache entry.
    CacheInvalidate(String),
    /// `result <taskid> <status> <exit-code> <stdout-len>` + payload.
    TaskResult {
        /// Task the result belongs to.
        taskid: u64,
        /// Wire result code (see `ResultCode::from_wire`).
        status: u32,
        /// Process exit code, or the signal number for signalled tasks.
        exit_code: i64,
        /// Length of the stdout payload that follows.
        stdout_len: u64,
    },
    /// `measured <taskid> <cores> <memory> <disk> <gpus> <wall-time-us>`
    Measured {
        /// Task the measurements belong to.
        taskid: u64,
        /// Peak resources observed by the worker.
        resources: Resources,
        /// Wall-clock execution time in microseconds.
        wall_time: u64,
    },
    /// `update <taskid> <len>` + payload: watched-output chunk.
    WatchUpdate {
        /// Task the chunk belongs to.
        taskid: u64,
        /// Length of the chunk payload that follows.
        len: u64,
    },
    /// `alive`: keepalive reply.
    Alive,
    /// `status`: peer is a status client asking for a stats dump.
    Status,
}

/// Parse one worker-originated line. `None` means the line is not a valid
/// protocol message and the connection should be dropped.
pub fn parse_worker_message(line: &str) -> Option<WorkerMessage> {
    let mut parts = line.split_whitespace();
    let keyword = parts.next()?;
    let rest: Vec<&str> = parts.collect();

    match keyword {
        "taskforge" => Some(WorkerMessage::Hello {
            protocol: rest.first()?.parse().ok()?,
        }),
        "ready" => {
            if rest.len() < 5 {
                return None;
            }
            Some(WorkerMessage::Ready {
                workerid: url_decode(rest[0]),
                hostname: url_decode(rest[1]),
                os: url_decode(rest[2]),
                arch: url_decode(rest[3]),
                version: url_decode(rest[4]),
                features: rest[5..].iter().map(|f| url_decode(f)).collect(),
            })
        }
        "from-factory" => Some(WorkerMessage::FromFactory(url_decode(rest.first()?))),
        "resources" => {
            if rest.len() != 4 {
                return None;
            }
            Some(WorkerMessage::ResourceReport(Resources::new(
                rest[0].parse().ok()?,
                rest[1].parse().ok()?,
                rest[2].parse().ok()?,
                rest[3].parse().ok()?,
            )))
        }
        "end-time" => Some(WorkerMessage::EndTime(rest.first()?.parse().ok()?)),
        "feature" => Some(WorkerMessage::Feature(url_decode(rest.first()?))),
        "auth" => Some(WorkerMessage::Auth(rest.first()?.to_string())),
        "cache-update" => {
            if rest.len() != 4 {
                return None;
            }
            Some(WorkerMessage::CacheUpdate {
                fingerprint: url_decode(rest[0]),
                size: rest[1].parse().ok()?,
                mtime: rest[2].parse().ok()?,
                transfer_time: rest[3].parse().ok()?,
            })
        }
        "cache-invalidate" => Some(WorkerMessage::CacheInvalidate(url_decode(rest.first()?))),
        "result" => {
            if rest.len() != 4 {
                return None;
            }
            Some(WorkerMessage::TaskResult {
                taskid: rest[0].parse().ok()?,
                status: rest[1].parse().ok()?,
                exit_code: rest[2].parse().ok()?,
                stdout_len: rest[3].parse().ok()?,
            })
        }
        "measured" => {
            if rest.len() != 6 {
                return None;
            }
            Some(WorkerMessage::Measured {
                taskid: rest[0].parse().ok()?,
                resources: Resources::new(
                    rest[1].parse().ok()?,
                    rest[2].parse().ok()?,
                    rest[3].parse().ok()?,
                    rest[4].parse().ok()?,
                ),
                wall_time: rest[5].parse().ok()?,
            })
        }
        "update" => {
            if rest.len() != 2 {
                return None;
            }
            Some(WorkerMessage::WatchUpdate {
                taskid: rest[0].parse().ok()?,
                len: rest[1].parse().ok()?,
            })
        }
        "alive" => Some(WorkerMessage::Alive),
        "status" => Some(WorkerMessage::Status),
        _ => None,
    }
}

/// Header of one item inside a recursive get stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferHeader {
    /// `file <name> <size> <mode>` followed by `size` raw bytes.
    File {
        /// Decoded item name.
        name: String,
        /// Payload length in bytes.
        size: u64,
        /// Unix permission bits.
        mode: u32,
    },
    /// `symlink <name> <len>` followed by the link target.
    Symlink {
        /// Decoded item name.
        name: String,
        /// Target string length in bytes.
        len: u64,
    },
    /// `dir <name>`: nested items follow until the matching `end`.
    Dir {
        /// Decoded directory name.
        name: String,
    },
    /// `missing <name> <errno>`: the worker could not provide the item.
    Missing {
        /// Decoded item name.
        name: String,
        /// Worker-side errno.
        errno: i32,
    },
    /// `end`: closes the innermost `dir` (or the whole stream).
    End,
}

/// Parse one line of a recursive transfer stream.
pub fn parse_transfer_header(line: &str) -> Option<TransferHeader> {
    let mut parts = line.split_whitespace();
    let keyword = parts.next()?;
    let rest: Vec<&str> = parts.collect();

    match keyword {
        "file" => {
            if rest.len() != 3 {
                return None;
            }
            Some(TransferHeader::File {
                name: url_decode(rest[0]),
                size: rest[1].parse().ok()?,
                mode: u32::from_str_radix(rest[2], 8).ok()?,
            })
        }
        "symlink" => {
            if rest.len() != 2 {
                return None;
            }
            Some(TransferHeader::Symlink {
                name: url_decode(rest[0]),
                len: rest[1].parse().ok()?,
            })
        }
        "dir" => Some(TransferHeader::Dir {
            name: url_decode(rest.first()?),
        }),
        "missing" => {
            if rest.len() != 2 {
                return None;
            }
            Some(TransferHeader::Missing {
                name: url_decode(rest[0]),
                errno: rest[1].parse().ok()?,
            })
        }
        "end" => Some(TransferHeader::End),
        _ => None,
    }
}
