//! Shared helpers for coordinator integration tests.
//!
//! The centerpiece is [`MockWorker`]: a scripted worker process that speaks
//! the real wire protocol over TCP, maintains an on-disk artifact cache,
//! materializes task sandboxes, and actually executes task commands with
//! `sh -c`. Tests drive a real [`taskforge::core::Coordinator`] against one
//! or more mock workers running on the same runtime.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use taskforge::config::CoordinatorConfig;
use taskforge::core::link::Link;
use taskforge::core::protocol::{PROTOCOL_VERSION, url_decode, url_encode};
use tempfile::TempDir;
use tokio::net::TcpStream;

/// Observable counters shared between a mock worker and its test.
#[derive(Debug, Default)]
pub struct MockWorkerStats {
    /// `file`/`dir`/`mkdir` transfers received from the coordinator.
    pub transfers_received: AtomicUsize,
    /// `puturl` requests received.
    pub puturl_received: AtomicUsize,
    /// `putcmd` requests received.
    pub putcmd_received: AtomicUsize,
    /// Tasks executed to completion.
    pub tasks_executed: AtomicUsize,
    /// `kill` messages received.
    pub kills_received: AtomicUsize,
}

/// Behavior knobs for a mock worker.
#[derive(Debug, Clone)]
pub struct MockWorkerConfig {
    /// Advertised cores.
    pub cores: i64,
    /// Advertised memory (MB).
    pub memory: i64,
    /// Advertised disk (MB).
    pub disk: i64,
    /// Advertised gpus.
    pub gpus: i64,
    /// Features advertised in the greeting.
    pub features: Vec<String>,
    /// Shared secret for the password challenge, when the coordinator
    /// requires one.
    pub password: Option<String>,
    /// Drop the connection right after a task is fully staged, before any
    /// result is reported. Models a worker crash mid-execution.
    pub die_after_dispatch: bool,
    /// Worker identity string.
    pub workerid: String,
}

impl Default for MockWorkerConfig {
    fn default() -> Self {
        MockWorkerConfig {
            cores: 4,
            memory: 8000,
            disk: 50000,
            gpus: 0,
            features: Vec::new(),
            password: None,
            die_after_dispatch: false,
            workerid: "mock-worker".to_string(),
        }
    }
}

/// Handle to a spawned mock worker.
pub struct MockWorker {
    /// Shared counters for assertions.
    pub stats: Arc<MockWorkerStats>,
    /// Join handle of the worker task.
    pub handle: tokio::task::JoinHandle<()>,
}

/// One parsed task envelope waiting for its inputs.
#[derive(Debug, Default)]
struct StagedTask {
    taskid: u64,
    command: String,
    env: Vec<(String, String)>,
    wall_time_us: Option<u64>,
    infiles: Vec<(String, String)>,
    outfiles: Vec<(String, String)>,
}

/// Spawn a mock worker connected to `port` on localhost.
pub async fn spawn_worker(port: u16, config: MockWorkerConfig) -> MockWorker {
    let stats = Arc::new(MockWorkerStats::default());
    let worker_stats = stats.clone();
    let handle = tokio::spawn(async move {
        if let Err(e) = worker_main(port, config, worker_stats).await {
            // Connection teardown at test end is expected; anything else is
            // worth seeing in the test log.
            eprintln!("mock worker exited: {}", e);
        }
    });
    MockWorker { stats, handle }
}

async fn worker_main(
    port: u16,
    config: MockWorkerConfig,
    stats: Arc<MockWorkerStats>,
) -> std::io::Result<()> {
    let timeout = Duration::from_secs(30);
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let mut link = Link::new(stream);
    let workspace = TempDir::new()?;
    let cache_root = workspace.path().join("cache");
    std::fs::create_dir_all(&cache_root)?;

    link.send_line(&format!("taskforge {}", PROTOCOL_VERSION), timeout)
        .await?;

    if let Some(password) = &config.password {
        let challenge = link.recv_line(timeout).await?;
        let nonce = challenge
            .strip_prefix("challenge ")
            .expect("expected a password challenge")
            .to_string();
        let digest = format!("{:x}", md5::compute(format!("{}{}", nonce, password)));
        link.send_line(&format!("auth {}", digest), timeout).await?;
        let ok = link.recv_line(timeout).await?;
        assert_eq!(ok, "ok", "password handshake failed");
    }

    let mut ready = format!(
        "ready {} {} linux x86_64 0.3.0",
        url_encode(&config.workerid),
        url_encode("mockhost"),
    );
    for feature in &config.features {
        ready.push(' ');
        ready.push_str(&url_encode(feature));
    }
    link.send_line(&ready, timeout).await?;
    link.send_line(
        &format!(
            "resources {} {} {} {}",
            config.cores, config.memory, config.disk, config.gpus
        ),
        timeout,
    )
    .await?;

    let mut cache: HashSet<String> = HashSet::new();
    loop {
        let line = link.recv_line(Duration::from_secs(600)).await?;
        let mut parts = line.split_whitespace();
        let keyword = parts.next().unwrap_or_default().to_string();
        let rest: Vec<String> = parts.map(|s| s.to_string()).collect();

        match keyword.as_str() {
            "task" => {
                let staged = read_envelope(&mut link, rest[0].parse().unwrap(), timeout).await?;
                let missing: Vec<String> = staged
                    .infiles
                    .iter()
                    .map(|(fp, _)| fp.clone())
                    .filter(|fp| !cache.contains(fp))
                    .collect();
                let mut missing: HashSet<String> = missing.into_iter().collect();
                while !missing.is_empty() {
                    let line = link.recv_line(timeout).await?;
                    let received = handle_transfer_message(
                        &mut link, &cache_root, &line, &stats, timeout,
                    )
                    .await?;
                    for fp in received {
                        cache.insert(fp.clone());
                        missing.remove(&fp);
                    }
                }
                if config.die_after_dispatch {
                    return Ok(());
                }
                execute_task(&mut link, &workspace, &cache_root, &staged, &mut cache, timeout)
                    .await?;
                stats.tasks_executed.fetch_add(1, Ordering::SeqCst);
            }
            "file" | "dir" | "mkdir" | "puturl" | "putcmd" => {
                let received =
                    handle_transfer_message(&mut link, &cache_root, &line, &stats, timeout).await?;
                for fp in received {
                    cache.insert(fp);
                }
            }
            "get" => {
                let fingerprint = url_decode(&rest[0]);
                send_cached_item(&mut link, &cache_root, &fingerprint, timeout).await?;
            }
            "kill" => {
                stats.kills_received.fetch_add(1, Ordering::SeqCst);
            }
            "invalidate" => {
                let fingerprint = url_decode(&rest[0]);
                cache.remove(&fingerprint);
                let _ = std::fs::remove_file(cache_root.join(&fingerprint));
                let _ = std::fs::remove_dir_all(cache_root.join(&fingerprint));
            }
            "check" => {
                link.send_line("alive", timeout).await?;
            }
            "release" => return Ok(()),
            _ => panic!("mock worker got unexpected message: {}", line),
        }
    }
}

async fn read_envelope(
    link: &mut Link,
    taskid: u64,
    timeout: Duration,
) -> std::io::Result<StagedTask> {
    let mut staged = StagedTask {
        taskid,
        ..Default::default()
    };
    loop {
        let line = link.recv_line(timeout).await?;
        let mut parts = line.split_whitespace();
        let keyword = parts.next().unwrap_or_default().to_string();
        let rest: Vec<String> = parts.map(|s| s.to_string()).collect();
        match keyword.as_str() {
            "cmd" => {
                let len: usize = rest[0].parse().unwrap();
                let bytes = link.recv_exact(len, timeout).await?;
                staged.command = String::from_utf8_lossy(&bytes).into_owned();
            }
            "env" => {
                let len: usize = rest[0].parse().unwrap();
                let bytes = link.recv_exact(len, timeout).await?;
                let entry = String::from_utf8_lossy(&bytes).into_owned();
                if let Some((key, value)) = entry.split_once('=') {
                    staged.env.push((key.to_string(), value.to_string()));
                }
            }
            "wall_time" => staged.wall_time_us = rest[0].parse().ok(),
            "infile" => staged
                .infiles
                .push((url_decode(&rest[0]), url_decode(&rest[1]))),
            "outfile" => staged
                .outfiles
                .push((url_decode(&rest[0]), url_decode(&rest[1]))),
            "end" => return Ok(staged),
            // category, coprocess, cores, memory, disk, gpus, end_time
            _ => {}
        }
    }
}

/// Handle one coordinator-to-worker transfer message, returning the
/// fingerprints that are now present in the cache.
async fn handle_transfer_message(
    link: &mut Link,
    cache_root: &Path,
    line: &str,
    stats: &MockWorkerStats,
    timeout: Duration,
) -> std::io::Result<Vec<String>> {
    let mut parts = line.split_whitespace();
    let keyword = parts.next().unwrap_or_default().to_string();
    let rest: Vec<String> = parts.map(|s| s.to_string()).collect();

    match keyword.as_str() {
        "file" => {
            stats.transfers_received.fetch_add(1, Ordering::SeqCst);
            let name = url_decode(&rest[0]);
            let size: usize = rest[1].parse().unwrap();
            let bytes = link.recv_exact(size, timeout).await?;
            std::fs::write(cache_root.join(&name), bytes)?;
            Ok(vec![name])
        }
        "dir" => {
            stats.transfers_received.fetch_add(1, Ordering::SeqCst);
            let name = url_decode(&rest[0]);
            let target = cache_root.join(&name);
            std::fs::create_dir_all(&target)?;
            receive_dir_contents(link, &target, timeout).await?;
            Ok(vec![name])
        }
        "mkdir" => {
            stats.transfers_received.fetch_add(1, Ordering::SeqCst);
            let name = url_decode(&rest[0]);
            std::fs::create_dir_all(cache_root.join(&name))?;
            Ok(vec![name])
        }
        "puturl" => {
            stats.puturl_received.fetch_add(1, Ordering::SeqCst);
            let url = url_decode(&rest[0]);
            let fingerprint = url_decode(&rest[1]);
            let content = format!("fetched:{}", url);
            std::fs::write(cache_root.join(&fingerprint), &content)?;
            link.send_line(
                &format!("cache-update {} {} 0 1000", url_encode(&fingerprint), content.len()),
                timeout,
            )
            .await?;
            Ok(vec![fingerprint])
        }
        "putcmd" => {
            stats.putcmd_received.fetch_add(1, Ordering::SeqCst);
            let cmd = url_decode(&rest[0]);
            let fingerprint = url_decode(&rest[1]);
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&cmd)
                .output()
                .await?;
            std::fs::write(cache_root.join(&fingerprint), &output.stdout)?;
            link.send_line(
                &format!(
                    "cache-update {} {} 0 1000",
                    url_encode(&fingerprint),
                    output.stdout.len()
                ),
                timeout,
            )
            .await?;
            Ok(vec![fingerprint])
        }
        other => panic!("unexpected transfer message: {}", other),
    }
}

/// Consume nested items of a `dir` stream until the matching `end`.
fn receive_dir_contents<'a>(
    link: &'a mut Link,
    base: &'a Path,
    timeout: Duration,
) -> futures::future::BoxFuture<'a, std::io::Result<()>> {
    use futures::FutureExt;
    async move {
        loop {
            let line = link.recv_line(timeout).await?;
            let mut parts = line.split_whitespace();
            let keyword = parts.next().unwrap_or_default().to_string();
            let rest: Vec<String> = parts.map(|s| s.to_string()).collect();
            match keyword.as_str() {
                "file" => {
                    let name = url_decode(&rest[0]);
                    let size: usize = rest[1].parse().unwrap();
                    let bytes = link.recv_exact(size, timeout).await?;
                    std::fs::write(base.join(name), bytes)?;
                }
                "symlink" => {
                    let name = url_decode(&rest[0]);
                    let len: usize = rest[1].parse().unwrap();
                    let target = link.recv_exact(len, timeout).await?;
                    let target = PathBuf::from(String::from_utf8_lossy(&target).into_owned());
                    #[cfg(unix)]
                    std::os::unix::fs::symlink(target, base.join(name))?;
                }
                "dir" => {
                    let name = url_decode(&rest[0]);
                    let nested = base.join(name);
                    std::fs::create_dir_all(&nested)?;
                    receive_dir_contents(link, &nested, timeout).await?;
                }
                "end" => return Ok(()),
                other => panic!("unexpected item in dir stream: {}", other),
            }
        }
    }
    .boxed()
}

/// Run the staged command in a fresh sandbox and report the result.
async fn execute_task(
    link: &mut Link,
    workspace: &TempDir,
    cache_root: &Path,
    staged: &StagedTask,
    cache: &mut HashSet<String>,
    timeout: Duration,
) -> std::io::Result<()> {
    let sandbox = workspace.path().join(format!("task-{}", staged.taskid));
    std::fs::create_dir_all(&sandbox)?;

    for (fingerprint, remote) in &staged.infiles {
        let source = cache_root.join(fingerprint);
        let destination = sandbox.join(remote);
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if source.is_dir() {
            copy_tree(&source, &destination)?;
        } else if source.is_file() {
            std::fs::copy(&source, &destination)?;
        }
    }

    let mut command = tokio::process::Command::new("sh");
    command
        .arg("-c")
        .arg(&staged.command)
        .current_dir(&sandbox)
        .kill_on_drop(true)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null());
    for (key, value) in &staged.env {
        command.env(key, value);
    }
    let mut child = command.spawn()?;
    let mut stdout_pipe = child.stdout.take();

    let wall = staged
        .wall_time_us
        .map(Duration::from_micros)
        .unwrap_or(Duration::from_secs(300));
    let started = std::time::Instant::now();
    let (status_code, exit_code, stdout) =
        match tokio::time::timeout(wall, child.wait()).await {
            Ok(status) => {
                let status = status?;
                let mut buffer = Vec::new();
                if let Some(mut pipe) = stdout_pipe.take() {
                    use tokio::io::AsyncReadExt;
                    let _ = pipe.read_to_end(&mut buffer).await;
                }
                (0u32, status.code().unwrap_or(-1) as i64, buffer)
            }
            Err(_) => {
                let _ = child.kill().await;
                // 7 << 3: the task ran past its per-attempt limit
                (56u32, -1i64, Vec::new())
            }
        };

    for (fingerprint, remote) in &staged.outfiles {
        let produced = sandbox.join(remote);
        if produced.is_dir() {
            copy_tree(&produced, &cache_root.join(fingerprint))?;
            cache.insert(fingerprint.clone());
        } else if produced.is_file() {
            std::fs::copy(&produced, cache_root.join(fingerprint))?;
            cache.insert(fingerprint.clone());
        }
    }

    let wall_us = started.elapsed().as_micros() as u64;
    link.send_line(
        &format!("measured {} 1 -1 -1 -1 {}", staged.taskid, wall_us.max(1)),
        timeout,
    )
    .await?;
    link.send_line(
        &format!(
            "result {} {} {} {}",
            staged.taskid,
            status_code,
            exit_code,
            stdout.len()
        ),
        timeout,
    )
    .await?;
    link.send_bytes(&stdout, timeout).await?;
    Ok(())
}

/// Stream one cached item back in answer to `get`.
fn send_cached_item<'a>(
    link: &'a mut Link,
    cache_root: &'a Path,
    fingerprint: &'a str,
    timeout: Duration,
) -> futures::future::BoxFuture<'a, std::io::Result<()>> {
    use futures::FutureExt;
    async move {
        let path = cache_root.join(fingerprint);
        if path.is_file() {
            let bytes = std::fs::read(&path)?;
            link.send_line(
                &format!("file {} {} 644", url_encode(fingerprint), bytes.len()),
                timeout,
            )
            .await?;
            link.send_bytes(&bytes, timeout).await?;
        } else if path.is_dir() {
            link.send_line(&format!("dir {}", url_encode(fingerprint)), timeout)
                .await?;
            send_dir_contents(link, &path, timeout).await?;
            link.send_line("end", timeout).await?;
        } else {
            link.send_line(&format!("missing {} 2", url_encode(fingerprint)), timeout)
                .await?;
        }
        Ok(())
    }
    .boxed()
}

fn send_dir_contents<'a>(
    link: &'a mut Link,
    dir: &'a Path,
    timeout: Duration,
) -> futures::future::BoxFuture<'a, std::io::Result<()>> {
    use futures::FutureExt;
    async move {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if path.is_dir() {
                link.send_line(&format!("dir {}", url_encode(&name)), timeout)
                    .await?;
                send_dir_contents(link, &path, timeout).await?;
                link.send_line("end", timeout).await?;
            } else {
                let bytes = std::fs::read(&path)?;
                link.send_line(
                    &format!("file {} {} 644", url_encode(&name), bytes.len()),
                    timeout,
                )
                .await?;
                link.send_bytes(&bytes, timeout).await?;
            }
        }
        Ok(())
    }
    .boxed()
}

fn copy_tree(source: &Path, destination: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(destination)?;
    for entry in walkdir::WalkDir::new(source) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Coordinator configuration suitable for fast tests: range-scanned port and
/// snappy timer intervals.
pub fn test_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.port.port = 0;
    config.scheduling.large_task_check_interval_secs = 1;
    config.logs.perf_interval_secs = 1;
    config
}

/// Environment map type used with `TestEnvironmentProvider`.
pub type EnvMap = HashMap<String, String>;

/// Drive the coordinator until one task finishes, up to `secs` seconds.
pub async fn wait_for_task(
    coordinator: &mut taskforge::core::Coordinator,
    secs: u64,
) -> Option<taskforge::core::Task> {
    coordinator.wait(Some(secs)).await.expect("wait failed")
}
