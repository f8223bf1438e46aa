//! Catalog-server announcements.
//!
//! The coordinator periodically emits an identity/statistics datagram to a
//! configured list of catalog hosts so that discovery tooling can list
//! running coordinators by project name. The catalog is strictly a sink:
//! nothing is read back, and announcement failures are logged and otherwise
//! ignored.

use crate::Result;
use crate::core::stats::CoordinatorStats;
use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use tokio::net::UdpSocket;

/// One announcement datagram, serialized as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogUpdate {
    /// Record type, always `"taskforge-coordinator"`.
    pub r#type: &'static str,
    /// Project name the coordinator announces under.
    pub project: String,
    /// Coordinator instance id, stable for the process lifetime.
    pub instance: String,
    /// Listening port.
    pub port: u16,
    /// Coordinator software version.
    pub version: String,
    /// Priority relative to other coordinators with the same name.
    pub priority: i64,
    /// Tasks waiting to be dispatched.
    pub tasks_waiting: u64,
    /// Tasks currently on workers.
    pub tasks_on_workers: u64,
    /// Workers currently connected.
    pub workers_connected: u64,
}

impl CatalogUpdate {
    /// Build an update from the current stats snapshot.
    pub fn from_stats(
        project: &str,
        instance: &str,
        port: u16,
        priority: i64,
        stats: &CoordinatorStats,
    ) -> Self {
        CatalogUpdate {
            r#type: "taskforge-coordinator",
            project: project.to_string(),
            instance: instance.to_string(),
            port,
            version: crate::VERSION.to_string(),
            priority,
            tasks_waiting: stats.tasks_waiting,
            tasks_on_workers: stats.tasks_on_workers,
            workers_connected: stats.workers_connected,
        }
    }
}

/// Destination abstraction for announcements.
///
/// Production uses [`UdpCatalogSink`]; tests inject a recording sink.
#[async_trait]
pub trait CatalogSink: Send + Sync {
    /// Deliver one announcement. Errors are reported but never fatal.
    async fn announce(&self, update: &CatalogUpdate) -> Result<()>;
}

/// Sends JSON datagrams to each configured `host:port`.
#[derive(Debug)]
pub struct UdpCatalogSink {
    hosts: Vec<String>,
}

impl UdpCatalogSink {
    /// Create a sink for the given `host:port` list.
    pub fn new(hosts: Vec<String>) -> Self {
        UdpCatalogSink { hosts }
    }
}

#[async_trait]
impl CatalogSink for UdpCatalogSink {
    async fn announce(&self, update: &CatalogUpdate) -> Result<()> {
        let payload = serde_json::to_vec(update).map_err(|e| anyhow::anyhow!(e))?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        for host in &self.hosts {
            match socket.send_to(&payload, host.as_str()).await {
                Ok(_) => debug!("announced to catalog {}", host),
                Err(e) => warn!("catalog announce to {} failed: {}", host, e),
            }
        }
        Ok(())
    }
}

/// Periodic announcer driven by the coordinator's timer pass.
pub struct CatalogAnnouncer {
    sink: Box<dyn CatalogSink>,
    interval_us: u64,
    last_announce_us: u64,
}

impl std::fmt::Debug for CatalogAnnouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogAnnouncer")
            .field("interval_us", &self.interval_us)
            .field("last_announce_us", &self.last_announce_us)
            .finish()
    }
}

impl CatalogAnnouncer {
    /// Create an announcer over any sink.
    pub fn new(sink: Box<dyn CatalogSink>, interval_us: u64) -> Self {
        CatalogAnnouncer {
            sink,
            interval_us,
            last_announce_us: 0,
        }
    }

    /// Announce if the interval elapsed. Failures are swallowed after
    /// logging; the catalog is best-effort by design.
    pub async fn tick(&mut self, update: &CatalogUpdate, now_us: u64) {
        if now_us.saturating_sub(self.last_announce_us) < self.interval_us {
            return;
        }
        self.last_announce_us = now_us;
        if let Err(e) = self.sink.announce(update).await {
            warn!("catalog announcement failed: {}", e);
        }
    }
}
