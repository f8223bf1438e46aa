//! External services integration for TaskForge.
//!
//! This module contains the coordinator's integrations with services outside
//! the worker protocol. Today that is the catalog announcer: an opaque
//! "announce my presence" sink to which the coordinator periodically reports
//! identity and statistics so discovery tools can find it.
//!
//! # Modules
//!
//! - `catalog` - catalog-server announcement sink

pub mod catalog;

pub use catalog::{CatalogAnnouncer, CatalogSink, CatalogUpdate, UdpCatalogSink};
