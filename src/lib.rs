//! TaskForge library root.
//!
//! TaskForge is a distributed task-execution framework: a single coordinator
//! process accepts user-submitted tasks (a shell command plus named input and
//! output artifacts) and dispatches them to a dynamic pool of remote worker
//! processes over a line-oriented TCP protocol.
//!
//! The typical application creates a [`core::Coordinator`], builds a number of
//! [`core::Task`] objects, submits them, and then collects results:
//!
//! ```rust,no_run
//! use taskforge::config::CoordinatorConfig;
//! use taskforge::core::{Coordinator, Task};
//!
//! # async fn example() -> taskforge::Result<()> {
//! let mut coordinator = Coordinator::create(CoordinatorConfig::default()).await?;
//!
//! let mut task = Task::new("/bin/echo hello");
//! task.specify_output_file("stdout.txt", "stdout.txt", Default::default())?;
//! coordinator.submit(task)?;
//!
//! while !coordinator.empty() {
//!     if let Some(done) = coordinator.wait(Some(5)).await? {
//!         println!("task {} finished: {:?}", done.taskid, done.result);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cli;
pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub type Result<T> = error::TaskForgeResult<T>;

pub mod logging;
pub mod services;
