//! Observability logs kept by the coordinator.
//!
//! Two optional append-only files record what happened, for later analysis:
//!
//! - the performance log ([`perf::PerfLog`]) snapshots counter rows on a
//!   fixed interval, with a column header at the top,
//! - the transaction log ([`txn::TransactionLog`]) writes one record per
//!   event of interest: task submitted/dispatched/retrieved/done, worker
//!   connected/disconnected with reason, transfers with size and time, and
//!   category first-allocation changes.
//!
//! Neither file is required for correctness; failing to open a configured
//! log is fatal at enable time, after which writes are best-effort.

pub mod perf;
pub mod txn;

pub use perf::PerfLog;
pub use txn::TransactionLog;
