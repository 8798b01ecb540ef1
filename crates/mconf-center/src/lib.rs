//! # mconf-center
//!
//! Configuration center runtime on tokio.
//!
//! - `Mconf`: the connected center handle (add/up/del/pull/push and listings)
//! - `BackingStore`: adapter trait for tree-path and prefix-map stores, with
//!   in-memory implementations of both
//! - Watch dispatch with one queue and task per subscription
//! - Asynchronous persistence with exponential backoff
//! - Error sink and statistics for failures that happen in the background

pub mod adapter;
pub mod center;
pub mod memory;
pub mod persist;
pub mod sink;
pub mod stats;
pub mod watch;

pub use adapter::{BackingStore, StoreError, StoreEvent, StoreWatcher};
pub use center::{Mconf, Subscription};
pub use memory::{MemoryMapStore, MemoryTreeStore};
pub use sink::{CenterError, ErrorRecord};
pub use stats::CenterStatistics;
pub use watch::{Notification, NotificationKind, Notify, NotifyError, SubscriptionId};

pub use mconf_core::{Cmd, CmdBuilder, MconfError, MconfSettings, Result};
