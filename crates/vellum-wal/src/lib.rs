//! Write-ahead log and replication state machine.
//!
//! Every namespace owns a fixed-capacity ring of [`WalRecord`]s keyed by
//! a strictly monotonic LSN counter. Mutations append records and notify
//! subscribed observers in LSN order; followers replay records and track
//! the leader via [`ReplicationState`].

pub mod observer;
pub mod record;
pub mod replication;
pub mod wal;

pub use observer::{ObserverRegistry, UpdatesObserver};
pub use record::{WalRecord, WalRecordType};
pub use replication::{ReplStatus, ReplicationRole, ReplicationState};
pub use wal::WalTracker;
