//! Replication role and state tracking.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vellum_error::{Result, VellumError};
use vellum_types::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationRole {
    #[default]
    None,
    Master,
    Slave,
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplStatus {
    #[default]
    Idle,
    Syncing,
    Error,
    Fatal,
}

/// Per-namespace replication bookkeeping, persisted as JSON in the
/// `repl.<n>` system records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationState {
    pub role: ReplicationRole,
    /// LSN of the last applied record (own or replicated).
    pub last_lsn: Lsn,
    /// LSN of the last record originated locally.
    pub last_self_lsn: Lsn,
    /// First LSN this node produced after becoming a master.
    pub origin_lsn: Lsn,
    /// Leader position a follower has confirmed.
    pub upstream_lsn: Lsn,
    /// XOR of per-item payload hashes; order-independent.
    pub data_hash: u64,
    pub data_count: usize,
    pub status: ReplStatus,
    /// Bumped whenever the follower must force a full resync.
    pub incarnation: u64,
}

impl ReplicationState {
    /// XOR an item's payload hash in (on upsert) or out (on delete);
    /// with XOR both are the same operation.
    pub fn toggle_item_hash(&mut self, payload_hash: u64) {
        self.data_hash ^= payload_hash;
    }

    /// Whether a local (non-replicated) write is currently allowed.
    pub fn check_write(&self, from_replication: bool) -> Result<()> {
        if self.status == ReplStatus::Fatal {
            return Err(VellumError::not_valid(
                "namespace is in fatal replication status",
            ));
        }
        match self.role {
            ReplicationRole::ReadOnly => Err(VellumError::forbidden(
                "namespace is read only",
            )),
            ReplicationRole::Slave if !from_replication => Err(VellumError::forbidden(
                "write to a slave namespace is allowed from replication only",
            )),
            _ => Ok(()),
        }
    }

    /// Reconcile the current role with a requested one (config update).
    pub fn on_role_changed(&mut self, requested: ReplicationRole, ns: &str) {
        if self.role == requested {
            return;
        }
        info!(namespace = ns, from = ?self.role, to = ?requested, "replication role switch");
        if self.role == ReplicationRole::Slave && requested == ReplicationRole::Master {
            // promotion: forget the old leader, stamp our own origin
            self.upstream_lsn = Lsn::EMPTY;
            self.origin_lsn = self.last_lsn;
            self.status = ReplStatus::Idle;
        }
        self.role = requested;
    }

    /// A server id change on a namespace that already has data makes its
    /// LSN history ambiguous; force read-only until an operator resyncs.
    pub fn on_server_id_changed(&mut self, ns: &str) {
        if self.data_count > 0 {
            warn!(namespace = ns, "server id changed on non-empty namespace, forcing read-only");
            self.role = ReplicationRole::ReadOnly;
            self.incarnation += 1;
        }
    }

    /// Record a replication apply failure; the namespace refuses writes
    /// until the status is cleared.
    pub fn set_fatal(&mut self, ns: &str, detail: &str) {
        warn!(namespace = ns, detail, "replication fatal");
        self.status = ReplStatus::Fatal;
    }

    pub fn clear_fatal(&mut self) {
        if self.status == ReplStatus::Fatal {
            self.status = ReplStatus::Idle;
        }
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("replication state serializes")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| VellumError::not_valid(format!("bad replication state: {e}")))
    }
}
