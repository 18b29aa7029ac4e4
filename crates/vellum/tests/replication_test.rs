//! Leader-to-follower replication: WAL shipping keeps the data hash in
//! step, slaves refuse direct writes, fatal status gates the namespace.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use vellum::{
    Database, ErrorCode, IndexDef, IndexType, KvType, Lsn, NamespaceConfig, ReplicationRole,
    UpdatesObserver, VxContext, WalRecord, WalRecordType,
};

fn node(server_id: i16) -> Database {
    let db = Database::with_config(NamespaceConfig::default(), server_id);
    db.open_namespace("events", None).unwrap();
    db.add_index("events", IndexDef::new("id", IndexType::Hash, KvType::Int).pk())
        .unwrap();
    db
}

#[derive(Default)]
struct RecordLog {
    records: Mutex<Vec<(Lsn, WalRecord)>>,
}

impl UpdatesObserver for RecordLog {
    fn on_wal_record(&self, lsn: Lsn, _origin: Lsn, _ns: &str, record: &WalRecord) {
        self.records.lock().push((lsn, record.clone()));
    }
}

#[test]
fn replay_reproduces_data_hash() {
    let master = node(1);
    let log = Arc::new(RecordLog::default());
    master.subscribe_updates(log.clone());

    for i in 0..50 {
        master
            .upsert("events", json!({"id": i, "value": format!("v{i}")}))
            .unwrap();
    }
    for i in (0..50).step_by(3) {
        master.delete("events", json!({"id": i})).unwrap();
    }

    let slave = node(2);
    {
        let handle = slave.handle("events").unwrap();
        handle.ns.write().repl.role = ReplicationRole::Slave;
    }

    // ship the log; item payloads decode against the leader's tags
    let master_handle = master.handle("events").unwrap();
    let master_tags = master_handle.ns.read().tags.clone();
    for (lsn, record) in log.records.lock().iter() {
        match record.kind {
            WalRecordType::ItemUpdate => {
                let doc = vellum_types::cjson::decode(&record.data, &master_tags).unwrap();
                let handle = slave.handle("events").unwrap();
                handle.ns.write().upsert_item(doc, true, *lsn).unwrap();
            }
            WalRecordType::ItemDelete => {
                let doc = vellum_types::cjson::decode(&record.data, &master_tags).unwrap();
                let handle = slave.handle("events").unwrap();
                handle.ns.write().delete_item(&doc, true, *lsn).unwrap();
            }
            _ => {}
        }
    }

    let master_state = master_handle.ns.read().repl.clone();
    let slave_handle = slave.handle("events").unwrap();
    let slave_state = slave_handle.ns.read().repl.clone();
    assert_eq!(master_state.data_count, slave_state.data_count);
    assert_eq!(
        master_state.data_hash, slave_state.data_hash,
        "replayed segment must reproduce the leader's data hash"
    );
    // the follower's position tracks the leader's counters
    assert_eq!(
        master_state.last_lsn.counter(),
        slave_state.last_lsn.counter()
    );
}

#[test]
fn slave_refuses_direct_writes() {
    let db = node(2);
    {
        let handle = db.handle("events").unwrap();
        handle.ns.write().repl.role = ReplicationRole::Slave;
    }
    let err = db.upsert("events", json!({"id": 1})).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Forbidden);
}

#[test]
fn fatal_status_blocks_until_cleared() {
    let db = node(1);
    {
        let handle = db.handle("events").unwrap();
        handle.ns.write().repl.set_fatal("events", "hash mismatch");
    }
    let err = db.upsert("events", json!({"id": 1})).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotValid);

    {
        let handle = db.handle("events").unwrap();
        handle.ns.write().repl.clear_fatal();
    }
    db.upsert("events", json!({"id": 1})).unwrap();
}

#[test]
fn promotion_clears_upstream_and_accepts_writes() {
    let db = node(2);
    {
        let handle = db.handle("events").unwrap();
        let mut ns = handle.ns.write();
        ns.repl.role = ReplicationRole::Slave;
        ns.repl.upstream_lsn = Lsn::new(10, 1);
        ns.upsert_item(json!({"id": 1}), true, Lsn::new(11, 1)).unwrap();
        let role_switch = ReplicationRole::Master;
        let name = ns.name().to_owned();
        ns.repl.on_role_changed(role_switch, &name);
        assert!(ns.repl.upstream_lsn.is_empty());
    }
    db.upsert("events", json!({"id": 2})).unwrap();
}

#[test]
fn wal_ring_overflow_forces_resync() {
    let config = NamespaceConfig {
        wal_size: 8,
        ..NamespaceConfig::default()
    };
    let db = Database::with_config(config, 1);
    db.open_namespace("events", None).unwrap();
    db.add_index("events", IndexDef::new("id", IndexType::Hash, KvType::Int).pk())
        .unwrap();

    for i in 0..40 {
        db.upsert("events", json!({"id": i})).unwrap();
    }

    let handle = db.handle("events").unwrap();
    let ns = handle.ns.read();
    // a follower that last saw counter 0 is outside the ring window
    let err = ns.wal.get(0).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotValid);
    // the live tail is still reachable
    let tail_start = ns.wal.first_counter();
    assert!(ns.wal.get(tail_start).is_ok());
    drop(ns);

    let cx = VxContext::new();
    let results = db.query_sql("SELECT COUNT(*) FROM events", &cx).unwrap();
    assert_eq!(results.total_count, Some(40));
}
