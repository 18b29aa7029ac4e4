//! Vellum: an in-memory document database engine.
//!
//! Namespaces hold schemaless JSON documents with typed secondary
//! indexes (hash, btree, fulltext, geo, ttl, composite), queried through
//! SQL, a JSON DSL or the [`Query`] builder. Writes flow through a
//! per-namespace WAL that feeds leader-to-follower replication;
//! transactions commit in place or via copy-on-write namespace swap.
//!
//! ```
//! use serde_json::json;
//! use vellum::{Database, IndexDef, IndexType, KvType, VxContext};
//!
//! let db = Database::new();
//! db.open_namespace("books", None).unwrap();
//! db.add_index("books", IndexDef::new("id", IndexType::Hash, KvType::Int).pk())
//!     .unwrap();
//! db.add_index("books", IndexDef::new("price", IndexType::Tree, KvType::Int64))
//!     .unwrap();
//!
//! db.upsert("books", json!({"id": 1, "price": 500, "title": "war and peace"}))
//!     .unwrap();
//!
//! let cx = VxContext::new();
//! let results = db
//!     .query_sql("SELECT * FROM books WHERE price >= 500", &cx)
//!     .unwrap();
//! assert_eq!(results.len(), 1);
//! ```

pub use vellum_ast::{
    dsl, wire, AggType, AggregateEntry, CalcTotalMode, CondType, EntryNode, EntryTree, JoinEntry,
    JoinType, JoinedQuery, OpType, Query, QueryEntry, QueryType, SortEntry, StrictMode,
    UpdateEntry, UpdateMode,
};
pub use vellum_core::{
    AggregationResult, Database, ExplainResult, FacetResult, ItemRef, MemStat, NamespaceConfig,
    NsHandle, PerfStat, QueryResults, Transaction,
};
pub use vellum_error::{ErrorCode, Result, VellumError};
pub use vellum_fulltext::FtConfig;
pub use vellum_index::{IndexDef, IndexOpts, IndexType};
pub use vellum_parser::{parse_sql, to_sql};
pub use vellum_storage::{MemStorage, Storage};
pub use vellum_types::{CollateMode, IdType, KvType, Lsn, Point, Variant, VxContext};
pub use vellum_wal::{ReplicationRole, UpdatesObserver, WalRecord, WalRecordType};
