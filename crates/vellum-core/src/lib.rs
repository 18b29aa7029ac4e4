//! Vellum engine core: namespaces, the query executor and transactions.
//!
//! The entry point is [`Database`]: open namespaces, register indexes,
//! upsert schemaless JSON documents and run SQL / AST queries against
//! them. Durability is delegated to the pluggable byte store from
//! `vellum-storage`; replication observers receive every WAL append in
//! LSN order.

pub mod aggregator;
pub mod config;
pub mod database;
pub mod item;
pub mod modify;
pub mod namespace;
pub mod query_results;
pub mod selecter;
pub mod sortexpr;
pub mod transaction;

pub use config::NamespaceConfig;
pub use database::{Database, NsHandle};
pub use namespace::{FieldLookup, MemStat, NamespaceImpl, PerfStat};
pub use query_results::{AggregationResult, ExplainResult, FacetResult, ItemRef, QueryResults};
pub use transaction::{Transaction, TxStep};
