//! Replication update observers.

use std::sync::Arc;

use parking_lot::RwLock;
use vellum_types::Lsn;

use crate::record::WalRecord;

/// Receives every WAL append of subscribed namespaces, in LSN order.
pub trait UpdatesObserver: Send + Sync {
    /// `origin_lsn` is the leader's LSN for replicated records, empty
    /// for records originated locally.
    fn on_wal_record(&self, lsn: Lsn, origin_lsn: Lsn, namespace: &str, record: &WalRecord);
}

/// Shared observer list; cloning shares the registration set.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    observers: Arc<RwLock<Vec<Arc<dyn UpdatesObserver>>>>,
}

impl ObserverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn UpdatesObserver>) {
        self.observers.write().push(observer);
    }

    pub fn unsubscribe_all(&self) {
        self.observers.write().clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    pub fn notify(&self, lsn: Lsn, origin_lsn: Lsn, namespace: &str, record: &WalRecord) {
        for observer in self.observers.read().iter() {
            observer.on_wal_record(lsn, origin_lsn, namespace, record);
        }
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("count", &self.observers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::WalRecordType;
    use parking_lot::Mutex;

    struct Collector {
        seen: Mutex<Vec<i64>>,
    }

    impl UpdatesObserver for Collector {
        fn on_wal_record(&self, lsn: Lsn, _origin: Lsn, _ns: &str, _record: &WalRecord) {
            self.seen.lock().push(lsn.counter());
        }
    }

    #[test]
    fn observers_receive_in_order() {
        let registry = ObserverRegistry::new();
        let collector = Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
        });
        registry.subscribe(collector.clone());

        let record = WalRecord::new(WalRecordType::ItemUpdate, vec![]);
        for counter in 0..5 {
            registry.notify(Lsn::new(counter, 0), Lsn::EMPTY, "ns", &record);
        }
        assert_eq!(*collector.seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_registry_reports_empty() {
        let registry = ObserverRegistry::new();
        assert!(registry.is_empty());
        registry.subscribe(Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
        }));
        assert!(!registry.is_empty());
        registry.unsubscribe_all();
        assert!(registry.is_empty());
    }
}
