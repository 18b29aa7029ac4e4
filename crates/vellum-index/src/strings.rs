//! Deferred reclamation of deleted key strings.
//!
//! An index "holds" a string by keeping its refcounted handle alive.
//! When a bucket empties, the key moves into the namespace's active
//! [`StringsHolder`]; external readers may still reference the string
//! through payload handles, so the background routine only drops a
//! holder's entries once every external reference is gone.

use vellum_types::KeyString;

#[derive(Debug, Default)]
pub struct StringsHolder {
    held: Vec<KeyString>,
}

impl StringsHolder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a string removed from an index bucket.
    pub fn hold(&mut self, s: KeyString) {
        self.held.push(s);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.held.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Memory held, in bytes of string payload.
    #[must_use]
    pub fn mem_usage(&self) -> usize {
        self.held.iter().map(|s| s.len()).sum()
    }

    /// Drop entries whose only remaining reference is the holder itself.
    /// Returns the number of reclaimed strings.
    pub fn sweep(&mut self) -> usize {
        let before = self.held.len();
        self.held.retain(|s| s.ref_count() > 1);
        before - self.held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_reclaims_unreferenced_only() {
        let mut holder = StringsHolder::new();
        let keep = KeyString::new("still-referenced");
        holder.hold(keep.clone());
        holder.hold(KeyString::new("orphan"));
        assert_eq!(holder.len(), 2);

        assert_eq!(holder.sweep(), 1);
        assert_eq!(holder.len(), 1);

        drop(keep);
        assert_eq!(holder.sweep(), 1);
        assert!(holder.is_empty());
    }

    #[test]
    fn mem_usage_counts_bytes() {
        let mut holder = StringsHolder::new();
        holder.hold(KeyString::new("abcd"));
        assert_eq!(holder.mem_usage(), 4);
    }
}
