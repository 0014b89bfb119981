//! Generic content-addressed interning side-table.
//!
//! Grounded in the design notes (spec.md §9): the original relies on
//! intrusive, ambient reference counting baked into the attribute base
//! class. Here that's expressed as `Arc`-style shared ownership plus a
//! side-table keyed by content hash that holds only `Weak` references; the
//! last `Handle` to drop scrubs its own bucket. No strong reference to a
//! value is ever held anywhere except by the handles the caller is holding,
//! so the table can never keep an otherwise-unreferenced value alive.
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};

struct Slot<T> {
    value: T,
    hash: u64,
    table: Weak<Mutex<HashMap<u64, Vec<Weak<Slot<T>>>>>>,
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            if let Ok(mut buckets) = table.lock() {
                if let Some(bucket) = buckets.get_mut(&self.hash) {
                    bucket.retain(|w| w.strong_count() > 0);
                    if bucket.is_empty() {
                        buckets.remove(&self.hash);
                    }
                }
            }
        }
    }
}

/// A canonical, reference-counted handle to an interned value of type `T`.
///
/// Two handles produced by the same `Intern<T>` compare equal (via
/// `Arc::ptr_eq`) if and only if the values they were `locate`d from are
/// content-equal; interning guarantees at most one live object per distinct
/// content value, up to the racing window documented on `Intern::locate`.
pub struct Handle<T>(Arc<Slot<T>>);

impl<T> Handle<T> {
    /// Stable content hash, used by aggregates that fold sub-handle hashes
    /// into their own hash (spec.md §4.1 "Hashing").
    pub fn content_hash(&self) -> u64 {
        self.0.hash
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle(Arc::clone(&self.0))
    }
}

impl<T> Deref for Handle<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0.value
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash.hash(state);
    }
}

impl<T: fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:?})", self.0.value)
    }
}

/// Content-addressed interning table for one attribute kind.
pub struct Intern<T> {
    buckets: Arc<Mutex<HashMap<u64, Vec<Weak<Slot<T>>>>>>,
}

impl<T> Default for Intern<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Intern<T> {
    pub fn new() -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of distinct canonical values currently live.
    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap().values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + PartialEq + Hash> Intern<T> {
    /// Find or create the canonical handle for `value`.
    ///
    /// Concurrency: the whole bucket lookup/insert happens under the
    /// table's lock, so a `locate` racing a `release` (a `Handle` dropping
    /// and running `Slot::drop`) always observes a consistent bucket: the
    /// dying slot either hasn't dropped yet (and gets handed back out,
    /// bumping its strong count before destruction can proceed) or has
    /// already scrubbed itself (and `locate` builds a fresh canonical
    /// value). Either way every handle returned is valid.
    pub fn locate(&self, value: T) -> Handle<T> {
        let hash = content_hash(&value);
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(hash).or_insert_with(Vec::new);
        for weak in bucket.iter() {
            if let Some(slot) = weak.upgrade() {
                if slot.value == value {
                    return Handle(slot);
                }
            }
        }
        bucket.retain(|w| w.strong_count() > 0);
        let slot = Arc::new(Slot {
            value,
            hash,
            table: Arc::downgrade(&self.buckets),
        });
        bucket.push(Arc::downgrade(&slot));
        Handle(slot)
    }
}

fn content_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_dedups() {
        let table: Intern<String> = Intern::new();
        let a = table.locate("hello".to_string());
        let b = table.locate("hello".to_string());
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_distinct_content_distinct_handles() {
        let table: Intern<String> = Intern::new();
        let a = table.locate("hello".to_string());
        let b = table.locate("world".to_string());
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_release_scrubs_entry() {
        let table: Intern<String> = Intern::new();
        {
            let _a = table.locate("transient".to_string());
            assert_eq!(table.len(), 1);
        }
        assert_eq!(table.len(), 0);
        // Re-locating after release creates a fresh canonical object
        let b = table.locate("transient".to_string());
        assert_eq!(table.len(), 1);
        drop(b);
        assert_eq!(table.len(), 0);
    }
}
