//! Named symbolic byte arrays and the process-wide array cache.

use ahash::AHashMap;
use std::fmt;
use std::sync::Arc;

/// A named symbolic array of bytes. Arrays are the leaves of the symbolic
/// universe: every unknown input is a read out of some array. Names are
/// unique per cache, so structural equality coincides with identity.
#[derive(Debug, PartialEq, Eq)]
pub struct Array {
    /// Unique name within the cache that allocated this array.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// Shared handle to an array. Identity (not name) is what the analyzer
/// keys maps on; the cache guarantees one handle per name.
pub type ArrayRef = Arc<Array>;

/// Stable identity of an array, derived from its allocation address.
/// Valid for as long as the owning cache is alive, which is the process
/// lifetime for all arrays the analyzer creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayId(usize);

impl ArrayId {
    /// Identity of the array behind a shared handle.
    pub fn of(array: &ArrayRef) -> ArrayId {
        ArrayId(Arc::as_ptr(array) as usize)
    }
}

impl fmt::Display for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.size)
    }
}

/// Deduplicating allocator for arrays. Lookups are pure; an insertion for
/// a name that already exists returns the existing handle, so array
/// identity is stable across repeated creation requests.
#[derive(Debug, Default)]
pub struct ArrayCache {
    by_name: AHashMap<String, ArrayRef>,
}

impl ArrayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the array with the given name and byte size. If the
    /// name is already present the existing handle is returned and the
    /// requested size is ignored.
    pub fn create(&mut self, name: &str, size: u64) -> ArrayRef {
        if let Some(existing) = self.by_name.get(name) {
            return existing.clone();
        }
        let arr: ArrayRef = Arc::new(Array {
            name: name.to_string(),
            size,
        });
        self.by_name.insert(name.to_string(), arr.clone());
        arr
    }

    /// Look up an existing array by name.
    pub fn get(&self, name: &str) -> Option<ArrayRef> {
        self.by_name.get(name).cloned()
    }

    /// Number of arrays allocated so far.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_dedupes_by_name() {
        let mut cache = ArrayCache::new();
        let a = cache.create("x", 4);
        let b = cache.create("x", 8);
        assert_eq!(ArrayId::of(&a), ArrayId::of(&b));
        assert_eq!(b.size, 4);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_names_distinct_identity() {
        let mut cache = ArrayCache::new();
        let a = cache.create("x", 4);
        let b = cache.create("y", 4);
        assert_ne!(ArrayId::of(&a), ArrayId::of(&b));
    }
}
