//! String interning for node names
//!
//! A flow is parsed once and then executed for every line of a batch; node
//! names show up in every line's outputs, run infos and events. Interning
//! keeps one allocation per distinct name and makes clones O(1).

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// Global string interner (thread-safe, lock-free reads)
static INTERNER: Lazy<Interner> = Lazy::new(Interner::new);

/// Thread-safe string interner using DashMap
pub struct Interner {
    strings: DashMap<Arc<str>, ()>,
}

impl Interner {
    pub fn new() -> Self {
        Self {
            strings: DashMap::new(),
        }
    }

    /// Intern a string, returning a shared Arc<str>
    pub fn intern(&self, s: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(s) {
            return Arc::clone(existing.key());
        }

        // entry() holds the shard lock, so two racing threads agree on one Arc
        let entry = self.strings.entry(Arc::from(s)).or_insert(());
        Arc::clone(entry.key())
    }

    /// Number of interned strings
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

/// Intern a node name using the global interner
#[inline]
pub fn intern(s: &str) -> Arc<str> {
    INTERNER.intern(s)
}
