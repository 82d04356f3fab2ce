//! Hash-based containers tuned for hot-path lookups.

/// Hasher used for maps keyed by untrusted or high-churn strings.
///
/// Faster than the standard library's SipHash while still providing enough
/// resistance against accidental collision pile-ups for our workloads.
pub type FastBuildHasher = foldhash::quality::RandomState;

/// A `HashMap` using [`FastBuildHasher`].
pub type FastHashMap<K, V> = hashbrown::HashMap<K, V, FastBuildHasher>;

/// A `HashSet` using [`FastBuildHasher`].
pub type FastHashSet<T> = hashbrown::HashSet<T, FastBuildHasher>;
