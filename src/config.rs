use serde::{Deserialize, Serialize};

use crate::circular_splay::SortMode;

/// Configuration for [`crate::BTree`]. `min_degree` below 2 is clamped to 2
/// at construction; changing it later only affects future splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BTreeConfig {
    pub min_degree: usize,
}

impl BTreeConfig {
    pub fn new(min_degree: usize) -> Self {
        Self { min_degree }
    }

    /// Largest number of keys a node may hold under this configuration.
    pub fn max_keys(&self) -> usize {
        2 * self.min_degree.max(2) - 1
    }
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self { min_degree: 2 }
    }
}

/// Configuration for [`crate::CircularSplayTree`]. `buffer_size` is the hard
/// bound on resident nodes and is clamped to at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircularSplayConfig {
    pub buffer_size: usize,
    pub default_mode: SortMode,
}

impl Default for CircularSplayConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            default_mode: SortMode::Numeric,
        }
    }
}

/// Configuration for [`crate::NarySplayTree`]. `initial_branching` is clamped
/// to at least 2 and `max_branching` to at least `initial_branching`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaryConfig {
    pub initial_branching: usize,
    pub max_branching: usize,
}

impl NaryConfig {
    pub fn new(initial_branching: usize, max_branching: usize) -> Self {
        Self {
            initial_branching,
            max_branching,
        }
    }
}

impl Default for NaryConfig {
    fn default() -> Self {
        Self {
            initial_branching: 2,
            max_branching: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn btree_max_keys_clamps_degree() {
        assert_eq!(BTreeConfig::new(0).max_keys(), 3);
        assert_eq!(BTreeConfig::new(2).max_keys(), 3);
        assert_eq!(BTreeConfig::new(5).max_keys(), 9);
    }

    #[test]
    fn defaults() {
        assert_eq!(BTreeConfig::default().min_degree, 2);
        let cs = CircularSplayConfig::default();
        assert_eq!(cs.buffer_size, 1024);
        assert_eq!(cs.default_mode, SortMode::Numeric);
        let nc = NaryConfig::default();
        assert_eq!((nc.initial_branching, nc.max_branching), (2, 16));
    }
}
