//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep raw addresses distinct from sizes and counts,
//! and give them a single place for their display format.

use std::fmt;

/// Address of a heap block (or of a code location in a stack trace)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub usize);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}
