//! # Symbol Resolution and Address Translation
//!
//! Turns the return addresses stored with each leaked allocation into
//! human-readable frame descriptions for the exit report. Nothing in here runs
//! on the allocation path: capture stores raw addresses only, and resolution
//! happens once, when the report is written.
//!
//! ## Resolution Chain
//!
//! Every address is tried against each step in turn and the first one that
//! produces a name wins:
//!
//! ```text
//! 1. /proc/self/maps        which file-backed object contains the address?
//!    0x55f3a2b4c780  ──►  /usr/bin/app  (loaded at 0x55f3a2b4c000)
//!
//! 2. PIE adjustment         runtime address → object-relative address
//!    0x55f3a2b4c780 - 0x55f3a2b4c000 = 0x780
//!
//! 3. DWARF (addr2line)      0x780 → app::cache::insert at src/cache.rs:42:9
//!
//! 4. dladdr                 dynamic symbol table, for objects without DWARF
//!    → malloc+0x1e (libc.so.6)
//!
//! 5. placeholder            0x00007f3a2b4c7800 <unknown>
//! ```
//!
//! Step 2 only applies to position-independent objects (PIE executables and
//! shared libraries). A non-PIE executable is linked at its final address and
//! its runtime addresses are looked up unchanged.
//!
//! Lookups use `address - 1`: a captured frame is a *return* address, which
//! points at the instruction after the call and may already belong to the next
//! source line (or the next function, after a `noreturn` call).
//!
//! ## Limitations
//!
//! - **Debug info**: file and line need DWARF in the object itself
//!   (`debug = true`); split debug files are not searched
//! - **Stripped objects**: only exported symbols are found through `dladdr`
//!
//! ## Module Structure
//!
//! - [`memory_maps`]: parsing `/proc/self/maps`
//! - [`symbolizer`]: DWARF lookups for one object file, with a per-address cache
//! - [`resolver`]: the chain above, with one cached symbolizer per object

pub mod memory_maps;
pub mod resolver;
pub mod symbolizer;

use crate::domain::Address;

pub use memory_maps::{MappedObject, MemoryMaps, MemoryRange};
pub use resolver::StackResolver;
pub use symbolizer::Symbolizer;

/// Turns captured frames into one printable description each
///
/// Implementations never fail as a whole: an address that cannot be resolved
/// gets a placeholder description.
pub trait ResolveFrames {
    /// Describe `addresses`, returning exactly one entry per address in order
    fn resolve(&mut self, addresses: &[usize]) -> Vec<String>;
}

/// Formats frames as bare addresses (no symbol lookup)
#[derive(Debug, Clone, Copy, Default)]
pub struct RawAddresses;

impl ResolveFrames for RawAddresses {
    fn resolve(&mut self, addresses: &[usize]) -> Vec<String> {
        addresses.iter().map(|&addr| raw_address(addr)).collect()
    }
}

pub(crate) fn raw_address(addr: usize) -> String {
    Address(addr).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_addresses_keep_order_and_length() {
        let described = RawAddresses.resolve(&[0x1000, 0xdead_beef, 0]);
        assert_eq!(
            described,
            vec!["0x0000000000001000", "0x00000000deadbeef", "0x0000000000000000"]
        );
    }

    #[test]
    fn test_raw_addresses_empty() {
        assert!(RawAddresses.resolve(&[]).is_empty());
    }
}
