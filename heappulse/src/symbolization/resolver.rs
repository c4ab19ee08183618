//! Stack trace resolution for the leak report
//!
//! Drives the resolution chain described in the [module docs](super): memory
//! maps, PIE adjustment, DWARF, then `dladdr`, then a placeholder.

#![allow(unsafe_code)] // dladdr

use log::{debug, info};
use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::path::{Path, PathBuf};

use crate::domain::SymbolizationError;

use super::memory_maps::{MappedObject, MemoryMaps};
use super::symbolizer::Symbolizer;
use super::{raw_address, ResolveFrames};

/// Resolves captured return addresses for the running process
///
/// Object files are opened lazily, the first time one of their addresses is
/// seen, and kept for the lifetime of the resolver. An object whose debug info
/// fails to load is remembered as such and not retried.
pub struct StackResolver {
    maps: Option<MemoryMaps>,
    symbolizers: HashMap<PathBuf, Option<Symbolizer>>,
}

impl StackResolver {
    /// Resolver over the current process's memory maps
    ///
    /// If the maps cannot be read, DWARF lookups are skipped and only the
    /// `dladdr` fallback is used.
    #[must_use]
    pub fn for_current_process() -> Self {
        let maps = MemoryMaps::for_current_process()
            .map_err(|e| debug!("Symbolization without memory maps: {e}"))
            .ok();
        Self { maps, symbolizers: HashMap::new() }
    }

    #[must_use]
    pub fn with_maps(maps: MemoryMaps) -> Self {
        Self { maps: Some(maps), symbolizers: HashMap::new() }
    }

    /// Describe one runtime address
    pub fn describe(&mut self, addr: usize) -> String {
        self.from_debug_info(addr)
            .or_else(|| dynamic_symbol(addr))
            .unwrap_or_else(|| format!("{} <unknown>", raw_address(addr)))
    }

    fn from_debug_info(&mut self, addr: usize) -> Option<String> {
        let runtime = addr as u64;
        let object = self.maps.as_ref()?.find(runtime)?.clone();
        let base = self.maps.as_ref()?.load_base(&object.path)?;

        let symbolizer = self.symbolizer_for(&object)?;
        let lookup = adjust_address(runtime, base, symbolizer.is_relocatable()).checked_sub(1)?;

        let described = symbolizer.describe(lookup)?;
        Some(format!("{} {described}", raw_address(addr)))
    }

    fn symbolizer_for(&mut self, object: &MappedObject) -> Option<&Symbolizer> {
        self.symbolizers
            .entry(object.path.clone())
            .or_insert_with(|| match Symbolizer::new(&object.path) {
                Ok(symbolizer) => {
                    info!("Loaded debug info for {}", object.path.display());
                    Some(symbolizer)
                }
                Err(e) => {
                    let err = SymbolizationError::ObjectLoadFailed {
                        path: object.path.clone(),
                        reason: format!("{e:#}"),
                    };
                    debug!("{err}");
                    None
                }
            })
            .as_ref()
    }
}

impl ResolveFrames for StackResolver {
    fn resolve(&mut self, addresses: &[usize]) -> Vec<String> {
        addresses.iter().map(|&addr| self.describe(addr)).collect()
    }
}

/// Translate a runtime address to the address the object's debug info uses
///
/// Position-independent objects are rebased onto their load address; others
/// were linked at their runtime address and are returned unchanged.
fn adjust_address(runtime: u64, load_base: u64, relocatable: bool) -> u64 {
    if relocatable {
        runtime.saturating_sub(load_base)
    } else {
        runtime
    }
}

/// Nearest exported symbol, from the dynamic linker's tables
fn dynamic_symbol(addr: usize) -> Option<String> {
    // SAFETY: Dl_info is plain data for which all-zero is a valid value.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };

    // SAFETY: dladdr only inspects the address and fills `info`.
    if unsafe { libc::dladdr(addr as *const c_void, &mut info) } == 0 || info.dli_sname.is_null() {
        return None;
    }

    // SAFETY: dladdr succeeded and dli_sname is non-null; it points into the
    // object's string table, which stays mapped while the object is loaded.
    let name = unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy();
    let offset = addr.wrapping_sub(info.dli_saddr as usize);

    let object = if info.dli_fname.is_null() {
        String::from("?")
    } else {
        // SAFETY: as above, for the object's file name.
        let path = unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy();
        Path::new(path.as_ref())
            .file_name()
            .map_or_else(|| path.to_string(), |name| name.to_string_lossy().into_owned())
    };

    Some(format!(
        "{} {}+0x{offset:x} ({object})",
        raw_address(addr),
        Symbolizer::demangle_symbol(&name)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjust_address_relocatable() {
        assert_eq!(adjust_address(0x7f00_0005_0000, 0x7f00_0000_0000, true), 0x5_0000);
    }

    #[test]
    fn test_adjust_address_fixed() {
        assert_eq!(adjust_address(0x40_1234, 0x40_0000, false), 0x40_1234);
    }

    #[test]
    fn test_unmapped_address_gets_placeholder() {
        let mut resolver = StackResolver::with_maps(MemoryMaps::default());
        assert_eq!(resolver.describe(0x10), "0x0000000000000010 <unknown>");
    }

    #[test]
    fn test_resolve_keeps_length() {
        let mut resolver = StackResolver::with_maps(MemoryMaps::default());
        assert_eq!(resolver.resolve(&[0x10, 0x20, 0x30]).len(), 3);
    }

    #[test]
    fn test_exported_libc_symbol_via_dladdr() {
        let mut resolver = StackResolver::with_maps(MemoryMaps::default());
        let described = resolver.describe(libc::free as usize);
        assert!(described.contains("free"), "got {described}");
    }

    #[inline(never)]
    fn marker_function() -> usize {
        std::hint::black_box(1)
    }

    #[test]
    fn test_own_function_resolves_to_name() {
        // Point inside the function body; a function's first byte minus one
        // would belong to the previous symbol.
        let addr = marker_function as usize + 1;
        let mut resolver = StackResolver::for_current_process();

        assert!(resolver.describe(addr).starts_with(&raw_address(addr)));
        // Test binaries built without debug info have nothing to look up.
        if let Some(described) = resolver.from_debug_info(addr) {
            assert!(described.contains("marker_function"), "got {described}");
        }
    }
}
