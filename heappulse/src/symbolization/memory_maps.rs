//! Memory mapping utilities for process address space analysis
//!
//! Parses `/proc/self/maps` into the list of file-backed mappings, which is
//! what the resolver needs to find the object behind a return address and the
//! base address that object was loaded at.

use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::SymbolizationError;

const SELF_MAPS: &str = "/proc/self/maps";

/// Address range `[start, end)` in the process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// One file-backed mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedObject {
    pub range: MemoryRange,
    /// Offset of `range.start` within the file
    pub offset: u64,
    pub path: PathBuf,
}

/// File-backed mappings of a process, in address order
#[derive(Debug, Clone, Default)]
pub struct MemoryMaps {
    objects: Vec<MappedObject>,
}

impl MemoryMaps {
    /// Mappings of the calling process
    ///
    /// # Errors
    /// Returns an error if `/proc/self/maps` cannot be read or parsed
    pub fn for_current_process() -> Result<Self, SymbolizationError> {
        Self::from_file(SELF_MAPS)
    }

    /// # Errors
    /// Returns an error if the file cannot be read or contains a malformed line
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SymbolizationError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            debug!("Failed to read {}: {e}", path.display());
            SymbolizationError::MemoryMapsUnavailable(path.to_path_buf())
        })?;
        Self::parse(&text)
    }

    /// Parse the text of a `maps` file
    ///
    /// Anonymous mappings and pseudo-paths (`[heap]`, `[stack]`, `[vdso]`)
    /// are skipped.
    ///
    /// # Errors
    /// Returns [`SymbolizationError::MalformedMapLine`] for a line whose
    /// address range or offset cannot be parsed
    pub fn parse(text: &str) -> Result<Self, SymbolizationError> {
        let mut objects = Vec::new();

        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            // "start-end perms offset dev inode pathname"
            let mut fields = line.split_whitespace();
            let malformed = || SymbolizationError::MalformedMapLine(line.to_string());

            let range = fields.next().ok_or_else(malformed)?;
            let _perms = fields.next().ok_or_else(malformed)?;
            let offset = fields.next().ok_or_else(malformed)?;
            let _dev = fields.next().ok_or_else(malformed)?;
            let _inode = fields.next().ok_or_else(malformed)?;

            // Path may contain spaces; it is everything after the inode
            let path = fields.collect::<Vec<_>>().join(" ");
            if !path.starts_with('/') {
                continue;
            }

            let (start, end) = range.split_once('-').ok_or_else(malformed)?;
            let start = u64::from_str_radix(start, 16).map_err(|_| malformed())?;
            let end = u64::from_str_radix(end, 16).map_err(|_| malformed())?;
            let offset = u64::from_str_radix(offset, 16).map_err(|_| malformed())?;

            objects.push(MappedObject {
                range: MemoryRange { start, end },
                offset,
                path: PathBuf::from(path),
            });
        }

        objects.sort_by_key(|object| object.range.start);
        Ok(Self { objects })
    }

    /// Mapping containing `addr`, if it is file-backed
    #[must_use]
    pub fn find(&self, addr: u64) -> Option<&MappedObject> {
        let idx = self.objects.partition_point(|object| object.range.start <= addr);
        idx.checked_sub(1)
            .map(|i| &self.objects[i])
            .filter(|object| object.range.contains(addr))
    }

    /// Address the object at `path` was loaded at
    ///
    /// That is the runtime address of file offset zero, derived from the
    /// object's lowest-offset mapping.
    #[must_use]
    pub fn load_base(&self, path: &Path) -> Option<u64> {
        self.objects
            .iter()
            .filter(|object| object.path == path)
            .min_by_key(|object| object.offset)
            .map(|object| object.range.start.saturating_sub(object.offset))
    }

    #[must_use]
    pub fn objects(&self) -> &[MappedObject] {
        &self.objects
    }
}
