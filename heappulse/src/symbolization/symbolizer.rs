//! DWARF lookups for one object file

use addr2line::Context;
use anyhow::{Context as _, Result};
use gimli::{EndianRcSlice, RunTimeEndian};
use object::{Object, ObjectKind, ObjectSection};
use rustc_demangle::demangle;
use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

type Reader = EndianRcSlice<RunTimeEndian>;

/// Turns object-relative addresses into one-line frame descriptions
///
/// Descriptions are cached per address: leaks from one call site share most
/// of their frames.
pub struct Symbolizer {
    ctx: Context<Reader>,
    /// Position-independent object (PIE executable or shared library)
    relocatable: bool,
    described: RefCell<HashMap<u64, Option<String>>>,
}

impl Symbolizer {
    /// Load the debug info of the object file at `path`
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if its DWARF
    /// debug info cannot be loaded
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let object = object::File::parse(&*data).context("Failed to parse object file")?;

        let endian =
            if object.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };
        let dwarf = gimli::Dwarf::load(|id| load_section(&object, id, endian))?;
        let ctx = Context::from_dwarf(dwarf).context("Failed to load DWARF debug information")?;

        Ok(Self {
            ctx,
            relocatable: object.kind() == ObjectKind::Dynamic,
            described: RefCell::new(HashMap::new()),
        })
    }

    /// Whether runtime addresses must be rebased before lookup
    #[must_use]
    pub fn is_relocatable(&self) -> bool {
        self.relocatable
    }

    /// `function at file:line:col`, followed by `(inlined into outer)` when the
    /// address lies in inlined code
    ///
    /// `None` when the debug info names neither a function nor a location for
    /// `addr`.
    pub fn describe(&self, addr: u64) -> Option<String> {
        if let Some(cached) = self.described.borrow().get(&addr) {
            return cached.clone();
        }

        let description = self.lookup(addr);
        self.described.borrow_mut().insert(addr, description.clone());
        description
    }

    fn lookup(&self, addr: u64) -> Option<String> {
        let mut frames = self.ctx.find_frames(addr).skip_all_loads().ok()?;

        let mut innermost = None;
        let mut outer_function = None;
        while let Ok(Some(frame)) = frames.next() {
            let function = frame
                .function
                .as_ref()
                .and_then(|name| name.demangle().ok())
                .map(Cow::into_owned);

            if innermost.is_none() {
                let position =
                    frame.location.and_then(|loc| source_position(loc.file, loc.line, loc.column));
                innermost = Some((function, position));
            } else {
                outer_function = Some(function);
            }
        }

        let (function, position) = innermost?;
        if function.is_none() && position.is_none() {
            return None;
        }
        Some(compose(function.as_deref(), position.as_deref(), outer_function))
    }

    /// Demangle a Rust symbol name, without the hash suffix
    #[must_use]
    pub fn demangle_symbol(symbol: &str) -> String {
        format!("{:#}", demangle(symbol))
    }
}

fn load_section(
    object: &object::File<'_>,
    id: gimli::SectionId,
    endian: RunTimeEndian,
) -> Result<Reader, gimli::Error> {
    let data = object
        .section_by_name(id.name())
        .and_then(|section| section.uncompressed_data().ok())
        .unwrap_or(Cow::Borrowed(&[][..]));
    Ok(EndianRcSlice::new(Rc::from(&*data), endian))
}

/// `file:line:col`, shortened to what the line table knows
fn source_position(file: Option<&str>, line: Option<u32>, column: Option<u32>) -> Option<String> {
    let file = file?;
    Some(match (line, column) {
        (Some(line), Some(column)) => format!("{file}:{line}:{column}"),
        (Some(line), None) => format!("{file}:{line}"),
        _ => file.to_string(),
    })
}

fn compose(function: Option<&str>, position: Option<&str>, outer: Option<Option<String>>) -> String {
    let mut text = function.unwrap_or("<unknown>").to_string();
    if let Some(position) = position {
        text.push_str(" at ");
        text.push_str(position);
    }
    if let Some(outer) = outer {
        text.push_str(" (inlined into ");
        text.push_str(outer.as_deref().unwrap_or("<unknown>"));
        text.push(')');
    }
    text
}
