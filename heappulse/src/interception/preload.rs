//! `LD_PRELOAD` surface
//!
//! ```text
//! cargo build --release --features preload
//! LD_PRELOAD=target/release/libheappulse.so ./some-program
//! ```
//!
//! Exports `malloc`, `free` and `realloc`. The dynamic linker resolves the
//! program's (and every library's) calls to these symbols here first; the real
//! implementations are found with `dlsym(RTLD_NEXT, ...)`.
//!
//! ## Startup
//!
//! ```text
//! first malloc ──► resolve real functions (dlsym) ──► forward + track
//!                      │
//!                      └─ dlsym itself calls malloc ──► bootstrap arena
//!
//! .init_array constructor ──► resolve (if not yet) ──► logger ──► install + atexit
//! ```
//!
//! Allocations made while the real functions are being resolved are served
//! from a small static arena. Arena blocks are never passed to the real `free`
//! or `realloc`.
//!
//! If a real function cannot be found the process is terminated immediately:
//! continuing would mean handing out memory that can never be freed.
//!
//! ## Limitations
//!
//! - `calloc`, `posix_memalign`, `aligned_alloc` and `memalign` are not
//!   intercepted; their blocks are untracked
//! - Thread-local state assumes the shim is part of the initial TLS block,
//!   which holds for `LD_PRELOAD` but not for a later `dlopen`

#![allow(unsafe_code)] // exported C allocator symbols

use allocator_api2::alloc::{AllocError, Allocator};
use std::alloc::Layout;
use std::cell::{Cell, UnsafeCell};
use std::ffi::{c_void, CStr};
use std::fmt::{self, Write as _};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{record_release, record_request, record_resize};
use crate::config::Config;
use crate::domain::InitError;
use crate::lifecycle;
use crate::registry::bookkeeping::dangling;
use crate::registry::AllocationRegistry;

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;

/// Alignment guaranteed by `malloc` on 64-bit Linux
const MALLOC_ALIGN: usize = 16;

// ============================================================================
// Real entry points
// ============================================================================

static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Set while this thread is inside `dlsym`
    static RESOLVING: Cell<bool> = const { Cell::new(false) };
}

fn ensure_resolved() {
    if REAL_MALLOC.load(Ordering::Acquire) != 0 {
        return;
    }
    // A nested call from inside dlsym (or from a thread being torn down)
    // leaves the slots empty and falls back to the arena.
    if !matches!(RESOLVING.try_with(|flag| flag.replace(true)), Ok(false)) {
        return;
    }

    if let Err(e) = resolve_real_functions() {
        fatal(&e);
    }
    let _ = RESOLVING.try_with(|flag| flag.set(false));
}

fn resolve_real_functions() -> Result<(), InitError> {
    let malloc = lookup("malloc", c"malloc")?;
    let free = lookup("free", c"free")?;
    let realloc = lookup("realloc", c"realloc")?;

    REAL_FREE.store(free, Ordering::Release);
    REAL_REALLOC.store(realloc, Ordering::Release);
    // published last: a non-zero malloc slot means all three are set
    REAL_MALLOC.store(malloc, Ordering::Release);
    Ok(())
}

fn lookup(symbol: &'static str, name: &CStr) -> Result<usize, InitError> {
    // SAFETY: RTLD_NEXT with a NUL-terminated name is always a valid query.
    let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if addr.is_null() {
        Err(InitError::SymbolNotFound { symbol })
    } else {
        Ok(addr as usize)
    }
}

fn real_malloc() -> Option<MallocFn> {
    ensure_resolved();
    let addr = REAL_MALLOC.load(Ordering::Acquire);
    // SAFETY: the slot only ever holds zero or dlsym's address for `malloc`.
    (addr != 0).then(|| unsafe { std::mem::transmute::<usize, MallocFn>(addr) })
}

fn real_free() -> Option<FreeFn> {
    ensure_resolved();
    let addr = REAL_FREE.load(Ordering::Acquire);
    // SAFETY: the slot only ever holds zero or dlsym's address for `free`.
    (addr != 0).then(|| unsafe { std::mem::transmute::<usize, FreeFn>(addr) })
}

fn real_realloc() -> Option<ReallocFn> {
    ensure_resolved();
    let addr = REAL_REALLOC.load(Ordering::Acquire);
    // SAFETY: the slot only ever holds zero or dlsym's address for `realloc`.
    (addr != 0).then(|| unsafe { std::mem::transmute::<usize, ReallocFn>(addr) })
}

/// Print `error` to stderr and terminate without running exit handlers
fn fatal(error: &InitError) -> ! {
    let mut message = StackMessage::new();
    let _ = writeln!(message, "[HeapPulse] {error}");
    let bytes = message.as_bytes();
    // SAFETY: writing an initialized stack buffer to fd 2, then exiting.
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
        libc::_exit(1)
    }
}

/// Fixed-size formatting buffer; output beyond capacity is truncated
struct StackMessage {
    buf: [u8; 256],
    len: usize,
}

impl StackMessage {
    const fn new() -> Self {
        Self { buf: [0; 256], len: 0 }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for StackMessage {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

// ============================================================================
// Bootstrap arena
// ============================================================================

const ARENA_SIZE: usize = 64 * 1024;
/// Each block is preceded by its size, padded to keep blocks aligned
const ARENA_HEADER: usize = MALLOC_ALIGN;

#[repr(C, align(16))]
struct Arena(UnsafeCell<[u8; ARENA_SIZE]>);

// SAFETY: blocks are handed out by an atomic bump pointer and never overlap.
unsafe impl Sync for Arena {}

static ARENA: Arena = Arena(UnsafeCell::new([0; ARENA_SIZE]));
static ARENA_USED: AtomicUsize = AtomicUsize::new(0);

fn arena_alloc(size: usize) -> *mut c_void {
    let Some(total) = size
        .checked_next_multiple_of(MALLOC_ALIGN)
        .and_then(|padded| padded.checked_add(ARENA_HEADER))
    else {
        return std::ptr::null_mut();
    };
    if total > ARENA_SIZE {
        return std::ptr::null_mut();
    }

    let start = ARENA_USED.fetch_add(total, Ordering::Relaxed);
    if start.checked_add(total).map_or(true, |end| end > ARENA_SIZE) {
        return std::ptr::null_mut();
    }

    // SAFETY: [start, start + total) is inside the arena and owned by this
    // call alone; the header slot is 16-byte aligned.
    unsafe {
        let header = ARENA.0.get().cast::<u8>().add(start);
        header.cast::<usize>().write(size);
        header.add(ARENA_HEADER).cast()
    }
}

fn in_arena(ptr: *const c_void) -> bool {
    let base = ARENA.0.get() as usize;
    (base..base + ARENA_SIZE).contains(&(ptr as usize))
}

/// Requested size of an arena block
///
/// # Safety
/// `ptr` must have been returned by [`arena_alloc`].
unsafe fn arena_block_size(ptr: *const c_void) -> usize {
    // SAFETY: the header precedes every arena block.
    unsafe { ptr.cast::<u8>().sub(ARENA_HEADER).cast::<usize>().read() }
}

// ============================================================================
// Registry storage
// ============================================================================

/// Bookkeeping storage served by the real `malloc`/`free`
#[derive(Debug, Clone, Copy, Default)]
pub struct RealBookkeeping;

// SAFETY: blocks come from the real malloc and go back to the real free;
// alignments malloc cannot guarantee are refused.
unsafe impl Allocator for RealBookkeeping {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(NonNull::slice_from_raw_parts(dangling(layout), 0));
        }
        if layout.align() > MALLOC_ALIGN {
            return Err(AllocError);
        }
        let malloc = real_malloc().ok_or(AllocError)?;
        // SAFETY: calling the real malloc with a non-zero size.
        let ptr = unsafe { malloc(layout.size()) };
        NonNull::new(ptr.cast::<u8>())
            .map(|ptr| NonNull::slice_from_raw_parts(ptr, layout.size()))
            .ok_or(AllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        if let Some(free) = real_free() {
            // SAFETY: `ptr` came from the real malloc in `allocate`.
            unsafe { free(ptr.as_ptr().cast()) }
        }
    }
}

static REGISTRY: AllocationRegistry<RealBookkeeping> = AllocationRegistry::new(RealBookkeeping);

// ============================================================================
// Constructor
// ============================================================================

#[used]
#[link_section = ".init_array"]
static INIT: extern "C" fn() = init;

extern "C" fn init() {
    ensure_resolved();
    if REAL_MALLOC.load(Ordering::Acquire) == 0 {
        // resolution was skipped because this thread's TLS is unusable
        fatal(&InitError::SymbolNotFound { symbol: "malloc" });
    }

    lifecycle::init_logging();
    lifecycle::install_with(&REGISTRY, Config::load);
}

// ============================================================================
// Exported entry points
// ============================================================================

/// # Safety
/// C `malloc` contract.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let Some(real) = real_malloc() else {
        return arena_alloc(size);
    };
    // SAFETY: forwarded contract.
    let ptr = unsafe { real(size) };
    record_request(&REGISTRY, ptr.cast(), size);
    ptr
}

/// # Safety
/// C `free` contract.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || in_arena(ptr) {
        return;
    }
    record_release(&REGISTRY, ptr.cast());
    if let Some(real) = real_free() {
        // SAFETY: forwarded contract; `ptr` is not an arena block.
        unsafe { real(ptr) }
    }
}

/// # Safety
/// C `realloc` contract.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if !ptr.is_null() && in_arena(ptr) {
        // SAFETY: `ptr` is an arena block.
        let old_size = unsafe { arena_block_size(ptr) };
        // SAFETY: our own malloc.
        let new = unsafe { malloc(size) };
        if !new.is_null() {
            // SAFETY: both blocks hold at least `min(old_size, size)` bytes
            // and are distinct.
            unsafe {
                std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), new.cast::<u8>(), old_size.min(size));
            }
        }
        return new;
    }

    let Some(real) = real_realloc() else {
        return if ptr.is_null() { arena_alloc(size) } else { std::ptr::null_mut() };
    };

    record_resize(&REGISTRY, ptr.cast(), size, || {
        // SAFETY: forwarded contract; `ptr` is not an arena block.
        unsafe { real(ptr, size) }.cast()
    })
    .cast()
}
