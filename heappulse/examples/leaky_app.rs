//! Demo program with deliberate leaks
//!
//! ```text
//! cargo run -p heappulse --example leaky_app
//! HEAPPULSE_MAX_DEPTH=4 cargo run -p heappulse --example leaky_app
//! HEAPPULSE_SYMBOLIZE=off cargo run -p heappulse --example leaky_app
//! ```
//!
//! The leak report is printed to stderr when `main` returns.

use heappulse::{lifecycle, LeakTracker};
use std::collections::HashMap;

#[global_allocator]
static GLOBAL: LeakTracker = LeakTracker::system();

struct Session {
    name: String,
    buffer: Vec<u8>,
}

#[inline(never)]
fn open_session(name: &str) -> Box<Session> {
    Box::new(Session { name: name.to_string(), buffer: vec![0; 128] })
}

#[inline(never)]
fn build_cache() -> HashMap<u32, String> {
    (0..16).map(|i| (i, format!("entry-{i}"))).collect()
}

fn main() {
    // balanced: nothing of this survives
    let cache = build_cache();
    println!("cache holds {} entries", cache.len());
    drop(cache);

    // leaked on purpose: the session, its name and its buffer
    let session = Box::leak(open_session("demo"));
    println!("leaked session {:?} with {} bytes", session.name, session.buffer.len());

    // a raw leak through the C-style path
    std::mem::forget(vec![1u32; 16]);

    if let Some(live) = lifecycle::live_allocations() {
        println!("{live} allocations live before exit");
    }
}
