//! Forking a process whose other threads are allocating through `LeakTracker`

#![cfg(not(feature = "preload"))]

use heappulse::{lifecycle, registry, LeakTracker};
use std::alloc::System;
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[global_allocator]
static GLOBAL: LeakTracker = LeakTracker::without_exit_report(System);

/// Exit status of a child that ran `body`, or `None` if it did not finish in time
fn run_in_child(body: impl FnOnce() -> bool) -> Option<bool> {
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        let ok = body();
        unsafe { libc::_exit(i32::from(!ok)) }
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut status = 0;
    loop {
        if unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) } == pid {
            return Some(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0);
        }
        if Instant::now() > deadline {
            unsafe {
                libc::kill(pid, libc::SIGKILL);
                libc::waitpid(pid, &mut status, 0);
            }
            return None;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn allocate_and_free(rounds: usize) -> bool {
    for _ in 0..rounds {
        drop(black_box(vec![7_u8; 48]));
    }
    true
}

#[test]
fn test_children_of_busy_process_never_block() {
    drop(black_box(Box::new(0_u64)));
    assert!(lifecycle::is_installed());

    let stop = Arc::new(AtomicBool::new(false));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    drop(black_box(vec![0_u8; 48]));
                }
            })
        })
        .collect();

    let mut hung = 0;
    for _ in 0..50 {
        match run_in_child(|| allocate_and_free(2_000)) {
            Some(ok) => assert!(ok, "child failed"),
            None => hung += 1,
        }
    }

    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(hung, 0, "children blocked after fork");
}

#[test]
fn test_child_inherits_live_records() {
    let leaked: &'static mut [u8; 96] = Box::leak(Box::new([3_u8; 96]));
    let address = leaked.as_ptr() as usize;
    assert!(registry::global().contains(address));

    let outcome = run_in_child(move || {
        let inherited = registry::global().get(address).is_some_and(|r| r.size == 96);
        let fresh = Box::new([0_u8; 40]);
        inherited && registry::global().contains(fresh.as_ptr() as usize)
    });
    assert_eq!(outcome, Some(true));
}
