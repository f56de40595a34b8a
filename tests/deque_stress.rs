//! Multi-thief conservation stress against the public deque backends.
//!
//! Heavier than the unit-level stress in `src/deque.rs`: more thieves, more
//! items, and a churn phase where the owner keeps popping while thieves
//! drain from the top.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use plywork::deque::{Deque, Growable, Locked, Steal};

fn churn<D: Deque<u64> + 'static>(thieves: usize, items: u64) {
    let d = Arc::new(D::with_log2_capacity(2));
    let done = Arc::new(AtomicBool::new(false));
    let stolen_count = Arc::new(AtomicU64::new(0));
    let stolen_sum = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..thieves)
        .map(|_| {
            let d = Arc::clone(&d);
            let done = Arc::clone(&done);
            let count = Arc::clone(&stolen_count);
            let sum = Arc::clone(&stolen_sum);
            thread::spawn(move || loop {
                match d.steal() {
                    Steal::Success(v) => {
                        count.fetch_add(1, Ordering::Relaxed);
                        sum.fetch_add(v, Ordering::Relaxed);
                    }
                    Steal::Empty => {
                        if done.load(Ordering::Acquire) {
                            break;
                        }
                        thread::yield_now();
                    }
                    Steal::Retry => {}
                }
            })
        })
        .collect();

    // Owner: push bursts, pop between bursts, then drain.
    let mut popped_count = 0u64;
    let mut popped_sum = 0u64;
    let mut next = 0u64;
    while next < items {
        let burst = (next % 13) + 1;
        for _ in 0..burst.min(items - next) {
            unsafe { d.push_bottom(next).unwrap() };
            next += 1;
        }
        for _ in 0..2 {
            if let Some(v) = unsafe { d.pop_bottom() } {
                popped_count += 1;
                popped_sum += v;
            }
        }
    }
    while let Some(v) = unsafe { d.pop_bottom() } {
        popped_count += 1;
        popped_sum += v;
    }
    done.store(true, Ordering::Release);

    for h in handles {
        h.join().unwrap();
    }

    // One more sweep: a thief may have raced the final pop-None.
    while let Some(v) = unsafe { d.pop_bottom() } {
        popped_count += 1;
        popped_sum += v;
    }

    let total = popped_count + stolen_count.load(Ordering::Relaxed);
    let sum = popped_sum + stolen_sum.load(Ordering::Relaxed);
    assert_eq!(total, items, "lost or duplicated items");
    assert_eq!(sum, (0..items).sum::<u64>(), "item identity corrupted");
}

#[test]
fn growable_four_thieves() {
    churn::<Growable<u64>>(4, 100_000);
}

#[test]
fn growable_single_thief_tiny_capacity() {
    churn::<Growable<u64>>(1, 50_000);
}

#[test]
fn locked_four_thieves() {
    churn::<Locked<u64>>(4, 50_000);
}
