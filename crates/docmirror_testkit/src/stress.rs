//! Stress helpers for the ordered cache.
//!
//! These drive a shared cache from several threads the way the initial
//! fetch and the change feed do, then verify the ordering invariant.

use crate::invariants::{check_sorted_unique, InvariantViolation};
use docmirror_core::{Document, OrderedCache};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Operations that changed the cache.
    pub changed_ops: usize,
    /// Entries left in the cache.
    pub final_len: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(total: usize, changed: usize, final_len: usize, duration: Duration) -> Self {
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            changed_ops: changed,
            final_len,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Changed: {}", self.changed_ops);
        println!("Final entries: {}", self.final_len);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of distinct document ids.
    pub doc_count: usize,
    /// One in `remove_every` operations is a removal. Zero disables removals.
    pub remove_every: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            doc_count: 1_000,
            remove_every: 4,
        }
    }
}

fn doc_id(index: usize) -> String {
    format!("doc-{index:06}")
}

/// Runs concurrent upserts and removals against one shared cache.
pub fn stress_concurrent_mutations(
    config: &StressConfig,
) -> Result<StressTestResult, InvariantViolation> {
    let cache = Arc::new(Mutex::new(OrderedCache::new()));
    let doc_count = config.doc_count.max(1);
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let operations = config.operations;
            let remove_every = config.remove_every;
            thread::spawn(move || {
                let mut changed = 0usize;
                for i in 0..operations {
                    let id = doc_id((t * 7919 + i * 31) % doc_count);
                    let mut cache = cache.lock();
                    if remove_every > 0 && i % remove_every == 0 {
                        if cache.remove(&id).is_some() {
                            changed += 1;
                        }
                    } else if cache
                        .upsert(Document::new(id).with_field("writer", t as u64))
                        .is_change()
                    {
                        changed += 1;
                    }
                }
                changed
            })
        })
        .collect();

    let changed = handles
        .into_iter()
        .map(|handle| handle.join().expect("Thread panicked"))
        .sum();

    let cache = cache.lock();
    check_sorted_unique(&cache)?;
    Ok(StressTestResult::new(
        config.operations * config.threads,
        changed,
        cache.len(),
        start.elapsed(),
    ))
}

/// Inserts `count` documents in descending id order, the worst case for
/// positional inserts.
pub fn stress_reverse_inserts(count: usize) -> Result<StressTestResult, InvariantViolation> {
    let mut cache = OrderedCache::new();
    let start = Instant::now();
    let changed = cache.extend((0..count).rev().map(|i| Document::new(doc_id(i))));
    check_sorted_unique(&cache)?;
    Ok(StressTestResult::new(count, changed, cache.len(), start.elapsed()))
}
